//! Ledgerline Test Utilities
//!
//! Shared test infrastructure for the Ledgerline workspace:
//! - In-memory `MockBackend` with failure injection and request gating
//! - Proptest generators for UDFs, fields, reports and rows
//! - Fixtures for the common scenarios
//! - Assertions for Ledgerline error variants

pub use ledgerline_core::{
    AggregationLevel, Backend, CalculationCatalog, CalculationDefinition, CycleCode, EntityKind,
    ExportError, FieldDefinition, FieldType, IntegrityError, LayoutJson, LedgerError,
    LedgerResult, ModelField, ModelInfo, ReportId, ReportLayout, ReportLayoutCreate,
    ReportRunRequest, ReportRunResponse, RequestError, Row, Udf, UdfCreate, UdfId,
    ValidationError,
};

use async_trait::async_trait;
use ledgerline_core::calculation::BUILTIN_DEFINITIONS;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Notify;

// ============================================================================
// MOCK BACKEND
// ============================================================================

/// Holds one request open until the test releases it.
#[derive(Debug, Default)]
pub struct Gate {
    entered: Notify,
    released: Notify,
}

impl Gate {
    /// Wait until the gated request has started.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the gated request continue.
    pub fn release(&self) {
        self.released.notify_one();
    }
}

#[derive(Debug, Default)]
struct MockState {
    udfs: BTreeMap<UdfId, Udf>,
    reports: BTreeMap<ReportId, ReportLayout>,
    models: Vec<ModelInfo>,
    model_fields: HashMap<String, Vec<ModelField>>,
    calculations: Vec<CalculationDefinition>,
    cycles: Vec<CycleCode>,
    run_rows: HashMap<ReportId, Vec<Row>>,
    next_udf_id: i64,
    next_report_id: i64,
    reject_referenced_deletes: bool,
    calls: Vec<String>,
    fail_next: HashMap<String, VecDeque<String>>,
    fail_always: HashMap<String, String>,
    gates: HashMap<String, Arc<Gate>>,
}

/// In-memory backend behaving like the reference server.
///
/// Clones share state, so a test can keep a handle while the code under
/// test owns another.
#[derive(Debug, Clone)]
pub struct MockBackend {
    state: Arc<RwLock<MockState>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Backend seeded with the reference models, calculations and cycles.
    pub fn new() -> Self {
        let state = MockState {
            models: fixtures::models(),
            model_fields: fixtures::model_fields(),
            calculations: BUILTIN_DEFINITIONS.clone(),
            cycles: fixtures::cycles(),
            next_udf_id: 1,
            next_report_id: 1,
            reject_referenced_deletes: true,
            ..MockState::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Allow deleting UDFs that reports still reference.
    pub fn permissive_deletes(self) -> Self {
        self.write().reject_referenced_deletes = false;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, MockState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MockState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------------

    /// Insert a UDF directly, bypassing the call log.
    pub fn seed_udf(&self, payload: UdfCreate) -> Udf {
        let mut state = self.write();
        let id = UdfId(state.next_udf_id);
        state.next_udf_id += 1;
        let udf = payload.into_udf(id);
        state.udfs.insert(id, udf.clone());
        udf
    }

    /// Insert a report directly, without compatibility checks.
    pub fn seed_report(&self, payload: ReportLayoutCreate) -> ReportLayout {
        let mut state = self.write();
        let id = ReportId(state.next_report_id);
        state.next_report_id += 1;
        let layout = payload.into_layout(id);
        state.reports.insert(id, layout.clone());
        layout
    }

    /// Remove a UDF directly, leaving dependent reports dangling.
    pub fn remove_udf(&self, id: UdfId) -> Option<Udf> {
        self.write().udfs.remove(&id)
    }

    pub fn set_calculations(&self, definitions: Vec<CalculationDefinition>) {
        self.write().calculations = definitions;
    }

    pub fn set_run_rows(&self, report_id: ReportId, rows: Vec<Row>) {
        self.write().run_rows.insert(report_id, rows);
    }

    // ------------------------------------------------------------------------
    // Failure injection and gating
    // ------------------------------------------------------------------------

    /// Fail the next call of `operation` with `message`.
    pub fn fail_next(&self, operation: &str, message: impl Into<String>) {
        self.write()
            .fail_next
            .entry(operation.to_string())
            .or_default()
            .push_back(message.into());
    }

    /// Fail every call of `operation` until cleared.
    pub fn fail_always(&self, operation: &str, message: impl Into<String>) {
        self.write()
            .fail_always
            .insert(operation.to_string(), message.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.write();
        state.fail_next.clear();
        state.fail_always.clear();
    }

    /// Hold the next call of `operation` open until the gate is released.
    pub fn gate(&self, operation: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.write()
            .gates
            .insert(operation.to_string(), Arc::clone(&gate));
        gate
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Operations called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.read().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.read().calls.iter().filter(|c| *c == operation).count()
    }

    pub fn clear_calls(&self) {
        self.write().calls.clear();
    }

    pub fn udf_count(&self) -> usize {
        self.read().udfs.len()
    }

    pub fn report_count(&self) -> usize {
        self.read().reports.len()
    }

    pub fn udf(&self, id: UdfId) -> Option<Udf> {
        self.read().udfs.get(&id).cloned()
    }

    /// Log the call, wait on its gate and apply any injected failure.
    async fn enter(&self, operation: &str) -> LedgerResult<()> {
        let gate = {
            let mut state = self.write();
            state.calls.push(operation.to_string());
            state.gates.remove(operation)
        };
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.released.notified().await;
        }

        let mut state = self.write();
        let one_shot = state
            .fail_next
            .get_mut(operation)
            .and_then(VecDeque::pop_front);
        match one_shot.or_else(|| state.fail_always.get(operation).cloned()) {
            Some(message) => Err(RequestError::failed(operation, message).into()),
            None => Ok(()),
        }
    }
}

fn rejected(operation: &str, message: impl Into<String>) -> LedgerError {
    RequestError::Rejected {
        operation: operation.to_string(),
        message: message.into(),
    }
    .into()
}

/// Stand-in for the server's code generator: one typed attribute per field.
fn generate_model_source(udf: &Udf) -> String {
    let mut code = String::from("from pydantic import BaseModel\n");
    code.push_str("from typing import Optional, List, Dict, Any\n\n");
    code.push_str(&format!("class {}(BaseModel):\n", udf.name.replace(' ', "")));
    for field in &udf.fields {
        let ty = match field.field_type {
            FieldType::String => "str",
            FieldType::Integer => "int",
            FieldType::Number => "float",
            FieldType::Boolean => "bool",
            FieldType::Array => "List[Any]",
            FieldType::Object => "Dict[str, Any]",
        };
        if field.required {
            code.push_str(&format!("    {}: {}\n", field.name, ty));
        } else {
            code.push_str(&format!("    {}: Optional[{}] = None\n", field.name, ty));
        }
    }
    code
}

#[async_trait]
impl Backend for MockBackend {
    async fn list_udfs(&self) -> LedgerResult<Vec<Udf>> {
        self.enter("list_udfs").await?;
        Ok(self.read().udfs.values().cloned().collect())
    }

    async fn create_udf(&self, payload: &UdfCreate) -> LedgerResult<Udf> {
        self.enter("create_udf").await?;
        Ok(self.seed_udf(payload.clone()))
    }

    async fn update_udf(&self, id: UdfId, payload: &UdfCreate) -> LedgerResult<Udf> {
        self.enter("update_udf").await?;
        let mut state = self.write();
        if !state.udfs.contains_key(&id) {
            return Err(RequestError::not_found(EntityKind::Udf, id).into());
        }
        let udf = payload.clone().into_udf(id);
        state.udfs.insert(id, udf.clone());
        Ok(udf)
    }

    async fn delete_udf(&self, id: UdfId) -> LedgerResult<()> {
        self.enter("delete_udf").await?;
        let mut state = self.write();
        if !state.udfs.contains_key(&id) {
            return Err(RequestError::not_found(EntityKind::Udf, id).into());
        }
        if state.reject_referenced_deletes && state.reports.values().any(|r| r.references_udf(id)) {
            return Err(rejected(
                "delete_udf",
                "Cannot delete UDF that is used by reports. Remove from reports first.",
            ));
        }
        state.udfs.remove(&id);
        Ok(())
    }

    async fn generate_udf_code(&self, id: UdfId) -> LedgerResult<String> {
        self.enter("generate_udf_code").await?;
        let state = self.read();
        let udf = state
            .udfs
            .get(&id)
            .ok_or_else(|| RequestError::not_found(EntityKind::Udf, id))?;
        Ok(generate_model_source(udf))
    }

    async fn list_models(&self) -> LedgerResult<Vec<ModelInfo>> {
        self.enter("list_models").await?;
        Ok(self.read().models.clone())
    }

    async fn model_fields(&self, model_id: &str) -> LedgerResult<Vec<ModelField>> {
        self.enter("model_fields").await?;
        Ok(self
            .read()
            .model_fields
            .get(model_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_calculations(
        &self,
        level: AggregationLevel,
    ) -> LedgerResult<Vec<CalculationDefinition>> {
        self.enter("list_calculations").await?;
        Ok(self
            .read()
            .calculations
            .iter()
            .filter(|d| d.applies_to(level))
            .cloned()
            .collect())
    }

    async fn list_reports(&self) -> LedgerResult<Vec<ReportLayout>> {
        self.enter("list_reports").await?;
        Ok(self.read().reports.values().cloned().collect())
    }

    async fn create_report(&self, payload: &ReportLayoutCreate) -> LedgerResult<ReportLayout> {
        self.enter("create_report").await?;
        self.check_report_udfs("create_report", payload)?;
        Ok(self.seed_report(payload.clone()))
    }

    async fn update_report(
        &self,
        id: ReportId,
        payload: &ReportLayoutCreate,
    ) -> LedgerResult<ReportLayout> {
        self.enter("update_report").await?;
        self.check_report_udfs("update_report", payload)?;
        let mut state = self.write();
        if !state.reports.contains_key(&id) {
            return Err(RequestError::not_found(EntityKind::Report, id).into());
        }
        let layout = payload.clone().into_layout(id);
        state.reports.insert(id, layout.clone());
        Ok(layout)
    }

    async fn delete_report(&self, id: ReportId) -> LedgerResult<()> {
        self.enter("delete_report").await?;
        match self.write().reports.remove(&id) {
            Some(_) => Ok(()),
            None => Err(RequestError::not_found(EntityKind::Report, id).into()),
        }
    }

    async fn run_report(&self, request: &ReportRunRequest) -> LedgerResult<ReportRunResponse> {
        self.enter("run_report").await?;
        let state = self.read();
        let layout = state
            .reports
            .get(&request.report_id)
            .ok_or_else(|| RequestError::not_found(EntityKind::Report, request.report_id))?;
        let mut data = state
            .run_rows
            .get(&request.report_id)
            .cloned()
            .unwrap_or_default();
        if let Some(filters) = &request.filters {
            data.retain(|row| filters.iter().all(|(k, v)| row.get(k) == Some(v)));
        }
        Ok(ReportRunResponse {
            report_name: layout.name.clone(),
            cycle_code: request.cycle_code.clone(),
            data,
        })
    }

    async fn list_cycles(&self) -> LedgerResult<Vec<CycleCode>> {
        self.enter("list_cycles").await?;
        Ok(self.read().cycles.clone())
    }
}

impl MockBackend {
    fn check_report_udfs(&self, operation: &str, payload: &ReportLayoutCreate) -> LedgerResult<()> {
        let state = self.read();
        for udf_id in &payload.udf_ids {
            let udf = state
                .udfs
                .get(udf_id)
                .ok_or_else(|| RequestError::not_found(EntityKind::Udf, udf_id))?;
            if udf.aggregation_level != payload.aggregation_level {
                return Err(rejected(
                    operation,
                    format!(
                        "UDF with ID {} has aggregation level '{}' which is incompatible with report aggregation level '{}'",
                        udf_id, udf.aggregation_level, payload.aggregation_level
                    ),
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Ledgerline types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    pub fn arb_level() -> impl Strategy<Value = AggregationLevel> {
        prop_oneof![
            Just(AggregationLevel::Deal),
            Just(AggregationLevel::Group),
            Just(AggregationLevel::Tranche),
        ]
    }

    pub fn arb_field_type() -> impl Strategy<Value = FieldType> {
        prop_oneof![
            Just(FieldType::String),
            Just(FieldType::Integer),
            Just(FieldType::Number),
            Just(FieldType::Boolean),
            Just(FieldType::Array),
            Just(FieldType::Object),
        ]
    }

    pub fn arb_field_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,11}"
    }

    /// A default value that fits `field_type`.
    pub fn arb_default_for(field_type: FieldType) -> BoxedStrategy<Value> {
        match field_type {
            FieldType::String => "[a-z]{0,8}".prop_map(Value::String).boxed(),
            FieldType::Integer => any::<i32>().prop_map(|n| json!(n)).boxed(),
            FieldType::Number => (-1.0e6f64..1.0e6).prop_map(|n| json!(n)).boxed(),
            FieldType::Boolean => any::<bool>().prop_map(Value::Bool).boxed(),
            FieldType::Array => Just(json!([])).boxed(),
            FieldType::Object => Just(json!({})).boxed(),
        }
    }

    /// A field without a calculation that passes validation on its own.
    pub fn arb_plain_field(name: String) -> impl Strategy<Value = FieldDefinition> {
        (arb_field_type(), any::<bool>(), proptest::option::of("[A-Za-z ]{1,20}"))
            .prop_flat_map(move |(field_type, required, description)| {
                let name = name.clone();
                proptest::option::of(arb_default_for(field_type)).prop_map(move |default| {
                    let mut field = FieldDefinition::new(name.clone(), field_type);
                    field.required = required;
                    field.description = description.clone();
                    field.default = default;
                    field
                })
            })
    }

    /// Fields with unique names, valid against any catalog.
    pub fn arb_field_set() -> impl Strategy<Value = Vec<FieldDefinition>> {
        proptest::collection::btree_set(arb_field_name(), 1..8).prop_flat_map(|names| {
            names
                .into_iter()
                .map(arb_plain_field)
                .collect::<Vec<_>>()
        })
    }

    /// A field with a built-in calculation valid at `level`, params at defaults.
    pub fn arb_calculated_field(level: AggregationLevel) -> impl Strategy<Value = FieldDefinition> {
        let kinds: Vec<String> = CalculationCatalog::builtin(level)
            .definitions()
            .iter()
            .filter(|d| d.params.iter().all(|p| !p.required || p.default.is_some()))
            .map(|d| d.calculation_type.clone())
            .collect();
        (arb_field_name(), proptest::sample::select(kinds)).prop_map(move |(name, kind)| {
            let catalog = CalculationCatalog::builtin(level);
            let mut field = FieldDefinition::new(name, FieldType::Number);
            field.select_calculation(catalog.get(&kind));
            field
        })
    }

    pub fn arb_udf_create(level: AggregationLevel) -> impl Strategy<Value = UdfCreate> {
        (
            "[A-Z][A-Za-z]{2,10}",
            proptest::option::of("[a-z ]{0,30}"),
            prop_oneof![Just("deal"), Just("tranche"), Just("cashflow")],
            arb_field_set(),
        )
            .prop_map(move |(name, description, base_model, fields)| UdfCreate {
                name,
                description,
                base_model: base_model.to_string(),
                aggregation_level: level,
                fields,
            })
    }

    pub fn arb_udf() -> impl Strategy<Value = Udf> {
        (1i64..10_000, arb_level())
            .prop_flat_map(|(id, level)| arb_udf_create(level).prop_map(move |p| p.into_udf(UdfId(id))))
    }

    /// UDFs with distinct ids across mixed levels.
    pub fn arb_udfs() -> impl Strategy<Value = Vec<Udf>> {
        proptest::collection::vec(arb_level().prop_flat_map(arb_udf_create), 0..10).prop_map(
            |payloads| {
                payloads
                    .into_iter()
                    .enumerate()
                    .map(|(i, p)| p.into_udf(UdfId(i as i64 + 1)))
                    .collect()
            },
        )
    }

    pub fn arb_qualified_name() -> impl Strategy<Value = String> {
        ("[A-Z][a-z]{0,5}", arb_field_name()).prop_map(|(u, f)| format!("{}.{}", u, f))
    }

    pub fn arb_cell() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[ -~]{0,12}".prop_map(Value::String),
        ]
    }

    /// A row holding a value for each of `fields`.
    pub fn arb_row(fields: Vec<String>) -> impl Strategy<Value = Row> {
        proptest::collection::vec(arb_cell(), fields.len()).prop_map(move |cells| {
            fields.iter().cloned().zip(cells).collect()
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common test scenarios.

    use super::*;
    use serde_json::{json, Value};

    fn column(name: &str, column_type: &str, primary_key: bool, foreign_key: bool) -> ModelField {
        ModelField {
            name: name.to_string(),
            column_type: column_type.to_string(),
            primary_key,
            nullable: !primary_key,
            foreign_key,
        }
    }

    /// The reference deal, tranche and cash flow models.
    pub fn models() -> Vec<ModelInfo> {
        [
            ("deal", "Deal", "Financial deals information", AggregationLevel::Deal),
            ("tranche", "Tranche", "Tranches within deals", AggregationLevel::Tranche),
            ("cashflow", "Cash Flow", "Cash flow data for tranches", AggregationLevel::Tranche),
        ]
        .into_iter()
        .map(|(id, name, description, level)| ModelInfo {
            id: id.to_string(),
            name: name.to_string(),
            description: Some(description.to_string()),
            aggregation_level: Some(level),
        })
        .collect()
    }

    pub fn model_fields() -> HashMap<String, Vec<ModelField>> {
        let mut fields = HashMap::new();
        fields.insert(
            "deal".to_string(),
            vec![
                column("id", "INTEGER", true, false),
                column("deal_name", "VARCHAR(255)", false, false),
                column("amount", "FLOAT", false, false),
            ],
        );
        fields.insert(
            "tranche".to_string(),
            vec![
                column("id", "INTEGER", true, false),
                column("deal_id", "INTEGER", false, true),
                column("tranche_name", "VARCHAR(255)", false, false),
                column("amount", "FLOAT", false, false),
                column("interest_rate", "FLOAT", false, false),
            ],
        );
        fields.insert(
            "cashflow".to_string(),
            vec![
                column("id", "INTEGER", true, false),
                column("tranche_id", "INTEGER", false, true),
                column("amount", "FLOAT", false, false),
                column("interest_amount", "FLOAT", false, false),
            ],
        );
        fields
    }

    pub fn cycles() -> Vec<CycleCode> {
        ["12023", "12022", "12201"]
            .into_iter()
            .map(CycleCode::from)
            .collect()
    }

    /// Tranche-level UDF with one summed number field.
    pub fn loan_summary() -> UdfCreate {
        let mut field = FieldDefinition::new("total_interest", FieldType::Number)
            .with_source_field("interest_amount");
        field.calculation_type = Some("sum".to_string());
        UdfCreate {
            name: "LoanSummary".to_string(),
            description: None,
            base_model: "loan".to_string(),
            aggregation_level: AggregationLevel::Tranche,
            fields: vec![field],
        }
    }

    /// Deal-level UDF that validates against the built-in deal catalog.
    pub fn deal_totals() -> UdfCreate {
        let catalog = CalculationCatalog::builtin(AggregationLevel::Deal);
        let mut total = FieldDefinition::new("total_amount", FieldType::Number)
            .with_description("Sum of tranche amounts");
        total.select_calculation(catalog.get("sum"));
        UdfCreate {
            name: "DealTotals".to_string(),
            description: Some("Deal level roll-ups".to_string()),
            base_model: "deal".to_string(),
            aggregation_level: AggregationLevel::Deal,
            fields: vec![
                FieldDefinition::new("deal_label", FieldType::String)
                    .required()
                    .with_source_field("deal_name"),
                total,
            ],
        }
    }

    /// Report over `udfs`, selecting every one of their fields.
    pub fn report_over(name: &str, level: AggregationLevel, udfs: &[Udf]) -> ReportLayoutCreate {
        let fields = ledgerline_core::flatten_fields(udfs)
            .into_iter()
            .map(|q| q.to_string());
        ReportLayoutCreate {
            name: name.to_string(),
            description: None,
            primary_model: "deal".to_string(),
            aggregation_level: level,
            udf_ids: udfs.iter().map(|u| u.id).collect(),
            layout_json: LayoutJson::with_fields(fields),
        }
    }

    pub fn rows(values: &[Value]) -> Vec<Row> {
        values.iter().filter_map(|v| v.as_object().cloned()).collect()
    }

    /// Rows for a [`deal_totals`] report: the first label embeds a comma,
    /// the second total is null. `id` is a primary-model column.
    pub fn comma_rows() -> Vec<Row> {
        rows(&[
            json!({"id": 1, "DealTotals.deal_label": "Alpha, Inc", "DealTotals.total_amount": 10.5}),
            json!({"id": 2, "DealTotals.deal_label": "Beta", "DealTotals.total_amount": null}),
        ])
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for Ledgerline-specific error variants.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &LedgerResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_request_error<T: std::fmt::Debug>(result: &LedgerResult<T>) {
        match result {
            Err(LedgerError::Request(_)) => {}
            other => panic!("Expected Request error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &LedgerResult<T>, entity: EntityKind) {
        match result {
            Err(LedgerError::Request(RequestError::NotFound { entity: e, .. })) => {
                assert_eq!(*e, entity, "Wrong entity kind in NotFound error");
            }
            other => panic!("Expected NotFound error for {}, got: {:?}", entity, other),
        }
    }
}
