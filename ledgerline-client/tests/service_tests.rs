use ledgerline_client::{
    CalculationSource, ClientError, Ledgerline, RemoteRegistry, ServiceOptions, StaticRegistry,
};
use ledgerline_core::{
    AggregationLevel, Backend, CatalogState, CsvQuoting, CycleCode, DeletePolicy, EntityKind,
    FieldDefinition, FieldType, IntegrityError, LedgerError, ReportLayout, RequestError,
    RunError, RunState, Udf, ValidationError,
};
use ledgerline_test_utils::{fixtures, MockBackend};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn options(policy: DeletePolicy, quoting: CsvQuoting, export_dir: &Path) -> ServiceOptions {
    ServiceOptions {
        delete_policy: policy,
        csv_quoting: quoting,
        export_dir: export_dir.to_path_buf(),
    }
}

fn session_with(backend: &MockBackend, options: ServiceOptions) -> Ledgerline {
    let shared: Arc<dyn Backend> = Arc::new(backend.clone());
    let registry: Arc<dyn CalculationSource> = Arc::new(RemoteRegistry::new(Arc::clone(&shared)));
    Ledgerline::with_backend(shared, registry, options)
}

fn session(backend: &MockBackend) -> Ledgerline {
    session_with(
        backend,
        options(
            DeletePolicy::RejectIfReferenced,
            CsvQuoting::Legacy,
            &PathBuf::from("exports"),
        ),
    )
}

async fn deal_report(ll: &Ledgerline, udf: &Udf) -> ReportLayout {
    let mut builder = ll.new_report();
    builder.draft_mut().name = "Monthly Deals".to_string();
    builder.set_primary_model("deal").unwrap();
    builder.set_aggregation_level(AggregationLevel::Deal).unwrap();
    assert!(builder.toggle_udf(udf.id).unwrap());
    for field in builder.available_fields() {
        builder.toggle_field(&field.to_string());
    }
    builder.save().await.unwrap()
}

// ============================================================================
// REPOSITORIES
// ============================================================================

#[tokio::test]
async fn test_create_refetches_udf_list() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    ll.refresh_all().await.unwrap();
    assert!(ll.udfs().udfs().is_empty());
    assert_eq!(ll.models().models().len(), 3);

    backend.clear_calls();
    let udf = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();
    assert_eq!(backend.calls(), vec!["create_udf", "list_udfs"]);
    assert_eq!(ll.udfs().udfs(), vec![udf]);
}

#[tokio::test]
async fn test_failed_mutation_leaves_cache_untouched() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    let existing = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();

    backend.clear_calls();
    backend.fail_next("create_udf", "database is locked");
    let err = ll.udfs().create(&fixtures::loan_summary()).await.unwrap_err();
    assert!(err.is_request());
    assert_eq!(backend.calls(), vec!["create_udf"]);
    assert_eq!(ll.udfs().udfs(), vec![existing]);
}

#[tokio::test]
async fn test_refetch_failure_does_not_fail_mutation() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    backend.fail_next("list_udfs", "timeout");

    let udf = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();
    assert!(ll.udfs().get(udf.id).is_none());

    ll.udfs().refresh().await.unwrap();
    assert_eq!(ll.udfs().get(udf.id), Some(udf));
}

#[tokio::test]
async fn test_update_is_full_replace_and_round_trips() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    let created = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();

    let mut payload = created.to_payload();
    payload.description = Some("Renamed roll-ups".to_string());
    payload.fields.truncate(1);
    let updated = ll.udfs().update(created.id, &payload).await.unwrap();

    assert_eq!(updated.fields, payload.fields);
    assert_eq!(ll.udfs().get(created.id), Some(updated.clone()));
    assert_eq!(backend.udf(created.id), Some(updated));
}

#[tokio::test]
async fn test_update_rejects_immutable_fields_locally() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    let created = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();

    let mut payload = created.to_payload();
    payload.aggregation_level = AggregationLevel::Tranche;
    let err = ll.udfs().update(created.id, &payload).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Ledger(LedgerError::Validation(ValidationError::ImmutableField { .. }))
    ));
    assert_eq!(backend.call_count("update_udf"), 0);
}

#[tokio::test]
async fn test_update_missing_udf_is_not_found() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    let err = ll
        .udfs()
        .update(ledgerline_core::UdfId(42), &fixtures::deal_totals())
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_ledger(),
        Some(LedgerError::Request(RequestError::NotFound {
            entity: EntityKind::Udf,
            ..
        }))
    ));
}

#[tokio::test]
async fn test_concurrent_save_of_same_udf_is_busy() {
    let backend = MockBackend::new();
    let ll = Arc::new(session(&backend));
    let udf = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();
    let payload = udf.to_payload();

    let gate = backend.gate("update_udf");
    let first = {
        let ll = Arc::clone(&ll);
        let payload = payload.clone();
        let id = udf.id;
        tokio::spawn(async move { ll.udfs().update(id, &payload).await })
    };
    gate.entered().await;

    let second = ll.udfs().update(udf.id, &payload).await;
    assert!(matches!(
        second,
        Err(ClientError::Busy {
            entity: EntityKind::Udf,
            ..
        })
    ));
    let delete = ll.udfs().delete(udf.id).await;
    assert!(matches!(delete, Err(ClientError::Busy { .. })));

    gate.release();
    first.await.unwrap().unwrap();
    assert_eq!(backend.call_count("update_udf"), 1);

    ll.udfs().update(udf.id, &payload).await.unwrap();
}

// ============================================================================
// DELETE POLICY
// ============================================================================

#[tokio::test]
async fn test_referenced_udf_delete_rejected_before_request() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    let udf = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();
    let report = deal_report(&ll, &udf).await;

    let err = ll.udfs().delete(udf.id).await.unwrap_err();
    match err {
        ClientError::Ledger(LedgerError::Integrity(IntegrityError::UdfInUse { udf_id, report_id })) => {
            assert_eq!(udf_id, udf.id);
            assert_eq!(report_id, report.id);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(backend.call_count("delete_udf"), 0);
    assert_eq!(backend.udf_count(), 1);
}

#[tokio::test]
async fn test_allow_dangling_delete_then_run_refused() {
    let backend = MockBackend::new().permissive_deletes();
    let ll = session_with(
        &backend,
        options(
            DeletePolicy::AllowDangling,
            CsvQuoting::Legacy,
            &PathBuf::from("exports"),
        ),
    );
    let udf = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();
    let report = deal_report(&ll, &udf).await;

    ll.udfs().delete(udf.id).await.unwrap();
    assert!(ll.udfs().udfs().is_empty());

    let err = ll
        .runner()
        .run(&report, CycleCode::from("12023"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Ledger(LedgerError::Integrity(IntegrityError::MissingUdf { .. }))
    ));
    assert_eq!(backend.call_count("run_report"), 0);
    assert_eq!(ll.runner().state(report.id), RunState::Idle);
}

#[tokio::test]
async fn test_unreferenced_udf_delete_refetches() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    let udf = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();

    backend.clear_calls();
    ll.udfs().delete(udf.id).await.unwrap();
    assert_eq!(backend.calls(), vec!["list_reports", "delete_udf", "list_udfs"]);
    assert!(ll.udfs().get(udf.id).is_none());
}

// ============================================================================
// UDF EDITOR
// ============================================================================

#[tokio::test]
async fn test_editor_create_flow() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    ll.refresh_all().await.unwrap();

    let mut editor = ll.new_udf();
    editor.draft_mut().name = "Deal Stats".to_string();
    editor.set_base_model("deal").await.unwrap();
    assert_eq!(editor.draft().model_fields().len(), 3);
    assert_eq!(editor.draft().primary_key().map(|f| f.name.as_str()), Some("id"));

    editor
        .set_aggregation_level(AggregationLevel::Deal)
        .await
        .unwrap();
    assert!(editor.draft().can_select_calculation());

    let catalog = editor.draft().effective_catalog().unwrap();
    let mut total = FieldDefinition::new("total", FieldType::Number).with_source_field("amount");
    total.select_calculation(catalog.get("sum"));
    editor.add_field(total).unwrap();

    let preview = editor.preview_schema();
    assert_eq!(
        preview.to_value()["properties"]["total"],
        json!({"type": "number", "description": "Calculation: sum of amount"})
    );

    let udf = editor.save().await.unwrap();
    assert!(editor.draft().is_persisted());
    assert_eq!(ll.udfs().get(udf.id), Some(udf.clone()));

    let code = editor.generate_code().await.unwrap();
    assert!(code.contains("class DealStats(BaseModel):"));

    let err = editor
        .set_aggregation_level(AggregationLevel::Tranche)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Ledger(LedgerError::Validation(ValidationError::ImmutableField { .. }))
    ));
}

#[tokio::test]
async fn test_editor_rejects_source_field_outside_model() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    let mut editor = ll.new_udf();
    editor.draft_mut().name = "Deal Stats".to_string();
    editor.set_base_model("deal").await.unwrap();
    editor
        .set_aggregation_level(AggregationLevel::Deal)
        .await
        .unwrap();

    let err = editor
        .add_field(FieldDefinition::new("rate", FieldType::Number).with_source_field("interest_rate"))
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Ledger(LedgerError::Validation(ValidationError::UnknownSourceField {
            ref source_field,
            ref base_model,
            ..
        })) if source_field == "interest_rate" && base_model == "deal"
    ));
    assert!(editor.draft().fields().is_empty());

    editor
        .add_field(FieldDefinition::new("label", FieldType::String).with_source_field("deal_name"))
        .unwrap();
    backend.clear_calls();
    let udf = editor.save().await.unwrap();
    assert_eq!(udf.fields[0].source_field.as_deref(), Some("deal_name"));
    assert_eq!(backend.call_count("create_udf"), 1);
}

#[tokio::test]
async fn test_editor_save_blocked_locally() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    let mut editor = ll.new_udf();
    editor.draft_mut().name = "Incomplete".to_string();
    editor.set_base_model("tranche").await.unwrap();

    backend.clear_calls();
    let err = editor.save().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Ledger(LedgerError::Validation(ValidationError::RequiredFieldMissing { ref field }))
            if field == "aggregation_level"
    ));
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_generate_code_requires_saved_udf() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    let editor = ll.new_udf();
    let err = editor.generate_code().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Ledger(LedgerError::Validation(ValidationError::NotPersisted {
            entity: EntityKind::Udf
        }))
    ));
    assert_eq!(backend.call_count("generate_udf_code"), 0);
}

#[tokio::test]
async fn test_catalog_failure_degrades_to_empty() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    let mut editor = ll.new_udf();
    editor.draft_mut().name = "Offline".to_string();
    editor.set_base_model("deal").await.unwrap();

    backend.fail_next("list_calculations", "registry offline");
    editor
        .set_aggregation_level(AggregationLevel::Deal)
        .await
        .unwrap();
    assert!(matches!(
        editor.draft().catalog_state(),
        CatalogState::Failed { .. }
    ));
    assert!(!editor.draft().can_select_calculation());

    editor
        .add_field(FieldDefinition::new("label", FieldType::String))
        .unwrap();
    assert!(editor.save().await.is_ok());
}

#[tokio::test]
async fn test_edit_existing_udf_resolves_catalog() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    let created = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();

    let mut editor = ll.edit_udf(created.id).await.unwrap();
    assert!(editor.draft().can_select_calculation());
    assert_eq!(editor.draft().model_fields().len(), 3);

    editor.draft_mut().description = Some("Edited".to_string());
    let saved = editor.save().await.unwrap();
    assert_eq!(saved.id, created.id);
    assert_eq!(saved.fields, created.fields);
    assert_eq!(backend.call_count("update_udf"), 1);
    assert_eq!(backend.call_count("create_udf"), 1);
}

#[tokio::test]
async fn test_static_registry_works_offline() {
    let backend = MockBackend::new();
    backend.fail_always("list_calculations", "registry offline");
    let shared: Arc<dyn Backend> = Arc::new(backend.clone());
    let ll = Ledgerline::with_backend(
        shared,
        Arc::new(StaticRegistry),
        options(
            DeletePolicy::RejectIfReferenced,
            CsvQuoting::Legacy,
            &PathBuf::from("exports"),
        ),
    );

    let mut editor = ll.new_udf();
    editor.set_base_model("tranche").await.unwrap();
    editor
        .set_aggregation_level(AggregationLevel::Tranche)
        .await
        .unwrap();
    let catalog = editor.draft().effective_catalog().unwrap();
    assert!(catalog.contains("min"));
    assert!(catalog.contains("max"));
    assert_eq!(backend.call_count("list_calculations"), 0);
}

// ============================================================================
// REPORT BUILDER
// ============================================================================

#[tokio::test]
async fn test_builder_offers_only_compatible_udfs() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    let deal = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();
    let tranche = ll.udfs().create(&fixtures::loan_summary()).await.unwrap();

    let mut builder = ll.new_report();
    assert!(builder.compatible_udfs().is_none());
    builder.set_aggregation_level(AggregationLevel::Deal).unwrap();
    let compatible = builder.compatible_udfs().unwrap();
    assert_eq!(compatible.as_slice(), &[deal.clone()][..]);

    let err = builder.toggle_udf(tranche.id).unwrap_err();
    assert!(matches!(
        err,
        ClientError::Ledger(LedgerError::Validation(ValidationError::IncompatibleUdf { .. }))
    ));

    builder.set_aggregation_level(AggregationLevel::Group).unwrap();
    assert!(builder.compatible_udfs().unwrap().is_empty());
}

#[tokio::test]
async fn test_builder_save_and_reopen() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    let udf = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();
    let layout = deal_report(&ll, &udf).await;

    assert_eq!(
        layout.fields(),
        &["DealTotals.deal_label".to_string(), "DealTotals.total_amount".to_string()][..]
    );
    assert_eq!(ll.reports().reports(), vec![layout.clone()]);

    let mut builder = ll.edit_report(layout.id).unwrap();
    assert!(!builder.toggle_field("DealTotals.total_amount"));
    let err = builder
        .set_aggregation_level(AggregationLevel::Tranche)
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Ledger(LedgerError::Validation(ValidationError::ImmutableField { .. }))
    ));

    let updated = builder.save().await.unwrap();
    assert_eq!(updated.id, layout.id);
    assert_eq!(updated.fields(), &["DealTotals.deal_label".to_string()][..]);
    assert_eq!(backend.call_count("update_report"), 1);
}

// ============================================================================
// RUNS AND EXPORT
// ============================================================================

#[tokio::test]
async fn test_run_and_export_to_dir() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new();
    let ll = session_with(
        &backend,
        options(DeletePolicy::RejectIfReferenced, CsvQuoting::Legacy, dir.path()),
    );
    let udf = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();
    let report = deal_report(&ll, &udf).await;
    backend.set_run_rows(report.id, fixtures::comma_rows());

    let cycles = ll.runner().available_cycles().await.unwrap();
    assert_eq!(cycles[0], CycleCode::from("12023"));

    let response = ll
        .runner()
        .run(&report, cycles[0].clone())
        .await
        .unwrap();
    assert_eq!(response.data.len(), 2);
    assert_eq!(ll.runner().state(report.id).name(), "succeeded");

    let path = ll.runner().export_to_dir(&report).unwrap();
    assert_eq!(path, dir.path().join("Monthly Deals_12023.csv"));
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(
        contents,
        "DealTotals.deal_label,DealTotals.total_amount\n\"Alpha, Inc\",10.5\n\"Beta\","
    );
}

#[tokio::test]
async fn test_rfc4180_export_escapes() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new();
    let ll = session_with(
        &backend,
        options(DeletePolicy::RejectIfReferenced, CsvQuoting::Rfc4180, dir.path()),
    );
    let udf = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();
    let report = deal_report(&ll, &udf).await;
    backend.set_run_rows(
        report.id,
        fixtures::rows(&[json!({"DealTotals.deal_label": "say \"hi\", ok", "DealTotals.total_amount": 1})]),
    );

    ll.runner()
        .run(&report, CycleCode::from("12023"))
        .await
        .unwrap();
    let export = ll.runner().export(&report).unwrap();
    let lines: Vec<&str> = export.contents.lines().collect();
    assert_eq!(lines[1], "\"say \"\"hi\"\", ok\",1");
}

#[tokio::test]
async fn test_export_without_successful_run() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    let udf = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();
    let report = deal_report(&ll, &udf).await;

    let err = ll.runner().export(&report).unwrap_err();
    assert!(matches!(
        err,
        ClientError::Ledger(LedgerError::Run(RunError::NoSuccessfulRun { .. }))
    ));

    backend.fail_next("run_report", "query engine down");
    let err = ll
        .runner()
        .run(&report, CycleCode::from("12023"))
        .await
        .unwrap_err();
    assert!(err.is_request());
    assert_eq!(ll.runner().state(report.id).name(), "failed");
    assert!(ll.runner().export(&report).is_err());
}

#[tokio::test]
async fn test_failed_rerun_keeps_last_successful_export() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    let udf = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();
    let report = deal_report(&ll, &udf).await;
    backend.set_run_rows(report.id, fixtures::comma_rows());

    ll.runner()
        .run(&report, CycleCode::from("12023"))
        .await
        .unwrap();

    backend.fail_next("run_report", "query engine down");
    let err = ll
        .runner()
        .run(&report, CycleCode::from("12022"))
        .await
        .unwrap_err();
    assert!(err.is_request());
    assert_eq!(ll.runner().state(report.id).name(), "failed");

    let export = ll.runner().export(&report).unwrap();
    assert_eq!(export.file_name, "Monthly Deals_12023.csv");
    assert_eq!(export.contents.lines().count(), 3);

    ll.runner().reset(report.id);
    assert!(ll.runner().export(&report).is_err());
}

#[tokio::test]
async fn test_empty_run_has_nothing_to_export() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new();
    let ll = session_with(
        &backend,
        options(DeletePolicy::RejectIfReferenced, CsvQuoting::Legacy, dir.path()),
    );
    let udf = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();
    let report = deal_report(&ll, &udf).await;

    ll.runner()
        .run(&report, CycleCode::from("12023"))
        .await
        .unwrap();
    let err = ll.runner().export_to_dir(&report).unwrap_err();
    assert!(matches!(
        err,
        ClientError::Ledger(LedgerError::Export(ledgerline_core::ExportError::NoRows))
    ));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_second_run_rejected_while_running() {
    let backend = MockBackend::new();
    let ll = Arc::new(session(&backend));
    let udf = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();
    let report = deal_report(&ll, &udf).await;

    let gate = backend.gate("run_report");
    let first = {
        let ll = Arc::clone(&ll);
        let report = report.clone();
        tokio::spawn(async move { ll.runner().run(&report, CycleCode::from("12023")).await })
    };
    gate.entered().await;
    assert!(ll.runner().state(report.id).is_running());

    let err = ll
        .runner()
        .run(&report, CycleCode::from("12022"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Ledger(LedgerError::Run(RunError::AlreadyRunning { .. }))
    ));

    gate.release();
    first.await.unwrap().unwrap();
    assert_eq!(backend.call_count("run_report"), 1);
    assert_eq!(ll.runner().state(report.id).name(), "succeeded");
}

#[tokio::test]
async fn test_cancelled_run_returns_to_idle() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    let udf = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();
    let report = deal_report(&ll, &udf).await;

    let gate = backend.gate("run_report");
    tokio::select! {
        _ = ll.runner().run(&report, CycleCode::from("12023")) => panic!("gated run completed"),
        _ = gate.entered() => {}
    }
    assert_eq!(ll.runner().state(report.id), RunState::Idle);

    ll.runner()
        .run(&report, CycleCode::from("12023"))
        .await
        .unwrap();
    assert_eq!(ll.runner().state(report.id).name(), "succeeded");
    assert_eq!(backend.call_count("run_report"), 2);
}

#[tokio::test]
async fn test_filtered_run_passes_filters() {
    let backend = MockBackend::new();
    let ll = session(&backend);
    let udf = ll.udfs().create(&fixtures::deal_totals()).await.unwrap();
    let report = deal_report(&ll, &udf).await;
    backend.set_run_rows(
        report.id,
        fixtures::rows(&[
            json!({"deal_name": "Alpha", "DealTotals.total_amount": 1}),
            json!({"deal_name": "Beta", "DealTotals.total_amount": 2}),
        ]),
    );

    let mut filters = std::collections::BTreeMap::new();
    filters.insert("deal_name".to_string(), json!("Beta"));
    let response = ll
        .runner()
        .run_filtered(&report, CycleCode::from("12023"), filters)
        .await
        .unwrap();
    assert_eq!(response.data.len(), 1);
    assert_eq!(response.data[0]["DealTotals.total_amount"], json!(2));
}
