//! Ledgerline client services.
//!
//! Async repositories, editor and builder sessions, and the report runner,
//! all driving a [`ledgerline_core::Backend`]. [`RestClient`] is the HTTP
//! implementation of that trait.

pub mod api_client;
pub mod builder;
pub mod config;
pub mod context;
pub mod editor;
pub mod error;
pub mod notifications;
pub mod registry;
pub mod repository;
pub mod runner;
pub mod telemetry;

pub use api_client::RestClient;
pub use builder::ReportBuilder;
pub use config::{AuthConfig, ClientConfig, ConfigError, LogFormat};
pub use context::{Ledgerline, ServiceOptions};
pub use editor::UdfEditor;
pub use error::{ClientError, ClientResult};
pub use notifications::{Notification, NotificationAction, NotificationLevel};
pub use registry::{CalculationSource, RemoteRegistry, StaticRegistry};
pub use repository::{ModelCatalog, ReportRepository, UdfRepository};
pub use runner::ReportRunner;
pub use telemetry::init_tracing;
