//! # Clinical Event Consumer
//!
//! Handler-side contracts for services that consume the clinical event bus.
//!
//! - [`contracts`]: one trait per downstream concern (record-keeping, decision
//!   support, notification, audit, interoperability export)
//! - [`HandlerRegistry`]: turns concern handlers into bus subscriptions with
//!   the concern's default topics and a `<service>-<concern>` consumer group
//! - [`dispatch`]: decodes the typed payload and calls one visitor method per
//!   event type
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use clinical_event_bus::{BusConfig, BusRuntime, ClinicalEvent, HandlerOutcome, HandlerResult};
//! use clinical_event_consumer::{AuditHandler, HandlerRegistry};
//!
//! struct AccessLog;
//!
//! #[async_trait]
//! impl AuditHandler for AccessLog {
//!     async fn handle(&self, event: &ClinicalEvent) -> HandlerResult {
//!         tracing::info!(event_id = %event.event_id(), "audited");
//!         Ok(HandlerOutcome::Handled)
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = BusRuntime::from_config(BusConfig::from_env()?)?;
//! HandlerRegistry::new()
//!     .audit(AccessLog)
//!     .register_all(&runtime, "compliance-service")
//!     .await?;
//! runtime.start().await?;
//! # Ok(())
//! # }
//! ```

mod context;
pub mod contracts;
pub mod dispatch;
mod registry;

pub use context::EventContext;
pub use contracts::{
    AuditHandler, Concern, DecisionSupportHandler, InteropExportHandler, NotificationHandler,
    RecordKeepingHandler,
};
pub use dispatch::{dispatch, PayloadVisitor};
pub use registry::{HandlerRegistry, Registration};
