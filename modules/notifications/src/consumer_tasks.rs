use std::sync::Arc;

use clinical_event_bus::{BusResult, BusRuntime};
use clinical_event_consumer::HandlerRegistry;

use crate::handlers::{AlertSink, AuditSink, CareTeamAlerts, RegulatedAccessAuditor};

/// Notification and audit concerns of this service
///
/// Notification listens on `device-events` and `alert-events`, audit on
/// `compliance-events` and `patient-events`, each in its own consumer group.
pub fn handler_registry(alerts: Arc<dyn AlertSink>, audit: Arc<dyn AuditSink>) -> HandlerRegistry {
    HandlerRegistry::new()
        .notification(CareTeamAlerts::new(alerts))
        .audit(RegulatedAccessAuditor::new(audit))
}

/// Register every consumer of this service on the runtime
pub async fn register_consumers(
    runtime: &BusRuntime,
    alerts: Arc<dyn AlertSink>,
    audit: Arc<dyn AuditSink>,
) -> BusResult<usize> {
    let service = runtime.config().service_name.clone();
    let count = handler_registry(alerts, audit)
        .register_all(runtime, &service)
        .await?;

    tracing::info!(service = %service, subscriptions = count, "Notification consumers registered");
    Ok(count)
}
