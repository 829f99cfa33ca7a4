use std::sync::Arc;

use async_trait::async_trait;
use clinical_event_bus::{
    ClinicalEvent, CriticalValueDetected, DeviceAlertTriggered, EventType, HandlerError,
    HandlerOutcome, HandlerResult, RegulatedIdAccessed,
};
use clinical_event_consumer::{
    dispatch, AuditHandler, EventContext, NotificationHandler, PayloadVisitor,
};
use uuid::Uuid;

use crate::models::{AccessAuditEntry, AlertPriority, CareTeamAlert};

/// Where care-team alerts are delivered (pager gateway, secure messaging, ...)
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &CareTeamAlert) -> Result<(), HandlerError>;
}

/// Where regulated-access audit entries are written
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: &AccessAuditEntry) -> Result<(), HandlerError>;
}

/// Writes alerts to the service log
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn deliver(&self, alert: &CareTeamAlert) -> Result<(), HandlerError> {
        tracing::warn!(
            alert_id = %alert.alert_id,
            priority = ?alert.priority,
            patient_id = %alert.patient_id,
            facility_id = %alert.facility_id,
            tenant_id = %alert.tenant_id,
            recipient_id = %alert.recipient_id.as_deref().unwrap_or("on-call"),
            correlation_id = %alert.correlation_id,
            "Care-team alert: {}",
            alert.summary
        );
        Ok(())
    }
}

/// Writes audit entries to the service log as JSON
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, entry: &AccessAuditEntry) -> Result<(), HandlerError> {
        let line = serde_json::to_string(entry)
            .map_err(|e| HandlerError::Failed(format!("failed to encode audit entry: {}", e)))?;
        tracing::info!(target: "regulated_access_audit", event_id = %entry.event_id, "{}", line);
        Ok(())
    }
}

// Stable namespace for alert ids derived from event ids
const ALERT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_2c4e_9a7b_4e0f_8c3d_5b2a_1e9f_7c40);

fn alert_id(ctx: &EventContext) -> Uuid {
    Uuid::new_v5(&ALERT_NAMESPACE, ctx.event_id.as_bytes())
}

/// Raises care-team alerts for critical lab values and device alarms
pub struct CareTeamAlerts {
    sink: Arc<dyn AlertSink>,
}

impl CareTeamAlerts {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self { sink }
    }

    fn alert(&self, ctx: &EventContext, priority: AlertPriority, recipient_id: Option<String>, summary: String) -> CareTeamAlert {
        CareTeamAlert {
            alert_id: alert_id(ctx),
            priority,
            patient_id: ctx.patient_id.clone(),
            facility_id: ctx.facility_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            recipient_id,
            summary,
            source_event_id: ctx.event_id,
            correlation_id: ctx.correlation_id.clone(),
            raised_at: ctx.timestamp,
        }
    }
}

#[async_trait]
impl PayloadVisitor for CareTeamAlerts {
    fn handles(&self, event_type: &EventType) -> bool {
        matches!(
            event_type,
            EventType::CriticalValueDetected | EventType::DeviceAlertTriggered
        )
    }

    async fn critical_value_detected(
        &self,
        ctx: &EventContext,
        payload: &CriticalValueDetected,
    ) -> HandlerResult {
        let mut summary = format!("Critical {}: {}", payload.test_name, payload.value);
        if let Some(unit) = &payload.unit {
            summary.push(' ');
            summary.push_str(unit);
        }
        if let Some(range) = &payload.reference_range {
            summary.push_str(&format!(" (ref {})", range));
        }

        let alert = self.alert(
            ctx,
            AlertPriority::from(payload.severity),
            payload.notify_provider_id.clone(),
            summary,
        );
        self.sink.deliver(&alert).await?;
        Ok(HandlerOutcome::Handled)
    }

    async fn device_alert_triggered(
        &self,
        ctx: &EventContext,
        payload: &DeviceAlertTriggered,
    ) -> HandlerResult {
        let priority = match payload.severity.to_ascii_lowercase().as_str() {
            "critical" | "high" => AlertPriority::Urgent,
            _ => AlertPriority::Routine,
        };
        let summary = format!(
            "Device {} alarm {}: {}",
            payload.device_id, payload.alert_code, payload.message
        );

        let alert = self.alert(ctx, priority, None, summary);
        self.sink.deliver(&alert).await?;
        Ok(HandlerOutcome::Handled)
    }
}

#[async_trait]
impl NotificationHandler for CareTeamAlerts {
    async fn handle(&self, event: &ClinicalEvent) -> HandlerResult {
        dispatch(event, self).await
    }
}

/// Audits every access to a regulated identifier
pub struct RegulatedAccessAuditor {
    sink: Arc<dyn AuditSink>,
}

impl RegulatedAccessAuditor {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl PayloadVisitor for RegulatedAccessAuditor {
    fn handles(&self, event_type: &EventType) -> bool {
        matches!(event_type, EventType::RegulatedIdAccessed)
    }

    async fn regulated_id_accessed(
        &self,
        ctx: &EventContext,
        payload: &RegulatedIdAccessed,
    ) -> HandlerResult {
        if payload.access_reason.trim().is_empty() {
            return Err(HandlerError::InvalidPayload(
                "regulated access without a stated reason".to_string(),
            ));
        }

        if payload.unmasked {
            tracing::warn!(
                event_id = %ctx.event_id,
                tenant_id = %ctx.tenant_id,
                user_id = %ctx.actor.user_id.as_deref().unwrap_or("unknown"),
                id_type = %payload.id_type,
                "Unmasked regulated identifier accessed"
            );
        }

        let entry = AccessAuditEntry {
            event_id: ctx.event_id,
            tenant_id: ctx.tenant_id.clone(),
            facility_id: ctx.facility_id.clone(),
            patient_id: ctx.patient_id.clone(),
            user_id: ctx.actor.user_id.clone(),
            user_role: ctx.actor.user_role.clone(),
            id_type: payload.id_type.clone(),
            access_type: payload.access_type,
            unmasked: payload.unmasked,
            reason: payload.access_reason.clone(),
            accessed_at: payload.accessed_at,
        };
        self.sink.record(&entry).await?;
        Ok(HandlerOutcome::Handled)
    }
}

#[async_trait]
impl AuditHandler for RegulatedAccessAuditor {
    async fn handle(&self, event: &ClinicalEvent) -> HandlerResult {
        dispatch(event, self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use clinical_event_bus::{
        AccessType, ActorContext, CriticalSeverity, EventDraft, EventPayload,
    };
    use std::sync::Mutex;

    struct Collect<T> {
        items: Mutex<Vec<T>>,
    }

    impl<T> Default for Collect<T> {
        fn default() -> Self {
            Self {
                items: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AlertSink for Collect<CareTeamAlert> {
        async fn deliver(&self, alert: &CareTeamAlert) -> Result<(), HandlerError> {
            self.items.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl AuditSink for Collect<AccessAuditEntry> {
        async fn record(&self, entry: &AccessAuditEntry) -> Result<(), HandlerError> {
            self.items.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    fn event(payload: EventPayload) -> ClinicalEvent {
        EventDraft::new(payload.event_type(), "pat-1", "FAC-01", "tenant-1")
            .with_payload(&payload)
            .unwrap()
            .with_actor(ActorContext::new("user-9").with_role("registrar"))
            .enrich("test", "0.0.0")
    }

    fn potassium(severity: CriticalSeverity) -> EventPayload {
        EventPayload::CriticalValueDetected(CriticalValueDetected {
            test_name: "Potassium".to_string(),
            test_code: None,
            value: "6.9".to_string(),
            unit: Some("mmol/L".to_string()),
            reference_range: Some("3.5-5.1".to_string()),
            severity,
            detected_at: Utc::now(),
            notify_provider_id: Some("prov-12".to_string()),
        })
    }

    #[tokio::test]
    async fn test_panic_value_raises_critical_alert() {
        let sink = Arc::new(Collect::<CareTeamAlert>::default());
        let handler = CareTeamAlerts::new(sink.clone());
        let event = event(potassium(CriticalSeverity::Panic));

        let outcome = NotificationHandler::handle(&handler, &event).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Handled);

        let alerts = sink.items.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].priority, AlertPriority::Critical);
        assert_eq!(alerts[0].recipient_id.as_deref(), Some("prov-12"));
        assert_eq!(alerts[0].summary, "Critical Potassium: 6.9 mmol/L (ref 3.5-5.1)");
        assert_eq!(alerts[0].source_event_id, event.event_id());
    }

    #[tokio::test]
    async fn test_redelivery_produces_same_alert_id() {
        let sink = Arc::new(Collect::<CareTeamAlert>::default());
        let handler = CareTeamAlerts::new(sink.clone());
        let event = event(potassium(CriticalSeverity::Critical));

        NotificationHandler::handle(&handler, &event).await.unwrap();
        NotificationHandler::handle(&handler, &event).await.unwrap();

        let alerts = sink.items.lock().unwrap();
        assert_eq!(alerts[0].alert_id, alerts[1].alert_id);
        assert_eq!(alerts[0].priority, AlertPriority::Urgent);
    }

    #[tokio::test]
    async fn test_unrelated_events_are_skipped() {
        let sink = Arc::new(Collect::<CareTeamAlert>::default());
        let handler = CareTeamAlerts::new(sink.clone());
        let vitals = EventDraft::new(EventType::VitalSignsRecorded, "pat-1", "FAC-01", "t")
            .with_data(serde_json::json!({ "measurements": [], "recordedAt": Utc::now() }))
            .enrich("test", "0.0.0");

        let outcome = NotificationHandler::handle(&handler, &vitals).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Skipped);
        assert!(sink.items.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_access_is_audited_with_actor() {
        let sink = Arc::new(Collect::<AccessAuditEntry>::default());
        let auditor = RegulatedAccessAuditor::new(sink.clone());
        let event = event(EventPayload::RegulatedIdAccessed(RegulatedIdAccessed {
            id_type: "national_id".to_string(),
            access_type: AccessType::View,
            access_reason: "identity verification".to_string(),
            unmasked: true,
            accessed_at: Utc::now(),
        }));

        AuditHandler::handle(&auditor, &event).await.unwrap();

        let entries = sink.items.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].user_id.as_deref(), Some("user-9"));
        assert_eq!(entries[0].user_role.as_deref(), Some("registrar"));
        assert!(entries[0].unmasked);
    }

    #[tokio::test]
    async fn test_auditor_skips_patient_events_without_decoding() {
        let sink = Arc::new(Collect::<AccessAuditEntry>::default());
        let auditor = RegulatedAccessAuditor::new(sink.clone());
        let updated = EventDraft::new(EventType::PatientUpdated, "pat-1", "FAC-01", "tenant-1")
            .with_data(serde_json::json!({ "field": "address" }))
            .enrich("test", "0.0.0");

        let outcome = AuditHandler::handle(&auditor, &updated).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Skipped);
        assert!(sink.items.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_access_without_reason_is_rejected() {
        let sink = Arc::new(Collect::<AccessAuditEntry>::default());
        let auditor = RegulatedAccessAuditor::new(sink.clone());
        let event = event(EventPayload::RegulatedIdAccessed(RegulatedIdAccessed {
            id_type: "national_id".to_string(),
            access_type: AccessType::Export,
            access_reason: "  ".to_string(),
            unmasked: false,
            accessed_at: Utc::now(),
        }));

        let err = AuditHandler::handle(&auditor, &event).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload(_)));
        assert!(sink.items.lock().unwrap().is_empty());
    }
}
