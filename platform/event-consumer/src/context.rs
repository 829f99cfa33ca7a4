use chrono::{DateTime, Utc};
use clinical_event_bus::helpers::{PatientContext, TraceContext};
use clinical_event_bus::{ActorContext, ClinicalEvent, EventType};
use uuid::Uuid;

/// Envelope fields a payload handler usually needs alongside the payload
#[derive(Debug, Clone, PartialEq)]
pub struct EventContext {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub patient_id: String,
    pub patient_record_number: Option<String>,
    pub facility_id: String,
    pub tenant_id: String,
    pub region: Option<String>,
    pub actor: ActorContext,
    pub correlation_id: String,
    pub causation_id: Option<String>,
    pub source: String,
}

impl EventContext {
    pub fn from_event(event: &ClinicalEvent) -> Self {
        Self {
            event_id: event.event_id(),
            event_type: event.event_type().clone(),
            timestamp: event.timestamp(),
            patient_id: event.patient_id().to_string(),
            patient_record_number: event.patient_record_number().map(str::to_string),
            facility_id: event.facility_id().to_string(),
            tenant_id: event.tenant_id().to_string(),
            region: event.region().map(str::to_string),
            actor: event.actor(),
            correlation_id: event.correlation_id().to_string(),
            causation_id: event.causation_id().map(str::to_string),
            source: event.source().to_string(),
        }
    }

    /// Same patient, facility, tenant, and region, for follow-up events
    pub fn patient(&self) -> PatientContext {
        PatientContext {
            patient_id: self.patient_id.clone(),
            patient_record_number: self.patient_record_number.clone(),
            facility_id: self.facility_id.clone(),
            tenant_id: self.tenant_id.clone(),
            region: self.region.clone(),
        }
    }

    /// Trace for an event caused by this one
    pub fn follow_up(&self) -> TraceContext {
        TraceContext {
            correlation_id: Some(self.correlation_id.clone()),
            causation_id: Some(self.event_id.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinical_event_bus::EventDraft;

    #[test]
    fn test_follow_up_keeps_correlation_and_points_at_cause() {
        let event = EventDraft::new(EventType::LabResultAvailable, "pat-1", "FAC-01", "tenant-1")
            .with_region(Some("us-east".to_string()))
            .with_correlation_id(Some("order-flow-9".to_string()))
            .enrich("lab-service", "1.0.0");

        let context = EventContext::from_event(&event);
        assert_eq!(context.source, "lab-service");

        let trace = context.follow_up();
        assert_eq!(trace.correlation_id.as_deref(), Some("order-flow-9"));
        assert_eq!(trace.causation_id, Some(event.event_id().to_string()));

        let patient = context.patient();
        assert_eq!(patient.facility_id, "FAC-01");
        assert_eq!(patient.region.as_deref(), Some("us-east"));
    }
}
