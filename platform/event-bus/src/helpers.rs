//! Typed publish helpers for the common clinical events
//!
//! Each helper builds the draft from a [`PatientContext`], the typed payload,
//! and optional actor and trace context, then publishes it through the shared
//! [`ProducerSession`].

use crate::envelope::{ActorContext, ClinicalEvent, EventDraft};
use crate::payloads::{
    CriticalValueDetected, EventPayload, LabResultAvailable, MedicationPrescribed,
    PatientRegistered, RegulatedIdAccessed,
};
use crate::producer::ProducerSession;
use crate::BusResult;

/// Who the event is about and where it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientContext {
    pub patient_id: String,
    pub patient_record_number: Option<String>,
    pub facility_id: String,
    pub tenant_id: String,
    pub region: Option<String>,
}

impl PatientContext {
    pub fn new(
        patient_id: impl Into<String>,
        facility_id: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            patient_id: patient_id.into(),
            patient_record_number: None,
            facility_id: facility_id.into(),
            tenant_id: tenant_id.into(),
            region: None,
        }
    }

    pub fn with_record_number(mut self, record_number: impl Into<String>) -> Self {
        self.patient_record_number = Some(record_number.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// Correlation and causation ids carried over from the triggering request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
}

impl TraceContext {
    /// Continue a chain: the new event is caused by `event`
    pub fn caused_by(event: &ClinicalEvent) -> Self {
        Self {
            correlation_id: Some(event.correlation_id().to_string()),
            causation_id: Some(event.event_id().to_string()),
        }
    }
}

async fn publish_typed(
    session: &ProducerSession,
    context: &PatientContext,
    actor: Option<ActorContext>,
    payload: EventPayload,
    trace: Option<TraceContext>,
) -> BusResult<ClinicalEvent> {
    let trace = trace.unwrap_or_default();

    let mut draft = EventDraft::new(
        payload.event_type(),
        context.patient_id.clone(),
        context.facility_id.clone(),
        context.tenant_id.clone(),
    )
    .with_payload(&payload)?
    .with_record_number(context.patient_record_number.clone())
    .with_region(context.region.clone())
    .with_correlation_id(trace.correlation_id)
    .with_causation_id(trace.causation_id);

    if let Some(actor) = actor {
        draft = draft.with_actor(actor);
    }

    session.publish(draft).await
}

pub async fn publish_patient_registered(
    session: &ProducerSession,
    context: &PatientContext,
    actor: Option<ActorContext>,
    payload: PatientRegistered,
    trace: Option<TraceContext>,
) -> BusResult<ClinicalEvent> {
    publish_typed(
        session,
        context,
        actor,
        EventPayload::PatientRegistered(payload),
        trace,
    )
    .await
}

/// Lands on `device-events` so alerting consumers see it next to device data
pub async fn publish_critical_value_detected(
    session: &ProducerSession,
    context: &PatientContext,
    actor: Option<ActorContext>,
    payload: CriticalValueDetected,
    trace: Option<TraceContext>,
) -> BusResult<ClinicalEvent> {
    publish_typed(
        session,
        context,
        actor,
        EventPayload::CriticalValueDetected(payload),
        trace,
    )
    .await
}

pub async fn publish_medication_prescribed(
    session: &ProducerSession,
    context: &PatientContext,
    actor: Option<ActorContext>,
    payload: MedicationPrescribed,
    trace: Option<TraceContext>,
) -> BusResult<ClinicalEvent> {
    publish_typed(
        session,
        context,
        actor,
        EventPayload::MedicationPrescribed(payload),
        trace,
    )
    .await
}

pub async fn publish_lab_result_available(
    session: &ProducerSession,
    context: &PatientContext,
    actor: Option<ActorContext>,
    payload: LabResultAvailable,
    trace: Option<TraceContext>,
) -> BusResult<ClinicalEvent> {
    publish_typed(
        session,
        context,
        actor,
        EventPayload::LabResultAvailable(payload),
        trace,
    )
    .await
}

/// Record access to a regulated identifier; routed to `compliance-events`
pub async fn publish_regulated_id_accessed(
    session: &ProducerSession,
    context: &PatientContext,
    actor: Option<ActorContext>,
    payload: RegulatedIdAccessed,
    trace: Option<TraceContext>,
) -> BusResult<ClinicalEvent> {
    publish_typed(
        session,
        context,
        actor,
        EventPayload::RegulatedIdAccessed(payload),
        trace,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::BusObserver;
    use crate::payloads::{AccessType, CriticalSeverity};
    use crate::{BusConfig, EventType, InMemoryBroker};
    use chrono::Utc;
    use std::sync::Arc;

    async fn session(broker: &InMemoryBroker) -> ProducerSession {
        let session = ProducerSession::new(
            Arc::new(broker.clone()),
            &BusConfig::default(),
            BusObserver::new(),
        );
        session.connect().await.unwrap();
        session
    }

    fn patient() -> PatientContext {
        PatientContext::new("pat-1", "FAC-01", "tenant-1").with_record_number("MRN-0042")
    }

    fn registered() -> PatientRegistered {
        PatientRegistered {
            given_name: "Ada".to_string(),
            family_name: "Lovelace".to_string(),
            date_of_birth: None,
            gender: None,
            registration_channel: Some("front-desk".to_string()),
        }
    }

    #[tokio::test]
    async fn test_patient_registered_routes_to_partition_six() {
        let broker = InMemoryBroker::new();
        let session = session(&broker).await;

        let event = publish_patient_registered(&session, &patient(), None, registered(), None)
            .await
            .unwrap();

        assert_eq!(event.event_type(), &EventType::PatientRegistered);
        assert_eq!(event.patient_record_number(), Some("MRN-0042"));
        assert_eq!(broker.partition_records("patient-events", 6).len(), 1);

        match event.payload().unwrap() {
            EventPayload::PatientRegistered(p) => assert_eq!(p.family_name, "Lovelace"),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_identical_calls_produce_distinct_events() {
        let broker = InMemoryBroker::new();
        let session = session(&broker).await;

        let first = publish_patient_registered(&session, &patient(), None, registered(), None)
            .await
            .unwrap();
        let second = publish_patient_registered(&session, &patient(), None, registered(), None)
            .await
            .unwrap();

        assert_ne!(first.event_id(), second.event_id());
        assert_eq!(broker.records("patient-events").len(), 2);
    }

    #[tokio::test]
    async fn test_regulated_access_carries_actor_and_trace() {
        let broker = InMemoryBroker::new();
        let session = session(&broker).await;

        let trace = TraceContext {
            correlation_id: Some("req-77".to_string()),
            causation_id: Some("cmd-1".to_string()),
        };
        let actor = ActorContext::new("user-9")
            .with_name("Dr. Grace")
            .with_role("physician");

        let event = publish_regulated_id_accessed(
            &session,
            &patient(),
            Some(actor),
            RegulatedIdAccessed {
                id_type: "national_id".to_string(),
                access_type: AccessType::View,
                access_reason: "identity verification".to_string(),
                unmasked: true,
                accessed_at: Utc::now(),
            },
            Some(trace),
        )
        .await
        .unwrap();

        assert_eq!(event.topic().as_str(), "compliance-events");
        assert_eq!(event.correlation_id(), "req-77");
        assert_eq!(event.causation_id(), Some("cmd-1"));
        assert_eq!(event.actor().user_role.as_deref(), Some("physician"));
        assert_eq!(broker.records("compliance-events").len(), 1);
    }

    #[tokio::test]
    async fn test_critical_value_goes_to_device_events() {
        let broker = InMemoryBroker::new();
        let session = session(&broker).await;

        let first = publish_critical_value_detected(
            &session,
            &patient(),
            None,
            CriticalValueDetected {
                test_name: "Potassium".to_string(),
                test_code: Some("2823-3".to_string()),
                value: "6.9".to_string(),
                unit: Some("mmol/L".to_string()),
                reference_range: Some("3.5-5.1".to_string()),
                severity: CriticalSeverity::Panic,
                detected_at: Utc::now(),
                notify_provider_id: None,
            },
            None,
        )
        .await
        .unwrap();

        assert_eq!(broker.records("device-events").len(), 1);

        let follow_up = TraceContext::caused_by(&first);
        assert_eq!(follow_up.correlation_id.as_deref(), Some(first.correlation_id()));
        assert_eq!(follow_up.causation_id, Some(first.event_id().to_string()));
    }

    #[tokio::test]
    async fn test_blank_context_is_rejected() {
        let broker = InMemoryBroker::new();
        let session = session(&broker).await;

        let result = publish_patient_registered(
            &session,
            &PatientContext::new("pat-1", " ", "tenant-1"),
            None,
            registered(),
            None,
        )
        .await;

        assert!(matches!(result, Err(crate::BusError::InvalidEvent(_))));
    }
}
