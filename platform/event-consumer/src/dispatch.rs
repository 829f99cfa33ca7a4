//! Typed payload dispatch
//!
//! [`dispatch`] decodes an event's `data` by its type and calls the matching
//! [`PayloadVisitor`] method. Every method defaults to `Skipped`, so a
//! visitor only overrides the event types it cares about. Visitors that
//! narrow [`PayloadVisitor::handles`] never have other payloads decoded.

use async_trait::async_trait;
use clinical_event_bus::{
    AppointmentCancelled, AppointmentScheduled, ClinicalEvent, ClinicalNoteSigned,
    CriticalValueDetected, DeviceAlertTriggered, EventPayload, EventType, HandlerError, HandlerOutcome,
    HandlerResult, LabOrderPlaced, LabResultAvailable, MedicationAdministered,
    MedicationPrescribed, PatientAdmitted, PatientDischarged, PatientRegistered, PatientUpdated,
    RegulatedIdAccessed, VitalSignsRecorded,
};

use crate::context::EventContext;

#[async_trait]
pub trait PayloadVisitor: Send + Sync {
    /// Whether events of this type reach the visitor at all
    ///
    /// Events of other types are skipped before their payload is decoded, so
    /// a malformed payload the visitor never asked for is not an error.
    fn handles(&self, _event_type: &EventType) -> bool {
        true
    }

    async fn patient_registered(&self, _ctx: &EventContext, _payload: &PatientRegistered) -> HandlerResult {
        Ok(HandlerOutcome::Skipped)
    }

    async fn patient_updated(&self, _ctx: &EventContext, _payload: &PatientUpdated) -> HandlerResult {
        Ok(HandlerOutcome::Skipped)
    }

    async fn patient_admitted(&self, _ctx: &EventContext, _payload: &PatientAdmitted) -> HandlerResult {
        Ok(HandlerOutcome::Skipped)
    }

    async fn patient_discharged(&self, _ctx: &EventContext, _payload: &PatientDischarged) -> HandlerResult {
        Ok(HandlerOutcome::Skipped)
    }

    async fn medication_prescribed(&self, _ctx: &EventContext, _payload: &MedicationPrescribed) -> HandlerResult {
        Ok(HandlerOutcome::Skipped)
    }

    async fn medication_administered(&self, _ctx: &EventContext, _payload: &MedicationAdministered) -> HandlerResult {
        Ok(HandlerOutcome::Skipped)
    }

    async fn lab_order_placed(&self, _ctx: &EventContext, _payload: &LabOrderPlaced) -> HandlerResult {
        Ok(HandlerOutcome::Skipped)
    }

    async fn lab_result_available(&self, _ctx: &EventContext, _payload: &LabResultAvailable) -> HandlerResult {
        Ok(HandlerOutcome::Skipped)
    }

    async fn critical_value_detected(&self, _ctx: &EventContext, _payload: &CriticalValueDetected) -> HandlerResult {
        Ok(HandlerOutcome::Skipped)
    }

    async fn vital_signs_recorded(&self, _ctx: &EventContext, _payload: &VitalSignsRecorded) -> HandlerResult {
        Ok(HandlerOutcome::Skipped)
    }

    async fn device_alert_triggered(&self, _ctx: &EventContext, _payload: &DeviceAlertTriggered) -> HandlerResult {
        Ok(HandlerOutcome::Skipped)
    }

    async fn appointment_scheduled(&self, _ctx: &EventContext, _payload: &AppointmentScheduled) -> HandlerResult {
        Ok(HandlerOutcome::Skipped)
    }

    async fn appointment_cancelled(&self, _ctx: &EventContext, _payload: &AppointmentCancelled) -> HandlerResult {
        Ok(HandlerOutcome::Skipped)
    }

    async fn clinical_note_signed(&self, _ctx: &EventContext, _payload: &ClinicalNoteSigned) -> HandlerResult {
        Ok(HandlerOutcome::Skipped)
    }

    async fn regulated_id_accessed(&self, _ctx: &EventContext, _payload: &RegulatedIdAccessed) -> HandlerResult {
        Ok(HandlerOutcome::Skipped)
    }

    /// Custom event types the bus does not model
    async fn unrecognized(&self, _ctx: &EventContext, _event_type: &str, _data: &serde_json::Value) -> HandlerResult {
        Ok(HandlerOutcome::Skipped)
    }
}

/// Decode `event`'s payload and call the matching visitor method
///
/// A payload that does not match its event type is a
/// [`HandlerError::InvalidPayload`], which is never retried. Types the
/// visitor does not [`handle`](PayloadVisitor::handles) are `Skipped`
/// without decoding.
pub async fn dispatch<V>(event: &ClinicalEvent, visitor: &V) -> HandlerResult
where
    V: PayloadVisitor + ?Sized,
{
    if !visitor.handles(event.event_type()) {
        return Ok(HandlerOutcome::Skipped);
    }

    let payload = event.payload().map_err(|e| {
        HandlerError::InvalidPayload(format!("{} payload: {}", event.event_type(), e))
    })?;
    let ctx = EventContext::from_event(event);

    match &payload {
        EventPayload::PatientRegistered(p) => visitor.patient_registered(&ctx, p).await,
        EventPayload::PatientUpdated(p) => visitor.patient_updated(&ctx, p).await,
        EventPayload::PatientAdmitted(p) => visitor.patient_admitted(&ctx, p).await,
        EventPayload::PatientDischarged(p) => visitor.patient_discharged(&ctx, p).await,
        EventPayload::MedicationPrescribed(p) => visitor.medication_prescribed(&ctx, p).await,
        EventPayload::MedicationAdministered(p) => visitor.medication_administered(&ctx, p).await,
        EventPayload::LabOrderPlaced(p) => visitor.lab_order_placed(&ctx, p).await,
        EventPayload::LabResultAvailable(p) => visitor.lab_result_available(&ctx, p).await,
        EventPayload::CriticalValueDetected(p) => visitor.critical_value_detected(&ctx, p).await,
        EventPayload::VitalSignsRecorded(p) => visitor.vital_signs_recorded(&ctx, p).await,
        EventPayload::DeviceAlertTriggered(p) => visitor.device_alert_triggered(&ctx, p).await,
        EventPayload::AppointmentScheduled(p) => visitor.appointment_scheduled(&ctx, p).await,
        EventPayload::AppointmentCancelled(p) => visitor.appointment_cancelled(&ctx, p).await,
        EventPayload::ClinicalNoteSigned(p) => visitor.clinical_note_signed(&ctx, p).await,
        EventPayload::RegulatedIdAccessed(p) => visitor.regulated_id_accessed(&ctx, p).await,
        EventPayload::Unrecognized { event_type, data } => {
            visitor.unrecognized(&ctx, event_type, data).await
        }
    }
}
