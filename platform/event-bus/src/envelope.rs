//! # Clinical Event Envelope
//!
//! The canonical record carried on every topic of the bus.
//!
//! ## Lifecycle
//!
//! 1. A caller (usually a typed helper) builds an [`EventDraft`]. Drafts have
//!    no `event_id`, `timestamp`, or enforced `version`; callers cannot
//!    supply an id.
//! 2. The producer session calls [`EventDraft::enrich`], which assigns the id
//!    and timestamp, defaults the version to `"1.0"`, and defaults the
//!    correlation id to the event id.
//! 3. The resulting [`ClinicalEvent`] is read-only: fields are exposed through
//!    accessors only.
//!
//! ## Wire Format
//!
//! JSON with camelCase field names (`eventId`, `eventType`, `patientId`, ...).
//! `data` is free-form at the transport level and decoded into
//! [`EventPayload`] on demand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

use crate::payloads::EventPayload;
use crate::routing::{topic_for, Topic};

/// Default envelope version when the caller does not pin one
pub const DEFAULT_VERSION: &str = "1.0";

/// Clinical event type
///
/// Known types are listed explicitly. Anything else is preserved verbatim in
/// [`EventType::Custom`] so that routing stays total for types introduced by
/// newer publishers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    PatientRegistered,
    PatientUpdated,
    PatientAdmitted,
    PatientDischarged,
    MedicationPrescribed,
    MedicationAdministered,
    LabOrderPlaced,
    LabResultAvailable,
    CriticalValueDetected,
    VitalSignsRecorded,
    DeviceAlertTriggered,
    AppointmentScheduled,
    AppointmentCancelled,
    ClinicalNoteSigned,
    RegulatedIdAccessed,
    Custom(String),
}

impl EventType {
    /// Every declared (non-custom) event type
    pub const KNOWN: [EventType; 15] = [
        EventType::PatientRegistered,
        EventType::PatientUpdated,
        EventType::PatientAdmitted,
        EventType::PatientDischarged,
        EventType::MedicationPrescribed,
        EventType::MedicationAdministered,
        EventType::LabOrderPlaced,
        EventType::LabResultAvailable,
        EventType::CriticalValueDetected,
        EventType::VitalSignsRecorded,
        EventType::DeviceAlertTriggered,
        EventType::AppointmentScheduled,
        EventType::AppointmentCancelled,
        EventType::ClinicalNoteSigned,
        EventType::RegulatedIdAccessed,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            EventType::PatientRegistered => "patient_registered",
            EventType::PatientUpdated => "patient_updated",
            EventType::PatientAdmitted => "patient_admitted",
            EventType::PatientDischarged => "patient_discharged",
            EventType::MedicationPrescribed => "medication_prescribed",
            EventType::MedicationAdministered => "medication_administered",
            EventType::LabOrderPlaced => "lab_order_placed",
            EventType::LabResultAvailable => "lab_result_available",
            EventType::CriticalValueDetected => "critical_value_detected",
            EventType::VitalSignsRecorded => "vital_signs_recorded",
            EventType::DeviceAlertTriggered => "device_alert_triggered",
            EventType::AppointmentScheduled => "appointment_scheduled",
            EventType::AppointmentCancelled => "appointment_cancelled",
            EventType::ClinicalNoteSigned => "clinical_note_signed",
            EventType::RegulatedIdAccessed => "regulated_id_accessed",
            EventType::Custom(name) => name,
        }
    }

    /// Destination topic for this event type
    pub fn topic(&self) -> Topic {
        topic_for(self.as_str())
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        EventType::KNOWN
            .iter()
            .find(|known| known.as_str() == value)
            .cloned()
            .unwrap_or_else(|| EventType::Custom(value.to_string()))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(EventType::from(raw.as_str()))
    }
}

/// Who performed the action that produced the event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActorContext {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub user_role: Option<String>,
}

impl ActorContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self
    }

    pub fn with_role(mut self, user_role: impl Into<String>) -> Self {
        self.user_role = Some(user_role.into());
        self
    }
}

/// A partially-built event, before id/timestamp/version are assigned
#[derive(Debug, Clone)]
pub struct EventDraft {
    event_type: EventType,
    patient_id: String,
    patient_record_number: Option<String>,
    facility_id: String,
    tenant_id: String,
    region: Option<String>,
    actor: ActorContext,
    data: serde_json::Value,
    metadata: Option<serde_json::Value>,
    correlation_id: Option<String>,
    causation_id: Option<String>,
    version: Option<String>,
}

impl EventDraft {
    /// Start a draft with the mandatory routing context
    pub fn new(
        event_type: EventType,
        patient_id: impl Into<String>,
        facility_id: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            patient_id: patient_id.into(),
            patient_record_number: None,
            facility_id: facility_id.into(),
            tenant_id: tenant_id.into(),
            region: None,
            actor: ActorContext::default(),
            data: serde_json::Value::Object(serde_json::Map::new()),
            metadata: None,
            correlation_id: None,
            causation_id: None,
            version: None,
        }
    }

    /// Set the event type and `data` from a typed payload
    pub fn with_payload(mut self, payload: &EventPayload) -> Result<Self, serde_json::Error> {
        self.event_type = payload.event_type();
        self.data = payload.to_data()?;
        Ok(self)
    }

    /// Set a free-form `data` payload
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_record_number(mut self, patient_record_number: Option<String>) -> Self {
        self.patient_record_number = patient_record_number;
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn with_actor(mut self, actor: ActorContext) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set the correlation ID (defaults to the event id when absent)
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Set the causation ID
    pub fn with_causation_id(mut self, causation_id: Option<String>) -> Self {
        self.causation_id = causation_id;
        self
    }

    /// Pin the envelope version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// Check the mandatory context fields
    ///
    /// `patient_id`, `facility_id`, and `tenant_id` must be non-blank.
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("patientId", &self.patient_id),
            ("facilityId", &self.facility_id),
            ("tenantId", &self.tenant_id),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{field} cannot be empty"));
            }
        }

        if self.event_type.as_str().trim().is_empty() {
            return Err("eventType cannot be empty".to_string());
        }

        Ok(())
    }

    /// Complete the envelope
    ///
    /// Assigns a fresh `event_id` and `timestamp`; this is the only place an
    /// event id is ever generated.
    pub fn enrich(self, source: &str, source_version: &str) -> ClinicalEvent {
        let event_id = Uuid::new_v4();
        let correlation_id = self
            .correlation_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| event_id.to_string());
        let version = self
            .version
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());

        ClinicalEvent {
            event_id,
            event_type: self.event_type,
            timestamp: Utc::now(),
            version,
            patient_id: self.patient_id,
            patient_record_number: self.patient_record_number,
            facility_id: self.facility_id,
            tenant_id: self.tenant_id,
            region: self.region,
            user_id: self.actor.user_id,
            user_name: self.actor.user_name,
            user_role: self.actor.user_role,
            data: self.data,
            metadata: self.metadata,
            correlation_id,
            causation_id: self.causation_id,
            source: source.to_string(),
            source_version: source_version.to_string(),
        }
    }
}

/// A complete, published clinical event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicalEvent {
    event_id: Uuid,
    event_type: EventType,
    timestamp: DateTime<Utc>,
    version: String,
    patient_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    patient_record_number: Option<String>,
    facility_id: String,
    tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_role: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<serde_json::Value>,
    correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    causation_id: Option<String>,
    source: String,
    source_version: String,
}

impl ClinicalEvent {
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    pub fn patient_record_number(&self) -> Option<&str> {
        self.patient_record_number.as_deref()
    }

    pub fn facility_id(&self) -> &str {
        &self.facility_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn actor(&self) -> ActorContext {
        ActorContext {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            user_role: self.user_role.clone(),
        }
    }

    /// Raw `data` payload as carried on the wire
    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    pub fn metadata(&self) -> Option<&serde_json::Value> {
        self.metadata.as_ref()
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn source_version(&self) -> &str {
        &self.source_version
    }

    /// Decode `data` into the typed payload for this event's type
    pub fn payload(&self) -> Result<EventPayload, serde_json::Error> {
        EventPayload::decode(&self.event_type, &self.data)
    }

    /// Destination topic for this event
    pub fn topic(&self) -> Topic {
        self.event_type.topic()
    }
}

/// Validate a raw event envelope before typed decoding
///
/// # Validation Rules
///
/// - `eventId`: Must be a valid UUID
/// - `eventType`: Must be a non-empty string
/// - `timestamp`: Must be present
/// - `patientId`, `facilityId`, `tenantId`: Must be non-empty
///
/// # Errors
///
/// Returns a descriptive error string if validation fails
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> Result<(), String> {
    let event_id = envelope
        .get("eventId")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid eventId")?;

    Uuid::parse_str(event_id).map_err(|e| format!("eventId is not a UUID: {e}"))?;

    let event_type = envelope
        .get("eventType")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid eventType")?;

    if event_type.is_empty() {
        return Err("eventType cannot be empty".to_string());
    }

    envelope
        .get("timestamp")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid timestamp")?;

    for field in ["patientId", "facilityId", "tenantId"] {
        let value = envelope
            .get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("Missing or invalid {field}"))?;

        if value.trim().is_empty() {
            return Err(format!("{field} cannot be empty"));
        }
    }

    // everything else is optional
    Ok(())
}
