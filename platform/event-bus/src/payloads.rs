//! Typed `data` payloads, one per event type
//!
//! On the wire `data` is plain JSON. [`EventPayload`] is the sum type over
//! every known event type; decoding is driven by the envelope's `eventType`
//! so handlers can `match` exhaustively instead of switching on strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::EventType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientRegistered {
    pub given_name: String,
    pub family_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    /// Where the registration happened (front desk, portal, ED triage, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientUpdated {
    pub changed_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientAdmitted {
    pub encounter_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admitting_provider_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientDischarged {
    pub encounter_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disposition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationPrescribed {
    pub prescription_id: String,
    pub medication_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medication_code: Option<String>,
    pub dosage: String,
    pub route: String,
    pub frequency: String,
    pub prescriber_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_days: Option<u32>,
    #[serde(default)]
    pub controlled_substance: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationAdministered {
    pub prescription_id: String,
    pub administered_by: String,
    pub dose_given: String,
    pub administered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabOrderPlaced {
    pub order_id: String,
    pub test_codes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

/// Lifecycle status of a lab result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Preliminary,
    Final,
    Corrected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabResultAvailable {
    pub order_id: String,
    pub result_id: String,
    pub test_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_code: Option<String>,
    pub status: ResultStatus,
    #[serde(default)]
    pub abnormal: bool,
    pub resulted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalSeverity {
    Critical,
    Panic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalValueDetected {
    pub test_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_code: Option<String>,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_range: Option<String>,
    pub severity: CriticalSeverity,
    pub detected_at: DateTime<Utc>,
    /// Provider who must acknowledge the value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_provider_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalMeasurement {
    pub kind: String,
    pub value: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalSignsRecorded {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub measurements: Vec<VitalMeasurement>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAlertTriggered {
    pub device_id: String,
    pub alert_code: String,
    pub message: String,
    pub severity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentScheduled {
    pub appointment_id: String,
    pub provider_id: String,
    pub scheduled_for: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentCancelled {
    pub appointment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicalNoteSigned {
    pub note_id: String,
    pub note_type: String,
    pub author_id: String,
}

/// How a regulated identifier was touched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    View,
    Export,
    Print,
    Update,
}

/// Access to a regulated identifier (national id, insurance member id, ...)
///
/// The identifier value itself is never carried, only its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegulatedIdAccessed {
    pub id_type: String,
    pub access_type: AccessType,
    pub access_reason: String,
    #[serde(default)]
    pub unmasked: bool,
    pub accessed_at: DateTime<Utc>,
}

/// Typed `data` payload, keyed by event type
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    PatientRegistered(PatientRegistered),
    PatientUpdated(PatientUpdated),
    PatientAdmitted(PatientAdmitted),
    PatientDischarged(PatientDischarged),
    MedicationPrescribed(MedicationPrescribed),
    MedicationAdministered(MedicationAdministered),
    LabOrderPlaced(LabOrderPlaced),
    LabResultAvailable(LabResultAvailable),
    CriticalValueDetected(CriticalValueDetected),
    VitalSignsRecorded(VitalSignsRecorded),
    DeviceAlertTriggered(DeviceAlertTriggered),
    AppointmentScheduled(AppointmentScheduled),
    AppointmentCancelled(AppointmentCancelled),
    ClinicalNoteSigned(ClinicalNoteSigned),
    RegulatedIdAccessed(RegulatedIdAccessed),
    /// Custom event type; `data` kept as-is
    Unrecognized {
        event_type: String,
        data: serde_json::Value,
    },
}

impl EventPayload {
    /// Decode raw `data` according to `event_type`
    pub fn decode(
        event_type: &EventType,
        data: &serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        fn typed<T: serde::de::DeserializeOwned>(
            data: &serde_json::Value,
        ) -> Result<T, serde_json::Error> {
            T::deserialize(data)
        }

        Ok(match event_type {
            EventType::PatientRegistered => EventPayload::PatientRegistered(typed(data)?),
            EventType::PatientUpdated => EventPayload::PatientUpdated(typed(data)?),
            EventType::PatientAdmitted => EventPayload::PatientAdmitted(typed(data)?),
            EventType::PatientDischarged => EventPayload::PatientDischarged(typed(data)?),
            EventType::MedicationPrescribed => EventPayload::MedicationPrescribed(typed(data)?),
            EventType::MedicationAdministered => {
                EventPayload::MedicationAdministered(typed(data)?)
            }
            EventType::LabOrderPlaced => EventPayload::LabOrderPlaced(typed(data)?),
            EventType::LabResultAvailable => EventPayload::LabResultAvailable(typed(data)?),
            EventType::CriticalValueDetected => EventPayload::CriticalValueDetected(typed(data)?),
            EventType::VitalSignsRecorded => EventPayload::VitalSignsRecorded(typed(data)?),
            EventType::DeviceAlertTriggered => EventPayload::DeviceAlertTriggered(typed(data)?),
            EventType::AppointmentScheduled => EventPayload::AppointmentScheduled(typed(data)?),
            EventType::AppointmentCancelled => EventPayload::AppointmentCancelled(typed(data)?),
            EventType::ClinicalNoteSigned => EventPayload::ClinicalNoteSigned(typed(data)?),
            EventType::RegulatedIdAccessed => EventPayload::RegulatedIdAccessed(typed(data)?),
            EventType::Custom(name) => EventPayload::Unrecognized {
                event_type: name.clone(),
                data: data.clone(),
            },
        })
    }

    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::PatientRegistered(_) => EventType::PatientRegistered,
            EventPayload::PatientUpdated(_) => EventType::PatientUpdated,
            EventPayload::PatientAdmitted(_) => EventType::PatientAdmitted,
            EventPayload::PatientDischarged(_) => EventType::PatientDischarged,
            EventPayload::MedicationPrescribed(_) => EventType::MedicationPrescribed,
            EventPayload::MedicationAdministered(_) => EventType::MedicationAdministered,
            EventPayload::LabOrderPlaced(_) => EventType::LabOrderPlaced,
            EventPayload::LabResultAvailable(_) => EventType::LabResultAvailable,
            EventPayload::CriticalValueDetected(_) => EventType::CriticalValueDetected,
            EventPayload::VitalSignsRecorded(_) => EventType::VitalSignsRecorded,
            EventPayload::DeviceAlertTriggered(_) => EventType::DeviceAlertTriggered,
            EventPayload::AppointmentScheduled(_) => EventType::AppointmentScheduled,
            EventPayload::AppointmentCancelled(_) => EventType::AppointmentCancelled,
            EventPayload::ClinicalNoteSigned(_) => EventType::ClinicalNoteSigned,
            EventPayload::RegulatedIdAccessed(_) => EventType::RegulatedIdAccessed,
            EventPayload::Unrecognized { event_type, .. } => EventType::from(event_type.as_str()),
        }
    }

    /// Encode into the wire `data` value
    pub fn to_data(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            EventPayload::PatientRegistered(p) => serde_json::to_value(p),
            EventPayload::PatientUpdated(p) => serde_json::to_value(p),
            EventPayload::PatientAdmitted(p) => serde_json::to_value(p),
            EventPayload::PatientDischarged(p) => serde_json::to_value(p),
            EventPayload::MedicationPrescribed(p) => serde_json::to_value(p),
            EventPayload::MedicationAdministered(p) => serde_json::to_value(p),
            EventPayload::LabOrderPlaced(p) => serde_json::to_value(p),
            EventPayload::LabResultAvailable(p) => serde_json::to_value(p),
            EventPayload::CriticalValueDetected(p) => serde_json::to_value(p),
            EventPayload::VitalSignsRecorded(p) => serde_json::to_value(p),
            EventPayload::DeviceAlertTriggered(p) => serde_json::to_value(p),
            EventPayload::AppointmentScheduled(p) => serde_json::to_value(p),
            EventPayload::AppointmentCancelled(p) => serde_json::to_value(p),
            EventPayload::ClinicalNoteSigned(p) => serde_json::to_value(p),
            EventPayload::RegulatedIdAccessed(p) => serde_json::to_value(p),
            EventPayload::Unrecognized { data, .. } => Ok(data.clone()),
        }
    }
}
