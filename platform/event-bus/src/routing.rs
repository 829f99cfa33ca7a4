//! Topic routing and partition selection
//!
//! Both functions are pure: no randomness, no external state.

use std::fmt;

/// Partition count used by the reference deployment
pub const DEFAULT_PARTITIONS: u32 = 16;

/// Fixed topic names of the clinical bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    PatientEvents,
    MedicationEvents,
    LabEvents,
    DeviceEvents,
    AppointmentEvents,
    BillingEvents,
    AuditEvents,
    AlertEvents,
    ComplianceEvents,
    ClinicalEvents,
    DeadLetterQueue,
}

impl Topic {
    pub const ALL: [Topic; 11] = [
        Topic::PatientEvents,
        Topic::MedicationEvents,
        Topic::LabEvents,
        Topic::DeviceEvents,
        Topic::AppointmentEvents,
        Topic::BillingEvents,
        Topic::AuditEvents,
        Topic::AlertEvents,
        Topic::ComplianceEvents,
        Topic::ClinicalEvents,
        Topic::DeadLetterQueue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::PatientEvents => "patient-events",
            Topic::MedicationEvents => "medication-events",
            Topic::LabEvents => "lab-events",
            Topic::DeviceEvents => "device-events",
            Topic::AppointmentEvents => "appointment-events",
            Topic::BillingEvents => "billing-events",
            Topic::AuditEvents => "audit-events",
            Topic::AlertEvents => "alert-events",
            Topic::ComplianceEvents => "compliance-events",
            Topic::ClinicalEvents => "clinical-events",
            Topic::DeadLetterQueue => "dead-letter-queue",
        }
    }

    /// Resolve a topic by its wire name
    pub fn from_name(name: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|topic| topic.as_str() == name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map an event type to its destination topic
///
/// Rules are evaluated in order; the first match wins:
/// - `patient_*` → `patient-events`
/// - `medication_*` → `medication-events`
/// - `lab_*` → `lab-events`
/// - `device_*`, `*vital_signs*`, `*critical_value*` → `device-events`
/// - `appointment_*` → `appointment-events`
/// - exactly `regulated_id_accessed` → `compliance-events`
/// - anything else → `clinical-events`
pub fn topic_for(event_type: &str) -> Topic {
    if event_type.starts_with("patient_") {
        Topic::PatientEvents
    } else if event_type.starts_with("medication_") {
        Topic::MedicationEvents
    } else if event_type.starts_with("lab_") {
        Topic::LabEvents
    } else if event_type.starts_with("device_")
        || event_type.contains("vital_signs")
        || event_type.contains("critical_value")
    {
        Topic::DeviceEvents
    } else if event_type.starts_with("appointment_") {
        Topic::AppointmentEvents
    } else if event_type == "regulated_id_accessed" {
        Topic::ComplianceEvents
    } else {
        Topic::ClinicalEvents
    }
}

/// Map a facility id to a partition in `[0, partitions)`
///
/// Rolling hash over the UTF-8 bytes with a wrapping 32-bit signed
/// accumulator (`hash = hash * 31 + byte`), then `|hash| mod partitions`.
/// Historical data is partitioned with exactly this function; changing it
/// requires a repartition.
///
/// # Panics
///
/// Never: a `partitions` value of zero is treated as one.
pub fn partition_for(facility_id: &str, partitions: u32) -> i32 {
    let hash = facility_id
        .as_bytes()
        .iter()
        .fold(0i32, |hash, &byte| hash.wrapping_mul(31).wrapping_add(i32::from(byte)));

    // unsigned_abs keeps |i32::MIN| = 2^31 instead of overflowing
    (hash.unsigned_abs() % partitions.max(1)) as i32
}

/// Destination of a single event on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub topic: Topic,
    pub partition: i32,
    /// Message key (patient id) for co-location within the partition
    pub key: String,
}

impl Route {
    pub fn new(event_type: &str, facility_id: &str, patient_id: &str, partitions: u32) -> Self {
        Self {
            topic: topic_for(event_type),
            partition: partition_for(facility_id, partitions),
            key: patient_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventType;
    use rand::distributions::{Alphanumeric, DistString};
    use rand::Rng;

    #[test]
    fn test_prefix_routing() {
        assert_eq!(topic_for("patient_registered"), Topic::PatientEvents);
        assert_eq!(topic_for("medication_prescribed"), Topic::MedicationEvents);
        assert_eq!(topic_for("lab_result_available"), Topic::LabEvents);
        assert_eq!(topic_for("appointment_scheduled"), Topic::AppointmentEvents);
    }

    #[test]
    fn test_device_routing_uses_substrings() {
        assert_eq!(topic_for("device_alert_triggered"), Topic::DeviceEvents);
        assert_eq!(topic_for("vital_signs_recorded"), Topic::DeviceEvents);
        assert_eq!(topic_for("critical_value_detected"), Topic::DeviceEvents);
        assert_eq!(topic_for("bedside_vital_signs_batch"), Topic::DeviceEvents);
    }

    #[test]
    fn test_earlier_rules_win() {
        // lab_ matches before the critical_value substring rule
        assert_eq!(topic_for("lab_critical_value_flagged"), Topic::LabEvents);
        assert_eq!(topic_for("patient_vital_signs_reviewed"), Topic::PatientEvents);
    }

    #[test]
    fn test_regulated_id_routes_to_compliance() {
        assert_eq!(topic_for("regulated_id_accessed"), Topic::ComplianceEvents);
        assert_eq!(topic_for("regulated_id_accessed_bulk"), Topic::ClinicalEvents);
    }

    #[test]
    fn test_default_topic() {
        assert_eq!(topic_for("clinical_note_signed"), Topic::ClinicalEvents);
        assert_eq!(topic_for("billing_charge_posted"), Topic::ClinicalEvents);
        assert_eq!(topic_for(""), Topic::ClinicalEvents);
    }

    #[test]
    fn test_every_known_event_type_resolves() {
        for event_type in EventType::KNOWN.iter() {
            let topic = event_type.topic();
            assert!(Topic::ALL.contains(&topic));
            assert_ne!(topic, Topic::DeadLetterQueue);
        }
    }

    #[test]
    fn test_partition_reference_values() {
        assert_eq!(partition_for("FAC-01", 16), 6);
        assert_eq!(partition_for("FAC-02", 16), 7);
        assert_eq!(partition_for("", 16), 0);
        // negative accumulator
        assert_eq!(partition_for("facility-north", 16), 5);
        // multi-byte UTF-8 hashes bytes, not chars
        assert_eq!(partition_for("é", 16), 6);
    }

    #[test]
    fn test_partition_is_deterministic_and_in_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let len = rng.gen_range(0..64);
            let facility = Alphanumeric.sample_string(&mut rng, len);
            let first = partition_for(&facility, DEFAULT_PARTITIONS);
            assert!((0..16).contains(&first));
            assert_eq!(first, partition_for(&facility, DEFAULT_PARTITIONS));
        }
    }

    #[test]
    fn test_zero_partitions_does_not_panic() {
        assert_eq!(partition_for("FAC-01", 0), 0);
    }

    #[test]
    fn test_topic_names_round_trip() {
        for topic in Topic::ALL {
            assert_eq!(Topic::from_name(topic.as_str()), Some(topic));
        }
        assert_eq!(Topic::from_name("unknown-events"), None);
    }

    #[test]
    fn test_route_keys_by_patient() {
        let route = Route::new("patient_registered", "FAC-01", "pat-9", 16);
        assert_eq!(route.topic, Topic::PatientEvents);
        assert_eq!(route.partition, 6);
        assert_eq!(route.key, "pat-9");
    }
}
