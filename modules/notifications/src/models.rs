use chrono::{DateTime, Utc};
use clinical_event_bus::{AccessType, CriticalSeverity};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// CARE-TEAM ALERTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPriority {
    Routine,
    Urgent,
    Critical,
}

impl From<CriticalSeverity> for AlertPriority {
    fn from(severity: CriticalSeverity) -> Self {
        match severity {
            CriticalSeverity::Panic => AlertPriority::Critical,
            CriticalSeverity::Critical => AlertPriority::Urgent,
        }
    }
}

/// An alert raised for the care team of a patient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CareTeamAlert {
    /// Derived from the source event, so a redelivered event yields the same id
    pub alert_id: Uuid,
    pub priority: AlertPriority,
    pub patient_id: String,
    pub facility_id: String,
    pub tenant_id: String,
    /// Provider to page directly; otherwise the facility's on-call roster
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    pub summary: String,
    /// Event that raised the alert
    pub source_event_id: Uuid,
    pub correlation_id: String,
    pub raised_at: DateTime<Utc>,
}

// ============================================================================
// REGULATED ACCESS AUDIT
// ============================================================================

/// One audited access to a regulated identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessAuditEntry {
    pub event_id: Uuid,
    pub tenant_id: String,
    pub facility_id: String,
    pub patient_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_role: Option<String>,
    pub id_type: String,
    pub access_type: AccessType,
    pub unmasked: bool,
    pub reason: String,
    pub accessed_at: DateTime<Utc>,
}
