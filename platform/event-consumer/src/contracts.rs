//! Per-concern handler contracts
//!
//! Each downstream concern gets its own trait so a service states what it
//! does with an event by which trait it implements. All of them share the
//! calling contract of [`EventHandler`]: await to completion, return
//! `Handled`/`Skipped` or an error, and tolerate redelivery.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use clinical_event_bus::{ClinicalEvent, EventHandler, HandlerResult, Topic};

/// Downstream concern a consuming service implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Concern {
    RecordKeeping,
    DecisionSupport,
    Notification,
    Audit,
    InteropExport,
}

impl Concern {
    pub const ALL: [Concern; 5] = [
        Concern::RecordKeeping,
        Concern::DecisionSupport,
        Concern::Notification,
        Concern::Audit,
        Concern::InteropExport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Concern::RecordKeeping => "record-keeping",
            Concern::DecisionSupport => "decision-support",
            Concern::Notification => "notification",
            Concern::Audit => "audit",
            Concern::InteropExport => "interop-export",
        }
    }

    /// Topics a handler for this concern listens on unless overridden
    pub fn default_topics(&self) -> &'static [Topic] {
        match self {
            Concern::RecordKeeping => &[Topic::PatientEvents, Topic::AppointmentEvents],
            Concern::DecisionSupport => &[Topic::MedicationEvents, Topic::LabEvents],
            Concern::Notification => &[Topic::DeviceEvents, Topic::AlertEvents],
            Concern::Audit => &[Topic::ComplianceEvents, Topic::PatientEvents],
            Concern::InteropExport => &[
                Topic::PatientEvents,
                Topic::LabEvents,
                Topic::MedicationEvents,
            ],
        }
    }

    /// Consumer group for `service` handling this concern
    ///
    /// One group per (service, concern) so each concern tracks its own
    /// offsets and scales independently.
    pub fn consumer_group(&self, service: &str) -> String {
        format!("{}-{}", service, self.as_str())
    }
}

impl fmt::Display for Concern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! concern_contract {
    ($(#[$meta:meta])* $contract:ident => $adapter:ident) => {
        $(#[$meta])*
        #[async_trait]
        pub trait $contract: Send + Sync {
            async fn handle(&self, event: &ClinicalEvent) -> HandlerResult;
        }

        pub(crate) struct $adapter<H: ?Sized>(pub(crate) Arc<H>);

        #[async_trait]
        impl<H: $contract + ?Sized> EventHandler for $adapter<H> {
            async fn handle(&self, event: &ClinicalEvent) -> HandlerResult {
                <H as $contract>::handle(&*self.0, event).await
            }
        }
    };
}

concern_contract! {
    /// Maintains the longitudinal patient record and scheduling state
    RecordKeepingHandler => RecordKeepingAdapter
}

concern_contract! {
    /// Clinical decision support: interactions, dosing checks, result triage
    DecisionSupportHandler => DecisionSupportAdapter
}

concern_contract! {
    /// Pages, alerts, and messages to care teams
    NotificationHandler => NotificationAdapter
}

concern_contract! {
    /// Compliance and access auditing
    AuditHandler => AuditAdapter
}

concern_contract! {
    /// Outbound interoperability feeds (HL7/FHIR exports, registries)
    InteropExportHandler => InteropExportAdapter
}
