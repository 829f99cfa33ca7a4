//! Care-team alerting and regulated-access auditing
//!
//! Consumes the clinical event bus as two concerns: notification (critical
//! values and device alarms become care-team alerts) and audit (every access
//! to a regulated identifier becomes an audit entry).

pub mod consumer_tasks;
pub mod handlers;
pub mod models;
