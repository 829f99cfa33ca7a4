use std::sync::Arc;

use clinical_event_bus::{
    BusResult, BusRuntime, EventHandler, EventSubscription, RetryConfig, Topic,
};

use crate::contracts::{
    AuditAdapter, AuditHandler, Concern, DecisionSupportAdapter, DecisionSupportHandler,
    InteropExportAdapter, InteropExportHandler, NotificationAdapter, NotificationHandler,
    RecordKeepingAdapter, RecordKeepingHandler,
};

/// A concern handler and the topics it listens on
#[derive(Clone)]
pub struct Registration {
    pub concern: Concern,
    pub topics: Vec<Topic>,
    handler: Arc<dyn EventHandler>,
    retry: Option<RetryConfig>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("concern", &self.concern)
            .field("topics", &self.topics)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Collects a service's concern handlers and turns them into subscriptions
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    registrations: Vec<Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_keeping(self, handler: impl RecordKeepingHandler + 'static) -> Self {
        self.add(Concern::RecordKeeping, Arc::new(RecordKeepingAdapter(Arc::new(handler))))
    }

    pub fn decision_support(self, handler: impl DecisionSupportHandler + 'static) -> Self {
        self.add(Concern::DecisionSupport, Arc::new(DecisionSupportAdapter(Arc::new(handler))))
    }

    pub fn notification(self, handler: impl NotificationHandler + 'static) -> Self {
        self.add(Concern::Notification, Arc::new(NotificationAdapter(Arc::new(handler))))
    }

    pub fn audit(self, handler: impl AuditHandler + 'static) -> Self {
        self.add(Concern::Audit, Arc::new(AuditAdapter(Arc::new(handler))))
    }

    pub fn interop_export(self, handler: impl InteropExportHandler + 'static) -> Self {
        self.add(Concern::InteropExport, Arc::new(InteropExportAdapter(Arc::new(handler))))
    }

    /// Replace the topics of the most recently added `concern` handler
    pub fn with_topics(mut self, concern: Concern, topics: &[Topic]) -> Self {
        if let Some(registration) = self
            .registrations
            .iter_mut()
            .rev()
            .find(|r| r.concern == concern)
        {
            registration.topics = topics.to_vec();
        }
        self
    }

    /// Override handler retry for every subscription of `concern`
    pub fn with_retry(mut self, concern: Concern, retry: RetryConfig) -> Self {
        for registration in self.registrations.iter_mut().filter(|r| r.concern == concern) {
            registration.retry = Some(retry.clone());
        }
        self
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    fn add(mut self, concern: Concern, handler: Arc<dyn EventHandler>) -> Self {
        self.registrations.push(Registration {
            concern,
            topics: concern.default_topics().to_vec(),
            handler,
            retry: None,
        });
        self
    }

    /// One subscription per (concern, topic), grouped as `<service>-<concern>`
    pub fn into_subscriptions(self, service: &str) -> Vec<EventSubscription> {
        let mut subscriptions = Vec::new();

        for registration in self.registrations {
            let group = registration.concern.consumer_group(service);
            for topic in &registration.topics {
                let subscription =
                    EventSubscription::from_shared(*topic, group.clone(), registration.handler.clone());
                subscriptions.push(match &registration.retry {
                    Some(retry) => subscription.with_retry(retry.clone()),
                    None => subscription,
                });
            }
        }

        subscriptions
    }

    /// Register every subscription on `runtime`
    pub async fn register_all(self, runtime: &BusRuntime, service: &str) -> BusResult<usize> {
        let subscriptions = self.into_subscriptions(service);
        let count = subscriptions.len();

        for subscription in subscriptions {
            tracing::info!(
                topic = %subscription.topic(),
                consumer_group = %subscription.consumer_group(),
                "Registering subscription"
            );
            runtime.register(subscription).await?;
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use clinical_event_bus::{ClinicalEvent, HandlerOutcome, HandlerResult};

    struct Noop;

    #[async_trait]
    impl AuditHandler for Noop {
        async fn handle(&self, _event: &ClinicalEvent) -> HandlerResult {
            Ok(HandlerOutcome::Skipped)
        }
    }

    #[async_trait]
    impl InteropExportHandler for Noop {
        async fn handle(&self, _event: &ClinicalEvent) -> HandlerResult {
            Ok(HandlerOutcome::Skipped)
        }
    }

    #[test]
    fn test_one_subscription_per_concern_topic() {
        let subscriptions = HandlerRegistry::new()
            .audit(Noop)
            .interop_export(Noop)
            .into_subscriptions("ehr");

        let pairs: Vec<(Topic, &str)> = subscriptions
            .iter()
            .map(|s| (s.topic(), s.consumer_group()))
            .collect();

        assert_eq!(
            pairs,
            vec![
                (Topic::ComplianceEvents, "ehr-audit"),
                (Topic::PatientEvents, "ehr-audit"),
                (Topic::PatientEvents, "ehr-interop-export"),
                (Topic::LabEvents, "ehr-interop-export"),
                (Topic::MedicationEvents, "ehr-interop-export"),
            ]
        );
    }

    #[test]
    fn test_topic_override() {
        let registry = HandlerRegistry::new()
            .audit(Noop)
            .with_topics(Concern::Audit, &[Topic::AuditEvents]);

        assert_eq!(registry.registrations()[0].topics, vec![Topic::AuditEvents]);
        assert_eq!(registry.into_subscriptions("svc").len(), 1);
    }
}
