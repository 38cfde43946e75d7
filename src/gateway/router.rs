/// Per-connection topic router
///
/// Pushes from the gateway are fanned out to every subscriber of the exact
/// topic. Each subscriber decodes the payload through its own validator, so
/// a payload one subscriber rejects still reaches the others.
///
/// The router lives inside the connection actor. Subscribers hold the
/// receiving end of an unbounded channel; dropping it is enough to leave,
/// the sink is pruned on the next publish to that topic.
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use tokio::sync::mpsc;

use crate::errors::ValidationError;

// ============================================================================
// TYPES
// ============================================================================

/// Subscription id (unique per connection)
pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct TopicEvent<T> {
    pub topic: String,
    pub payload: T,
    pub received_at: DateTime<Utc>,
}

/// Item delivered to a subscriber
pub type Delivery<T> = Result<TopicEvent<T>, ValidationError>;

/// Turns a raw payload into the subscriber's type
pub trait PayloadValidator<T>: Send + Sync {
    fn validate(&self, topic: &str, payload: &Value) -> Result<T, ValidationError>;
}

impl<T, F> PayloadValidator<T> for F
where
    F: Fn(&str, &Value) -> Result<T, ValidationError> + Send + Sync,
{
    fn validate(&self, topic: &str, payload: &Value) -> Result<T, ValidationError> {
        self(topic, payload)
    }
}

/// Validates by deserializing into `T`
pub struct JsonValidator<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonValidator<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for JsonValidator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> PayloadValidator<T> for JsonValidator<T> {
    fn validate(&self, topic: &str, payload: &Value) -> Result<T, ValidationError> {
        T::deserialize(payload).map_err(|e| ValidationError::new(topic, e.to_string()))
    }
}

/// Accepts anything, yielding the raw JSON
pub struct PassThrough;

impl PayloadValidator<Value> for PassThrough {
    fn validate(&self, _topic: &str, payload: &Value) -> Result<Value, ValidationError> {
        Ok(payload.clone())
    }
}

// ============================================================================
// SINKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SinkOutcome {
    Delivered,
    Rejected,
    Closed,
}

/// Type-erased subscriber as stored by the router
pub(crate) trait TopicSink: Send {
    fn deliver(&self, topic: &str, payload: &Value, received_at: DateTime<Utc>) -> SinkOutcome;
}

struct TypedSink<T> {
    validator: Box<dyn PayloadValidator<T>>,
    tx: mpsc::UnboundedSender<Delivery<T>>,
}

impl<T: Send + 'static> TopicSink for TypedSink<T> {
    fn deliver(&self, topic: &str, payload: &Value, received_at: DateTime<Utc>) -> SinkOutcome {
        if self.tx.is_closed() {
            return SinkOutcome::Closed;
        }

        let (item, outcome) = match self.validator.validate(topic, payload) {
            Ok(payload) => (
                Ok(TopicEvent {
                    topic: topic.to_string(),
                    payload,
                    received_at,
                }),
                SinkOutcome::Delivered,
            ),
            Err(e) => (Err(e), SinkOutcome::Rejected),
        };

        match self.tx.send(item) {
            Ok(()) => outcome,
            Err(_) => SinkOutcome::Closed,
        }
    }
}

/// Build a sink and the receiver its subscriber reads from
pub(crate) fn sink_channel<T: Send + 'static>(
    validator: Box<dyn PayloadValidator<T>>,
) -> (Box<dyn TopicSink>, mpsc::UnboundedReceiver<Delivery<T>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Box::new(TypedSink { validator, tx }), rx)
}

// ============================================================================
// ROUTER
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub rejected: usize,
    pub pruned: usize,
}

pub(crate) struct TopicRouter {
    topics: HashMap<String, Vec<(SubscriptionId, Box<dyn TopicSink>)>>,
    next_id: SubscriptionId,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self {
            topics: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn add(&mut self, topic: &str, sink: Box<dyn TopicSink>) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.topics.entry(topic.to_string()).or_default().push((id, sink));
        id
    }

    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        let mut removed = false;
        self.topics.retain(|_, sinks| {
            let before = sinks.len();
            sinks.retain(|(sid, _)| *sid != id);
            removed |= sinks.len() != before;
            !sinks.is_empty()
        });
        removed
    }

    /// Fan a payload out to every subscriber of exactly `topic`
    pub fn publish(&mut self, topic: &str, payload: &Value) -> PublishReport {
        let mut report = PublishReport::default();
        let Some(sinks) = self.topics.get_mut(topic) else {
            return report;
        };

        let received_at = Utc::now();
        sinks.retain(|(_, sink)| match sink.deliver(topic, payload, received_at) {
            SinkOutcome::Delivered => {
                report.delivered += 1;
                true
            }
            SinkOutcome::Rejected => {
                report.rejected += 1;
                true
            }
            SinkOutcome::Closed => {
                report.pruned += 1;
                false
            }
        });

        if sinks.is_empty() {
            self.topics.remove(topic);
        }
        report
    }

    pub fn len(&self) -> usize {
        self.topics.values().map(Vec::len).sum()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, Vec::len)
    }

    /// Drop every sink; subscribers see their stream end
    pub fn clear(&mut self) {
        self.topics.clear();
    }
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Receiving end of one topic subscription
pub struct Subscription<T> {
    id: SubscriptionId,
    topic: String,
    rx: mpsc::UnboundedReceiver<Delivery<T>>,
    unsubscribe: Option<Box<dyn FnOnce(SubscriptionId) + Send + Sync>>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(
        id: SubscriptionId,
        topic: String,
        rx: mpsc::UnboundedReceiver<Delivery<T>>,
        unsubscribe: Box<dyn FnOnce(SubscriptionId) + Send + Sync>,
    ) -> Self {
        Self {
            id,
            topic,
            rx,
            unsubscribe: Some(unsubscribe),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event or validation failure; None once the connection is shut down
    pub async fn recv(&mut self) -> Option<Delivery<T>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery<T>> {
        self.rx.try_recv().ok()
    }

    /// Deregister immediately instead of waiting for the next publish
    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe(self.id);
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Temperature {
        temperature: f64,
    }

    #[test]
    fn test_fan_out_with_isolated_validation() {
        let mut router = TopicRouter::new();
        let topic = "sensor/1001/temperature";

        let (typed_sink, mut typed_rx) = sink_channel::<Temperature>(Box::new(JsonValidator::new()));
        let (raw_sink, mut raw_rx) = sink_channel::<Value>(Box::new(PassThrough));
        router.add(topic, typed_sink);
        router.add(topic, raw_sink);

        let report = router.publish(topic, &json!({"temperature": 21.5}));
        assert_eq!(report, PublishReport { delivered: 2, rejected: 0, pruned: 0 });
        assert_eq!(typed_rx.try_recv().unwrap().unwrap().payload, Temperature { temperature: 21.5 });
        assert_eq!(raw_rx.try_recv().unwrap().unwrap().payload, json!({"temperature": 21.5}));

        let report = router.publish(topic, &json!({"temperature": "hot"}));
        assert_eq!(report, PublishReport { delivered: 1, rejected: 1, pruned: 0 });
        let failure = typed_rx.try_recv().unwrap().unwrap_err();
        assert_eq!(failure.subject, topic);
        assert_eq!(raw_rx.try_recv().unwrap().unwrap().payload, json!({"temperature": "hot"}));
    }

    #[test]
    fn test_exact_match_only() {
        let mut router = TopicRouter::new();
        let (sink, mut rx) = sink_channel::<Value>(Box::new(PassThrough));
        router.add("sensor/1001/battery", sink);

        assert_eq!(router.publish("sensor/1001", &json!({})), PublishReport::default());
        assert_eq!(router.publish("sensor/1001/battery/extra", &json!({})), PublishReport::default());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closure_validator() {
        let mut router = TopicRouter::new();
        let validator = |topic: &str, payload: &Value| {
            payload
                .get("battery")
                .and_then(Value::as_f64)
                .ok_or_else(|| ValidationError::new(topic, "missing battery"))
        };
        let (sink, mut rx) = sink_channel::<f64>(Box::new(validator));
        router.add("sensor/7/battery", sink);

        router.publish("sensor/7/battery", &json!({"battery": 64.0}));
        assert_eq!(rx.try_recv().unwrap().unwrap().payload, 64.0);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let mut router = TopicRouter::new();
        let (kept, mut kept_rx) = sink_channel::<Value>(Box::new(PassThrough));
        let (dropped, dropped_rx) = sink_channel::<Value>(Box::new(PassThrough));
        router.add("t", kept);
        router.add("t", dropped);
        drop(dropped_rx);
        assert_eq!(router.len(), 2);

        let report = router.publish("t", &json!(1));
        assert_eq!(report, PublishReport { delivered: 1, rejected: 0, pruned: 1 });
        assert_eq!(router.subscriber_count("t"), 1);
        assert!(kept_rx.try_recv().is_ok());
    }

    #[test]
    fn test_remove_and_clear() {
        let mut router = TopicRouter::new();
        let (a, _a_rx) = sink_channel::<Value>(Box::new(PassThrough));
        let (b, mut b_rx) = sink_channel::<Value>(Box::new(PassThrough));
        let a_id = router.add("t", a);
        router.add("u", b);

        assert!(router.remove(a_id));
        assert!(!router.remove(a_id));
        assert_eq!(router.subscriber_count("t"), 0);

        router.clear();
        assert_eq!(router.len(), 0);
        assert!(matches!(
            b_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_subscription_unsubscribe_callback() {
        let (_sink, rx) = sink_channel::<Value>(Box::new(PassThrough));
        let (tx, mut seen) = mpsc::unbounded_channel();
        let subscription = Subscription::new(
            9,
            "t".to_string(),
            rx,
            Box::new(move |id: SubscriptionId| {
                let _ = tx.send(id);
            }),
        );
        assert_eq!(subscription.topic(), "t");
        subscription.unsubscribe();
        assert_eq!(seen.recv().await, Some(9));
    }
}
