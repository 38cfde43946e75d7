/// In-flight command tracking for one connection
///
/// Owned by the connection actor, so no locking. Every entry is settled at
/// most once: by its response, by its deadline, or by the socket going away.
/// Whichever comes first removes the entry; anything arriving later finds
/// nothing and is dropped.
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::codec::{CorrelationId, WireError};
use crate::errors::GatewayError;

pub(crate) type Reply = oneshot::Sender<Result<Value, GatewayError>>;

/// Who is waiting on a command
pub(crate) enum Responder {
    Caller(Reply),
    /// The actor's own authentication handshake
    Authentication,
}

pub(crate) struct PendingCommand {
    pub name: String,
    pub issued_at: Instant,
    pub deadline: Instant,
    pub timeout: Duration,
    responder: Responder,
}

/// What settling an entry produced for the actor
#[derive(Debug, PartialEq)]
pub(crate) enum Settled {
    /// The caller has been answered
    Caller { id: CorrelationId, name: String },
    /// The handshake outcome, for the actor to act on
    Authentication(Result<Value, GatewayError>),
}

pub(crate) struct CommandCorrelator {
    next_id: CorrelationId,
    pending: HashMap<CorrelationId, PendingCommand>,
}

impl CommandCorrelator {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocate a correlation id and start the entry's clock
    pub fn register(&mut self, name: &str, timeout: Duration, responder: Responder) -> CorrelationId {
        let id = self.next_id;
        self.next_id += 1;

        let issued_at = Instant::now();
        self.pending.insert(
            id,
            PendingCommand {
                name: name.to_string(),
                issued_at,
                deadline: issued_at + timeout,
                timeout,
                responder,
            },
        );
        id
    }

    /// Settle the entry matching a response; None for unknown or already settled ids
    pub fn complete(
        &mut self,
        id: CorrelationId,
        ok: bool,
        result: Option<Value>,
        error: Option<WireError>,
    ) -> Option<Settled> {
        let pending = self.pending.remove(&id)?;
        let outcome = if ok {
            Ok(result.unwrap_or(Value::Null))
        } else {
            let error = error.unwrap_or(WireError {
                code: None,
                message: "command failed".to_string(),
            });
            Err(GatewayError::Command {
                command: pending.name.clone(),
                code: error.code,
                message: error.message,
            })
        };
        Some(settle(id, pending, outcome))
    }

    /// Remove one entry and reject it with `error`
    pub fn cancel(&mut self, id: CorrelationId, error: GatewayError) -> Option<Settled> {
        let pending = self.pending.remove(&id)?;
        Some(settle(id, pending, Err(error)))
    }

    /// Reject every entry whose deadline has passed
    pub fn expire_due(&mut self, now: Instant) -> Vec<Settled> {
        let due: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        due.into_iter()
            .filter_map(|id| {
                let pending = self.pending.remove(&id)?;
                let error = GatewayError::CommandTimeout {
                    command: pending.name.clone(),
                    timeout_ms: pending.timeout.as_millis() as u64,
                };
                Some(settle(id, pending, Err(error)))
            })
            .collect()
    }

    /// Reject everything, e.g. because the socket closed
    pub fn reject_all(&mut self, error: GatewayError) -> Vec<Settled> {
        self.pending
            .drain()
            .map(|(id, pending)| settle(id, pending, Err(error.clone())))
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    pub fn get(&self, id: CorrelationId) -> Option<&PendingCommand> {
        self.pending.get(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn settle(id: CorrelationId, pending: PendingCommand, outcome: Result<Value, GatewayError>) -> Settled {
    match pending.responder {
        Responder::Caller(reply) => {
            // The caller may have given up; nothing to do then
            let _ = reply.send(outcome);
            Settled::Caller { id, name: pending.name }
        }
        Responder::Authentication => Settled::Authentication(outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn caller() -> (Responder, oneshot::Receiver<Result<Value, GatewayError>>) {
        let (tx, rx) = oneshot::channel();
        (Responder::Caller(tx), rx)
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_responses_match_out_of_order() {
        let mut correlator = CommandCorrelator::new();
        let (r1, rx1) = caller();
        let (r2, rx2) = caller();
        let first = correlator.register("take_dynamic_temperature", Duration::from_secs(5), r1);
        let second = correlator.register("take_dynamic_battery", Duration::from_secs(5), r2);
        assert!(second > first);
        assert_eq!(correlator.len(), 2);

        assert!(correlator
            .complete(second, true, Some(json!({"battery": 87})), None)
            .is_some());
        assert!(correlator
            .complete(
                first,
                false,
                None,
                Some(WireError {
                    code: Some("E_SENSOR".into()),
                    message: "sensor asleep".into()
                })
            )
            .is_some());

        assert_eq!(rx2.await.unwrap(), Ok(json!({"battery": 87})));
        assert_eq!(
            rx1.await.unwrap(),
            Err(GatewayError::Command {
                command: "take_dynamic_temperature".into(),
                code: Some("E_SENSOR".into()),
                message: "sensor asleep".into()
            })
        );
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_and_late_responses_are_ignored() {
        let mut correlator = CommandCorrelator::new();
        assert_eq!(correlator.complete(42, true, None, None), None);

        let (r, rx) = caller();
        let id = correlator.register("ping", Duration::from_millis(10), r);
        let expired = correlator.expire_due(Instant::now() + Duration::from_millis(20));
        assert_eq!(expired, vec![Settled::Caller { id, name: "ping".into() }]);
        assert_eq!(
            rx.await.unwrap(),
            Err(GatewayError::CommandTimeout {
                command: "ping".into(),
                timeout_ms: 10
            })
        );

        // the response shows up after the deadline: nothing left to settle
        assert_eq!(correlator.complete(id, true, Some(json!({})), None), None);
        assert!(correlator.expire_due(Instant::now() + Duration::from_secs(1)).is_empty());
    }

    #[tokio::test]
    async fn test_expire_only_due_entries() {
        let mut correlator = CommandCorrelator::new();
        let (short, _rx_short) = caller();
        let (long, _rx_long) = caller();
        correlator.register("ping", Duration::from_millis(50), short);
        let long_id = correlator.register("discover_sensors", Duration::from_secs(60), long);

        let next = correlator.next_deadline().unwrap();
        assert_eq!(correlator.expire_due(next).len(), 1);
        assert!(correlator.get(long_id).is_some());
        assert_eq!(correlator.next_deadline(), correlator.get(long_id).map(|p| p.deadline));
    }

    #[tokio::test]
    async fn test_reject_all_and_authentication_entries() {
        let mut correlator = CommandCorrelator::new();
        let (r, rx) = caller();
        correlator.register("ping", Duration::from_secs(5), r);
        correlator.register("authenticate", Duration::from_secs(5), Responder::Authentication);

        let settled = correlator.reject_all(GatewayError::ConnectionClosed);
        assert_eq!(settled.len(), 2);
        assert!(settled.contains(&Settled::Authentication(Err(GatewayError::ConnectionClosed))));
        assert_eq!(rx.await.unwrap(), Err(GatewayError::ConnectionClosed));
        assert!(correlator.is_empty());
        assert_eq!(correlator.next_deadline(), None);
    }
}
