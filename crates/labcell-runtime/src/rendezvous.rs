//! Single-slot rendezvous between a WAITING scan session and ENTER_ID.
//!
//! The parked worker registers a oneshot sender together with the detected
//! bottle family; an ENTER_ID either advances that worker exactly once or is
//! rejected without disturbing it. Concurrent deliveries race for the
//! `Option::take` under the lock, so exactly one wins.

use std::sync::Mutex;

use tokio::sync::oneshot;

use labcell_core::types::ObjectType;
use labcell_core::CommandError;

/// The payload an operator enters after scanning a bottle.
#[derive(Debug, Clone, PartialEq)]
pub struct EnterId {
    pub bottle_id: String,
    pub object_type: ObjectType,
}

struct Waiter {
    task_id: String,
    expected: ObjectType,
    tx: oneshot::Sender<EnterId>,
}

/// Process-wide rendezvous slot; at most one scan session waits at a time.
#[derive(Default)]
pub struct EnterIdRendezvous {
    slot: Mutex<Option<Waiter>>,
}

impl EnterIdRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a scan session until an operator enters the bottle id.
    pub fn register(&self, task_id: &str, expected: ObjectType) -> oneshot::Receiver<EnterId> {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.slot.lock().expect("rendezvous lock poisoned");
        if let Some(stale) = slot.replace(Waiter {
            task_id: task_id.to_string(),
            expected,
            tx,
        }) {
            tracing::warn!(task_id = %stale.task_id, "replacing stale enter-id waiter");
        }
        rx
    }

    /// Remove this task's waiter (cancellation, wait timeout).
    pub fn clear(&self, task_id: &str) {
        let mut slot = self.slot.lock().expect("rendezvous lock poisoned");
        if slot.as_ref().map_or(false, |w| w.task_id == task_id) {
            *slot = None;
        }
    }

    /// Deliver an ENTER_ID to the waiting session.
    ///
    /// A type disagreement leaves the waiter in place so the operator can
    /// retry; the task stays WAITING.
    pub fn deliver(&self, enter: EnterId) -> Result<String, CommandError> {
        let mut slot = self.slot.lock().expect("rendezvous lock poisoned");
        let Some(waiter) = slot.as_ref() else {
            return Err(CommandError::NoWaitingTask);
        };
        if waiter.expected != enter.object_type {
            return Err(CommandError::EnterIdTypeMismatch {
                expected: waiter.expected,
                got: enter.object_type,
            });
        }
        let waiter = slot.take().expect("waiter checked above");
        let task_id = waiter.task_id.clone();
        if waiter.tx.send(enter).is_err() {
            // Receiver vanished between parking and delivery.
            return Err(CommandError::NoWaitingTask);
        }
        Ok(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labcell_core::ErrorCode;

    fn enter(id: &str, ty: ObjectType) -> EnterId {
        EnterId {
            bottle_id: id.to_string(),
            object_type: ty,
        }
    }

    #[test]
    fn test_deliver_without_waiter_is_4002() {
        let rendezvous = EnterIdRendezvous::new();
        let err = rendezvous
            .deliver(enter("B1", ObjectType::GlassBottle500))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoWaitingTask);
    }

    #[test]
    fn test_type_mismatch_leaves_waiter_parked() {
        tokio_test::block_on(async {
            let rendezvous = EnterIdRendezvous::new();
            let rx = rendezvous.register("task-1", ObjectType::GlassBottle500);

            let err = rendezvous
                .deliver(enter("B1", ObjectType::GlassBottle1000))
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::EnterIdTypeMismatch);

            // The matching retry still lands.
            let task_id = rendezvous
                .deliver(enter("B1", ObjectType::GlassBottle500))
                .unwrap();
            assert_eq!(task_id, "task-1");
            assert_eq!(rx.await.unwrap().bottle_id, "B1");
        });
    }

    #[test]
    fn test_exactly_one_concurrent_delivery_wins() {
        let rendezvous = EnterIdRendezvous::new();
        let _rx = rendezvous.register("task-1", ObjectType::GlassBottle500);

        let first = rendezvous.deliver(enter("B1", ObjectType::GlassBottle500));
        let second = rendezvous.deliver(enter("B2", ObjectType::GlassBottle500));
        assert!(first.is_ok());
        assert_eq!(second.unwrap_err().code(), ErrorCode::NoWaitingTask);
    }

    #[test]
    fn test_clear_only_removes_own_waiter() {
        let rendezvous = EnterIdRendezvous::new();
        let _rx = rendezvous.register("task-1", ObjectType::GlassBottle500);
        rendezvous.clear("task-2");
        assert!(rendezvous
            .deliver(enter("B1", ObjectType::GlassBottle500))
            .is_ok());
    }
}
