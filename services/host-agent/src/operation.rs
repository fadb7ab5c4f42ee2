//! Per-instance in-flight operation slot.
//!
//! Starting or attaching to a container hands out an owned [`InFlight`]
//! token. The token travels into the runtime's termination callback; when the
//! container exits the callback completes the token, which frees the slot
//! and resolves the matching [`ProcessDone`]. If the runtime rejects the
//! operation outright it drops the callback, and dropping the token has the
//! same effect.
//!
//! At most one token exists per slot: [`OperationSlot::begin`] waits for the
//! previous one to be released.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{oneshot, watch};

/// Exclusive "container is transitioning" cell for one instance.
#[derive(Debug)]
pub struct OperationSlot {
    busy: Arc<watch::Sender<bool>>,
}

impl OperationSlot {
    pub fn new() -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            busy: Arc::new(busy),
        }
    }

    /// Claims the slot, waiting for any in-flight operation to finish first.
    pub async fn begin(&self) -> (InFlight, ProcessDone) {
        let mut idle = self.busy.subscribe();
        loop {
            let claimed = self.busy.send_if_modified(|busy| {
                if *busy {
                    false
                } else {
                    *busy = true;
                    true
                }
            });
            if claimed {
                break;
            }
            // The sender lives in `self`, so this only returns once idle.
            let _ = idle.wait_for(|busy| !*busy).await;
        }

        let (done_tx, done_rx) = oneshot::channel();
        (
            InFlight {
                busy: Arc::clone(&self.busy),
                done: Some(done_tx),
            },
            ProcessDone(done_rx),
        )
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    /// Resolves once no operation is in flight.
    pub async fn wait_idle(&self) {
        let mut idle = self.busy.subscribe();
        let _ = idle.wait_for(|busy| !*busy).await;
    }
}

impl Default for OperationSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned proof that an operation holds the slot.
#[derive(Debug)]
pub struct InFlight {
    busy: Arc<watch::Sender<bool>>,
    done: Option<oneshot::Sender<()>>,
}

impl InFlight {
    /// Publishes completion and frees the slot.
    pub fn complete(self) {}
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
        self.busy.send_replace(false);
    }
}

/// Resolves when the matching [`InFlight`] token is completed or dropped.
#[derive(Debug)]
pub struct ProcessDone(oneshot::Receiver<()>);

impl Future for ProcessDone {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.0).poll(cx).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_complete_releases_slot_and_signals() {
        let slot = OperationSlot::new();
        let (token, done) = slot.begin().await;
        assert!(slot.is_busy());

        token.complete();
        done.await;
        assert!(!slot.is_busy());
    }

    #[tokio::test]
    async fn test_dropped_token_releases_slot() {
        let slot = OperationSlot::new();
        let (token, done) = slot.begin().await;
        drop(token);
        done.await;
        assert!(!slot.is_busy());
    }

    #[tokio::test]
    async fn test_begin_waits_for_previous_operation() {
        let slot = Arc::new(OperationSlot::new());
        let (first, _done) = slot.begin().await;

        let contender = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move {
                let (second, _) = slot.begin().await;
                second.complete();
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        first.complete();
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
        assert!(!slot.is_busy());
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let slot = Arc::new(OperationSlot::new());
        slot.wait_idle().await;

        let (token, _done) = slot.begin().await;
        let waiter = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move { slot.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        token.complete();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
