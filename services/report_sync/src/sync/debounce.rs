//! services/report_sync/src/sync/debounce.rs
//!
//! A single-slot scheduled task. Scheduling replaces whatever is pending; the
//! task only runs once the delay has elapsed without another `schedule` call.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Pending {
    cancel: CancellationToken,
    fire_now: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct Debouncer {
    slot: Option<Pending>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `task` to run after `delay`, cancelling the previous one if it
    /// has not fired yet. The task owns everything it needs; nothing is read
    /// back from the caller when it fires.
    pub fn schedule<F>(&mut self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();

        let cancel = CancellationToken::new();
        let fire_now = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            let fire_now = fire_now.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = fire_now.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                task.await;
            })
        };
        self.slot = Some(Pending {
            cancel,
            fire_now,
            handle,
        });
    }

    /// Cancels the pending task. Returns `true` if one was waiting to fire.
    ///
    /// A task that already fired keeps running to completion.
    pub fn cancel(&mut self) -> bool {
        match self.slot.take() {
            Some(pending) => {
                let was_waiting = !pending.handle.is_finished();
                pending.cancel.cancel();
                was_waiting
            }
            None => false,
        }
    }

    /// Fires the pending task immediately. Await the handle to wait for it.
    pub fn flush(&mut self) -> Option<JoinHandle<()>> {
        self.slot.take().map(|pending| {
            pending.fire_now.cancel();
            pending.handle
        })
    }

    pub fn is_pending(&self) -> bool {
        self.slot
            .as_ref()
            .is_some_and(|pending| !pending.handle.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
