//! Resettable trailing-edge scheduler for watcher-triggered syncs.
//!
//! Every [`SyncDebouncer::notify`] pushes the deadline out by the full window;
//! the callback runs once the window passes quietly. The task stops when its
//! cancellation token fires or the debouncer is dropped.

use std::time::Duration;

use {
    tokio::{sync::mpsc, task::JoinHandle, time::Instant},
    tokio_util::sync::CancellationToken,
    tracing::{debug, trace},
};

/// Cheap handle for feeding notifications from other threads.
#[derive(Clone)]
pub struct DebounceNotifier {
    tx: mpsc::UnboundedSender<()>,
}

impl DebounceNotifier {
    pub fn notify(&self) {
        // The task is gone once cancelled; late notifications are moot.
        let _ = self.tx.send(());
    }
}

pub struct SyncDebouncer {
    notifier: DebounceNotifier,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SyncDebouncer {
    /// Spawn the scheduler on the current tokio runtime.
    pub fn spawn<F>(window: Duration, cancel: CancellationToken, on_fire: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    msg = rx.recv() => if msg.is_none() { return },
                }

                let sleep = tokio::time::sleep(window);
                tokio::pin!(sleep);
                let mut closed = false;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = &mut sleep => break,
                        msg = rx.recv(), if !closed => match msg {
                            Some(()) => {
                                trace!("debounce window reset");
                                sleep.as_mut().reset(Instant::now() + window);
                            },
                            None => closed = true,
                        },
                    }
                }

                debug!(window_ms = window.as_millis() as u64, "debounce window elapsed");
                on_fire();
                if closed {
                    return;
                }
            }
        });

        Self {
            notifier: DebounceNotifier { tx },
            cancel,
            task,
        }
    }

    pub fn notify(&self) {
        self.notifier.notify();
    }

    pub fn notifier(&self) -> DebounceNotifier {
        self.notifier.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SyncDebouncer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
