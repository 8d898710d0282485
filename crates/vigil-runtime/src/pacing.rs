//! Cooperative stop and wake-up signalling for orchestrator workers.
//!
//! A [`StopSignal`] is shared between an orchestrator handle and its worker.
//! The handle bumps a generation counter whenever run state changes (arrival,
//! pause, resume, stop); the worker's [`Pacer`] turns that into timer-driven
//! waits that end as soon as something relevant happens, instead of polling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};

#[derive(Debug)]
pub(crate) struct StopSignal {
    stop: AtomicBool,
    generation: watch::Sender<u64>,
}

impl StopSignal {
    pub(crate) fn new() -> Arc<Self> {
        let (generation, _) = watch::channel(0);
        Arc::new(Self {
            stop: AtomicBool::new(false),
            generation,
        })
    }

    /// Wake the worker so it re-reads run state.
    pub(crate) fn notify(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.notify();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn pacer(self: &Arc<Self>) -> Pacer {
        Pacer {
            rx: self.generation.subscribe(),
            signal: Arc::clone(self),
        }
    }
}

/// Why a [`Pacer::wait_until`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Notified,
    Deadline,
}

/// Worker-side view of a [`StopSignal`].
pub(crate) struct Pacer {
    signal: Arc<StopSignal>,
    rx: watch::Receiver<u64>,
}

impl Pacer {
    pub(crate) fn is_stopped(&self) -> bool {
        self.signal.is_stopped()
    }

    /// Wait for the next notification, or `deadline` if given.
    pub(crate) async fn wait_until(&mut self, deadline: Option<Instant>) -> Wake {
        match deadline {
            Some(deadline) => tokio::select! {
                _ = self.rx.changed() => Wake::Notified,
                _ = sleep_until(deadline) => Wake::Deadline,
            },
            None => {
                // The sender lives inside `signal`, so this cannot observe a
                // closed channel.
                let _ = self.rx.changed().await;
                Wake::Notified
            }
        }
    }

    /// Sleep for `duration` unless a stop is requested first.
    ///
    /// Returns `true` when the full duration elapsed without a stop.
    pub(crate) async fn sleep(&mut self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return false;
            }
            if Instant::now() >= deadline {
                return true;
            }
            if self.wait_until(Some(deadline)).await == Wake::Deadline {
                return !self.is_stopped();
            }
        }
    }
}
