//! The signal bridge.
//!
//! OS signals can interrupt anything at any instruction boundary, so the
//! per-signal listeners do exactly one thing: set a bit in a shared
//! atomic bitmask. No allocation, no I/O, no locks. The event loop calls
//! [`SignalBridge::poll`] before taking each event (and at least once a
//! second), which atomically swaps the mask to zero and turns each bit
//! into an ordinary typed event. The swap is what makes a concurrently
//! arriving signal impossible to lose: it either lands before the swap
//! and is returned now, or after and is returned by the next poll.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::events::Event;

pub const BIT_CHLD: u32 = 1 << 0;
pub const BIT_TERM: u32 = 1 << 1;
pub const BIT_QUIT: u32 = 1 << 2;
pub const BIT_HUP: u32 = 1 << 3;

pub struct SignalBridge {
    mask: Arc<AtomicU32>,
    refresh_interval: Duration,
    last_refresh: Instant,
}

impl SignalBridge {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            mask: Arc::new(AtomicU32::new(0)),
            refresh_interval,
            last_refresh: Instant::now(),
        }
    }

    /// Handle to the shared mask, for listener tasks and tests.
    pub fn mask(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.mask)
    }

    /// The single operation permitted from a signal context.
    pub fn raise(mask: &AtomicU32, bit: u32) {
        mask.fetch_or(bit, Ordering::SeqCst);
    }

    /// Install listener tasks for SIGCHLD, SIGTERM, SIGQUIT and SIGHUP.
    /// Each delivery sets one bit; all real work happens in [`poll`].
    ///
    /// [`poll`]: SignalBridge::poll
    #[cfg(unix)]
    pub fn install(&self, cancel: &CancellationToken) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, bit) in [
            (SignalKind::child(), BIT_CHLD),
            (SignalKind::terminate(), BIT_TERM),
            (SignalKind::quit(), BIT_QUIT),
            (SignalKind::hangup(), BIT_HUP),
        ] {
            let mut stream = signal(kind)?;
            let mask = self.mask();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = stream.recv() => {
                            if received.is_none() {
                                break;
                            }
                            Self::raise(&mask, bit);
                        }
                    }
                }
            });
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn install(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    /// Atomically read-and-clear the mask and convert set bits to events.
    /// Also emits the periodic refresh events on an elapsed-time basis,
    /// independent of any signal.
    pub fn poll(&mut self) -> Vec<Event> {
        let mask = self.mask.swap(0, Ordering::SeqCst);
        let mut events = Vec::new();

        if mask & BIT_CHLD != 0 {
            debug!("signal: child death");
            events.push(Event::ReapCheck);
        }
        if mask & BIT_TERM != 0 {
            debug!("signal: terminate, shutting down gracefully");
            events.push(Event::Close { force: false });
        }
        if mask & BIT_QUIT != 0 {
            debug!("signal: quit, shutting down forcefully");
            events.push(Event::Close { force: true });
        }
        if mask & BIT_HUP != 0 {
            debug!("signal: hangup, reloading configuration");
            events.push(Event::Reload);
        }

        if self.last_refresh.elapsed() >= self.refresh_interval {
            self.last_refresh = Instant::now();
            events.push(Event::RefreshAgents);
            events.push(Event::RefreshJobs);
        }

        events
    }
}
