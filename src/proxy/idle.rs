//! Idle-session timer: closes a quiet SSH session after a configured
//! timeout.
//!
//! Every served request pokes the signal before it starts forwarding. The
//! poke is non-blocking and lossy: under load a dropped poke is harmless,
//! because any delivered reset inside the window already re-arms the
//! deadline. The timer task runs exactly while a session is live and exits
//! on the session's termination signal.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Reset events buffered between the serving path and the timer task.
pub const IDLE_EVENT_CAPACITY: usize = 10;

/// Sender half of the idle-reset channel, re-armed per session.
pub struct IdleSignal {
    tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl IdleSignal {
    pub fn new() -> Self {
        Self {
            tx: Mutex::new(None),
        }
    }

    /// Non-blocking reset. A full buffer or an unarmed timer drops the
    /// event silently.
    pub fn poke(&self) {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            let _ = tx.try_send(());
        }
    }

    /// Create a fresh reset channel for a newly established session and
    /// hand back its receiving end.
    pub fn arm(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(IDLE_EVENT_CAPACITY);
        let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(tx);
        rx
    }

    /// Detach the current channel; subsequent pokes are no-ops until the
    /// next `arm`.
    pub fn disarm(&self) {
        let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }
}

impl Default for IdleSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive one session's idle deadline.
///
/// Exits when the session's termination signal fires or the reset channel
/// is dropped; calls `expire` exactly once if the deadline is ever reached.
pub async fn run<F, Fut>(
    idle_timeout: Duration,
    mut resets: mpsc::Receiver<()>,
    session_closed: CancellationToken,
    expire: F,
) where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut deadline = Instant::now() + idle_timeout;
    loop {
        tokio::select! {
            _ = session_closed.cancelled() => {
                trace!("idle timer stopped: session closed");
                return;
            }
            _ = sleep_until(deadline) => {
                expire().await;
                return;
            }
            event = resets.recv() => match event {
                Some(()) => deadline = Instant::now() + idle_timeout,
                None => return,
            },
        }
    }
}
