//! Close handshake coordination for a single connection
//!
//! Decides how a connection goes from open to fully closed:
//! - applies the closing timeout policy once a close sequence starts
//! - forces closure through the transport when the peer does not answer in time
//! - fires the eviction callback exactly once, after the transport reported
//!   the connection closed, whichever path led there

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{
    CloseStatus, CloseTransport, ConnectionTimer, EvictionCallback, TimerError, TimerHandle,
    TimerResult,
};

/// Closing timeout used when nothing is configured, in seconds
pub const DEFAULT_CLOSING_TIMEOUT_SECS: i64 = 10;

/// How long to wait for the peer after a close sequence started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosingTimeout {
    /// Never force closure; the peer or transport must end the connection
    Disabled,
    /// Tear the channel down as soon as the close sequence starts
    Immediate,
    /// Wait this long, then force closure
    After(Duration),
}

impl ClosingTimeout {
    /// Convert a configured value in whole seconds
    pub fn from_secs(secs: i64) -> Self {
        if secs < 0 {
            ClosingTimeout::Disabled
        } else {
            Self::from_millis(secs.saturating_mul(1000))
        }
    }

    /// Convert a value in milliseconds: negative disables, zero is immediate
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            m if m < 0 => ClosingTimeout::Disabled,
            0 => ClosingTimeout::Immediate,
            m => ClosingTimeout::After(Duration::from_millis(m as u64)),
        }
    }

    /// Milliseconds with -1 for disabled and 0 for immediate
    pub fn as_millis(&self) -> i64 {
        match self {
            ClosingTimeout::Disabled => -1,
            ClosingTimeout::Immediate => 0,
            ClosingTimeout::After(delay) => i64::try_from(delay.as_millis()).unwrap_or(i64::MAX),
        }
    }
}

impl Default for ClosingTimeout {
    fn default() -> Self {
        Self::from_secs(DEFAULT_CLOSING_TIMEOUT_SECS)
    }
}

impl fmt::Display for ClosingTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosingTimeout::Disabled => write!(f, "disabled"),
            ClosingTimeout::Immediate => write!(f, "immediate"),
            ClosingTimeout::After(delay) => write!(f, "{}ms", delay.as_millis()),
        }
    }
}

/// Path that led to the connection being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Closed right away because the timeout policy is immediate
    Immediate,
    /// Forced after the closing timeout elapsed
    TimedOut,
    /// The close sequence ran and the transport closed on its own
    Acknowledged,
    /// The transport closed without any close sequence
    Abrupt,
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseCause::Immediate => "closed immediately",
            CloseCause::TimedOut => "closing timeout elapsed",
            CloseCause::Acknowledged => "close handshake completed",
            CloseCause::Abrupt => "transport closed abruptly",
        };
        f.write_str(s)
    }
}

/// Published to session-level listeners once the connection is closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseOutcome {
    pub cause: CloseCause,
    /// Status from the peer's close frame, if one arrived
    pub peer_status: Option<CloseStatus>,
}

/// Who started the close sequence
#[derive(Debug, Clone, Copy)]
enum Initiator {
    Local,
    Peer,
}

#[derive(Default)]
struct CloseState {
    closing: bool,
    forced: Option<CloseCause>,
    closed: bool,
    timer: Option<TimerHandle>,
    eviction: Option<EvictionCallback>,
    peer_status: Option<CloseStatus>,
}

struct Inner {
    timeout: ClosingTimeout,
    transport: Arc<dyn CloseTransport>,
    timer: Option<ConnectionTimer>,
    state: Mutex<CloseState>,
    outcome_tx: watch::Sender<Option<CloseOutcome>>,
}

/// Close state machine for one connection
///
/// Cheap to clone; clones share the same state. All state sits behind one
/// mutex that is never held while calling into the transport or running the
/// eviction callback, so either may call back into the coordinator.
#[derive(Clone)]
pub struct CloseCoordinator {
    inner: Arc<Inner>,
}

impl CloseCoordinator {
    /// Create a coordinator with a fixed timeout policy
    ///
    /// A bounded timeout schedules on the current tokio runtime, so creating
    /// one outside a runtime fails. Immediate and disabled policies need none.
    pub fn new(
        timeout: ClosingTimeout,
        transport: Arc<dyn CloseTransport>,
    ) -> TimerResult<Self> {
        let timer = match timeout {
            ClosingTimeout::After(_) => Some(ConnectionTimer::current()?),
            _ => None,
        };

        let (outcome_tx, _) = watch::channel(None);
        Ok(Self {
            inner: Arc::new(Inner {
                timeout,
                transport,
                timer,
                state: Mutex::new(CloseState::default()),
                outcome_tx,
            }),
        })
    }

    /// The timeout policy fixed at construction
    pub fn timeout(&self) -> ClosingTimeout {
        self.inner.timeout
    }

    /// Register the callback that removes this connection from its registry
    ///
    /// Last registration wins. Register before the connection can see close
    /// events: a callback registered after the connection closed is dropped
    /// without running.
    pub fn set_eviction_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        if state.closed {
            warn!("Eviction callback registered after the connection closed, it will never run");
            return;
        }
        if state.eviction.replace(Box::new(callback)).is_some() {
            debug!("Replaced previously registered eviction callback");
        }
    }

    /// The application asked to close the connection
    ///
    /// Only the first call starts a close sequence; later calls do nothing.
    pub fn on_local_close_requested(&self) {
        self.begin_close(Initiator::Local);
    }

    /// The transport received the peer's close frame
    ///
    /// Starts the close sequence if the peer spoke first (the transport echoes
    /// the frame). If we started it, this is the acknowledgment and any armed
    /// timer keeps bounding the wait for the transport to go away.
    pub fn on_peer_close_received(&self, status: Option<CloseStatus>) {
        {
            let mut state = self.lock();
            if state.closed {
                debug!("Peer close frame after connection closed, ignoring");
                return;
            }
            if state.peer_status.is_none() {
                state.peer_status = Some(status.unwrap_or_default());
            }
        }
        self.begin_close(Initiator::Peer);
    }

    /// The closing timeout elapsed without the transport closing
    pub fn on_timer_expired(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                debug!("Closing timeout fired after connection closed, ignoring");
                return;
            }
            if state.forced.is_some() {
                return;
            }
            // Dropping an unfired handle cancels it
            state.timer = None;
            state.forced = Some(CloseCause::TimedOut);
        }

        info!(
            "Peer did not finish closing within {}, forcing closure",
            self.inner.timeout
        );
        self.inner.transport.close_channel_now();
    }

    /// The transport tore the channel down, from any cause
    ///
    /// Cancels the timer, marks the connection closed, runs the eviction
    /// callback and then wakes everyone waiting in [`closed`](Self::closed).
    pub fn on_connection_closed(&self) {
        let (eviction, outcome) = {
            let mut state = self.lock();
            if state.closed {
                debug!("Connection already closed, ignoring duplicate notification");
                return;
            }
            if let Some(timer) = state.timer.take() {
                if timer.cancel() {
                    debug!("Cancelled closing timeout");
                }
            }
            state.closed = true;

            let cause = match state.forced {
                Some(cause) => cause,
                None if state.closing => CloseCause::Acknowledged,
                None => CloseCause::Abrupt,
            };
            let outcome = CloseOutcome {
                cause,
                peer_status: state.peer_status.clone(),
            };
            (state.eviction.take(), outcome)
        };

        debug!("Connection closed: {}", outcome.cause);

        match eviction {
            Some(evict) => evict(),
            None => debug!("No eviction callback registered"),
        }

        self.inner.outcome_tx.send_replace(Some(outcome));
    }

    /// Wait until the connection is closed
    ///
    /// Resolves at once if it already is.
    pub async fn closed(&self) -> CloseOutcome {
        let mut rx = self.inner.outcome_tx.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .expect("outcome sender lives in the coordinator being awaited");
        (*outcome)
            .clone()
            .expect("wait_for only returns once an outcome is published")
    }

    /// Whether a close sequence has started
    pub fn is_closing(&self) -> bool {
        self.lock().closing
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn begin_close(&self, initiator: Initiator) {
        let mut state = self.lock();
        if state.closed || state.closing {
            debug!("Close sequence already running, ignoring {:?} close", initiator);
            return;
        }
        state.closing = true;

        debug!(
            "{:?} close started, closing timeout {}",
            initiator, self.inner.timeout
        );

        match self.inner.timeout {
            ClosingTimeout::Disabled => {}
            ClosingTimeout::Immediate => {
                state.forced = Some(CloseCause::Immediate);
                drop(state);
                self.inner.transport.close_channel_now();
            }
            ClosingTimeout::After(delay) => match self.arm_timer(delay) {
                Ok(handle) => state.timer = Some(handle),
                Err(e) => {
                    error!("Failed to arm closing timeout: {}, closing now", e);
                    state.forced = Some(CloseCause::Immediate);
                    drop(state);
                    self.inner.transport.close_channel_now();
                }
            },
        }
    }

    fn arm_timer(&self, delay: Duration) -> TimerResult<TimerHandle> {
        let timer = self.inner.timer.as_ref().ok_or(TimerError::NoRuntime)?;
        let weak = Arc::downgrade(&self.inner);
        timer.arm(delay, move || {
            if let Some(inner) = weak.upgrade() {
                CloseCoordinator { inner }.on_timer_expired();
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, CloseState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CloseCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CloseCoordinator")
            .field("timeout", &self.inner.timeout)
            .field("closing", &state.closing)
            .field("closed", &state.closed)
            .field("forced", &state.forced)
            .finish()
    }
}
