use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::CancelReason;
use crate::transport::{ExecutionId, Transport};

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED_TIMEOUT: u8 = 2;
const CANCELLED_EXPLICIT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Pending,
    Completed,
    Cancelled(CancelReason),
}

/// State of one in-flight execution. Completion and cancellation race on a
/// single compare-and-swap; whichever lands first decides the outcome.
#[derive(Debug)]
pub struct CancellationToken {
    exec: ExecutionId,
    state: AtomicU8,
}

impl CancellationToken {
    pub fn new(exec: ExecutionId) -> Self {
        CancellationToken {
            exec,
            state: AtomicU8::new(PENDING),
        }
    }

    pub fn exec(&self) -> ExecutionId {
        self.exec
    }

    pub fn state(&self) -> TokenState {
        decode(self.state.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.state() != TokenState::Pending
    }

    pub fn cancelled(&self) -> Option<CancelReason> {
        match self.state() {
            TokenState::Cancelled(reason) => Some(reason),
            _ => None,
        }
    }

    /// Marks the execution complete. Fails with the cancel reason if the
    /// token already fired.
    pub fn complete(&self) -> Result<(), CancelReason> {
        match self
            .state
            .compare_exchange(PENDING, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(prev) => match decode(prev) {
                TokenState::Cancelled(reason) => Err(reason),
                _ => Ok(()),
            },
        }
    }

    /// Returns true only for the call that moved the token out of pending.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let target = match reason {
            CancelReason::Timeout => CANCELLED_TIMEOUT,
            CancelReason::Explicit => CANCELLED_EXPLICIT,
        };
        self.state
            .compare_exchange(PENDING, target, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

fn decode(v: u8) -> TokenState {
    match v {
        COMPLETED => TokenState::Completed,
        CANCELLED_TIMEOUT => TokenState::Cancelled(CancelReason::Timeout),
        CANCELLED_EXPLICIT => TokenState::Cancelled(CancelReason::Explicit),
        _ => TokenState::Pending,
    }
}

struct Deadline {
    at: Instant,
    token: Arc<CancellationToken>,
}

/// Timer thread that cancels executions whose deadline passed.
///
/// Spawned lazily on the first armed deadline; exits once the owning
/// connection shuts it down.
pub struct TimeoutSupervisor {
    transport: Arc<dyn Transport>,
    conn_closed: Arc<AtomicBool>,
    tx: Mutex<Option<mpsc::Sender<Deadline>>>,
    shut_down: AtomicBool,
}

impl TimeoutSupervisor {
    pub fn new(transport: Arc<dyn Transport>, conn_closed: Arc<AtomicBool>) -> Self {
        TimeoutSupervisor {
            transport,
            conn_closed,
            tx: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn arm(&self, token: Arc<CancellationToken>, timeout: Duration) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        let deadline = Deadline {
            at: Instant::now() + timeout,
            token,
        };
        let mut tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if tx.is_none() {
            *tx = self.spawn();
        }
        let Some(sender) = tx.as_ref() else {
            return;
        };
        if let Err(mpsc::SendError(deadline)) = sender.send(deadline) {
            warn!(exec = %deadline.token.exec(), "timeout supervisor is gone; deadline not armed");
            *tx = None;
        }
    }

    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let mut tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        tx.take();
    }

    fn spawn(&self) -> Option<mpsc::Sender<Deadline>> {
        let (tx, rx) = mpsc::channel::<Deadline>();
        let transport = self.transport.clone();
        let conn_closed = self.conn_closed.clone();
        match thread::Builder::new()
            .name("x07-db-stmt-timeout".to_string())
            .spawn(move || supervisor_loop(rx, transport, conn_closed))
        {
            Ok(_) => Some(tx),
            Err(err) => {
                warn!(error = %err, "failed to spawn timeout supervisor");
                None
            }
        }
    }
}

impl Drop for TimeoutSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn supervisor_loop(
    rx: mpsc::Receiver<Deadline>,
    transport: Arc<dyn Transport>,
    conn_closed: Arc<AtomicBool>,
) {
    let mut pending: Vec<Deadline> = Vec::new();
    loop {
        let next_at = pending.iter().map(|d| d.at).min();
        let msg = match next_at {
            Some(at) => rx.recv_timeout(at.saturating_duration_since(Instant::now())),
            None => rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected),
        };
        match msg {
            Ok(d) => pending.push(d),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        pending.retain(|d| {
            if d.token.is_finished() {
                return false;
            }
            if d.at > now {
                return true;
            }
            fire(&d.token, transport.as_ref(), &conn_closed);
            false
        });
    }
    trace!("timeout supervisor exiting");
}

fn fire(token: &CancellationToken, transport: &dyn Transport, conn_closed: &AtomicBool) {
    if !token.cancel(CancelReason::Timeout) {
        return;
    }
    debug!(exec = %token.exec(), "query timeout fired");
    if conn_closed.load(Ordering::Acquire) || !transport.is_open() {
        return;
    }
    if let Err(err) = transport.cancel(token.exec()) {
        warn!(exec = %token.exec(), error = %err, "out-of-band cancel failed");
    }
}
