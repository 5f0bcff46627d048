// Outgoing message queue shared by every transport adapter
// Buffers sends until the channel signals readiness, then flushes in FIFO order

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::poison::lock;

enum QueueState {
    Buffering(VecDeque<String>),
    Open(mpsc::UnboundedSender<String>),
    Closed,
}

pub struct SendQueue {
    state: Mutex<QueueState>,
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::Buffering(VecDeque::new())),
        }
    }

    /// Buffer or forward one message depending on readiness
    pub fn push(&self, wire: String) {
        let mut state = lock(&self.state);
        match &mut *state {
            QueueState::Buffering(queued) => queued.push_back(wire),
            QueueState::Open(out) => {
                if out.send(wire).is_err() {
                    *state = QueueState::Closed;
                }
            }
            QueueState::Closed => debug!("Dropping message on closed channel"),
        }
    }

    /// Flush everything buffered into `out` and forward directly from now on.
    /// Returns the number of flushed messages.
    pub fn open(&self, out: mpsc::UnboundedSender<String>) -> usize {
        let mut state = lock(&self.state);
        let queued = match std::mem::replace(&mut *state, QueueState::Closed) {
            QueueState::Buffering(queued) => queued,
            QueueState::Open(_) => VecDeque::new(),
            QueueState::Closed => return 0,
        };

        let flushed = queued.len();
        for wire in queued {
            if out.send(wire).is_err() {
                return 0;
            }
        }
        *state = QueueState::Open(out);
        flushed
    }

    pub fn is_open(&self) -> bool {
        matches!(*lock(&self.state), QueueState::Open(_))
    }

    /// Drop anything buffered; later pushes are discarded
    pub fn close(&self) {
        *lock(&self.state) = QueueState::Closed;
    }
}
