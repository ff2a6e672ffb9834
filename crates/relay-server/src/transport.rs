//! Transport abstraction consumed by the core. The registry depends
//! only on this contract, not on any specific socket implementation.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Mirror of the WebSocket ready-state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// A bidirectional text-frame session. Writes are best-effort: `false`
/// means the frame was not accepted (closed peer or full queue) and the
/// caller counts the loss instead of retrying.
pub trait Transport: Send {
    fn send(&mut self, frame: &str) -> bool;
    /// Graceful close handshake.
    fn close(&mut self);
    /// Abort without a handshake (heartbeat kill path).
    fn terminate(&mut self);
    fn ready_state(&self) -> ReadyState;
}

/// Command stream consumed by the WebSocket writer task.
#[derive(Debug)]
pub(crate) enum WriterCmd {
    Frame(String),
    Close,
    Terminate,
}

/// Production transport: frames are queued on a bounded channel drained
/// by a writer task that owns the WebSocket sink. The ready state is
/// shared with the reader/writer tasks at the edge.
pub struct WsTransport {
    tx: mpsc::Sender<WriterCmd>,
    state: Arc<Mutex<ReadyState>>,
}

impl WsTransport {
    /// Build a transport plus the writer-side receiver and the shared
    /// ready-state cell.
    pub(crate) fn channel(
        max_send_queue: usize,
    ) -> (Self, mpsc::Receiver<WriterCmd>, Arc<Mutex<ReadyState>>) {
        let (tx, rx) = mpsc::channel(max_send_queue);
        let state = Arc::new(Mutex::new(ReadyState::Connecting));
        let transport = Self {
            tx,
            state: Arc::clone(&state),
        };
        (transport, rx, state)
    }
}

impl Transport for WsTransport {
    fn send(&mut self, frame: &str) -> bool {
        if *self.state.lock() != ReadyState::Open {
            return false;
        }
        match self.tx.try_send(WriterCmd::Frame(frame.to_owned())) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(frame_len = frame.len(), "send queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        if *state == ReadyState::Open || *state == ReadyState::Connecting {
            *state = ReadyState::Closing;
            let _ = self.tx.try_send(WriterCmd::Close);
        }
    }

    fn terminate(&mut self) {
        *self.state.lock() = ReadyState::Closed;
        let _ = self.tx.try_send(WriterCmd::Terminate);
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock()
    }
}
