/// Classification of non-fatal failures observed on one connection or
/// one message. Nothing here crosses the registry boundary as an error:
/// faults are counted, logged, and the process keeps serving.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Fault {
    /// Transport accept/send/close failure. The affected connection is
    /// torn down as if disconnected.
    #[error("transport fault: {0}")]
    Transport(String),
    /// Malformed or non-array payload, or a batch element that is not
    /// an envelope.
    #[error("garbage payload")]
    Garbage,
    /// Envelope key with no registered handler.
    #[error("unknown key: {0}")]
    UnknownKey(String),
    /// Callback token not found in the table: peer replay or a reset
    /// table. Ignored.
    #[error("stale callback token {0}")]
    StaleCallback(u32),
    /// Transport not open at flush time; the pending batch is dropped.
    /// Accepted message loss, never retried.
    #[error("transport not writable, batch dropped")]
    Unwritable,
}

impl Fault {
    /// Short classification string for logging and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Garbage => "garbage",
            Self::UnknownKey(_) => "unknown_key",
            Self::StaleCallback(_) => "stale_callback",
            Self::Unwritable => "unwritable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings() {
        assert_eq!(Fault::Garbage.kind(), "garbage");
        assert_eq!(Fault::UnknownKey("x".into()).kind(), "unknown_key");
        assert_eq!(Fault::StaleCallback(3).kind(), "stale_callback");
        assert_eq!(Fault::Unwritable.kind(), "unwritable");
        assert_eq!(Fault::Transport("eof".into()).kind(), "transport");
    }

    #[test]
    fn faults_display() {
        assert_eq!(Fault::StaleCallback(7).to_string(), "stale callback token 7");
    }
}
