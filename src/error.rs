//! Fatal engine errors and their process exit codes (§6.4, §7).
//!
//! Non-fatal conditions — a full stream table, a malformed input line, a
//! short write to a client, a client EOF — are handled inline by the engine
//! and never become an `EngineError`. Only conditions the reference
//! implementation treats as unrecoverable reach here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unable to bind {0}: {1}")]
    BindFailed(std::net::SocketAddr, std::io::Error),

    #[error("fatal I/O error on input stream: {0}")]
    InputStreamIo(std::io::Error),

    #[error("input stream closed unexpectedly")]
    InputStreamClosed,

    #[error("fatal I/O error on output stream: {0}")]
    OutputStreamIo(std::io::Error),

    #[error("too many PGNs seen: the {0}-entry secondary-ordered list is full")]
    PgnListOverflow(usize),

    #[error("mio registry error: {0}")]
    ReactorSetup(std::io::Error),
}

impl EngineError {
    /// Maps a fatal error to the process exit code described in §6.4.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::BindFailed(..) => 1,
            EngineError::InputStreamIo(_) | EngineError::InputStreamClosed => 1,
            EngineError::OutputStreamIo(_) => 1,
            EngineError::PgnListOverflow(_) => 1,
            EngineError::ReactorSetup(_) => 1,
        }
    }
}
