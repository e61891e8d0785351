/* Daemon-wide error taxonomy.
 *
 * Using explicit variants instead of opaque strings lets each layer
 * take structured recovery actions: frame and protocol errors are
 * dropped and logged, link I/O errors tear the link down through the
 * hotplug observer, and supervision/config errors escalate to the
 * process root. */

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /* Malformed COBS section, bad length byte, checksum mismatch or
     * truncated payload. Recoverable by dropping the frame and
     * resynchronizing at the next delimiter. */
    #[error("frame decode failed: {reason}")]
    FrameDecode { reason: &'static str },

    /* Serial read/write failure, EOF, or a vanished port. Fatal for
     * the link; triggers the pending-disconnect path. */
    #[error("link I/O failure on {port}: {source}")]
    LinkIo {
        port: String,
        #[source]
        source: std::io::Error,
    },

    /* Unexpected message in the current link state, or a payload that
     * disagrees with the declared device type. Logged, frame dropped. */
    #[error("protocol violation (message {message_id:#04x}): {reason}")]
    ProtocolViolation { message_id: u8, reason: String },

    /* Rejected parameter mutation: out of bounds, wrong type, not a
     * valid choice, or a write to a read-only parameter. Reported to
     * the caller as a structured error; no registry change. */
    #[error("invalid write to \"{param}\": {reason}")]
    RegistryValidation { param: String, reason: String },

    /* A worker exceeded `max_respawns` within the `respawn_reset`
     * window. Fatal at the process level. */
    #[error("worker \"{worker}\" failed {failures} time(s) within the respawn window")]
    SupervisionFailure { worker: String, failures: u32 },

    /* Peer disappeared, join-lock contention, or a decode failure on
     * the store bus. Recoverable per peer. */
    #[error("store transport error: {0}")]
    StoreTransport(String),

    /* Schema or names file unreadable or malformed. Fatal at startup. */
    #[error("configuration error in {path}: {reason}")]
    Config { path: String, reason: String },
}

impl RuntimeError {
    pub fn config(path: impl Into<String>, reason: impl Into<String>) -> Self {
        RuntimeError::Config {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn violation(message_id: u8, reason: impl Into<String>) -> Self {
        RuntimeError::ProtocolViolation {
            message_id,
            reason: reason.into(),
        }
    }

    pub fn validation(param: impl Into<String>, reason: impl Into<String>) -> Self {
        RuntimeError::RegistryValidation {
            param: param.into(),
            reason: reason.into(),
        }
    }
}
