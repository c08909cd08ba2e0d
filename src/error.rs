//! Error types shared across the crate.

use thiserror::Error;

/// Everything that can go wrong between a method call and its reply.
///
/// Wire-level failures (`MalformedFrame`, `ChecksumMismatch`,
/// `DecryptFailure`) are attributed to the pending call whose request id
/// the offending datagram carried; datagrams that cannot be attributed are
/// logged and dropped by the dispatcher.
#[derive(Debug, Error)]
pub enum Error {
    /// A frame failed structural validation; `field` names the offender.
    #[error("malformed frame: {field}: {detail}")]
    MalformedFrame {
        field: &'static str,
        detail: String,
    },

    /// The MD5 over header prefix, token and ciphertext did not match the
    /// checksum field of an inbound frame.
    #[error("frame checksum mismatch")]
    ChecksumMismatch,

    /// AES-128-CBC decryption (or PKCS#7 unpadding) of the payload failed.
    #[error("payload decryption failed")]
    DecryptFailure,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply arrived within the per-request deadline.
    #[error("request timed out")]
    Timeout,

    /// All attempts of a call failed; `last` is the final underlying error.
    #[error("giving up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    /// The device answered with an `error` body instead of a result.
    #[error("device error {code}: {message}")]
    Remote { code: String, message: String },

    /// The client was closed; pending and future calls are cancelled.
    #[error("session closed")]
    SessionClosed,

    /// The device token is not a 32-character hex string.
    #[error("invalid device token: {0}")]
    InvalidToken(String),

    /// A value does not fit the requested big-endian width.
    #[error("value {value} does not fit into {width} bits")]
    IntOverflow { value: u64, width: u32 },

    #[error("JSON encode/decode failed: {0}")]
    Json(#[from] serde_json::Error),
}
