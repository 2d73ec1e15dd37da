//! Minimal SIP support for WebSocket signaling: message parsing and
//! serialization (RFC 3261 subset), MD5 digest authentication (RFC 2617),
//! and just enough SDP for a single audio stream.
//!
//! One SIP message travels per WebSocket text frame (RFC 7118), so there is
//! no Content-Length framing on receive; the header is still emitted on send
//! because registrars reject requests without it.

pub mod auth;
pub mod msg;
pub mod sdp;

use thiserror::Error;

/// Errors from parsing or assembling SIP messages.
#[derive(Debug, Error)]
pub enum SipError {
    #[error("malformed SIP message: {0}")]
    Malformed(String),
    #[error("unsupported digest parameter: {0}")]
    UnsupportedDigest(String),
}
