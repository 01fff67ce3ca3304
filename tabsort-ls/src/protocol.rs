//! Wire protocol between the browser extension and the listener service
//!
//! Every WebSocket text frame is one message.
//!
//! Client → server:
//! - first frame: the shared-secret token, verbatim
//! - then: JSON records `{"url": "..."}`; anything else is ignored
//! - `PONG` in answer to a keepalive `PING`
//!
//! Server → client:
//! - JSON notices `{"message": "..."}` for handshake outcomes
//! - `PING` keepalives while streaming

use serde::{Deserialize, Serialize};

/// Keepalive probe sent by the server
pub const KEEPALIVE_PING: &str = "PING";

/// Keepalive answer sent by the extension
pub const KEEPALIVE_PONG: &str = "PONG";

/// Server status notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// This session is now the primary
    Established { port: u16 },
    /// No token arrived in time
    HandshakeTimeout,
    /// First message was not the shared secret
    InvalidCode,
    /// Another port already holds the primary connection
    PrimaryElsewhere { primary: u16 },
    /// A client is already connected (same port or election in progress)
    ClientActive { primary: Option<u16> },
    /// This port lost primary status while streaming
    NotPrimary { primary: Option<u16> },
}

#[derive(Serialize)]
struct NoticeBody<'a> {
    message: &'a str,
}

impl Notice {
    /// Human-readable status text
    pub fn text(&self) -> String {
        match self {
            Notice::Established { port } => {
                format!("Connection established with primary server on port {}.", port)
            }
            Notice::HandshakeTimeout => "Handshake timeout.".to_string(),
            Notice::InvalidCode => "Invalid code, closing connection.".to_string(),
            Notice::PrimaryElsewhere { primary } => format!(
                "Server is already connected on primary port {}. Closing this connection.",
                primary
            ),
            Notice::ClientActive { primary: Some(p) } => format!(
                "Another client is already connected on primary port {}. Closing this connection.",
                p
            ),
            Notice::ClientActive { primary: None } => {
                "Another client is already connected. Closing this connection.".to_string()
            }
            Notice::NotPrimary { primary: Some(p) } => format!(
                "Server is connected on primary port {}. Closing this connection.",
                p
            ),
            Notice::NotPrimary { primary: None } => {
                "Server has no primary connection. Closing this connection.".to_string()
            }
        }
    }

    /// JSON frame payload `{"message": "..."}`
    pub fn to_json(&self) -> String {
        let text = self.text();
        serde_json::to_string(&NoticeBody { message: &text })
            .unwrap_or_else(|_| format!("{{\"message\":\"{}\"}}", text))
    }
}

/// Inbound record after handshake
#[derive(Debug, Deserialize)]
struct UrlRecord {
    #[serde(default)]
    url: Option<String>,
}

/// What a streaming-phase frame contains
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Keepalive answer
    Pong,
    /// A navigation record carrying a URL
    Url(String),
    /// JSON without a usable `url` field
    MissingUrl,
    /// Not JSON at all
    Malformed,
}

/// Classify a streaming-phase text frame
pub fn parse_inbound(text: &str) -> Inbound {
    let trimmed = text.trim();
    if trimmed == KEEPALIVE_PONG {
        return Inbound::Pong;
    }
    match serde_json::from_str::<UrlRecord>(trimmed) {
        Ok(UrlRecord { url: Some(url) }) if !url.trim().is_empty() => Inbound::Url(url),
        Ok(_) => Inbound::MissingUrl,
        Err(_) => Inbound::Malformed,
    }
}
