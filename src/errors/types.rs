//! Error type definitions for the portal gateway

use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Invalid configuration, fatal at load time
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Outbound proxy tunnel errors
    #[error("Proxy tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Upstream legacy-protocol errors
    #[error("Portal error: {0}")]
    Portal(#[from] PortalError),

    /// Downstream brokering errors
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Data serialization/deserialization failures
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        AppError::Configuration {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        AppError::Internal {
            message: message.into(),
        }
    }
}

/// Proxy tunnel factory errors
///
/// All of these surface to the caller; the factory never silently downgrades
/// a broken proxy to a direct connection.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The proxy descriptor string does not match any accepted form
    #[error("Invalid proxy format '{descriptor}': {reason}")]
    InvalidProxyFormat { descriptor: String, reason: String },

    /// Shadowsocks cipher name is not in the supported set
    #[error("Unsupported cipher: {0}")]
    UnsupportedCipher(String),

    /// Pre-flight TCP connect to the remote proxy endpoint failed
    #[error("Proxy unreachable: {endpoint}: {reason}")]
    ProxyUnreachable { endpoint: String, reason: String },

    /// The local Shadowsocks bridge process could not be started or verified
    #[error("Bridge startup failed: {reason}")]
    BridgeStartupFailed { reason: String },
}

/// Upstream legacy-portal protocol errors
///
/// `AllEndpointsExhausted` is terminal for a call: the MAC is currently
/// unusable, which is not a fatal process error for callers.
#[derive(Error, Debug)]
pub enum PortalError {
    /// Transport-level failure reaching the portal
    #[error("Portal unreachable: {url}: {reason}")]
    PortalUnreachable { url: String, reason: String },

    /// Handshake completed transport-wise but yielded no usable token
    #[error("Handshake failed for MAC {mac}: {reason}")]
    HandshakeFailed { mac: String, reason: String },

    /// The portal rejected the bearer token
    #[error("Authentication token expired or rejected")]
    AuthExpired,

    /// Response body did not have the expected shape
    #[error("Malformed response from {endpoint}: {reason}")]
    MalformedResponse { endpoint: String, reason: String },

    /// Every known endpoint/method combination failed
    #[error("All portal endpoints exhausted for {url}")]
    AllEndpointsExhausted { url: String },
}

/// Downstream session brokering errors
#[derive(Error, Debug)]
pub enum GatewayError {
    /// No MAC in {Available, Busy} for the target portal
    #[error("No MAC available for portal {portal_id}")]
    NoMacAvailable { portal_id: String },

    /// User is at their concurrent-connection limit
    #[error("Connection limit reached ({max}) for user {username}")]
    AdmissionDenied { username: String, max: u32 },

    /// Numeric stream id is not present in the catalog snapshot
    #[error("Unknown stream id {0}")]
    UnknownStreamId(u32),

    /// User's portal restriction excludes the requested portal
    #[error("Access to portal {portal_id} denied")]
    PortalRestricted { portal_id: String },

    /// All resolution attempts exhausted for this playback request
    #[error("Playback unavailable: {reason}")]
    PlaybackUnavailable { reason: String },
}
