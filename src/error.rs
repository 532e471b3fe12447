//! Crate-wide error type for the control/data connection layer.
//!
//! Mirrors the `FtpError`/`FtpErrorKind` shape: a flat kind enum,
//! a human message, an optional reply code, and manual `Display`/`Error`
//! impls. Queue-item-level problems use the separate, smaller `ProblemCode`
//! enum in `queue.rs` — connection errors and per-item problem codes are
//! kept as distinct layers.

use std::fmt;

/// Categorised engine error.
#[derive(Debug, Clone)]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
    /// FTP reply code that triggered the error, if any.
    pub code: Option<u16>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// TCP / DNS resolution failure.
    ConnectionFailed,
    /// AUTH TLS / TLS handshake failure.
    TlsFailed,
    /// Wrong username/password.
    AuthFailed,
    /// Server returned a 4xx/5xx for a command.
    CommandRejected,
    /// Data channel could not be established (PASV/PORT failed).
    DataChannelFailed,
    /// Transfer aborted, incomplete, or timed out.
    TransferFailed,
    /// No byte arrived on the data channel within the configured window.
    NoDataTimeout,
    /// MODE Z stream was not valid deflate.
    DecompressionFailed,
    /// Server sent an un-parseable response.
    ProtocolError,
    /// An I/O error on the local side (file read/write).
    IoError,
    /// Operation timed out (connect, listen, or command-reply timeout).
    Timeout,
    /// Session is disconnected / dropped.
    Disconnected,
    /// Proxy login-script failure.
    ProxyError,
    /// Config / parameter validation error.
    InvalidConfig,
    /// Out of memory while buffering a listing or a name.
    LowMemory,
    /// A CWD/PWD round trip revealed a directory cycle.
    DirEndlessLoop,
    /// Catch-all.
    Unknown,
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn new(kind: EngineErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            detail: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::ConnectionFailed, msg)
    }

    pub fn tls_failed(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::TlsFailed, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::AuthFailed, msg)
    }

    pub fn command_rejected(code: u16, msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::CommandRejected, msg).with_code(code)
    }

    pub fn data_channel(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::DataChannelFailed, msg)
    }

    pub fn transfer_failed(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::TransferFailed, msg)
    }

    pub fn no_data_timeout(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::NoDataTimeout, msg)
    }

    pub fn decompression_failed(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::DecompressionFailed, msg)
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::ProtocolError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::IoError, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Timeout, msg)
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Disconnected, msg)
    }

    pub fn proxy_error(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::ProxyError, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::InvalidConfig, msg)
    }

    pub fn low_memory(msg: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::LowMemory, msg)
    }

    /// A CWD/PWD round trip closed one of the two recognised cycle kinds.
    /// Never cheap-retryable — the item fails structurally rather
    /// than waiting for a sibling worker to try the same doomed CWD again.
    pub fn endless_loop(cycle: crate::explored::CycleKind) -> Self {
        Self::new(EngineErrorKind::DirEndlessLoop, format!("{:?}", cycle))
    }

    /// Classify an FTP reply code into the most appropriate error kind,
    /// same role as `FtpError::from_reply`.
    pub fn from_reply(code: u16, text: &str) -> Self {
        let kind = match code {
            421 => EngineErrorKind::Disconnected,
            425 | 426 => EngineErrorKind::DataChannelFailed,
            430 | 530 => EngineErrorKind::AuthFailed,
            450 | 451 | 452 | 552 => EngineErrorKind::TransferFailed,
            500..=504 => EngineErrorKind::CommandRejected,
            _ if code >= 400 => EngineErrorKind::CommandRejected,
            _ => EngineErrorKind::Unknown,
        };
        Self {
            kind,
            message: text.to_string(),
            code: Some(code),
            detail: None,
        }
    }

    /// Whether this error class is safe to retry on the same worker
    /// without user intervention.
    pub fn is_cheap_retryable(&self) -> bool {
        matches!(
            self.kind,
            EngineErrorKind::NoDataTimeout | EngineErrorKind::DecompressionFailed
        ) || (self.kind == EngineErrorKind::DataChannelFailed
            && self.code.map(|c| c == 425 || c == 426).unwrap_or(false))
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{:?} {}] {}", self.kind, code, self.message),
            None => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(format!("I/O timeout: {}", e))
        } else {
            Self::io_error(e.to_string())
        }
    }
}

impl From<EngineError> for String {
    fn from(e: EngineError) -> String {
        e.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_reply_classifies_426_as_data_channel_failed() {
        let e = EngineError::from_reply(426, "Connection closed; transfer aborted");
        assert_eq!(e.kind, EngineErrorKind::DataChannelFailed);
    }

    #[test]
    fn transfer_aborted_426_is_cheap_retryable() {
        let e = EngineError::from_reply(426, "Connection closed; transfer aborted");
        assert!(e.is_cheap_retryable());
    }

    #[test]
    fn permanent_5xx_is_not_cheap_retryable() {
        let e = EngineError::from_reply(550, "No such file or directory");
        assert!(!e.is_cheap_retryable());
    }

    #[test]
    fn data_channel_failure_without_a_reply_code_is_not_cheap_retryable() {
        let e = EngineError::data_channel("could not parse PASV reply");
        assert!(!e.is_cheap_retryable());
    }
}
