use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

/// Connection-level failure classes reported by the HTTP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Refused,
    Reset,
    Aborted,
    Timeout,
    EndOfStream,
    Other,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportKind::Refused => "connection refused",
            TransportKind::Reset => "connection reset",
            TransportKind::Aborted => "connection aborted",
            TransportKind::Timeout => "timed out",
            TransportKind::EndOfStream => "end of stream",
            TransportKind::Other => "transport failure",
        };
        f.write_str(label)
    }
}

/// Ordered steps of the re-signing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningPhase {
    Copy,
    Unsign,
    Sign,
    Align,
    Replace,
}

impl fmt::Display for SigningPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SigningPhase::Copy => "copy",
            SigningPhase::Unsign => "unsign",
            SigningPhase::Sign => "sign",
            SigningPhase::Align => "align",
            SigningPhase::Replace => "replace",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Manifest parse failed: {0}")]
    ManifestParse(String),

    #[error("Signing failed during {phase}: {message}")]
    Signing { phase: SigningPhase, message: String },

    #[error("Fingerprint extraction failed: {0}")]
    Fingerprint(String),

    #[error("Test server {kind}: {message}")]
    Transport { kind: TransportKind, message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String, retryable: bool },

    #[error("Empty result from test server")]
    EmptyResponse,

    #[error("Action '{action}' unsuccessful: {message}")]
    ActionFailure { action: String, message: String },

    #[error("Action '{action}' timed out after {deadline:?}")]
    ActionTimeout { action: String, deadline: Duration },

    #[error("{package} did not get installed. Reason: '{reason}'. Aborting!")]
    Installation { package: String, reason: String },

    #[error("App did not start. Check the device log for instrumentation failures")]
    AppNotStarted,

    #[error(
        "Unable to make connection to the test server at {endpoint}\nPlease check the logcat output for more info about what happened"
    )]
    ReadinessTimeout { endpoint: String },

    #[error(
        "Unable to obtain test server version: {reason}\nPlease run 'reinstall_test_server' to make sure you have the correct version"
    )]
    VersionUnavailable { reason: String },

    #[error(
        "Client and test server version mismatch.\nClient version {client}\nTest server version {server}\nExpected test server version {client}\n\nSolution:\n\nRun 'reinstall_test_server' to make sure you have the correct version"
    )]
    VersionMismatch { client: String, server: String },

    #[error("Could not remove the keyguard")]
    LockScreen,

    #[error("Will not talk to the test server because of previous failures")]
    RunAborted,

    #[error("Could not {operation} preferences '{name}'")]
    Preferences { operation: String, name: String },

    #[error("{0}")]
    Tool(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::ManifestParse(_) => "ERR_MANIFEST",
            AppError::Signing { .. } => "ERR_SIGNING",
            AppError::Fingerprint(_) => "ERR_FINGERPRINT",
            AppError::Transport { .. } => "ERR_TRANSPORT",
            AppError::Protocol { .. } => "ERR_PROTOCOL",
            AppError::EmptyResponse => "ERR_EMPTY_RESPONSE",
            AppError::ActionFailure { .. } => "ERR_ACTION_FAILED",
            AppError::ActionTimeout { .. } => "ERR_ACTION_TIMEOUT",
            AppError::Installation { .. } => "ERR_INSTALLATION",
            AppError::AppNotStarted => "ERR_APP_NOT_STARTED",
            AppError::ReadinessTimeout { .. } => "ERR_READINESS",
            AppError::VersionUnavailable { .. } => "ERR_VERSION_UNAVAILABLE",
            AppError::VersionMismatch { .. } => "ERR_VERSION_MISMATCH",
            AppError::LockScreen => "ERR_LOCK_SCREEN",
            AppError::RunAborted => "ERR_RUN_ABORTED",
            AppError::Preferences { .. } => "ERR_PREFERENCES",
            AppError::Tool(_) => "ERR_TOOL",
            AppError::Config(_) => "ERR_CONFIG",
            AppError::Io(_) => "ERR_SYSTEM",
            AppError::Json(_) => "ERR_SYSTEM",
        }
    }

    pub fn transport(kind: TransportKind, message: impl Into<String>) -> Self {
        AppError::Transport {
            kind,
            message: message.into(),
        }
    }

    pub fn signing(phase: SigningPhase, message: impl Into<String>) -> Self {
        AppError::Signing {
            phase,
            message: message.into(),
        }
    }

    pub fn tool(message: impl Into<String>) -> Self {
        AppError::Tool(message.into())
    }

    /// Connection-level failures, including the 502 the on-device proxy returns while the
    /// server socket is not yet bound.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            AppError::Transport { .. } | AppError::Protocol { retryable: true, .. }
        )
    }
}
