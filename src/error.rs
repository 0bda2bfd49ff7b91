// Error taxonomy shared by the connection state machine and the OTA updater.
//
// Every failure is a reported value with a stable, non-zero status code. The
// codes double as the OTA_FAILED payload, so they must not be renumbered.

use std::fmt;

/// Status returned for a successful operation.
pub const STATUS_OK: i32 = 0;

/// Step of the OTA sequence that produced a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStep {
    Descriptor,
    Transfer,
    IncompleteData,
    Commit,
}

impl OtaStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            OtaStep::Descriptor => "DESCRIPTOR",
            OtaStep::Transfer => "TRANSFER",
            OtaStep::IncompleteData => "INCOMPLETE_DATA",
            OtaStep::Commit => "COMMIT",
        }
    }

    fn offset(&self) -> i32 {
        match self {
            OtaStep::Descriptor => 0,
            OtaStep::Transfer => 1,
            OtaStep::IncompleteData => 2,
            OtaStep::Commit => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid credentials, malformed URL or unusable trust anchor
    Config(String),
    /// Link or transport failure not attributable to configuration
    Transport { message: String, raw: i32 },
    /// Disconnect events consumed the whole retry budget
    RetryExhausted { budget: u32 },
    /// OTA descriptor fetch, transfer, verification or commit failure
    Protocol { step: OtaStep, raw: i32 },
    /// Allocation failure for a transient buffer
    Resource(String),
    /// A bounded wait elapsed before a definitive outcome
    Timeout,
    /// A wait was cancelled through its token
    Cancelled,
    /// Operation not allowed in the instance's current state
    InvalidState(&'static str),
}

impl Error {
    pub const CONFIG: i32 = 0x101;
    pub const TRANSPORT: i32 = 0x102;
    pub const RETRY_EXHAUSTED: i32 = 0x103;
    pub const PROTOCOL_BASE: i32 = 0x110;
    pub const RESOURCE: i32 = 0x120;
    pub const TIMEOUT: i32 = 0x130;
    pub const CANCELLED: i32 = 0x131;
    pub const INVALID_STATE: i32 = 0x140;

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub fn transport(message: impl Into<String>, raw: i32) -> Self {
        Error::Transport {
            message: message.into(),
            raw,
        }
    }

    /// Non-zero status code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::Config(_) => Self::CONFIG,
            Error::Transport { .. } => Self::TRANSPORT,
            Error::RetryExhausted { .. } => Self::RETRY_EXHAUSTED,
            Error::Protocol { step, .. } => Self::PROTOCOL_BASE + step.offset(),
            Error::Resource(_) => Self::RESOURCE,
            Error::Timeout => Self::TIMEOUT,
            Error::Cancelled => Self::CANCELLED,
            Error::InvalidState(_) => Self::INVALID_STATE,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Transport { .. } => "TRANSPORT_ERROR",
            Error::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Error::Protocol { .. } => "PROTOCOL_ERROR",
            Error::Resource(_) => "RESOURCE_ERROR",
            Error::Timeout => "TIMEOUT",
            Error::Cancelled => "CANCELLED",
            Error::InvalidState(_) => "INVALID_STATE",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "{}: {}", self.kind(), msg),
            Error::Transport { message, raw } => {
                write!(f, "{}: {} (0x{:x})", self.kind(), message, raw)
            }
            Error::RetryExhausted { budget } => {
                write!(f, "{}: gave up after {} reconnect attempts", self.kind(), budget)
            }
            Error::Protocol { step, raw } => {
                write!(f, "{}: {} failed (0x{:x})", self.kind(), step.as_str(), raw)
            }
            Error::Resource(msg) => write!(f, "{}: {}", self.kind(), msg),
            Error::Timeout | Error::Cancelled => f.write_str(self.kind()),
            Error::InvalidState(msg) => write!(f, "{}: {}", self.kind(), msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Integer status of an entry point result: 0 on success, the error code otherwise.
pub fn status<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => STATUS_OK,
        Err(e) => e.code(),
    }
}
