// Secured firmware transport seam, shaped after esp_https_ota.

use std::fmt;

use crate::config::OtaConfig;
use crate::error::{Error, OtaStep};

use super::descriptor::AppDescriptor;

/// Category of a transport fault; decides which error the updater reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Bad URL, certificate or other configuration
    Config,
    /// Connection, TLS or I/O failure
    Transport,
    /// Unexpected data or state from the server or image
    Protocol,
    /// Out of memory for a session buffer
    NoMemory,
}

/// A failed transport call with the platform's raw code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub raw: i32,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, raw: i32, message: impl Into<String>) -> Self {
        Self {
            kind,
            raw,
            message: message.into(),
        }
    }

    /// Map a fault raised after `begin` to the error reported for `step`.
    /// Every step fails as a protocol error of that step, except running out
    /// of memory for the descriptor buffer.
    pub fn into_error(self, step: OtaStep) -> Error {
        match (self.kind, step) {
            (FaultKind::NoMemory, OtaStep::Descriptor) => Error::Resource(self.message),
            _ => Error::Protocol { step, raw: self.raw },
        }
    }

    /// Map a `begin` failure: only config and transport categories exist there.
    pub fn into_begin_error(self) -> Error {
        match self.kind {
            FaultKind::Config => Error::Config(self.message),
            FaultKind::NoMemory => Error::Resource(self.message),
            FaultKind::Transport | FaultKind::Protocol => Error::Transport {
                message: self.message,
                raw: self.raw,
            },
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} fault: {} (0x{:x})", self.kind, self.message, self.raw)
    }
}

/// Outcome of one `perform` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    InProgress,
    Complete,
}

pub trait OtaTransport {
    type Session: OtaSession;

    /// Open a secured session against `config.url`, authenticated by the
    /// trust anchor.
    fn begin(&mut self, config: &OtaConfig) -> Result<Self::Session, Fault>;
}

pub trait OtaSession {
    fn image_descriptor(&mut self) -> Result<AppDescriptor, Fault>;

    /// Receive and write the next chunk of the image.
    fn perform(&mut self) -> Result<Progress, Fault>;

    /// Cumulative image bytes read so far.
    fn image_len_read(&self) -> u32;

    fn is_complete_data_received(&self) -> bool;

    /// Validate and commit the written image. Irreversible.
    fn finish(self) -> Result<(), Fault>;

    /// Drop the session without committing.
    fn abort(self);
}
