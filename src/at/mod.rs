//! Line-framed AT-command transport (C2): a port that writes commands,
//! collects lines until a final-response token, and dispatches unsolicited
//! lines to a regex-keyed handler registry.

pub mod parser;
pub mod port;
pub mod unsolicited;

use std::time::Duration;

use thiserror::Error;

pub use port::{AtPort, FinalResponse};
pub use unsolicited::UnsolicitedRegistry;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AtError {
    #[error("+CME ERROR: {0}")]
    EquipmentError(i32),
    #[error("+CMS ERROR: {0}")]
    SmsError(i32),
    #[error("command timed out")]
    Timeout,
    #[error("no carrier")]
    NoCarrier,
    #[error("line busy")]
    Busy,
    #[error("no answer")]
    NoAnswer,
    #[error("port is closed")]
    PortClosed,
    #[error("init command failed: {0}")]
    InitFailed(String),
}

/// A single AT command and its expected handling.
#[derive(Debug, Clone)]
pub struct AtCommand {
    pub text: String,
    pub timeout: Duration,
    pub cacheable: bool,
}

impl AtCommand {
    pub fn new(text: impl Into<String>, timeout: Duration) -> Self {
        Self { text: text.into(), timeout, cacheable: false }
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }
}

/// A tolerated init-sequence error: a command whose non-OK final response is
/// ignored when opening the port.
#[derive(Debug, Clone)]
pub struct InitStep {
    pub command: AtCommand,
    pub tolerate_errors: bool,
}
