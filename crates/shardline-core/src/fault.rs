//! Severity-classified faults
//!
//! Anything that goes wrong after a consumer has started (a failed fetch, a
//! save that could not be written, a lease that moved to another worker) is
//! reported as a [`Fault`] instead of an error return. Faults are plain data:
//! they travel through the same channels as records and end up at the
//! consumer's fault handler, which decides whether to log, alert or abort.
//!
//! ## Severities
//!
//! | severity   | tag     | meaning                                           |
//! |------------|---------|---------------------------------------------------|
//! | `Critical` | `crit`  | a poller gave up; its partition is no longer read |
//! | `Error`    | `error` | lost ownership or a broken invariant              |
//! | `Warning`  | `warn`  | transient failure, retried automatically          |
//! | `Info`     | `info`  | lifecycle notices (start position, exhaustion)    |
//! | `Debug`    | `debug` | diagnostic detail                                 |

use std::fmt;

/// Fault severity, ordered by decreasing urgency (`Critical` sorts first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
}

impl Severity {
    /// Short tag used in log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "crit",
            Severity::Error => "error",
            Severity::Warning => "warn",
            Severity::Info => "info",
            Severity::Debug => "debug",
        }
    }

    /// Whether the default fault handler terminates the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Severity::Critical | Severity::Error)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fault raised by a poller or checkpointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub severity: Severity,
    pub message: String,
    /// Partition the fault concerns, if any
    pub partition_id: Option<String>,
}

impl Fault {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            partition_id: None,
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self::new(Severity::Debug, message)
    }

    pub fn with_partition(mut self, partition_id: impl Into<String>) -> Self {
        self.partition_id = Some(partition_id.into());
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.severity.is_fatal()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.partition_id {
            Some(id) => write!(f, "[{}] {}: {}", self.severity, id, self.message),
            None => write!(f, "[{}] {}", self.severity, self.message),
        }
    }
}

impl std::error::Error for Fault {}
