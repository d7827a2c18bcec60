//! Fault routing
//!
//! Every fault raised after `begin()` ends up at exactly one [`FaultHandler`].
//! Closures work directly:
//!
//! ```rust
//! use shardline_consumer::FaultHandler;
//! use shardline_core::Fault;
//!
//! let handler = |fault: &Fault| eprintln!("{fault}");
//! handler.handle(&Fault::info("starting from earliest"));
//! ```

use shardline_core::{Fault, Severity};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Channel the checkpointer reports its faults on.
pub type FaultSender = mpsc::UnboundedSender<Fault>;

pub trait FaultHandler: Send + Sync {
    fn handle(&self, fault: &Fault);
}

impl<F> FaultHandler for F
where
    F: Fn(&Fault) + Send + Sync,
{
    fn handle(&self, fault: &Fault) {
        self(fault)
    }
}

/// Log a fault at the level matching its severity.
pub fn log_fault(fault: &Fault) {
    let partition = fault.partition_id.as_deref().unwrap_or("-");
    match fault.severity {
        Severity::Critical | Severity::Error => error!(
            severity = %fault.severity,
            partition_id = %partition,
            "{}",
            fault.message
        ),
        Severity::Warning => warn!(partition_id = %partition, "{}", fault.message),
        Severity::Info => info!(partition_id = %partition, "{}", fault.message),
        Severity::Debug => debug!(partition_id = %partition, "{}", fault.message),
    }
}

/// Logs every fault and aborts the process on `Critical` or `Error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFaultHandler;

impl FaultHandler for DefaultFaultHandler {
    fn handle(&self, fault: &Fault) {
        log_fault(fault);
        if fault.is_fatal() {
            std::process::abort();
        }
    }
}

/// Logs every fault and never terminates.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFaultHandler;

impl FaultHandler for LoggingFaultHandler {
    fn handle(&self, fault: &Fault) {
        log_fault(fault);
    }
}
