//! Terminal output for the shardline CLI

use colored::*;
use shardline_consumer::FaultHandler;
use shardline_core::{Fault, Severity};
use std::collections::HashMap;

/// Render a fault as a single `[tag] partition: message` line.
pub fn fault_line(fault: &Fault, colored: bool) -> String {
    let line = fault.to_string();
    if !colored {
        return line;
    }
    match fault.severity {
        Severity::Critical | Severity::Error => line.red().bold().to_string(),
        Severity::Warning => line.yellow().to_string(),
        Severity::Info => line.normal().to_string(),
        Severity::Debug => line.dimmed().to_string(),
    }
}

/// Sorted `partition  cursor` lines for a stored head map.
pub fn checkpoint_lines(heads: &HashMap<String, String>) -> Vec<String> {
    let width = heads.keys().map(String::len).max().unwrap_or(0);
    let mut entries: Vec<_> = heads.iter().collect();
    entries.sort();
    entries
        .into_iter()
        .map(|(partition, cursor)| format!("{partition:<width$}  {cursor}"))
        .collect()
}

/// Prints faults to stderr and aborts on `Critical` and `Error`.
pub struct TerminalFaultHandler {
    colored: bool,
}

impl TerminalFaultHandler {
    pub fn new(colored: bool) -> Self {
        Self { colored }
    }
}

impl FaultHandler for TerminalFaultHandler {
    fn handle(&self, fault: &Fault) {
        eprintln!("{}", fault_line(fault, self.colored));
        if fault.is_fatal() {
            std::process::abort();
        }
    }
}
