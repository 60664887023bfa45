//! Lynx Common - Shared types, traits, and wire codec
//!
//! This crate provides the data model, error types, and JSON Lines codec
//! used across the Lynx discovery core: drivers, orchestrator, worker
//! subprocess, and privileged daemon all speak these types.

pub mod codec;
pub mod error;
pub mod services;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use codec::{decode_line, decode_record, encode_line, write_line};
pub use error::{
    CodecError, DriverError, DriverResult, IpcError, ProcessError, SetupError, SpecError,
};
pub use services::service_name;
pub use traits::{PrivilegeBroker, PrivilegedExecutor, RecordSink};
pub use types::{
    AddressBlock, Completion, DiscoveryMethod, DriverStatus, DriverSummary, HostRecord, LogLevel,
    LogLine, MethodAvailability, MethodFailure, OperationState, PortRange, PrivilegeReport,
    PrivilegeState, ProgressRecord, ScanMode, ScanOptions, ScanRequest, ScanSummary,
    TargetSpecification, WorkerCommand, WorkerReport, ALLOW_LARGE_ENV, DEFAULT_MDNS_SERVICES,
    MAX_HOSTS, MAX_HOSTS_LARGE, MAX_RETRIES,
};
pub use types::host_limit;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
