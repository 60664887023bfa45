//! Orchestrator - runs discovery methods as one operation
//!
//! Fans a [`ScanRequest`](lynx_common::ScanRequest) out across the selected
//! drivers, gates the privileged ones on the platform broker, merges every
//! host report into one record per address and streams the changes.

mod handle;
mod host_table;
mod hostnames;
mod orchestrator;
mod progress;
mod registry;

pub use handle::ScanHandle;
pub use host_table::HostTable;
pub use hostnames::{resolve_names, DnsLookup, NameLookup, LOOKUP_TIMEOUT};
pub use orchestrator::{Orchestrator, DEFAULT_GRACE};
pub use progress::ScanTally;
pub use registry::OperationRegistry;
