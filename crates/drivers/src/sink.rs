//! Event sink shared by all drivers

use lynx_common::{DiscoveryMethod, HostRecord, LogLevel, LogLine};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Immutable event emitted by a driver into the merge channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    Host(HostRecord),
    Log(LogLine),
}

/// Sending half of the merge channel, bound to one method.
///
/// Every host record passing through gets the method stamped on it. Cheap to
/// clone; clones share the distinct-host tally. Sending never blocks, so it is
/// safe to use from `spawn_blocking` capture loops.
#[derive(Debug, Clone)]
pub struct EventSink {
    method: DiscoveryMethod,
    tx: mpsc::UnboundedSender<DriverEvent>,
    seen: Arc<Mutex<HashSet<IpAddr>>>,
}

impl EventSink {
    pub fn new(method: DiscoveryMethod, tx: mpsc::UnboundedSender<DriverEvent>) -> Self {
        Self {
            method,
            tx,
            seen: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Same channel, rebound to `method` with a fresh tally.
    #[must_use]
    pub fn for_method(&self, method: DiscoveryMethod) -> Self {
        Self::new(method, self.tx.clone())
    }

    #[inline]
    pub fn method(&self) -> DiscoveryMethod {
        self.method
    }

    /// Emit a host. Returns false once the receiving side is gone.
    pub fn host(&self, record: HostRecord) -> bool {
        self.seen.lock().insert(record.address);
        self.tx
            .send(DriverEvent::Host(record.with_method(self.method)))
            .is_ok()
    }

    pub fn log<S: Into<String>>(&self, level: LogLevel, message: S) -> bool {
        let line = LogLine::new(level, message).with_method(self.method);
        self.tx.send(DriverEvent::Log(line)).is_ok()
    }

    pub fn info<S: Into<String>>(&self, message: S) -> bool {
        self.log(LogLevel::Info, message)
    }

    pub fn warn<S: Into<String>>(&self, message: S) -> bool {
        self.log(LogLevel::Warn, message)
    }

    /// Distinct addresses emitted so far.
    pub fn hosts_found(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn has_found(&self, address: &IpAddr) -> bool {
        self.seen.lock().contains(address)
    }
}
