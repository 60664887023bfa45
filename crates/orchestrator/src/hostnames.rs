//! Reverse DNS names for discovered hosts
//!
//! Runs after the drivers finish, over the hosts that still have no name.
//! Lookups share the operation's concurrency limit and each one is bounded
//! by [`LOOKUP_TIMEOUT`] or the per-target timeout, whichever is shorter.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use trust_dns_resolver::TokioAsyncResolver;

/// Upper bound for a single PTR lookup.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Address to name lookup.
#[async_trait]
pub trait NameLookup: Send + Sync {
    async fn reverse_lookup(&self, ip: IpAddr) -> Option<String>;
}

/// PTR lookups through the system resolver configuration.
pub struct DnsLookup {
    resolver: Option<TokioAsyncResolver>,
}

impl DnsLookup {
    pub fn from_system_conf() -> Self {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => Some(resolver),
            Err(e) => {
                debug!(error = %e, "no system DNS configuration; names stay empty");
                None
            }
        };
        Self { resolver }
    }
}

#[async_trait]
impl NameLookup for DnsLookup {
    async fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        let lookup = self.resolver.as_ref()?.reverse_lookup(ip).await.ok()?;
        lookup.iter().next().and_then(|name| clean_name(&name.to_string()))
    }
}

/// Drop the root label dot; empty names are no name.
fn clean_name(name: &str) -> Option<String> {
    let name = name.trim_end_matches('.');
    (!name.is_empty()).then(|| name.to_string())
}

/// Names for as many of `hosts` as answer before `cancel` fires.
pub async fn resolve_names(
    lookup: Arc<dyn NameLookup>,
    hosts: Vec<IpAddr>,
    timeout: Duration,
    concurrency: usize,
    cancel: &CancellationToken,
) -> HashMap<IpAddr, String> {
    let timeout = timeout.min(LOOKUP_TIMEOUT);
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for ip in hosts {
        let lookup = lookup.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            let name = tokio::time::timeout(timeout, lookup.reverse_lookup(ip))
                .await
                .ok()
                .flatten()?;
            Some((ip, name))
        });
    }

    let mut names = HashMap::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tasks.abort_all();
                break;
            }
            joined = tasks.join_next() => match joined {
                Some(Ok(Some((ip, name)))) => {
                    debug!(%ip, %name, "reverse name");
                    names.insert(ip, name);
                }
                Some(_) => {}
                None => break,
            },
        }
    }
    names
}
