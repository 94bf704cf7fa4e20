//! Socket address providers consumed by the supervisor.

use crate::error::ClientError;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Provider failures steer the supervisor: a transient error keeps the
/// reconnect loop running with an incremented retry number, a fatal one
/// closes the client permanently.
#[derive(Debug, Clone)]
pub enum ProviderError {
    Transient(ClientError),
    Fatal(ClientError),
}

/// Hands out the address for the next connection attempt.
pub trait AddrProvider: Send + Sync + 'static {
    fn get(&self, retry: usize, last_error: Option<&ClientError>)
        -> Result<SocketAddr, ProviderError>;
}

pub(crate) fn parse_addr(addr: &str) -> Result<SocketAddr, ClientError> {
    if let Ok(parsed) = addr.parse::<SocketAddr>() {
        return Ok(parsed);
    }
    // fall back to resolving a host name, first result wins
    match addr.to_socket_addrs() {
        Ok(mut resolved) => resolved
            .next()
            .ok_or_else(|| ClientError::Usage(format!("address '{}' resolves to nothing", addr))),
        Err(_) => Err(ClientError::Usage(format!("invalid address '{}'", addr))),
    }
}

/// One fixed peer; gives up after `retry_limit` failed attempts.
pub struct SingleAddrProvider {
    addr: SocketAddr,
    retry_limit: usize,
}

impl SingleAddrProvider {
    pub fn new(addr: &str, retry_limit: usize) -> Result<Self, ClientError> {
        Ok(Self { addr: parse_addr(addr)?, retry_limit })
    }
}

impl AddrProvider for SingleAddrProvider {
    fn get(
        &self, retry: usize, last_error: Option<&ClientError>,
    ) -> Result<SocketAddr, ProviderError> {
        if retry > self.retry_limit {
            let cause = last_error
                .cloned()
                .unwrap_or_else(|| ClientError::comm("no connection attempt succeeded"));
            return Err(ProviderError::Fatal(ClientError::comm(format!(
                "gave up connecting to {} after {} attempts: {}",
                self.addr, retry, cause
            ))));
        }
        Ok(self.addr)
    }
}

/// Cycles through a refreshable member list; the cluster discovery task
/// replaces the set while the supervisor keeps consuming it.
pub struct RoundRobinProvider {
    addrs: RwLock<Vec<SocketAddr>>,
    pos: AtomicUsize,
    retry_limit: usize,
}

impl RoundRobinProvider {
    pub fn new(addrs: &[String], retry_limit: usize) -> Result<Self, ClientError> {
        if addrs.is_empty() {
            return Err(ClientError::Usage("address list is empty".to_string()));
        }
        let parsed: Vec<SocketAddr> =
            addrs.iter().map(|a| parse_addr(a)).collect::<Result<_, _>>()?;
        Ok(Self { addrs: RwLock::new(parsed), pos: AtomicUsize::new(0), retry_limit })
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.addrs.read().unwrap().clone()
    }

    /// Swaps in a fresh member set. Unparsable entries fail the whole
    /// refresh so a bad discovery result cannot empty the pool.
    pub fn refresh_addresses(&self, addrs: &[String]) -> Result<(), ClientError> {
        if addrs.is_empty() {
            return Err(ClientError::Usage("refusing to refresh to an empty address list".into()));
        }
        let parsed: Vec<SocketAddr> =
            addrs.iter().map(|a| parse_addr(a)).collect::<Result<_, _>>()?;
        *self.addrs.write().unwrap() = parsed;
        Ok(())
    }
}

impl AddrProvider for RoundRobinProvider {
    fn get(
        &self, retry: usize, last_error: Option<&ClientError>,
    ) -> Result<SocketAddr, ProviderError> {
        let addrs = self.addrs.read().unwrap();
        // every member gets retry_limit attempts before the pool gives up
        if retry > self.retry_limit.saturating_mul(addrs.len().max(1)) {
            let cause = last_error
                .cloned()
                .unwrap_or_else(|| ClientError::comm("no connection attempt succeeded"));
            return Err(ProviderError::Fatal(ClientError::comm(format!(
                "gave up connecting after {} attempts: {}",
                retry, cause
            ))));
        }
        let i = self.pos.fetch_add(1, Ordering::AcqRel) % addrs.len();
        Ok(addrs[i])
    }
}
