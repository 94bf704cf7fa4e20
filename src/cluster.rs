//! Fault-tolerant overlay: transient failures are parked and re-dispatched
//! once the supervisor reaches another member, and a periodic discovery task
//! keeps the member list fresh.

use crate::client::{ClientCore, ClientHandle, ClientHooks};
use crate::config::ClusterConfig;
use crate::error::ClientError;
use crate::provider::RoundRobinProvider;
use crate::request::PendingRequest;
use crate::schema::SchemaMeta;
use crate::state;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;

/// Supplies the current member set, typically by calling a stored function
/// on the active peer.
pub trait ServiceDiscoverer: Send + Sync + 'static {
    fn instances(&self) -> BoxFuture<'_, Result<Vec<String>, ClientError>>;
}

/// Hooks of the cluster client: transient errors land in the retry map
/// instead of the caller's future, registration takes the discovery read
/// lock so an address swap cannot race dispatch, and reaching the alive
/// state re-dispatches everything parked.
pub struct ClusterHooks {
    retries: StdMutex<FxHashMap<u64, PendingRequest>>,
    pub(crate) discovery: RwLock<()>,
}

impl ClusterHooks {
    fn new() -> Self {
        Self { retries: StdMutex::new(FxHashMap::default()), discovery: RwLock::new(()) }
    }

    fn drain_retries(&self) -> Vec<PendingRequest> {
        let mut retries = self.retries.lock().unwrap();
        retries.drain().map(|(_, rec)| rec).collect()
    }
}

impl ClientHooks for ClusterHooks {
    fn fail(&self, core: &ClientCore<Self>, rec: PendingRequest, err: ClientError) {
        if core.state.is_set(state::CLOSED) || !err.is_transient() {
            rec.fail(err);
            return;
        }
        debug!("parking {:?} for retry: {}", rec, err);
        self.retries.lock().unwrap().insert(rec.sync, rec);
    }

    fn on_alive(&self, core: &Arc<ClientCore<Self>>) {
        let parked = self.drain_retries();
        if parked.is_empty() {
            return;
        }
        info!("reconnected, re-dispatching {} parked requests", parked.len());
        let version = core.schema.version();
        for rec in parked {
            if rec.is_done() {
                continue;
            }
            let core = core.clone();
            tokio::spawn(async move {
                core.register_via_hooks(rec, version).await;
            });
        }
    }

    fn on_closed(&self, _core: &ClientCore<Self>, err: &ClientError) {
        for rec in self.drain_retries() {
            rec.fail(err.clone());
        }
    }

    fn register<'a>(
        &'a self, core: &'a ClientCore<Self>, rec: PendingRequest, schema_id: u64,
    ) -> impl Future<Output = ()> + Send + 'a {
        async move {
            let _discovery_guard = self.discovery.read().await;
            core.register_operation(rec, schema_id).await;
        }
    }
}

/// A client over a set of interchangeable members. Exposes the whole
/// single-peer surface through deref.
pub struct ClusterClient {
    handle: ClientHandle<ClusterHooks>,
}

impl ClusterClient {
    pub async fn new(
        config: ClusterConfig, addrs: &[String], schema: Arc<dyn SchemaMeta>,
        discoverer: Option<Box<dyn ServiceDiscoverer>>,
    ) -> Result<Self, ClientError> {
        let provider = Arc::new(RoundRobinProvider::new(addrs, config.client.retry_count)?);
        let handle = ClientHandle::with_hooks(
            provider.clone(),
            schema,
            config.client.clone(),
            ClusterHooks::new(),
        )
        .await?;
        if let Some(discoverer) = discoverer {
            tokio::spawn(discovery_loop(
                handle.core().clone(),
                provider,
                discoverer,
                config.discovery_delay,
            ));
        }
        Ok(Self { handle })
    }
}

impl Deref for ClusterClient {
    type Target = ClientHandle<ClusterHooks>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

async fn discovery_loop(
    core: Arc<ClientCore<ClusterHooks>>, provider: Arc<RoundRobinProvider>,
    discoverer: Box<dyn ServiceDiscoverer>, delay: Duration,
) {
    let mut last_members: Option<Vec<String>> = None;
    loop {
        if core.state.is_set(state::CLOSED) {
            return;
        }
        match discoverer.instances().await {
            Ok(mut members) if !members.is_empty() => {
                members.sort();
                if last_members.as_ref() != Some(&members) {
                    match provider.refresh_addresses(&members) {
                        Ok(()) => {
                            last_members = Some(members);
                            renew_connection_if_required(&core, provider.addresses()).await;
                        }
                        Err(e) => warn!("discovery produced unusable addresses: {}", e),
                    }
                }
            }
            Ok(_) => debug!("discovery returned an empty member set, keeping the old one"),
            Err(e) => debug!("discovery attempt failed: {}", e),
        }
        tokio::time::sleep(delay).await;
    }
}

/// If the active peer left the member set and nothing is in flight, stop
/// I/O under the discovery write lock so the supervisor moves over. A
/// contended lock means dispatch is running; leave it for the next tick.
async fn renew_connection_if_required(
    core: &Arc<ClientCore<ClusterHooks>>, members: Vec<SocketAddr>,
) {
    if core.pending_responses() > 0 || !core.alive() {
        return;
    }
    let Some(current) = core.peer() else { return };
    if members.contains(&current) {
        return;
    }
    let Ok(_discovery_guard) = core.hooks.discovery.try_write() else { return };
    if core.pending_responses() == 0 {
        info!("active peer {} left the cluster, switching", current);
        core.stop_io().await;
    }
}
