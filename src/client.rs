//! The multiplexing engine: request dispatch, the reader/writer pair, the
//! schema reconciler and the reconnect supervisor.
//!
//! One client owns one socket. Concurrent callers dispatch through
//! [`ClientHandle::exec`] and get single-assignment futures back; responses
//! are correlated by sync-id and may complete in any order. Three long-lived
//! tasks run per client: the supervisor (rebuilds the socket after fatal
//! errors), the reader and the writer. A fourth task serializes schema
//! refresh jobs.

use crate::codec::{self, RawPacket};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::io::{self, WriteBuffers};
use crate::proto::*;
use crate::provider::{AddrProvider, ProviderError, SingleAddrProvider};
use crate::registry::Registry;
use crate::request::{OpFuture, Payload, PendingRequest, Request, Response, SqlRow};
use crate::resultset::{self, ResultSet};
use crate::schema::{SchemaMeta, StaticSchema};
use crate::state::{self, ConnState};
use bytes::BytesMut;
use crossfire::{MAsyncRx, MTx, mpmc};
use log::{debug, info, trace, warn};
use rmpv::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::timeout;

const SCHEMA_RETRY_DELAY: Duration = Duration::from_millis(300);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Customization seam for the cluster overlay. The base client fails a
/// request straight into its future; overrides may park transient failures
/// for retry, guard registration with their own locks, and react to the
/// connection coming alive.
pub trait ClientHooks: Send + Sync + Sized + 'static {
    fn fail(&self, _core: &ClientCore<Self>, rec: PendingRequest, err: ClientError) {
        rec.fail(err);
    }

    /// Called on the transition that reaches the alive state.
    fn on_alive(&self, _core: &Arc<ClientCore<Self>>) {}

    /// Called once when the client is closed for good.
    fn on_closed(&self, _core: &ClientCore<Self>, _err: &ClientError) {}

    fn register<'a>(
        &'a self, core: &'a ClientCore<Self>, rec: PendingRequest, schema_id: u64,
    ) -> impl Future<Output = ()> + Send + 'a {
        core.register_operation(rec, schema_id)
    }
}

/// Hooks of the plain single-peer client.
pub struct BaseHooks;

impl ClientHooks for BaseHooks {}

enum Work {
    RefreshSchema,
    Shutdown,
}

/// Engine state shared by the caller-facing handle and the background tasks.
pub struct ClientCore<H: ClientHooks> {
    pub(crate) config: ClientConfig,
    pub(crate) hooks: H,
    provider: Arc<dyn AddrProvider>,
    pub(crate) schema: Arc<dyn SchemaMeta>,
    pub(crate) state: ConnState,
    schema_lock: RwLock<()>,
    registry: StdMutex<Registry>,
    sync_seq: AtomicU64,
    pending: AtomicU64,
    /// Sticky cause of the current failure episode; cleared on reconnect.
    fatal: StdMutex<Option<ClientError>>,
    buffers: WriteBuffers,
    write_half: Mutex<Option<OwnedWriteHalf>>,
    io_stop: Notify,
    io_stopped: AtomicBool,
    work_tx: MTx<Work>,
    server_version: StdMutex<Option<String>>,
    peer_addr: StdMutex<Option<SocketAddr>>,
}

impl<H: ClientHooks> ClientCore<H> {
    #[inline]
    pub(crate) fn fatal(&self) -> Option<ClientError> {
        self.fatal.lock().unwrap().clone()
    }

    #[inline]
    pub(crate) fn pending_responses(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn peer(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock().unwrap()
    }

    #[inline]
    pub(crate) fn alive(&self) -> bool {
        self.state.is_set(state::ALIVE) && self.fatal().is_none()
    }

    /// Dispatch: assign a sync-id under the schema read lock, pick the
    /// delayed-queue branch or register right away.
    pub(crate) async fn dispatch(&self, request: Request) -> OpFuture {
        let _schema_guard = self.schema_lock.read().await;
        let sync = self.sync_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let (rec, fut) = PendingRequest::begin(request, sync, &self.config);
        if self.state.is_set(state::CLOSED) {
            rec.fail(ClientError::Closed);
            return fut;
        }
        let schema_loaded =
            self.schema.is_initialized() && !self.state.is_set(state::SCHEMA_UPDATING);
        if !rec.is_serializable(self.schema.as_ref()) {
            // names the cache cannot resolve: park the request
            let dependent = rec.sync;
            self.registry.lock().unwrap().delay(rec);
            if schema_loaded {
                // the cache may merely be stale; probe the server instead of
                // refreshing the whole catalog eagerly
                let probe_sync = self.sync_seq.fetch_add(1, Ordering::AcqRel) + 1;
                let (mut probe, _probe_result) =
                    PendingRequest::begin(Request::ping(), probe_sync, &self.config);
                probe.sync_dependent = Some(dependent);
                let version = self.schema.version();
                self.hooks.register(self, probe, version).await;
            }
            return fut;
        }
        if !schema_loaded {
            self.registry.lock().unwrap().delay(rec);
            return fut;
        }
        let version = self.schema.version();
        self.hooks.register(self, rec, version).await;
        fut
    }

    /// Stamps the schema id, encodes and hands the bytes to the write path.
    /// The record is visible in the registry before the first byte leaves so
    /// a fast response always finds it. Hook implementations that wrap
    /// registration end up here.
    pub async fn register_operation(&self, mut rec: PendingRequest, schema_id: u64) {
        if let Some(cause) = self.fatal() {
            self.hooks.fail(self, rec, ClientError::comm(format!("connection is dead: {}", cause)));
            return;
        }
        rec.started_schema_id = schema_id;
        let body = match rec.resolve_body(self.schema.as_ref()) {
            Ok(body) => body,
            Err(e) => {
                self.hooks.fail(self, rec, e.into());
                return;
            }
        };
        let frame = match codec::encode_request(rec.code, rec.sync, schema_id, &body) {
            Ok(frame) => frame,
            Err(e) => {
                self.hooks.fail(self, rec, e);
                return;
            }
        };
        let sync = rec.sync;
        self.registry.lock().unwrap().insert_inflight(rec);
        if self.fatal().is_some() {
            // lost the race with a dying connection
            if let Some(rec) = self.registry.lock().unwrap().remove_inflight(sync) {
                self.hooks.fail(self, rec, ClientError::comm("connection is dead"));
            }
            return;
        }
        if let Err(e) = self.write_packet(&frame).await {
            if let Some(rec) = self.registry.lock().unwrap().remove_inflight(sync) {
                self.hooks.fail(self, rec, e);
            }
        }
    }

    async fn write_packet(&self, frame: &[u8]) -> Result<(), ClientError> {
        if io::use_direct(frame.len(), self.buffers.capacity(), self.config.direct_write_factor) {
            self.direct_write(frame).await?;
        } else {
            self.buffers.shared_write(frame, self.config.write_timeout).await?;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Large packets skip the shared buffer and go to the socket whole.
    async fn direct_write(&self, frame: &[u8]) -> Result<(), ClientError> {
        let mut half = timeout(self.config.write_timeout, self.write_half.lock())
            .await
            .map_err(|_| ClientError::TimedWrite("socket lock"))?;
        let writer = half.as_mut().ok_or_else(|| ClientError::comm("connection is down"))?;
        timeout(self.config.write_timeout, writer.write_all(frame))
            .await
            .map_err(|_| ClientError::TimedWrite("socket write"))??;
        Ok(())
    }

    async fn read_loop(&self, mut read_half: OwnedReadHalf) {
        let mut scratch = BytesMut::with_capacity(512);
        loop {
            let stop = self.io_stop.notified();
            tokio::pin!(stop);
            stop.as_mut().enable();
            if self.io_stopped.load(Ordering::Acquire) {
                return;
            }
            tokio::select! {
                r = codec::read_frame(&mut read_half, &mut scratch) => match r {
                    Ok(packet) => self.on_packet(packet).await,
                    Err(e) => {
                        self.die("cannot read response", Some(e)).await;
                        return;
                    }
                },
                _ = stop => return,
            }
        }
    }

    async fn write_loop(&self) {
        let mut writer_buf: Vec<u8> = Vec::with_capacity(self.buffers.capacity());
        loop {
            if !self.buffers.wait_take(&mut writer_buf, &self.io_stop, &self.io_stopped).await {
                // graceful stop: nobody else may be holding the half
                *self.write_half.lock().await = None;
                return;
            }
            {
                let mut half = self.write_half.lock().await;
                let Some(writer) = half.as_mut() else { return };
                let drained = match timeout(
                    self.config.write_timeout,
                    writer.write_all(&writer_buf),
                )
                .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(ClientError::from(e)),
                    Err(_) => Err(ClientError::TimedWrite("socket write")),
                };
                if let Err(e) = drained {
                    *half = None;
                    drop(half);
                    self.die("cannot write buffered packets", Some(e)).await;
                    return;
                }
            }
            writer_buf.clear();
        }
    }

    async fn on_packet(&self, packet: RawPacket) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        let rec = self.registry.lock().unwrap().remove_inflight(packet.sync);
        match rec {
            Some(rec) => self.complete(packet, rec).await,
            None => trace!("discarding response for unknown sync {}", packet.sync),
        }
    }

    async fn complete(&self, packet: RawPacket, rec: PendingRequest) {
        if rec.shared.is_done() {
            // expired while in flight; the late response is dropped
            return;
        }
        let started_schema_id = rec.started_schema_id;
        if packet.code == CODE_SUCCESS {
            if let Some(dependent) = rec.sync_dependent {
                self.resolve_probe(dependent).await;
                rec.shared.complete(Ok(Response {
                    schema_id: packet.schema_id,
                    payload: Payload::Data(Value::Nil),
                }));
            } else if rec.code == Code::Execute {
                match resultset::decode_sql_body(&packet) {
                    Ok(payload) => {
                        rec.shared
                            .complete(Ok(Response { schema_id: packet.schema_id, payload }));
                    }
                    Err(e) => self.hooks.fail(self, rec, e),
                }
            } else {
                let data = packet.field(KEY_DATA).cloned().unwrap_or(Value::Nil);
                rec.shared.complete(Ok(Response {
                    schema_id: packet.schema_id,
                    payload: Payload::Data(data),
                }));
            }
        } else if packet.code == CODE_WRONG_SCHEMA_VERSION {
            if packet.schema_id > self.schema.version() {
                // server is ahead of the cache: park until the refresh runs
                self.registry.lock().unwrap().delay(rec);
            } else {
                let version = self.schema.version();
                self.hooks.register(self, rec, version).await;
            }
        } else {
            let code = (packet.code & CODE_ERROR_MASK) as u32;
            let err = ClientError::Server { code, message: packet.error_message() };
            self.hooks.fail(self, rec, err);
        }
        if started_schema_id == 0 {
            return;
        }
        // a DDL bump shows up as a higher schema id on any response
        if packet.schema_id > self.schema.version() {
            self.update_schema().await;
        }
    }

    /// A probe came back clean: the cache is current. Re-evaluate the
    /// dependent; names that still miss are genuinely unknown.
    async fn resolve_probe(&self, dependent: u64) {
        let rec = self.registry.lock().unwrap().take_delayed(dependent);
        let Some(rec) = rec else { return };
        if rec.shared.is_done() {
            return;
        }
        match rec.resolve_body(self.schema.as_ref()) {
            // a concurrent refresh resolved the names under us
            Ok(_) => {
                let version = self.schema.version();
                self.hooks.register(self, rec, version).await;
            }
            Err(e) => self.hooks.fail(self, rec, e.into()),
        }
    }

    /// One-shot schema refresh trigger, guarded under the schema write lock.
    pub(crate) async fn update_schema(&self) {
        let _write_guard = self.schema_lock.write().await;
        if self.state.acquire(state::SCHEMA_UPDATING).ok {
            let _ = self.work_tx.send(Work::RefreshSchema);
        }
    }

    async fn run_schema_refresh(&self) {
        if let Err(e) = self.schema.refresh().await {
            warn!("schema refresh failed: {}", e);
            if self.state.is_set(state::CLOSED) {
                self.state.release(state::SCHEMA_UPDATING);
                return;
            }
            let tx = self.work_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(SCHEMA_RETRY_DELAY).await;
                let _ = tx.send(Work::RefreshSchema);
            });
            return;
        }
        let _write_guard = self.schema_lock.write().await;
        let version = self.schema.version();
        let delayed = { self.registry.lock().unwrap().drain_delayed() };
        for rec in delayed {
            if !rec.shared.is_done() {
                self.hooks.register(self, rec, version).await;
            }
        }
        self.state.release(state::SCHEMA_UPDATING);
    }

    pub(crate) async fn die(&self, message: &str, cause: Option<ClientError>) {
        let error = match cause {
            Some(c) => ClientError::comm(format!("{}: {}", message, c)),
            None => ClientError::comm(message.to_string()),
        };
        self.die_with(error).await;
    }

    /// Idempotent connection teardown: record the sticky cause, fail every
    /// in-flight and delayed request with it, wake blocked producers and
    /// stop both I/O tasks. A second death in the same episode keeps the
    /// first cause.
    async fn die_with(&self, error: ClientError) {
        let error = {
            let mut fatal = self.fatal.lock().unwrap();
            match fatal.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    *fatal = Some(error.clone());
                    error
                }
            }
        };
        debug!("connection died: {}", error);
        let drained = { self.registry.lock().unwrap().drain_all() };
        for rec in drained {
            self.hooks.fail(self, rec, error.clone());
        }
        self.pending.store(0, Ordering::Release);
        self.buffers.clear().await;
        self.stop_io().await;
    }

    /// Stops reader and writer without declaring the connection dead; the
    /// supervisor then rebuilds the socket. Used by `die` and by the cluster
    /// overlay for a graceful peer switch. The write half is dropped with a
    /// try-lock: if the writer task holds it, the writer drops it on its own
    /// bounded exit instead.
    pub(crate) async fn stop_io(&self) {
        self.io_stopped.store(true, Ordering::Release);
        self.io_stop.notify_waiters();
        if let Ok(mut half) = self.write_half.try_lock() {
            *half = None;
        }
    }

    pub(crate) async fn close_with(&self, error: ClientError) {
        if !self.state.close() {
            return;
        }
        info!("closing client: {}", error);
        self.hooks.on_closed(self, &error);
        let _ = self.work_tx.send(Work::Shutdown);
        self.die_with(error).await;
    }

    pub(crate) async fn register_via_hooks(&self, rec: PendingRequest, schema_id: u64) {
        self.hooks.register(self, rec, schema_id).await;
    }
}

struct IoGuard<H: ClientHooks> {
    core: Arc<ClientCore<H>>,
    mask: u32,
    left: Arc<AtomicUsize>,
}

impl<H: ClientHooks> Drop for IoGuard<H> {
    fn drop(&mut self) {
        self.core.state.release(self.mask | state::SCHEMA_UPDATING);
        // only the last of the two I/O tasks to leave may wake the supervisor
        if self.left.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.core.state.try_signal_reconnect();
        }
    }
}

fn spawn_io<H: ClientHooks>(core: &Arc<ClientCore<H>>, read_half: OwnedReadHalf) {
    let left = Arc::new(AtomicUsize::new(2));
    {
        let core = core.clone();
        let left = left.clone();
        tokio::spawn(async move {
            let acquired = core.state.acquire(state::READING);
            if acquired.ok {
                if acquired.became_alive {
                    core.hooks.on_alive(&core);
                }
                let _guard = IoGuard { core: core.clone(), mask: state::READING, left };
                core.read_loop(read_half).await;
            }
        });
    }
    {
        let core = core.clone();
        tokio::spawn(async move {
            let acquired = core.state.acquire(state::WRITING);
            if acquired.ok {
                if acquired.became_alive {
                    core.hooks.on_alive(&core);
                }
                let _guard = IoGuard { core: core.clone(), mask: state::WRITING, left };
                core.write_loop().await;
            }
        });
    }
}

/// Greeting, optional AUTH, then hand the halves to the I/O tasks and kick
/// off the initial catalog refresh. Any failure reports as a communication
/// error and abandons the candidate socket.
async fn try_connect<H: ClientHooks>(
    core: &Arc<ClientCore<H>>, addr: SocketAddr,
) -> Result<(), ClientError> {
    let stream = timeout(core.config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ClientError::comm(format!("connect to {} timed out", addr)))??;
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();
    let mut block = [0u8; GREETING_SIZE];
    read_half.read_exact(&mut block).await?;
    let greeting = Greeting::parse(&block)?;
    debug!("connected to {} ({})", addr, greeting.server_version);
    if let Some(username) = core.config.username.clone() {
        let password = core.config.password.clone().unwrap_or_default();
        let sync = core.sync_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let frame = codec::encode_auth(sync, &username, &password, &greeting.salt)?;
        write_half.write_all(&frame).await?;
        // authentication is synchronous on the channel, multiplexing starts
        // only after it
        let mut scratch = BytesMut::with_capacity(512);
        let reply = codec::read_frame(&mut read_half, &mut scratch).await?;
        if reply.code != CODE_SUCCESS {
            return Err(ClientError::comm(format!(
                "authentication failed: {}",
                reply.error_message()
            )));
        }
    }
    *core.server_version.lock().unwrap() = Some(greeting.server_version);
    *core.peer_addr.lock().unwrap() = Some(addr);
    core.buffers.clear().await;
    *core.fatal.lock().unwrap() = None;
    *core.write_half.lock().await = Some(write_half);
    core.io_stopped.store(false, Ordering::Release);
    core.state.release(state::RECONNECT);
    spawn_io(core, read_half);
    core.update_schema().await;
    Ok(())
}

/// The supervisor: builds a socket, then sleeps until the state machine
/// signals the next failure episode.
async fn reconnector<H: ClientHooks>(core: Arc<ClientCore<H>>) {
    loop {
        if core.state.is_set(state::CLOSED) {
            return;
        }
        let mut retry = 0usize;
        let mut last_error = core.fatal();
        loop {
            if core.state.is_set(state::CLOSED) {
                return;
            }
            let addr = match core.provider.get(retry, last_error.as_ref()) {
                Ok(addr) => addr,
                Err(ProviderError::Transient(e)) => {
                    retry += 1;
                    last_error = Some(e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
                Err(ProviderError::Fatal(e)) => {
                    warn!("giving up on reconnecting: {}", e);
                    core.close_with(e).await;
                    return;
                }
            };
            match try_connect(&core, addr).await {
                Ok(()) => break,
                Err(e) => {
                    debug!("connect attempt {} to {} failed: {}", retry, addr, e);
                    retry += 1;
                    last_error = Some(e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
        let seen = core.state.await_reconnect().await;
        if seen & state::CLOSED != 0 {
            return;
        }
    }
}

async fn work_loop<H: ClientHooks>(core: Arc<ClientCore<H>>, rx: MAsyncRx<Work>) {
    while let Ok(job) = rx.recv().await {
        match job {
            Work::Shutdown => return,
            Work::RefreshSchema => core.run_schema_refresh().await,
        }
    }
}

/// The caller-facing handle; cheap to clone. Dropping it does not close the
/// client, call [`close`](ClientHandle::close).
pub struct ClientHandle<H: ClientHooks> {
    core: Arc<ClientCore<H>>,
}

impl<H: ClientHooks> Clone for ClientHandle<H> {
    fn clone(&self) -> Self {
        Self { core: self.core.clone() }
    }
}

/// The single-peer client.
pub type Client = ClientHandle<BaseHooks>;

impl Client {
    /// Connects to one peer with a fresh in-memory schema cache.
    pub async fn connect(addr: &str, config: ClientConfig) -> Result<Client, ClientError> {
        let schema = Arc::new(StaticSchema::new());
        Self::connect_with_schema(addr, schema, config).await
    }

    pub async fn connect_with_schema(
        addr: &str, schema: Arc<dyn SchemaMeta>, config: ClientConfig,
    ) -> Result<Client, ClientError> {
        let provider = Arc::new(SingleAddrProvider::new(addr, config.retry_count)?);
        Self::new(provider, schema, config).await
    }

    pub async fn new(
        provider: Arc<dyn AddrProvider>, schema: Arc<dyn SchemaMeta>, config: ClientConfig,
    ) -> Result<Client, ClientError> {
        ClientHandle::with_hooks(provider, schema, config, BaseHooks).await
    }
}

impl<H: ClientHooks> ClientHandle<H> {
    /// Builds a client around a custom hook set; the supervisor and work
    /// executor start here and the call returns once the first connection is
    /// alive or `init_timeout` passes.
    pub async fn with_hooks(
        provider: Arc<dyn AddrProvider>, schema: Arc<dyn SchemaMeta>, config: ClientConfig,
        hooks: H,
    ) -> Result<Self, ClientError> {
        if !(config.direct_write_factor > 0.0 && config.direct_write_factor <= 1.0) {
            return Err(ClientError::Usage(format!(
                "direct_write_factor must be in (0, 1], got {}",
                config.direct_write_factor
            )));
        }
        if config.shared_buffer_size == 0 {
            return Err(ClientError::Usage("shared_buffer_size must be positive".into()));
        }
        let (work_tx, work_rx) = mpmc::unbounded_async::<Work>();
        let core = Arc::new(ClientCore {
            buffers: WriteBuffers::new(config.shared_buffer_size),
            registry: StdMutex::new(Registry::with_capacity(config.predicted_futures)),
            config,
            hooks,
            provider,
            schema,
            state: ConnState::new(state::RECONNECT),
            schema_lock: RwLock::new(()),
            sync_seq: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            fatal: StdMutex::new(Some(ClientError::comm(
                "not connected, initializing connection",
            ))),
            write_half: Mutex::new(None),
            io_stop: Notify::new(),
            io_stopped: AtomicBool::new(false),
            work_tx,
            server_version: StdMutex::new(None),
            peer_addr: StdMutex::new(None),
        });
        tokio::spawn(work_loop(core.clone(), work_rx));
        tokio::spawn(reconnector(core.clone()));
        let handle = Self { core };
        let init_timeout = handle.core.config.init_timeout;
        if !handle.wait_alive_timeout(init_timeout).await {
            let e = ClientError::comm(format!(
                "{:?} exceeded while waiting for client initialization",
                init_timeout
            ));
            handle.core.close_with(e.clone()).await;
            return Err(e);
        }
        Ok(handle)
    }

    #[inline]
    pub(crate) fn core(&self) -> &Arc<ClientCore<H>> {
        &self.core
    }

    /// Dispatches a request and returns its future. Dispatch failures fail
    /// the future, never this call.
    pub async fn exec(&self, request: Request) -> OpFuture {
        self.core.dispatch(request).await
    }

    /// Fire-and-forget dispatch: drops the future and hands back the
    /// assigned sync-id. Refused while the connection is down.
    pub async fn exec_detached(&self, request: Request) -> Result<u64, ClientError> {
        if let Some(cause) = self.core.fatal() {
            return Err(cause);
        }
        let fut = self.core.dispatch(request).await;
        Ok(fut.sync_id())
    }

    /// Dispatches and materializes the rows, applying the single-result-row
    /// shape for EVAL/CALL.
    pub async fn execute_request(&self, request: Request) -> Result<ResultSet, ClientError> {
        let code = request.code;
        let response = self.core.dispatch(request).await.resolve().await?;
        match response.payload {
            Payload::Data(data) => ResultSet::new(data, code.is_single_result_row()),
            _ => Err(ClientError::Usage("statement produced an SQL result".into())),
        }
    }

    pub async fn sql_update(&self, sql: &str, bind: Vec<Value>) -> Result<u64, ClientError> {
        let response = self.core.dispatch(Request::execute(sql, bind)).await.resolve().await?;
        match response.payload {
            Payload::RowCount(n) => Ok(n),
            _ => Err(ClientError::Usage("statement did not return a row count".into())),
        }
    }

    pub async fn sql_query(&self, sql: &str, bind: Vec<Value>) -> Result<Vec<SqlRow>, ClientError> {
        let response = self.core.dispatch(Request::execute(sql, bind)).await.resolve().await?;
        match response.payload {
            Payload::SqlRows(rows) => Ok(rows),
            _ => Err(ClientError::Usage("statement did not return rows".into())),
        }
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.core.dispatch(Request::ping()).await.resolve().await.map(|_| ())
    }

    pub async fn close(&self) {
        self.core.close_with(ClientError::comm("connection is closed")).await;
        self.core.state.await_state(state::CLOSED).await;
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.core.alive()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.core.state.is_set(state::CLOSED)
    }

    /// Blocks until the connection reaches the alive state.
    pub async fn wait_alive(&self) -> Result<(), ClientError> {
        let mut rx = self.core.state.subscribe();
        loop {
            {
                let s = *rx.borrow_and_update();
                if s & state::CLOSED != 0 {
                    return Err(ClientError::Closed);
                }
                if s & state::ALIVE == state::ALIVE && self.core.fatal().is_none() {
                    return Ok(());
                }
            }
            if rx.changed().await.is_err() {
                return Err(ClientError::Closed);
            }
        }
    }

    pub async fn wait_alive_timeout(&self, dur: Duration) -> bool {
        matches!(timeout(dur, self.wait_alive()).await, Ok(Ok(())))
    }

    pub fn server_version(&self) -> Option<String> {
        self.core.server_version.lock().unwrap().clone()
    }

    /// Requests written but not yet answered.
    pub fn pending_responses(&self) -> u64 {
        self.core.pending_responses()
    }
}
