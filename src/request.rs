//! Request records and their single-assignment result futures.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::proto::*;
use crate::schema::{SchemaError, SchemaMeta};
use crossfire::{MAsyncRx, MRx, MTx, mpmc};
use rmpv::Value;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// One argument cell of a request body: either immediately serializable or a
/// name lookup that cannot be encoded until the schema cache knows the name.
#[derive(Debug, Clone)]
pub enum ArgCell {
    Value(Value),
    SpaceName(String),
    IndexName { space: String, index: String },
}

impl ArgCell {
    pub fn resolve(&self, schema: &dyn SchemaMeta) -> Result<Value, SchemaError> {
        match self {
            ArgCell::Value(v) => Ok(v.clone()),
            ArgCell::SpaceName(space) => schema.resolve_space(space).map(Value::from),
            ArgCell::IndexName { space, index } => {
                schema.resolve_index(space, index).map(Value::from)
            }
        }
    }

    #[inline]
    fn is_ready(&self, schema: &dyn SchemaMeta) -> bool {
        match self {
            ArgCell::Value(_) => true,
            _ => self.resolve(schema).is_ok(),
        }
    }
}

/// A space referenced by id or by a name to be resolved against the schema
/// cache at dispatch time.
#[derive(Debug, Clone)]
pub enum SpaceRef {
    Id(u64),
    Name(String),
}

impl From<u64> for SpaceRef {
    fn from(id: u64) -> Self {
        SpaceRef::Id(id)
    }
}

impl From<&str> for SpaceRef {
    fn from(name: &str) -> Self {
        SpaceRef::Name(name.to_string())
    }
}

/// An index within a space. Referencing an index by name requires the space
/// to be referenced by name as well, because the catalog keys indexes under
/// the space name.
#[derive(Debug, Clone)]
pub enum IndexRef {
    Id(u64),
    Name(String),
}

impl From<u64> for IndexRef {
    fn from(id: u64) -> Self {
        IndexRef::Id(id)
    }
}

impl From<&str> for IndexRef {
    fn from(name: &str) -> Self {
        IndexRef::Name(name.to_string())
    }
}

fn space_cell(space: &SpaceRef) -> ArgCell {
    match space {
        SpaceRef::Id(id) => ArgCell::Value(Value::from(*id)),
        SpaceRef::Name(name) => ArgCell::SpaceName(name.clone()),
    }
}

fn index_cell(space: &SpaceRef, index: &IndexRef) -> ArgCell {
    match index {
        IndexRef::Id(id) => ArgCell::Value(Value::from(*id)),
        IndexRef::Name(name) => {
            let space = match space {
                SpaceRef::Name(s) => s.clone(),
                // resolution will report the missing space name
                SpaceRef::Id(_) => String::new(),
            };
            ArgCell::IndexName { space, index: name.clone() }
        }
    }
}

/// A logical call before dispatch: opcode plus the ordered body entries.
#[derive(Debug, Clone)]
pub struct Request {
    pub code: Code,
    pub body: Vec<(u64, ArgCell)>,
    /// Overrides the configured default deadline.
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(code: Code) -> Self {
        Self { code, body: Vec::new(), timeout: None }
    }

    pub fn arg(mut self, key: u64, cell: ArgCell) -> Self {
        self.body.push((key, cell));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn ping() -> Self {
        Self::new(Code::Ping)
    }

    pub fn select(
        space: impl Into<SpaceRef>, index: impl Into<IndexRef>, key: Value, limit: u64,
        offset: u64, iterator: u64,
    ) -> Self {
        let space = space.into();
        let index = index.into();
        Self::new(Code::Select)
            .arg(KEY_SPACE, space_cell(&space))
            .arg(KEY_INDEX, index_cell(&space, &index))
            .arg(KEY_ITERATOR, ArgCell::Value(Value::from(iterator)))
            .arg(KEY_OFFSET, ArgCell::Value(Value::from(offset)))
            .arg(KEY_LIMIT, ArgCell::Value(Value::from(limit)))
            .arg(KEY_KEY, ArgCell::Value(key))
    }

    pub fn insert(space: impl Into<SpaceRef>, tuple: Value) -> Self {
        let space = space.into();
        Self::new(Code::Insert)
            .arg(KEY_SPACE, space_cell(&space))
            .arg(KEY_TUPLE, ArgCell::Value(tuple))
    }

    pub fn replace(space: impl Into<SpaceRef>, tuple: Value) -> Self {
        let space = space.into();
        Self::new(Code::Replace)
            .arg(KEY_SPACE, space_cell(&space))
            .arg(KEY_TUPLE, ArgCell::Value(tuple))
    }

    pub fn update(
        space: impl Into<SpaceRef>, index: impl Into<IndexRef>, key: Value, ops: Value,
    ) -> Self {
        let space = space.into();
        let index = index.into();
        Self::new(Code::Update)
            .arg(KEY_SPACE, space_cell(&space))
            .arg(KEY_INDEX, index_cell(&space, &index))
            .arg(KEY_KEY, ArgCell::Value(key))
            .arg(KEY_TUPLE, ArgCell::Value(ops))
    }

    pub fn upsert(space: impl Into<SpaceRef>, tuple: Value, ops: Value) -> Self {
        let space = space.into();
        Self::new(Code::Upsert)
            .arg(KEY_SPACE, space_cell(&space))
            .arg(KEY_TUPLE, ArgCell::Value(tuple))
            .arg(KEY_UPSERT_OPS, ArgCell::Value(ops))
    }

    pub fn delete(space: impl Into<SpaceRef>, index: impl Into<IndexRef>, key: Value) -> Self {
        let space = space.into();
        let index = index.into();
        Self::new(Code::Delete)
            .arg(KEY_SPACE, space_cell(&space))
            .arg(KEY_INDEX, index_cell(&space, &index))
            .arg(KEY_KEY, ArgCell::Value(key))
    }

    pub fn call(function: &str, args: Value) -> Self {
        Self::new(Code::Call)
            .arg(KEY_FUNCTION, ArgCell::Value(Value::from(function)))
            .arg(KEY_TUPLE, ArgCell::Value(args))
    }

    pub fn eval(expression: &str, args: Value) -> Self {
        Self::new(Code::Eval)
            .arg(KEY_EXPRESSION, ArgCell::Value(Value::from(expression)))
            .arg(KEY_TUPLE, ArgCell::Value(args))
    }

    pub fn execute(sql: &str, bind: Vec<Value>) -> Self {
        Self::new(Code::Execute)
            .arg(KEY_SQL_TEXT, ArgCell::Value(Value::from(sql)))
            .arg(KEY_SQL_BIND, ArgCell::Value(Value::Array(bind)))
    }
}

/// A named SQL result row.
pub type SqlRow = FxHashMap<String, Value>;

/// The decoded body of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// DATA for non-SQL opcodes; `Nil` when the body was empty (PING).
    Data(Value),
    /// SQL_INFO row count of an SQL statement.
    RowCount(u64),
    /// METADATA/DATA rows of an SQL query.
    SqlRows(Vec<SqlRow>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Schema version the server reported when completing the request.
    pub schema_id: u64,
    pub payload: Payload,
}

type OpOutcome = Result<Response, ClientError>;

/// Single-assignment completion slot shared between the registry record, the
/// deadline timer and late completion attempts. The first `complete` wins;
/// after that the record is a tombstone and further outcomes are discarded.
pub(crate) struct OpShared {
    done: AtomicBool,
    tx: MTx<OpOutcome>,
}

impl OpShared {
    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn complete(&self, outcome: OpOutcome) -> bool {
        if self.done.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            // the receiver may already be dropped (fire-and-forget)
            let _ = self.tx.send(outcome);
            return true;
        }
        false
    }
}

/// An in-flight request record owned by the registry. Hook implementations
/// receive it back when a dispatch fails and decide whether to fail the
/// caller's future or park the record for retry.
pub struct PendingRequest {
    pub sync: u64,
    pub code: Code,
    pub(crate) body: Vec<(u64, ArgCell)>,
    pub(crate) started_schema_id: u64,
    pub(crate) deadline: Instant,
    /// For an internal schema probe, the sync-id of the request whose
    /// resolution it gates. Kept as an index so the registry stays the sole
    /// owner of both records.
    pub(crate) sync_dependent: Option<u64>,
    pub(crate) shared: Arc<OpShared>,
}

impl PendingRequest {
    /// Creates the record, arms the deadline timer and hands back the
    /// caller-facing future. Must run inside the client's runtime.
    pub(crate) fn begin(
        request: Request, sync: u64, config: &ClientConfig,
    ) -> (Self, OpFuture) {
        let mut code = request.code;
        if code == Code::Call && !config.use_new_call {
            code = Code::OldCall;
        }
        let deadline =
            Instant::now() + request.timeout.unwrap_or(config.operation_timeout);
        let (async_tx, rx) = mpmc::bounded_async::<OpOutcome>(1);
        let tx: MTx<OpOutcome> = async_tx.into();
        let shared = Arc::new(OpShared { done: AtomicBool::new(false), tx });
        let timer = shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            timer.complete(Err(ClientError::Expired));
        });
        let record = Self {
            sync,
            code,
            body: request.body,
            started_schema_id: 0,
            deadline,
            sync_dependent: None,
            shared: shared.clone(),
        };
        (record, OpFuture { sync, rx, shared })
    }

    pub(crate) fn is_serializable(&self, schema: &dyn SchemaMeta) -> bool {
        self.body.iter().all(|(_, cell)| cell.is_ready(schema))
    }

    /// Resolves every cell against the current cache.
    pub(crate) fn resolve_body(
        &self, schema: &dyn SchemaMeta,
    ) -> Result<Vec<(u64, Value)>, SchemaError> {
        self.body.iter().map(|(k, cell)| Ok((*k, cell.resolve(schema)?))).collect()
    }

    /// Fails the caller's future; a no-op if the record already completed.
    #[inline]
    pub fn fail(&self, err: ClientError) {
        self.shared.complete(Err(err));
    }

    /// Whether the future has already been completed (success, error or
    /// deadline); such a record is a tombstone.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "request(sync={}, code={:?}, deadline={:?})",
            self.sync,
            self.code,
            self.deadline
        )
    }
}

/// The caller-facing result future.
///
/// Await it with [`resolve`](OpFuture::resolve), park a non-async thread on
/// it with [`wait`](OpFuture::wait), or drop it for fire-and-forget
/// dispatch; the engine side is identical in all three cases.
pub struct OpFuture {
    sync: u64,
    rx: MAsyncRx<OpOutcome>,
    shared: Arc<OpShared>,
}

impl OpFuture {
    /// The correlation id this request was dispatched under.
    #[inline]
    pub fn sync_id(&self) -> u64 {
        self.sync
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    pub async fn resolve(self) -> Result<Response, ClientError> {
        match self.rx.recv().await {
            Ok(outcome) => outcome,
            Err(_) => Err(ClientError::Closed),
        }
    }

    /// Blocking variant of [`resolve`](OpFuture::resolve) for callers
    /// outside the runtime.
    pub fn wait(self) -> Result<Response, ClientError> {
        let rx: MRx<OpOutcome> = self.rx.into();
        match rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(ClientError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StaticSchema;

    fn test_config() -> ClientConfig {
        ClientConfig { operation_timeout: Duration::from_secs(5), ..Default::default() }
    }

    #[test]
    fn test_serializable_fold() {
        let schema = StaticSchema::initialized_at(1);
        schema.add_space("users", 512);
        let by_id = Request::insert(512u64, Value::Array(vec![Value::from(1)]));
        let by_name = Request::insert("users", Value::Array(vec![Value::from(1)]));
        let unknown = Request::insert("ghost", Value::Array(vec![Value::from(1)]));
        let rec = |r: Request| PendingRequest {
            sync: 1,
            code: r.code,
            body: r.body,
            started_schema_id: 0,
            deadline: Instant::now(),
            sync_dependent: None,
            shared: Arc::new(OpShared {
                done: AtomicBool::new(false),
                tx: mpmc::bounded_async::<OpOutcome>(1).0.into(),
            }),
        };
        assert!(rec(by_id).is_serializable(&schema));
        assert!(rec(by_name).is_serializable(&schema));
        assert!(!rec(unknown).is_serializable(&schema));
    }

    #[test]
    fn test_index_by_name_resolution() {
        let schema = StaticSchema::initialized_at(1);
        schema.add_space("users", 512);
        schema.add_index("users", "primary", 0);
        let req = Request::select("users", "primary", Value::Array(vec![]), 10, 0, 0);
        let resolved: Vec<(u64, Value)> = req
            .body
            .iter()
            .map(|(k, c)| (*k, c.resolve(&schema).expect("resolve")))
            .collect();
        assert_eq!(resolved[0], (KEY_SPACE, Value::from(512u64)));
        assert_eq!(resolved[1], (KEY_INDEX, Value::from(0u64)));
    }

    #[tokio::test]
    async fn test_single_assignment() {
        let (rec, fut) = PendingRequest::begin(Request::ping(), 9, &test_config());
        assert!(!fut.is_done());
        assert!(rec.shared.complete(Ok(Response { schema_id: 3, payload: Payload::Data(Value::Nil) })));
        assert!(!rec.shared.complete(Err(ClientError::Expired)));
        let resp = fut.resolve().await.expect("first outcome wins");
        assert_eq!(resp.schema_id, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_completes_future() {
        let config =
            ClientConfig { operation_timeout: Duration::from_millis(50), ..Default::default() };
        let (_rec, fut) = PendingRequest::begin(Request::ping(), 1, &config);
        assert_eq!(fut.resolve().await, Err(ClientError::Expired));
    }

    #[tokio::test]
    async fn test_old_call_selection() {
        let old = ClientConfig { use_new_call: false, ..test_config() };
        let (rec, _fut) = PendingRequest::begin(Request::call("f", Value::Array(vec![])), 1, &old);
        assert_eq!(rec.code, Code::OldCall);
        let (rec, _fut) =
            PendingRequest::begin(Request::call("f", Value::Array(vec![])), 2, &test_config());
        assert_eq!(rec.code, Code::Call);
    }
}
