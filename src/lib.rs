//! # iproto-mux
//!
//! An asynchronous multiplexing client for the Tarantool binary protocol
//! (`iproto`): MessagePack-framed request/response over one duplex TCP
//! socket, shared by any number of concurrent callers with pipelined,
//! out-of-order responses.
//!
//! The engine keeps two cross-cutting concerns coherent while it multiplexes:
//!
//! - **schema versions** — requests carrying space/index names resolve them
//!   against a cached catalog; a `WRONG_SCHEMA_VERSION` response parks the
//!   request, refreshes the cache and re-sends transparently;
//! - **connection lifecycle** — an explicit state machine supervises
//!   connect, live traffic, reconnect and close, and the futures of
//!   in-flight requests survive supervisor restarts.
//!
//! [`ClusterClient`] layers transient-error retry and fail-over across a
//! refreshable member list over the same engine.
//!
//! Completion order across concurrent requests is not guaranteed, not even
//! for one caller issuing back-to-back requests; correlation is by sync-id
//! only.
//!
//! ## Example
//!
//! ```no_run
//! use iproto_mux::{Client, ClientConfig, Request, Value};
//!
//! # async fn demo() -> Result<(), iproto_mux::ClientError> {
//! let client = Client::connect("127.0.0.1:3301", ClientConfig::default()).await?;
//! let rows = client
//!     .execute_request(Request::select(512u64, 0u64, Value::Array(vec![]), 100, 0, 0))
//!     .await?;
//! for row in rows.rows() {
//!     println!("id={}", row.get_i64(0)?);
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod error;
pub(crate) mod io;
pub mod proto;
pub mod provider;
pub(crate) mod registry;
pub mod request;
pub mod resultset;
pub mod schema;
pub(crate) mod state;

pub use client::{BaseHooks, Client, ClientHandle, ClientHooks};
pub use cluster::{ClusterClient, ClusterHooks, ServiceDiscoverer};
pub use config::{ClientConfig, ClusterConfig};
pub use error::ClientError;
pub use proto::Code;
pub use provider::{AddrProvider, ProviderError, RoundRobinProvider, SingleAddrProvider};
pub use request::{ArgCell, IndexRef, OpFuture, Payload, Request, Response, SpaceRef, SqlRow};
pub use resultset::{ResultSet, Row};
pub use schema::{SchemaError, SchemaMeta, StaticSchema};

pub use rmpv::Value;
