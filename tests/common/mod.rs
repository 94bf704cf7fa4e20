#![allow(dead_code)]

//! A scripted in-process iproto server for driving the client end to end.

use bytes::BytesMut;
use captains_log::*;
use iproto_mux::codec::{self, RawPacket};
use iproto_mux::proto::*;
use iproto_mux::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub fn setup_log() {
    recipe::raw_file_logger("/tmp/iproto_mux_test.log", Level::Trace).test().build().expect("log");
}

/// What the scripted handler wants done with a received packet.
pub enum Action {
    Reply(Vec<OutPacket>),
    Silent,
    Hangup,
}

/// Per-connection scratch state the handler may use.
#[derive(Default)]
pub struct Ctx {
    pub held: Vec<RawPacket>,
    pub served: usize,
}

pub type Handler = Arc<dyn Fn(&RawPacket, &mut Ctx) -> Action + Send + Sync>;

pub struct OutPacket {
    pub code: u64,
    pub sync: u64,
    pub schema_id: u64,
    pub body: Vec<(u64, Value)>,
}

pub fn ok_data(sync: u64, schema_id: u64, data: Value) -> OutPacket {
    OutPacket { code: CODE_SUCCESS, sync, schema_id, body: vec![(KEY_DATA, data)] }
}

pub fn ok_empty(sync: u64, schema_id: u64) -> OutPacket {
    OutPacket { code: CODE_SUCCESS, sync, schema_id, body: vec![] }
}

pub fn server_error(sync: u64, schema_id: u64, err_code: u64, msg: &str) -> OutPacket {
    OutPacket {
        code: CODE_ERROR_BIT | err_code,
        sync,
        schema_id,
        body: vec![(KEY_ERROR, Value::from(msg))],
    }
}

pub fn wrong_schema(sync: u64, schema_id: u64) -> OutPacket {
    OutPacket {
        code: CODE_WRONG_SCHEMA_VERSION,
        sync,
        schema_id,
        body: vec![(KEY_ERROR, Value::from("wrong schema version"))],
    }
}

pub struct MockServer {
    addr: SocketAddr,
    _accept_task: JoinHandle<()>,
}

impl MockServer {
    pub async fn spawn(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let handler = handler.clone();
                tokio::spawn(serve_conn(stream, handler));
            }
        });
        Self { addr, _accept_task: accept_task }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }
}

async fn serve_conn(mut stream: TcpStream, handler: Handler) {
    let greeting = make_greeting("Tarantool 2.11.0 (mock)", &[0x5au8; 32]);
    if stream.write_all(&greeting).await.is_err() {
        return;
    }
    let mut ctx = Ctx::default();
    let mut scratch = BytesMut::with_capacity(512);
    loop {
        let packet = match codec::read_frame(&mut stream, &mut scratch).await {
            Ok(packet) => packet,
            Err(_) => return,
        };
        ctx.served += 1;
        match handler(&packet, &mut ctx) {
            Action::Reply(outs) => {
                for out in outs {
                    let frame = codec::encode_response(out.code, out.sync, out.schema_id, &out.body)
                        .expect("encode response");
                    if stream.write_all(&frame).await.is_err() {
                        return;
                    }
                }
            }
            Action::Silent => {}
            Action::Hangup => return,
        }
    }
}

/// Polls until `pred` holds or the deadline passes.
pub async fn wait_until(pred: impl Fn() -> bool, timeout: std::time::Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if pred() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    pred()
}
