//! Minimal in-process RESP2 server for exercising the client pool.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use redis_protocol::resp2::decode::decode_bytes;
use redis_protocol::resp2::encode::extend_encode;
use redis_protocol::resp2::types::BytesFrame;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Default)]
struct State {
    data: Mutex<HashMap<String, (Bytes, Option<u64>)>>,
    connections: AtomicUsize,
    fail_next: Mutex<Option<String>>,
    stall_next: AtomicBool,
}

pub struct FakeServer {
    addr: SocketAddr,
    state: Arc<State>,
}

impl FakeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State::default());

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle_connection(stream, Arc::clone(&accept_state)));
            }
        });

        Self { addr, state }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn last_ttl(&self, key: &str) -> Option<u64> {
        self.state.data.lock().get(key).and_then(|(_, ttl)| *ttl)
    }

    /// Answer the next command with an error reply.
    pub fn fail_next_with(&self, msg: &str) {
        *self.state.fail_next.lock() = Some(msg.to_string());
    }

    /// Read the next command and never answer it.
    pub fn stall_next(&self) {
        self.state.stall_next.store(true, Ordering::SeqCst);
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<State>) {
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        while let Ok(Some((frame, consumed))) = decode_bytes(&buf.clone().freeze()) {
            let _ = buf.split_to(consumed);

            if state.stall_next.swap(false, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }

            let reply = match state.fail_next.lock().take() {
                Some(msg) => BytesFrame::Error(msg.as_str().into()),
                None => dispatch(&frame, &state),
            };

            let mut out = BytesMut::new();
            if extend_encode(&mut out, &reply, false).is_err()
                || stream.write_all(&out).await.is_err()
            {
                return;
            }
        }
    }
}

fn dispatch(frame: &BytesFrame, state: &State) -> BytesFrame {
    let args: Vec<Bytes> = match frame {
        BytesFrame::Array(items) => items
            .iter()
            .filter_map(|f| match f {
                BytesFrame::BulkString(b) => Some(b.clone()),
                _ => None,
            })
            .collect(),
        _ => return BytesFrame::Error("ERR expected array".into()),
    };
    let text = |i: usize| String::from_utf8_lossy(&args[i]).to_uppercase();

    match text(0).as_str() {
        "PING" => BytesFrame::SimpleString("PONG".into()),
        "GET" => match state.data.lock().get(&*String::from_utf8_lossy(&args[1])) {
            Some((value, _)) => BytesFrame::BulkString(value.clone()),
            None => BytesFrame::Null,
        },
        "SET" => {
            let key = String::from_utf8_lossy(&args[1]).into_owned();
            let mut nx = false;
            let mut ttl = None;
            let mut i = 3;
            while i < args.len() {
                match text(i).as_str() {
                    "NX" => nx = true,
                    "EX" => {
                        ttl = text(i + 1).parse().ok();
                        i += 1;
                    }
                    _ => {}
                }
                i += 1;
            }
            let mut data = state.data.lock();
            if nx && data.contains_key(&key) {
                return BytesFrame::Null;
            }
            data.insert(key, (args[2].clone(), ttl));
            BytesFrame::SimpleString("OK".into())
        }
        "DEL" => {
            let removed = state
                .data
                .lock()
                .remove(&*String::from_utf8_lossy(&args[1]))
                .is_some();
            BytesFrame::Integer(i64::from(removed))
        }
        other => BytesFrame::Error(format!("ERR unknown command '{other}'").as_str().into()),
    }
}
