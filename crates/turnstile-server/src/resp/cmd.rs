use bytes::Bytes;
use redis_protocol::resp2::types::BytesFrame;
use turnstile_core::StoreError;

/// A RESP2 request: an array of bulk strings, plus a label for errors and logs.
#[derive(Debug, Clone)]
pub struct Command {
    pub op: &'static str,
    frame: BytesFrame,
}

impl Command {
    fn new(op: &'static str, args: Vec<Bytes>) -> Self {
        Self {
            op,
            frame: BytesFrame::Array(args.into_iter().map(BytesFrame::BulkString).collect()),
        }
    }

    pub fn frame(&self) -> &BytesFrame {
        &self.frame
    }
}

fn arg(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

pub fn ping() -> Command {
    Command::new("PING", vec![Bytes::from_static(b"PING")])
}

pub fn get(key: &str) -> Command {
    Command::new("GET", vec![Bytes::from_static(b"GET"), arg(key)])
}

/// `SET key value EX seconds`
pub fn set_ex(key: &str, value: Bytes, seconds: u64) -> Command {
    Command::new(
        "SET",
        vec![
            Bytes::from_static(b"SET"),
            arg(key),
            value,
            Bytes::from_static(b"EX"),
            arg(&seconds.to_string()),
        ],
    )
}

/// `SET key value NX EX seconds`: write only if the key does not exist.
pub fn set_nx_ex(key: &str, value: Bytes, seconds: u64) -> Command {
    Command::new(
        "SET NX",
        vec![
            Bytes::from_static(b"SET"),
            arg(key),
            value,
            Bytes::from_static(b"NX"),
            Bytes::from_static(b"EX"),
            arg(&seconds.to_string()),
        ],
    )
}

pub fn del(key: &str) -> Command {
    Command::new("DEL", vec![Bytes::from_static(b"DEL"), arg(key)])
}

/// Surface `-ERR ...` replies as protocol errors.
fn check_error(reply: BytesFrame) -> Result<BytesFrame, StoreError> {
    match reply {
        BytesFrame::Error(msg) => Err(StoreError::Protocol(msg.to_string())),
        other => Ok(other),
    }
}

/// Bulk string or null.
pub fn parse_get(reply: BytesFrame) -> Result<Option<Bytes>, StoreError> {
    match check_error(reply)? {
        BytesFrame::BulkString(b) => Ok(Some(b)),
        BytesFrame::Null => Ok(None),
        _ => Err(StoreError::UnexpectedReply { op: "GET" }),
    }
}

/// `+OK`
pub fn parse_ok(reply: BytesFrame, op: &'static str) -> Result<(), StoreError> {
    match check_error(reply)? {
        BytesFrame::SimpleString(s) if s.as_ref() == b"OK" => Ok(()),
        _ => Err(StoreError::UnexpectedReply { op }),
    }
}

/// `+OK` when written, null when the key already existed.
pub fn parse_set_nx(reply: BytesFrame) -> Result<bool, StoreError> {
    match check_error(reply)? {
        BytesFrame::SimpleString(s) if s.as_ref() == b"OK" => Ok(true),
        BytesFrame::Null => Ok(false),
        _ => Err(StoreError::UnexpectedReply { op: "SET NX" }),
    }
}

pub fn parse_integer(reply: BytesFrame, op: &'static str) -> Result<i64, StoreError> {
    match check_error(reply)? {
        BytesFrame::Integer(n) => Ok(n),
        _ => Err(StoreError::UnexpectedReply { op }),
    }
}

pub fn parse_pong(reply: BytesFrame) -> Result<(), StoreError> {
    match check_error(reply)? {
        BytesFrame::SimpleString(s) if s.as_ref() == b"PONG" => Ok(()),
        _ => Err(StoreError::UnexpectedReply { op: "PING" }),
    }
}
