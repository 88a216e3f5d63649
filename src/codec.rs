use bytes::{BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    schema::{JSONRPCMessage, RequestId, INVALID_REQUEST, PARSE_ERROR},
};

/// One newline-delimited line off the wire.
#[derive(Debug)]
pub enum Frame {
    Message(JSONRPCMessage),
    /// A line that could not be understood. The stream stays open; the
    /// server answers with `code` and the id when one could be recovered.
    Invalid {
        id: Option<RequestId>,
        code: i32,
        reason: String,
    },
}

/// Newline-delimited JSON-RPC framing.
#[derive(Debug, Default)]
pub struct JsonRpcCodec;

impl JsonRpcCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for JsonRpcCodec {
    type Error = Error;
    type Item = Frame;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let Some(n) = src.iter().position(|b| *b == b'\n') else {
                return Ok(None);
            };
            let line = src.split_to(n + 1);
            let body = trim_line(&line[..line.len() - 1]);
            if body.is_empty() {
                continue;
            }
            return Ok(Some(parse_frame(body)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        // A final line without a trailing newline.
        let rest = src.split();
        let body = trim_line(&rest);
        if body.is_empty() {
            Ok(None)
        } else {
            Ok(Some(parse_frame(body)))
        }
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Message contents are not logged: tool arguments may carry user data.
fn parse_frame(body: &[u8]) -> Frame {
    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            warn!("unparseable JSON-RPC line ({} bytes): {e}", body.len());
            return Frame::Invalid {
                id: None,
                code: PARSE_ERROR,
                reason: format!("Parse error: {e}"),
            };
        }
    };
    let id = value
        .get("id")
        .cloned()
        .and_then(|id| serde_json::from_value::<RequestId>(id).ok());
    if value.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Frame::Invalid {
            id,
            code: INVALID_REQUEST,
            reason: "Invalid Request: jsonrpc must be \"2.0\"".into(),
        };
    }
    match serde_json::from_value::<JSONRPCMessage>(value) {
        Ok(message) => Frame::Message(message),
        Err(e) => Frame::Invalid {
            id,
            code: INVALID_REQUEST,
            reason: format!("Invalid Request: {e}"),
        },
    }
}

impl Encoder<JSONRPCMessage> for JsonRpcCodec {
    type Error = Error;

    fn encode(&mut self, item: JSONRPCMessage, dst: &mut BytesMut) -> Result<()> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        debug!(bytes = json.len(), "encoded JSON-RPC message");
        Ok(())
    }
}
