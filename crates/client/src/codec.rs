//! Newline-delimited JSON framing for tool calls.
//!
//! Each outbound call is one compact JSON object followed by `\n`. Compact
//! serialization escapes control characters inside strings, so a payload
//! can never contain a bare terminator. Field names come from the
//! server's [`WireFormat`].

use std::sync::Arc;

use serde_json::{Map, Value};

use tw_domain::config::WireFormat;

use crate::error::RemoteError;

/// How many bytes of an offending frame are kept for diagnostics.
const FRAME_PREVIEW_BYTES: usize = 256;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A decoded inbound record.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A reply to the call with this correlation id.
    Response {
        id: u64,
        outcome: Result<Value, RemoteError>,
    },
    /// A record without an id; the server is telling us something unprompted.
    Notification(Value),
}

/// A decoded outbound record, as seen by the tool server.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// `None` for notifications.
    pub id: Option<u64>,
    pub tool: String,
    pub arguments: Value,
}

/// A single frame that could not be decoded. The stream carries on.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason} (frame: {})", preview(.frame))]
pub struct ProtocolDecodeError {
    pub reason: String,
    pub frame: Vec<u8>,
}

/// The stream can no longer be split into frames.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{buffered} bytes buffered without a frame terminator (limit {limit})")]
pub struct FramingError {
    pub buffered: usize,
    pub limit: usize,
}

fn preview(frame: &[u8]) -> String {
    let end = frame.len().min(FRAME_PREVIEW_BYTES);
    let mut s = String::from_utf8_lossy(&frame[..end]).into_owned();
    if frame.len() > end {
        s.push('…');
    }
    s
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Codec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct Codec {
    wire: WireFormat,
    max_frame_bytes: usize,
}

impl Codec {
    pub fn new(wire: WireFormat, max_frame_bytes: usize) -> Self {
        Self {
            wire,
            max_frame_bytes,
        }
    }

    pub fn wire(&self) -> &WireFormat {
        &self.wire
    }

    /// Encode one call as a single terminated frame.
    pub fn encode(
        &self,
        id: u64,
        tool: &str,
        arguments: &Value,
    ) -> Result<Vec<u8>, serde_json::Error> {
        let mut record = self.envelope();
        record.insert(self.wire.id.clone(), Value::from(id));
        record.insert(self.wire.tool.clone(), Value::from(tool));
        record.insert(self.wire.arguments.clone(), arguments.clone());
        Self::frame(&record)
    }

    /// Encode an id-less notification (no response expected).
    pub fn encode_notification(&self, tool: &str) -> Result<Vec<u8>, serde_json::Error> {
        let mut record = self.envelope();
        record.insert(self.wire.tool.clone(), Value::from(tool));
        Self::frame(&record)
    }

    /// Encode a reply to call `id`. Used by tool servers.
    pub fn encode_response(
        &self,
        id: u64,
        outcome: &Result<Value, RemoteError>,
    ) -> Result<Vec<u8>, serde_json::Error> {
        let mut record = self.envelope();
        record.insert(self.wire.id.clone(), Value::from(id));
        match outcome {
            Ok(result) => {
                record.insert(self.wire.result.clone(), result.clone());
            }
            Err(err) => {
                let mut obj = Map::new();
                obj.insert(self.wire.error_kind.clone(), Value::from(err.kind.as_str()));
                obj.insert(
                    self.wire.error_message.clone(),
                    Value::from(err.message.as_str()),
                );
                if let Some(data) = &err.data {
                    obj.insert(self.wire.error_data.clone(), data.clone());
                }
                record.insert(self.wire.error.clone(), Value::Object(obj));
            }
        }
        Self::frame(&record)
    }

    fn envelope(&self) -> Map<String, Value> {
        self.wire
            .envelope
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn frame(record: &Map<String, Value>) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec(record)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Decode every complete frame in `chunk`.
    ///
    /// Returns the decoded frames in order plus the unterminated tail,
    /// which the caller must prepend to the next read. Blank lines are
    /// skipped.
    pub fn decode<'a>(
        &self,
        chunk: &'a [u8],
    ) -> (Vec<Result<Inbound, ProtocolDecodeError>>, &'a [u8]) {
        let mut messages = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let line = rest[..pos].trim_ascii();
            rest = &rest[pos + 1..];
            if !line.is_empty() {
                messages.push(self.decode_frame(line));
            }
        }
        (messages, rest)
    }

    /// Decode a single frame (without its terminator).
    pub fn decode_frame(&self, frame: &[u8]) -> Result<Inbound, ProtocolDecodeError> {
        let fail = |reason: String| ProtocolDecodeError {
            reason,
            frame: frame.to_vec(),
        };

        if frame.len() > self.max_frame_bytes {
            return Err(fail(format!(
                "frame of {} bytes exceeds limit of {}",
                frame.len(),
                self.max_frame_bytes
            )));
        }

        let value: Value =
            serde_json::from_slice(frame).map_err(|e| fail(format!("invalid JSON: {e}")))?;
        let Value::Object(mut record) = value else {
            return Err(fail("record is not a JSON object".into()));
        };

        let error = record
            .remove(&self.wire.error)
            .filter(|v| !v.is_null());
        let result = record.remove(&self.wire.result);

        let id = match record.get(&self.wire.id) {
            None | Some(Value::Null) => {
                if error.is_some() || result.is_some() {
                    return Err(fail("response carries no correlation id".into()));
                }
                return Ok(Inbound::Notification(Value::Object(record)));
            }
            Some(raw) => parse_id(raw)
                .ok_or_else(|| fail(format!("correlation id {raw} is not an unsigned integer")))?,
        };

        // An explicit `null` result is a success; a missing one is not.
        let outcome = match (error, result) {
            (Some(err), _) => Err(self.remote_error(err)),
            (None, Some(result)) => Ok(result),
            (None, None) => return Err(fail("response carries neither result nor error".into())),
        };
        Ok(Inbound::Response { id, outcome })
    }

    /// Decode an outbound record (the tool server's side of the wire).
    pub fn decode_request(&self, frame: &[u8]) -> Result<Request, ProtocolDecodeError> {
        let fail = |reason: String| ProtocolDecodeError {
            reason,
            frame: frame.to_vec(),
        };

        let value: Value =
            serde_json::from_slice(frame).map_err(|e| fail(format!("invalid JSON: {e}")))?;
        let Value::Object(mut record) = value else {
            return Err(fail("record is not a JSON object".into()));
        };

        let id = match record.get(&self.wire.id) {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                parse_id(raw)
                    .ok_or_else(|| fail(format!("correlation id {raw} is not an unsigned integer")))?,
            ),
        };
        let tool = match record.remove(&self.wire.tool) {
            Some(Value::String(s)) => s,
            _ => return Err(fail(format!("missing string field '{}'", self.wire.tool))),
        };
        let arguments = record
            .remove(&self.wire.arguments)
            .unwrap_or(Value::Null);

        Ok(Request {
            id,
            tool,
            arguments,
        })
    }

    fn remote_error(&self, err: Value) -> RemoteError {
        match err {
            Value::Object(mut obj) => {
                let kind = match obj.remove(&self.wire.error_kind) {
                    Some(Value::String(s)) => s,
                    Some(Value::Null) | None => "unknown".into(),
                    Some(other) => other.to_string(),
                };
                let message = match obj.remove(&self.wire.error_message) {
                    Some(Value::String(s)) => s,
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                };
                let data = obj.remove(&self.wire.error_data).filter(|v| !v.is_null());
                RemoteError {
                    kind,
                    message,
                    data,
                }
            }
            Value::String(message) => RemoteError {
                kind: "unknown".into(),
                message,
                data: None,
            },
            other => RemoteError {
                kind: "unknown".into(),
                message: other.to_string(),
                data: None,
            },
        }
    }
}

fn parse_id(raw: &Value) -> Option<u64> {
    match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream decoder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Buffers partial reads and yields complete frames.
pub struct FrameDecoder {
    codec: Arc<Codec>,
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(codec: Arc<Codec>) -> Self {
        Self {
            codec,
            buf: Vec::new(),
        }
    }

    /// Feed one read's worth of bytes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Inbound, ProtocolDecodeError>> {
        self.buf.extend_from_slice(chunk);
        // Nothing new can complete unless this read brought a terminator.
        if !chunk.contains(&b'\n') {
            return Vec::new();
        }
        let (messages, leftover) = self.codec.decode(&self.buf);
        let consumed = self.buf.len() - leftover.len();
        self.buf.drain(..consumed);
        messages
    }

    /// Fails once the unterminated tail outgrows the frame limit.
    pub fn check_overflow(&self) -> Result<(), FramingError> {
        if self.buf.len() > self.codec.max_frame_bytes {
            return Err(FramingError {
                buffered: self.buf.len(),
                limit: self.codec.max_frame_bytes,
            });
        }
        Ok(())
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn codec() -> Codec {
        Codec::new(WireFormat::default(), 1024)
    }

    fn responses(decoded: Vec<Result<Inbound, ProtocolDecodeError>>) -> Vec<Inbound> {
        decoded.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn encode_is_one_terminated_line() {
        let frame = codec()
            .encode(7, "search", &json!({ "query": "line one\nline two" }))
            .unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(frame.iter().filter(|&&b| b == b'\n').count(), 1);

        let parsed: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(parsed["id"], 7);
        assert_eq!(parsed["tool"], "search");
        assert_eq!(parsed["arguments"]["query"], "line one\nline two");
    }

    #[test]
    fn encode_uses_configured_fields_and_envelope() {
        let mut wire = WireFormat {
            tool: "method".into(),
            arguments: "params".into(),
            ..Default::default()
        };
        wire.envelope.insert("jsonrpc".into(), json!("2.0"));
        let codec = Codec::new(wire, 1024);

        let frame = codec.encode(1, "tools/call", &json!({})).unwrap();
        let parsed: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(parsed["jsonrpc"], "2.0");
        assert_eq!(parsed["method"], "tools/call");
        assert!(parsed.get("params").is_some());
        assert!(parsed.get("tool").is_none());
    }

    #[test]
    fn notification_has_no_id() {
        let frame = codec().encode_notification("notifications/initialized").unwrap();
        let parsed: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(parsed["tool"], "notifications/initialized");
        assert!(parsed.get("id").is_none());
    }

    #[test]
    fn request_roundtrip() {
        let c = codec();
        let arguments = json!({ "query": "rust\tlang", "count": 5, "nested": [null, {"a": 1.5}] });
        let frame = c.encode(42, "web_search", &arguments).unwrap();
        let req = c.decode_request(frame.trim_ascii_end()).unwrap();
        assert_eq!(
            req,
            Request {
                id: Some(42),
                tool: "web_search".into(),
                arguments,
            }
        );
    }

    #[test]
    fn response_roundtrip() {
        let c = codec();
        let ok = c.encode_response(3, &Ok(json!({ "hits": [] }))).unwrap();
        let err = RemoteError {
            kind: "RateLimited".into(),
            message: "slow down".into(),
            data: Some(json!({ "retry_after": 2 })),
        };
        let failed = c.encode_response(4, &Err(err.clone())).unwrap();

        let mut stream = ok;
        stream.extend(failed);
        let (decoded, rest) = c.decode(&stream);
        assert!(rest.is_empty());
        assert_eq!(
            responses(decoded),
            vec![
                Inbound::Response {
                    id: 3,
                    outcome: Ok(json!({ "hits": [] }))
                },
                Inbound::Response {
                    id: 4,
                    outcome: Err(err)
                },
            ]
        );
    }

    #[test]
    fn request_without_tool_is_rejected() {
        let err = codec().decode_request(br#"{"id":1}"#).unwrap_err();
        assert!(err.reason.contains("'tool'"));
    }

    #[test]
    fn decode_success_and_error() {
        let raw = concat!(
            r#"{"id":1,"result":{"hits":3}}"#,
            "\n",
            r#"{"id":7,"error":{"kind":"NotFound","message":"no such tool"}}"#,
            "\n"
        );
        let (decoded, rest) = codec().decode(raw.as_bytes());
        assert!(rest.is_empty());
        let msgs = responses(decoded);
        assert_eq!(
            msgs[0],
            Inbound::Response {
                id: 1,
                outcome: Ok(json!({ "hits": 3 }))
            }
        );
        match &msgs[1] {
            Inbound::Response { id: 7, outcome: Err(e) } => {
                assert_eq!(e.kind, "NotFound");
                assert_eq!(e.message, "no such tool");
                assert!(e.data.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn numeric_error_kind_is_stringified() {
        let wire = WireFormat {
            error_kind: "code".into(),
            ..Default::default()
        };
        let codec = Codec::new(wire, 1024);
        let raw = br#"{"id":"3","error":{"code":-32601,"message":"Method not found","data":{"m":"x"}}}"#;
        match codec.decode_frame(raw).unwrap() {
            Inbound::Response { id, outcome: Err(e) } => {
                assert_eq!(id, 3);
                assert_eq!(e.kind, "-32601");
                assert_eq!(e.data, Some(json!({ "m": "x" })));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn record_without_id_is_notification() {
        let raw = br#"{"tool":"progress","arguments":{"pct":50}}"#;
        assert!(matches!(
            codec().decode_frame(raw).unwrap(),
            Inbound::Notification(_)
        ));
    }

    #[test]
    fn response_without_id_is_decode_error() {
        let raw = br#"{"id":null,"error":{"kind":"Parse","message":"bad"}}"#;
        let err = codec().decode_frame(raw).unwrap_err();
        assert!(err.reason.contains("no correlation id"));
    }

    #[test]
    fn id_only_record_is_decode_error() {
        let err = codec()
            .decode_frame(br#"{"id":5,"status":"accepted"}"#)
            .unwrap_err();
        assert!(err.reason.contains("neither result nor error"));
        assert_eq!(err.frame, br#"{"id":5,"status":"accepted"}"#);
    }

    #[test]
    fn explicit_null_result_is_success() {
        assert_eq!(
            codec().decode_frame(br#"{"id":5,"result":null}"#).unwrap(),
            Inbound::Response {
                id: 5,
                outcome: Ok(Value::Null)
            }
        );
    }

    #[test]
    fn malformed_frame_does_not_stop_stream() {
        let raw = b"server starting up...\n{\"id\":2,\"result\":true}\n";
        let (decoded, _) = codec().decode(raw);
        assert_eq!(decoded.len(), 2);
        let err = decoded[0].clone().unwrap_err();
        assert_eq!(err.frame, b"server starting up...");
        assert!(err.to_string().contains("server starting up"));
        assert_eq!(
            decoded[1].clone().unwrap(),
            Inbound::Response {
                id: 2,
                outcome: Ok(json!(true))
            }
        );
    }

    #[test]
    fn blank_lines_and_crlf_are_tolerated() {
        let raw = b"\n\r\n{\"id\":1,\"result\":1}\r\n";
        let (decoded, rest) = codec().decode(raw);
        assert!(rest.is_empty());
        assert_eq!(responses(decoded).len(), 1);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let codec = Codec::new(WireFormat::default(), 16);
        let err = codec
            .decode_frame(br#"{"id":1,"result":"0123456789"}"#)
            .unwrap_err();
        assert!(err.reason.contains("exceeds limit"));
    }

    #[test]
    fn split_point_does_not_change_output() {
        let c = Arc::new(codec());
        let stream = concat!(
            r#"{"id":1,"result":"a"}"#,
            "\n",
            r#"{"id":2,"error":{"kind":"X","message":"y"}}"#,
            "\n",
            r#"{"id":3,"result":[1,2]}"#,
            "\n"
        )
        .as_bytes();

        let (whole, _) = c.decode(stream);
        let whole = responses(whole);

        for split in 0..=stream.len() {
            let mut decoder = FrameDecoder::new(c.clone());
            let mut got = decoder.push(&stream[..split]);
            got.extend(decoder.push(&stream[split..]));
            assert_eq!(responses(got), whole, "split at {split}");
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn decoder_buffers_partial_frame() {
        let mut decoder = FrameDecoder::new(Arc::new(codec()));
        assert!(decoder.push(br#"{"id":9,"res"#).is_empty());
        assert!(decoder.push(br#"ult":"ok"}"#).is_empty());
        let got = responses(decoder.push(b"\n"));
        assert_eq!(
            got,
            vec![Inbound::Response {
                id: 9,
                outcome: Ok(json!("ok"))
            }]
        );
    }

    #[test]
    fn decoder_reports_overflow() {
        let mut decoder = FrameDecoder::new(Arc::new(Codec::new(WireFormat::default(), 8)));
        decoder.push(b"0123456789");
        let err = decoder.check_overflow().unwrap_err();
        assert_eq!(err.buffered, 10);
        assert_eq!(err.limit, 8);
    }
}
