//! JSON request/response protocol shared by the control plane and the workers.
//!
//! One request and one response per TCP connection. The sender writes a single JSON
//! object followed by `\n` and shuts down its write half; the receiver parses
//! incrementally and stops at the first complete JSON value.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::wm::error::ProtocolError;

/// Upper bound on a single message.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Hello,
    DecompileFunction,
    GetFunctions,
    StopServer,
    /// Control plane only.
    Status,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Hello => "hello",
            Action::DecompileFunction => "decompile_function",
            Action::GetFunctions => "get_functions",
            Action::StopServer => "stop_server",
            Action::Status => "status",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hello" => Some(Action::Hello),
            "decompile_function" => Some(Action::DecompileFunction),
            "get_functions" => Some(Action::GetFunctions),
            "stop_server" => Some(Action::StopServer),
            "status" => Some(Action::Status),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Request {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            binary_path: None,
            address: None,
        }
    }

    pub fn to_value(&self) -> Value {
        // Serializing a plain struct of strings cannot fail.
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "action": self.action.as_str() }))
    }
}

/// Parse a hex address (`"401000"`, `"0x401000"`, `"0X401000"`).
pub fn parse_address(s: &str) -> Option<u64> {
    let t = s.trim();
    let digits = t
        .strip_prefix("0x")
        .or_else(|| t.strip_prefix("0X"))
        .unwrap_or(t);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Tracks where the first top-level JSON value ends, one chunk at a time.
///
/// Only brackets, strings and escapes are followed; validating the value is left to
/// serde_json once the frame is complete, so each byte is looked at once.
#[derive(Debug, Default)]
struct FrameScanner {
    depth: usize,
    in_string: bool,
    escaped: bool,
    /// A bare top-level scalar (number, literal or garbage) is being read.
    in_scalar: bool,
    started: bool,
}

impl FrameScanner {
    /// Offset just past the end of the value within `bytes`, once it is complete.
    fn feed(&mut self, bytes: &[u8]) -> Option<usize> {
        for (i, &b) in bytes.iter().enumerate() {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                    if self.depth == 0 {
                        return Some(i + 1);
                    }
                }
                continue;
            }
            if self.in_scalar {
                if b.is_ascii_whitespace() || matches!(b, b'{' | b'[' | b'}' | b']' | b'"' | b',') {
                    return Some(i);
                }
                continue;
            }
            match b {
                b' ' | b'\t' | b'\r' | b'\n' => {}
                b'{' | b'[' => {
                    self.started = true;
                    self.depth += 1;
                }
                b'}' | b']' => {
                    self.started = true;
                    if self.depth <= 1 {
                        // A stray closer at depth 0 is handed to the parser as-is.
                        return Some(i + 1);
                    }
                    self.depth -= 1;
                }
                b'"' => {
                    self.started = true;
                    self.in_string = true;
                }
                _ => {
                    self.started = true;
                    if self.depth == 0 {
                        self.in_scalar = true;
                    }
                }
            }
        }
        None
    }
}

fn parse_frame(frame: &[u8]) -> Result<Value, ProtocolError> {
    serde_json::from_slice(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Read exactly one JSON value.
///
/// Bytes after the first complete value are ignored. EOF before a complete value is
/// `Closed` when nothing arrived and `Malformed` otherwise.
pub async fn read_message<R>(reader: &mut R, limit: usize) -> Result<Value, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut scanner = FrameScanner::default();
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if !scanner.started {
                return Err(ProtocolError::Closed);
            }
            if scanner.depth > 0 || scanner.in_string {
                return Err(ProtocolError::Malformed(
                    "connection closed inside an incomplete JSON value".to_string(),
                ));
            }
            // A top-level scalar ends at EOF.
            return parse_frame(&buf);
        }
        let fresh = &chunk[..n];
        match scanner.feed(fresh) {
            Some(end) => {
                if buf.len() + end > limit {
                    return Err(ProtocolError::TooLarge { limit });
                }
                buf.extend_from_slice(&fresh[..end]);
                return parse_frame(&buf);
            }
            None => {
                if buf.len() + n > limit {
                    return Err(ProtocolError::TooLarge { limit });
                }
                buf.extend_from_slice(fresh);
            }
        }
    }
}

/// Write one JSON value plus `\n`, then shut down the write half.
pub async fn write_message<W>(writer: &mut W, msg: &Value) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(msg).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::TooLarge {
            limit: MAX_MESSAGE_BYTES,
        });
    }
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct ExchangeTimeouts {
    pub connect: Duration,
    pub io: Duration,
}

fn ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Send `msg` to `host:port` and return the single response value.
pub async fn exchange(
    host: &str,
    port: u16,
    msg: &Value,
    timeouts: ExchangeTimeouts,
) -> Result<Value, ProtocolError> {
    let connect = tokio::time::timeout(timeouts.connect, TcpStream::connect((host, port)));
    let mut stream = match connect.await {
        Err(_) => {
            return Err(ProtocolError::Timeout {
                phase: "connecting",
                ms: ms(timeouts.connect),
            });
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            return Err(ProtocolError::ConnectionRefused { port });
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(s)) => s,
    };
    tokio::time::timeout(timeouts.io, write_message(&mut stream, msg))
        .await
        .map_err(|_| ProtocolError::Timeout {
            phase: "sending request",
            ms: ms(timeouts.io),
        })??;
    tokio::time::timeout(timeouts.io, read_message(&mut stream, MAX_MESSAGE_BYTES))
        .await
        .map_err(|_| ProtocolError::Timeout {
            phase: "reading response",
            ms: ms(timeouts.io),
        })?
}

/// Readiness probe: true only for `{"success":true,"message":"hi"}`.
pub async fn hello(host: &str, port: u16, timeouts: ExchangeTimeouts) -> bool {
    match exchange(host, port, &Request::new(Action::Hello).to_value(), timeouts).await {
        Ok(v) => is_hello_reply(&v),
        Err(_) => false,
    }
}

pub fn is_hello_reply(v: &Value) -> bool {
    v.get("success").and_then(Value::as_bool) == Some(true)
        && v.get("message").and_then(Value::as_str) == Some("hi")
}

/// `{success:false, error}`.
pub fn error_envelope(error: impl Into<String>) -> Value {
    json!({ "success": false, "error": error.into() })
}

/// Transport failure as a client-facing envelope: `"<kind>: <detail>"`.
pub fn protocol_error_envelope(err: &ProtocolError) -> Value {
    error_envelope(format!("{}: {err}", err.kind()))
}

/// Make sure a relayed response carries a `success` flag, and an `error` when it is not true.
pub fn normalize_response(resp: Value) -> Value {
    let mut obj = match resp {
        Value::Object(m) => m,
        other => {
            let mut m = Map::new();
            m.insert("success".into(), Value::Bool(false));
            m.insert(
                "error".into(),
                Value::String(format!("malformed_payload: worker replied with non-object {other}")),
            );
            return Value::Object(m);
        }
    };
    if !matches!(obj.get("success"), Some(Value::Bool(_))) {
        obj.insert("success".into(), Value::Bool(false));
    }
    let ok = obj.get("success") == Some(&Value::Bool(true));
    let has_error = obj
        .get("error")
        .and_then(Value::as_str)
        .is_some_and(|s| !s.is_empty());
    if !ok && !has_error {
        obj.insert(
            "error".into(),
            Value::String("worker reported failure without an error message".into()),
        );
    }
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_request_serialization_omits_absent_fields() {
        let v = Request {
            binary_path: Some("/srv/a.exe".into()),
            ..Request::new(Action::GetFunctions)
        }
        .to_value();
        assert_eq!(v, json!({"action": "get_functions", "binary_path": "/srv/a.exe"}));

        let r: Request =
            serde_json::from_value(json!({"action": "decompile_function", "address": "0x10"}))
                .unwrap();
        assert_eq!(r.action, Action::DecompileFunction);
        assert_eq!(r.address.as_deref(), Some("0x10"));
    }

    #[test]
    fn test_action_names() {
        for a in [
            Action::Hello,
            Action::DecompileFunction,
            Action::GetFunctions,
            Action::StopServer,
            Action::Status,
        ] {
            assert_eq!(Action::parse(a.as_str()), Some(a));
            assert_eq!(serde_json::to_value(a).unwrap(), json!(a.as_str()));
        }
        assert_eq!(Action::parse("rm_rf"), None);
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x401000"), Some(0x401000));
        assert_eq!(parse_address("0X1f"), Some(0x1f));
        assert_eq!(parse_address("deadBEEF"), Some(0xdeadbeef));
        assert_eq!(parse_address("0x"), None);
        assert_eq!(parse_address("main"), None);
        assert_eq!(parse_address(""), None);
    }

    #[tokio::test]
    async fn test_read_stops_at_first_complete_value() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(b"{\"success\":true}\n{\"second\":1}").await.unwrap();
        // The writer never closes; the reader must not wait for EOF.
        let v = read_message(&mut b, MAX_MESSAGE_BYTES).await.unwrap();
        assert_eq!(v, json!({"success": true}));
    }

    #[tokio::test]
    async fn test_multiline_nested_payload_is_not_truncated() {
        let code = "int main() {\n  if (x) {\n    return 1;\n  }\n}\n";
        let msg = json!({
            "success": true,
            "function": {"name": "main", "decompiled_code": code, "nested": {"a": [1, {"b": "}"}]}}
        });
        let pretty = serde_json::to_vec_pretty(&msg).unwrap();
        let (mut a, mut b) = tokio::io::duplex(16);
        let writer = tokio::spawn(async move {
            // Dribble the bytes in small pieces.
            for piece in pretty.chunks(7) {
                a.write_all(piece).await.unwrap();
            }
            a.shutdown().await.unwrap();
        });
        let v = read_message(&mut b, MAX_MESSAGE_BYTES).await.unwrap();
        writer.await.unwrap();
        assert_eq!(v, msg);
    }

    #[test]
    fn test_frame_scanner_ignores_brackets_in_strings() {
        let mut sc = FrameScanner::default();
        let part1 = br#"{"code": "if (a) { b[\"}\"] }", "#;
        assert_eq!(sc.feed(part1), None);
        let part2 = br#""n": [1, {"x": "]"}]} trailing"#;
        let end = sc.feed(part2).unwrap();
        assert_eq!(&part2[end..], b" trailing");

        let mut sc = FrameScanner::default();
        assert_eq!(sc.feed(b"  12"), None);
        assert_eq!(sc.feed(b"34\n"), Some(2));
    }

    #[tokio::test]
    async fn test_large_pretty_payload_reads_in_linear_time() {
        let functions: Vec<Value> = (0..60_000u64)
            .map(|i| {
                json!({
                    "name": format!("sub_{:x}", 0x401000 + i * 16),
                    "address": format!("0x{:x}", 0x401000 + i * 16),
                    "size": 16
                })
            })
            .collect();
        let msg = json!({"success": true, "functions": functions});
        let pretty = serde_json::to_vec_pretty(&msg).unwrap();
        assert!(pretty.len() > 4 * 1024 * 1024);

        let (mut a, mut b) = tokio::io::duplex(READ_CHUNK);
        let writer = tokio::spawn(async move {
            a.write_all(&pretty).await.unwrap();
            a.shutdown().await.unwrap();
        });
        let started = std::time::Instant::now();
        let v = read_message(&mut b, MAX_MESSAGE_BYTES).await.unwrap();
        // Well inside the default request timeout, even unoptimized.
        assert!(started.elapsed() < Duration::from_secs(10), "{:?}", started.elapsed());
        writer.await.unwrap();
        assert_eq!(v["functions"].as_array().unwrap().len(), 60_000);
    }

    #[tokio::test]
    async fn test_read_errors() {
        let mut empty: &[u8] = b"  \n";
        assert!(matches!(
            read_message(&mut empty, MAX_MESSAGE_BYTES).await,
            Err(ProtocolError::Closed)
        ));

        let mut partial: &[u8] = b"{\"success\": tr";
        assert!(matches!(
            read_message(&mut partial, MAX_MESSAGE_BYTES).await,
            Err(ProtocolError::Malformed(_))
        ));

        let mut garbage: &[u8] = b"hello world\n";
        assert!(matches!(
            read_message(&mut garbage, MAX_MESSAGE_BYTES).await,
            Err(ProtocolError::Malformed(_))
        ));

        let mut big: &[u8] = b"{\"pad\": \"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\"}";
        assert!(matches!(
            read_message(&mut big, 16).await,
            Err(ProtocolError::TooLarge { limit: 16 })
        ));
    }

    #[tokio::test]
    async fn test_write_message_appends_newline_and_closes() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, &json!({"action": "hello"})).await.unwrap();
        let mut out = Vec::new();
        b.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"{\"action\":\"hello\"}\n");
    }

    #[tokio::test]
    async fn test_exchange_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let t = ExchangeTimeouts {
            connect: Duration::from_secs(1),
            io: Duration::from_secs(1),
        };
        let err = exchange("127.0.0.1", port, &json!({"action": "hello"}), t)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "connection_refused");
        assert!(!hello("127.0.0.1", port, t).await);
    }

    #[tokio::test]
    async fn test_exchange_times_out_on_silent_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(sock);
        });
        let t = ExchangeTimeouts {
            connect: Duration::from_secs(1),
            io: Duration::from_millis(200),
        };
        let err = exchange("127.0.0.1", port, &json!({"action": "hello"}), t)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout { phase: "reading response", .. }));
        server.abort();
    }

    #[test]
    fn test_envelopes() {
        let e = protocol_error_envelope(&ProtocolError::ConnectionRefused { port: 7001 });
        assert_eq!(e["success"], json!(false));
        assert!(e["error"].as_str().unwrap().starts_with("connection_refused: "));

        assert_eq!(
            normalize_response(json!({"success": true, "functions": []})),
            json!({"success": true, "functions": []})
        );
        // Worker-side errors come back without a success flag.
        assert_eq!(
            normalize_response(json!({"error": "no function at 0x10"})),
            json!({"success": false, "error": "no function at 0x10"})
        );
        let n = normalize_response(json!({"message": "??"}));
        assert_eq!(n["success"], json!(false));
        assert!(n["error"].as_str().is_some());
        let n = normalize_response(json!([1, 2]));
        assert_eq!(n["success"], json!(false));
        assert!(is_hello_reply(&json!({"success": true, "message": "hi"})));
        assert!(!is_hello_reply(&json!({"success": true, "message": "hello"})));
    }
}
