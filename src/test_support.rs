//! Shared fixtures for the unit tests: a scripted pipe backend and a
//! minimal HTTP/SSE server.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::transport::lifecycle::ProcessSpec;
use crate::transport::types::BackendDescriptor;

// ─── Pipe Fixture ────────────────────────────────────────────────────────────

/// Number of tools the pipe fixture advertises.
pub const FIXTURE_TOOL_COUNT: usize = 3;

/// A line-protocol backend written in POSIX sh.
///
/// Prints a non-JSON banner first. `slow` answers after 400ms from a
/// background subshell, `hang` never answers, `fail` returns an error,
/// `crash` exits, everything else answers `"4"` immediately.
pub const PIPE_FIXTURE_SCRIPT: &str = r##"
echo "fixture backend ready"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"action":"list_tools"'*)
      printf '{"id":"%s","data":{"tools":[{"name":"calculator","description":"Evaluate an arithmetic expression","parameters":{"type":"object","properties":{"expression":{"type":"string"}},"required":["expression"]}},{"name":"slow","description":"Answers late","parameters":{"type":"object","properties":{}}},{"name":"hang","description":"Never answers","parameters":{"type":"object","properties":{}}}]}}\n' "$id" ;;
    *'"name":"slow"'*)
      ( sleep 0.4; printf '{"id":"%s","data":{"tool":"slow"}}\n' "$id" ) & ;;
    *'"name":"hang"'*)
      : ;;
    *'"name":"fail"'*)
      printf '{"id":"%s","error":"tool exploded"}\n' "$id" ;;
    *'"name":"crash"'*)
      echo "fatal: crash requested" >&2
      exit 1 ;;
    *)
      printf '{"id":"%s","data":{"content":[{"type":"text","text":"4"}]}}\n' "$id" ;;
  esac
done
"##;

pub fn pipe_fixture_spec() -> ProcessSpec {
    ProcessSpec {
        command: "sh".into(),
        args: vec!["-c".into(), PIPE_FIXTURE_SCRIPT.into()],
        env: HashMap::new(),
        cwd: None,
    }
}

pub fn pipe_fixture_descriptor(id: &str) -> BackendDescriptor {
    let mut descriptor = BackendDescriptor::new(id, "pipe");
    descriptor.command = Some("sh".into());
    descriptor.args = vec!["-c".into(), PIPE_FIXTURE_SCRIPT.into()];
    descriptor
}

// ─── SSE Fixture ─────────────────────────────────────────────────────────────

/// Start an HTTP/SSE backend on an ephemeral port; returns its stream URL.
///
/// `GET` opens the event stream and announces `/messages` as the request
/// endpoint. Every `POST` is acknowledged with 202 and answered on the stream:
/// `slow` after 300ms, `hang` never, `fail_http` with a 500 instead,
/// `drop_stream` by closing the stream, `whoami` with request metadata, and
/// anything else by echoing its arguments.
pub async fn spawn_sse_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (events, _) = broadcast::channel::<Option<String>>(64);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(handle_connection(socket, events.clone()));
        }
    });

    format!("http://{addr}/events")
}

struct RawRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: String,
}

async fn read_request(socket: &mut TcpStream) -> Option<RawRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(RawRequest {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

fn message_event(payload: serde_json::Value) -> Option<String> {
    Some(format!("data: {payload}\n\n"))
}

async fn handle_connection(mut socket: TcpStream, events: broadcast::Sender<Option<String>>) {
    let Some(request) = read_request(&mut socket).await else {
        return;
    };

    if request.method == "GET" {
        let mut rx = events.subscribe();
        let preamble = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\n\r\n: connected\n\nevent: endpoint\ndata: /messages\n\n";
        if socket.write_all(preamble.as_bytes()).await.is_err() {
            return;
        }
        while let Ok(Some(event)) = rx.recv().await {
            if socket.write_all(event.as_bytes()).await.is_err() {
                return;
            }
        }
        let _ = socket.shutdown().await;
        return;
    }

    let wire: serde_json::Value = serde_json::from_str(&request.body).unwrap_or_default();
    let id = wire["id"].as_str().unwrap_or_default().to_string();
    let action = wire["action"].as_str().unwrap_or_default().to_string();
    let name = wire["data"]["name"].as_str().unwrap_or_default().to_string();

    if name == "fail_http" {
        let _ = socket
            .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\nConnection: close\r\n\r\nboom")
            .await;
        return;
    }
    let _ = socket
        .write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await;

    let reply = if action == "list_tools" {
        message_event(serde_json::json!({
            "id": id,
            "data": {"tools": [{
                "name": "search",
                "description": "Search the web",
                "parameters": {
                    "type": "object",
                    "properties": {"query": {"type": "string"}},
                    "required": ["query"]
                }
            }]}
        }))
    } else {
        match name.as_str() {
            "hang" => return,
            "drop_stream" => None,
            "slow" => {
                tokio::time::sleep(Duration::from_millis(300)).await;
                message_event(serde_json::json!({"id": id, "data": {"slow": true}}))
            }
            "whoami" => message_event(serde_json::json!({
                "id": id,
                "data": {
                    "auth": request.headers.get("authorization").cloned().unwrap_or_default(),
                    "path": request.path,
                    "header_id": request.headers.get("x-request-id").cloned().unwrap_or_default(),
                    "body_id": id,
                }
            })),
            _ => message_event(serde_json::json!({
                "id": id,
                "data": {"echo": wire["data"]["arguments"].clone()}
            })),
        }
    };
    let _ = events.send(reply);
}
