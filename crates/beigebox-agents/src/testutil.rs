//! Test-only scripted chat-completions server.
//!
//! Answers every POST with a canned OpenAI-shaped completion whose
//! content is chosen by inspecting the request body — enough to script
//! planner/evaluator/task turns without a real model.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Start a one-shot HTTP server on a random loopback port. `respond`
/// maps each request body to the assistant content to return.
pub async fn spawn_chat_server<F>(respond: F) -> SocketAddr
where
    F: Fn(&Value) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
    let addr = listener.local_addr().expect("local addr");
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let respond = Arc::clone(&respond);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                // Read headers, then the content-length body
                let body_start = loop {
                    let Ok(n) = socket.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = find_header_end(&buf) {
                        break pos;
                    }
                };

                let headers = String::from_utf8_lossy(&buf[..body_start]).to_lowercase();
                let content_length: usize = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0);
                while buf.len() < body_start + content_length {
                    let Ok(n) = socket.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }

                let body: Value =
                    serde_json::from_slice(&buf[body_start..]).unwrap_or(Value::Null);
                let content = respond(&body);
                let reply = json!({
                    "choices": [{"message": {"role": "assistant", "content": content}}],
                    "model": body.get("model").cloned().unwrap_or(json!("stub")),
                })
                .to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{reply}",
                    reply.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// The system prompt of the first message, for turn classification.
pub fn system_prompt(body: &Value) -> String {
    body.get("messages")
        .and_then(|m| m.as_array())
        .and_then(|m| m.first())
        .filter(|m| m.get("role").and_then(|r| r.as_str()) == Some("system"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string()
}
