//! Shared SSE relay — reads a backend's byte stream, reassembles lines,
//! and feeds them through an mpsc channel.

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{error_chunk, COST_SENTINEL_PREFIX};

/// Channel depth for relayed event lines — bounded so a stalled client
/// applies backpressure to the backend read.
pub const STREAM_CHANNEL_DEPTH: usize = 64;

/// Spawn a task that reads `resp` line by line into `tx`.
///
/// With `scan_cost` set (metered backends), each data chunk is inspected
/// for a cost field; when one appears, a `__bb_cost__:<float>` sentinel
/// line is emitted right after the chunk that carried it.
///
/// A mid-stream read failure emits a synthesized error chunk plus the
/// `data: [DONE]` terminator — the stream is committed by then, so the
/// error travels in-band.
pub fn spawn_line_relay(
    resp: reqwest::Response,
    tx: mpsc::Sender<String>,
    backend_name: String,
    scan_cost: bool,
) {
    tokio::spawn(async move {
        let mut byte_stream = resp.bytes_stream();
        let mut buf = String::new();
        let mut cost_sent = false;

        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    warn!(backend = %backend_name, err = %e, "mid-stream read failure");
                    let _ = tx.send(error_chunk(&format!("{backend_name} stream failed: {e}"))).await;
                    let _ = tx.send("data: [DONE]".to_string()).await;
                    return;
                }
            };

            let text = match std::str::from_utf8(&chunk) {
                Ok(t) => t,
                Err(_) => continue,
            };
            buf.push_str(text);

            while let Some(newline) = buf.find('\n') {
                let line: String = buf[..newline].trim_end_matches('\r').to_string();
                buf.drain(..=newline);
                if line.is_empty() {
                    continue;
                }
                let cost = if scan_cost && !cost_sent { extract_line_cost(&line) } else { None };
                if tx.send(line).await.is_err() {
                    return; // receiver dropped — client went away
                }
                if let Some(cost) = cost {
                    cost_sent = true;
                    debug!(backend = %backend_name, cost, "stream cost captured");
                    if tx.send(format!("{COST_SENTINEL_PREFIX}{cost}")).await.is_err() {
                        return;
                    }
                }
            }
        }

        // Flush a trailing unterminated line
        let tail = buf.trim();
        if !tail.is_empty() {
            let _ = tx.send(tail.to_string()).await;
        }
    });
}

/// Pull a cost figure out of one SSE data line, if it carries one.
fn extract_line_cost(line: &str) -> Option<f64> {
    let data = line.strip_prefix("data: ")?;
    if data.trim() == "[DONE]" {
        return None;
    }
    let value: Value = serde_json::from_str(data).ok()?;
    extract_cost(&value)
}

/// Cost may appear directly (`cost_usd`) or nested (`usage.cost`).
pub fn extract_cost(data: &Value) -> Option<f64> {
    if let Some(cost) = data.get("cost_usd").and_then(|v| v.as_f64()) {
        return Some(cost);
    }
    data.get("usage").and_then(|u| u.get("cost")).and_then(|v| v.as_f64())
}
