//! Newline-delimited JSON framing over one long-lived TCP stream (§4.1).
//!
//! Grounded on the generic read/write shape of `imbolc-net`'s `framing.rs`
//! (length-prefixed there, newline-delimited here per the wire contract) and
//! on the teacher's per-session write discipline in `sharify/websocket.rs`.

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::ServerError;

/// No I/O on a stream for this long closes it (§4.1, §5).
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Reads one newline-terminated JSON frame, or `Ok(None)` on clean EOF.
///
/// A malformed line is still consumed (the caller advances past it and keeps
/// reading); only a read error or the idle deadline ends the stream.
pub async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> Result<Option<String>, ServerError> {
    let mut line = String::new();
    let read = timeout(IDLE_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| ServerError::Transport("idle timeout".into()))??;
    if read == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
    Ok(Some(trimmed))
}

/// Serializes `value` and writes it CRLF-terminated, serialized under the
/// per-handle write mutex so concurrent senders never interleave frames.
pub async fn write_frame(writer: &Mutex<OwnedWriteHalf>, value: &Value) -> Result<(), ServerError> {
    let mut body = serde_json::to_vec(value).map_err(|e| ServerError::Protocol(e.to_string()))?;
    body.extend_from_slice(b"\r\n");
    let mut guard = writer.lock().await;
    guard
        .write_all(&body)
        .await
        .map_err(|e| ServerError::Resource(e.to_string()))
}

/// Writes a pre-built raw frame (used for the fixed TLS refusal, §6).
pub async fn write_raw(writer: &Mutex<OwnedWriteHalf>, bytes: &[u8]) -> Result<(), ServerError> {
    let mut guard = writer.lock().await;
    guard
        .write_all(bytes)
        .await
        .map_err(|e| ServerError::Resource(e.to_string()))
}
