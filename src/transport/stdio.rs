//! Newline-delimited JSON-RPC over a reader/writer pair
//!
//! Each line read is one JSON-RPC message or batch. Responses and
//! server-initiated notifications are written one JSON document per line.
//! Logging must go to stderr when this runs on the process stdio.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, info, warn};

use crate::errors::TransportError;
use crate::mcp::rpc::{json_rpc_error_without_id, INVALID_REQUEST, PARSE_ERROR};
use crate::mcp::server::ProtocolHandler;

/// Serves `handler` until `reader` reaches end of input.
pub async fn serve<R, W>(
    handler: Arc<dyn ProtocolHandler>,
    reader: R,
    mut writer: W,
) -> Result<(), TransportError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut notifications = handler.subscribe();
    let mut notifications_open = true;
    let mut handled = 0usize;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };

                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                handled += 1;
                if let Some(response) = handle_line(handler.as_ref(), line).await {
                    write_message(&mut writer, &response).await?;
                }
            }
            notification = notifications.recv(), if notifications_open => match notification {
                Ok(message) => write_message(&mut writer, &message).await?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "stdio writer lagged, skipped notifications");
                }
                Err(RecvError::Closed) => notifications_open = false,
            },
        }
    }

    // Flush notifications raised by the final messages before exiting.
    loop {
        match notifications.try_recv() {
            Ok(message) => write_message(&mut writer, &message).await?,
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "stdio writer lagged, skipped notifications");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }

    writer.flush().await?;
    info!(messages = handled, "stdio input closed");
    Ok(())
}

/// Handles one input line. Returns `None` when nothing must be written back.
pub async fn handle_line(handler: &dyn ProtocolHandler, line: &str) -> Option<Value> {
    let payload: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, "discarding unparsable stdio line");
            return Some(json_rpc_error_without_id(PARSE_ERROR, "Parse error"));
        }
    };

    match payload {
        Value::Array(batch) if batch.is_empty() => {
            Some(json_rpc_error_without_id(INVALID_REQUEST, "Invalid Request"))
        }
        Value::Array(batch) => {
            let mut responses = Vec::new();
            for message in batch {
                if let Some(response) = handler.handle_message(message).await {
                    responses.push(response);
                }
            }
            (!responses.is_empty()).then_some(Value::Array(responses))
        }
        message => handler.handle_message(message).await,
    }
}

async fn write_message<W>(writer: &mut W, message: &Value) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
