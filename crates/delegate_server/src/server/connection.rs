#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::BytesMut;
use delegate_protocol::framing::try_split_frame;
use delegate_protocol::{CommandFrame, DEFAULT_MAX_FRAME_SIZE, FramingError, ResponseFrame, codes, encode_frame};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::dispatcher::{Dispatcher, ServerContext};
use crate::server::session::ConnectionHandle;

/// Outbound queue depth per connection. Events beyond this are dropped
/// rather than blocking the fan-out.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Drive one accepted TCP connection until quit or transport loss.
///
/// A writer task owns the write half and drains the outbound queue; the
/// reader loop splits frames off the read half and feeds the dispatcher.
/// Responses and broadcast events share the same queue, so per-connection
/// ordering holds across both.
pub async fn handle_connection(conn_id: u64, stream: TcpStream, ctx: Arc<ServerContext>) -> anyhow::Result<()> {
	let (mut reader, mut writer) = stream.into_split();
	let (tx, mut rx) = mpsc::channel::<Value>(OUTBOUND_QUEUE_DEPTH);

	let writer_task = tokio::spawn(async move {
		while let Some(value) = rx.recv().await {
			let frame = match encode_frame(&value, DEFAULT_MAX_FRAME_SIZE) {
				Ok(frame) => frame,
				Err(e) => {
					warn!(conn_id, error = %e, "dropping unencodable outbound frame");
					continue;
				}
			};
			if let Err(e) = writer.write_all(&frame).await {
				debug!(conn_id, error = %e, "outbound write failed");
				break;
			}
			metrics::counter!("delegate_server_frames_out_total").increment(1);
		}
	});

	let handle = ConnectionHandle {
		conn_id,
		tx: tx.clone(),
	};
	let mut dispatcher = Dispatcher::new(ctx, handle);

	let mut buf = BytesMut::with_capacity(4 * 1024);
	let mut clean_close = false;

	'read: loop {
		match reader.read_buf(&mut buf).await {
			Ok(0) => break,
			Ok(_) => {}
			Err(e) => {
				debug!(conn_id, error = %e, "read failed");
				break;
			}
		}

		loop {
			let payload = match try_split_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE) {
				Ok(Some(payload)) => payload,
				Ok(None) => break,
				Err(e @ FramingError::FrameTooLarge { .. }) => {
					warn!(conn_id, error = %e, "closing connection on oversized frame");
					let _ = tx.send(json_error(&e)).await;
					break 'read;
				}
				Err(e) => {
					let _ = tx.send(json_error(&e)).await;
					continue;
				}
			};
			metrics::counter!("delegate_server_frames_in_total").increment(1);

			let raw = String::from_utf8_lossy(&payload);
			let frame = match CommandFrame::parse(&raw) {
				Ok(frame) => frame,
				Err(e) => {
					let _ = tx.send(json_error(&e)).await;
					continue;
				}
			};

			let response = dispatcher.dispatch(frame).await;
			if tx.send(response.to_value()).await.is_err() {
				break 'read;
			}

			if dispatcher.is_closed() {
				clean_close = true;
				break 'read;
			}
		}
	}

	if !clean_close {
		dispatcher.connection_lost().await;
	}

	drop(tx);
	let _ = writer_task.await;
	debug!(conn_id, clean_close, "connection finished");
	Ok(())
}

fn json_error(e: &FramingError) -> Value {
	ResponseFrame::new(codes::server::JSON_ERROR)
		.with("message", json!(e.to_string()))
		.to_value()
}
