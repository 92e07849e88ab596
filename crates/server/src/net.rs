//! TCP transport front-end.
//!
//! The transport is deliberately thin: one connect line naming the client,
//! an immediate `OK`, then newline-delimited JSON frames in both directions.
//! Everything interesting happens in the session actor; this module only
//! frames bytes and reports the connection lifecycle.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};
use crate::manager::SessionManager;

/// Accept sync connections until `shutdown` is cancelled.
pub async fn serve(
	listener: TcpListener,
	manager: Arc<SessionManager>,
	shutdown: CancellationToken,
) -> std::io::Result<()> {
	if let Ok(addr) = listener.local_addr() {
		tracing::info!(addr = %addr, "sync transport listening");
	}
	loop {
		tokio::select! {
			() = shutdown.cancelled() => {
				tracing::info!("sync transport shutting down");
				return Ok(());
			}
			accepted = listener.accept() => match accepted {
				Ok((stream, _addr)) => {
					let manager = manager.clone();
					tokio::spawn(handle_connection(stream, manager));
				}
				Err(e) => tracing::error!(error = %e, "failed to accept connection"),
			}
		}
	}
}

/// Parse the connect line: `CONNECT /sync?clientId=<id>&lsn=<lsn>`.
///
/// A `GET /sync?... HTTP/1.1` request line parses identically; only the
/// target's query matters. Returns the client id and the raw optional LSN.
pub(crate) fn parse_connect_line(line: &str) -> Result<(String, Option<String>)> {
	let mut parts = line.split_whitespace();
	let _method = parts
		.next()
		.ok_or_else(|| SyncError::InvalidArgument("empty connect line".to_string()))?;
	let target = parts
		.next()
		.ok_or_else(|| SyncError::InvalidArgument("connect line has no target".to_string()))?;

	let url = url::Url::parse(&format!("http://localhost{target}"))
		.map_err(|e| SyncError::InvalidArgument(format!("bad connect target: {e}")))?;

	let mut client_id = None;
	let mut lsn = None;
	for (key, value) in url.query_pairs() {
		match key.as_ref() {
			"clientId" => client_id = Some(value.into_owned()),
			"lsn" => lsn = Some(value.into_owned()),
			_ => {}
		}
	}

	let client_id = client_id
		.filter(|id| !id.is_empty())
		.ok_or_else(|| SyncError::InvalidArgument("missing clientId".to_string()))?;
	Ok((client_id, lsn))
}

async fn handle_connection(stream: TcpStream, manager: Arc<SessionManager>) {
	let peer = stream.peer_addr().ok();
	let (reader, mut writer) = stream.into_split();
	let mut reader = BufReader::new(reader);

	let mut line = String::new();
	match reader.read_line(&mut line).await {
		Ok(0) => return,
		Ok(_) => {}
		Err(e) => {
			tracing::warn!(?peer, error = %e, "failed to read connect line");
			return;
		}
	}

	let (client_id, raw_lsn) = match parse_connect_line(line.trim()) {
		Ok(parsed) => parsed,
		Err(e) => {
			tracing::warn!(?peer, error = %e, "refusing connection");
			let _ = writer.write_all(format!("ERR {e}\n").as_bytes()).await;
			return;
		}
	};

	let (handle, mut outbound, closer) =
		match manager.accept(&client_id, raw_lsn.as_deref()).await {
			Ok(accepted) => accepted,
			Err(e) => {
				tracing::warn!(client_id = %client_id, error = %e, "refusing connection");
				let _ = writer.write_all(format!("ERR {e}\n").as_bytes()).await;
				return;
			}
		};

	// The handshake completes immediately; the sync workflow is already
	// running asynchronously inside the session actor.
	if writer.write_all(b"OK\n").await.is_err() {
		handle.disconnect("handshake write failed", false).await;
		return;
	}
	tracing::info!(client_id = %client_id, ?peer, "sync connection established");

	let writer_closer = closer.clone();
	let writer_task = tokio::spawn(async move {
		loop {
			tokio::select! {
				() = writer_closer.cancelled() => break,
				frame = outbound.recv() => {
					let Some(frame) = frame else { break };
					match tabsync_proto::encode_frame(&frame) {
						Ok(mut text) => {
							text.push('\n');
							if writer.write_all(text.as_bytes()).await.is_err() {
								break;
							}
						}
						Err(e) => tracing::warn!(error = %e, "failed to encode outbound frame"),
					}
				}
			}
		}
		let _ = writer.shutdown().await;
	});

	loop {
		line.clear();
		tokio::select! {
			() = closer.cancelled() => {
				handle.disconnect("closed by server", true).await;
				break;
			}
			read = reader.read_line(&mut line) => match read {
				Ok(0) => {
					handle.disconnect("eof", true).await;
					break;
				}
				Ok(_) => {
					let text = line.trim();
					if text.is_empty() {
						continue;
					}
					match tabsync_proto::decode_frame(text) {
						Ok(frame) => {
							if frame.client_id != client_id {
								tracing::warn!(
									client_id = %client_id,
									frame_client = %frame.client_id,
									"rejecting frame with mismatched clientId"
								);
								continue;
							}
							handle.frame(frame).await;
						}
						Err(e) => {
							tracing::warn!(client_id = %client_id, error = %e, "rejecting malformed frame");
						}
					}
				}
				Err(e) => {
					handle.disconnect(format!("read error: {e}"), false).await;
					break;
				}
			}
		}
	}

	closer.cancel();
	let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_connect_line_with_lsn() {
		let (client_id, lsn) =
			parse_connect_line("CONNECT /sync?clientId=c1&lsn=0/A").unwrap();
		assert_eq!(client_id, "c1");
		assert_eq!(lsn.as_deref(), Some("0/A"));
	}

	#[test]
	fn parses_http_style_request_line() {
		let (client_id, lsn) =
			parse_connect_line("GET /sync?clientId=replica-7 HTTP/1.1").unwrap();
		assert_eq!(client_id, "replica-7");
		assert_eq!(lsn, None);
	}

	#[test]
	fn rejects_missing_client_id() {
		assert!(matches!(
			parse_connect_line("CONNECT /sync?lsn=0/A"),
			Err(SyncError::InvalidArgument(_))
		));
		assert!(matches!(
			parse_connect_line("CONNECT /sync?clientId="),
			Err(SyncError::InvalidArgument(_))
		));
	}

	#[test]
	fn rejects_garbage() {
		assert!(parse_connect_line("").is_err());
		assert!(parse_connect_line("CONNECT").is_err());
	}
}
