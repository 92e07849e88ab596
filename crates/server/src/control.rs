//! Control endpoints for operators.
//!
//! A small blocking HTTP server on its own thread, separate from the sync
//! transport: `GET /metrics` for counters and client registrations,
//! `POST /new-changes?clientId=<id>` to force a feed pass, and
//! `POST /sync-stats?clientId=<id>` to push a stats frame to a connected
//! client. Everything served here is advisory.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use tabsync_proto::Lsn;
use tiny_http::{Method, Request, Response, Server};

use crate::db::ChangeFeed;
use crate::manager::SessionManager;

/// Start the control server on `addr`; serves until the process exits.
pub fn spawn(
	addr: SocketAddr,
	manager: Arc<SessionManager>,
	runtime: tokio::runtime::Handle,
) -> std::io::Result<std::thread::JoinHandle<()>> {
	let server = Server::http(addr).map_err(std::io::Error::other)?;
	tracing::info!(addr = %addr, "control endpoints listening");
	Ok(std::thread::spawn(move || serve_loop(&server, &manager, &runtime)))
}

fn serve_loop(server: &Server, manager: &Arc<SessionManager>, runtime: &tokio::runtime::Handle) {
	for request in server.incoming_requests() {
		let response = route(&request, manager, runtime);
		if let Err(e) = request.respond(response) {
			tracing::warn!(error = %e, "failed to respond to control request");
		}
	}
}

fn route(
	request: &Request,
	manager: &Arc<SessionManager>,
	runtime: &tokio::runtime::Handle,
) -> Response<Cursor<Vec<u8>>> {
	let Ok(url) = url::Url::parse(&format!("http://localhost{}", request.url())) else {
		return json_response(400, &serde_json::json!({ "error": "bad request" }));
	};
	let client_id = url
		.query_pairs()
		.find(|(k, _)| k == "clientId")
		.map(|(_, v)| v.into_owned());

	match (request.method(), url.path()) {
		(&Method::Get, "/metrics") => metrics(manager),
		(&Method::Post, "/new-changes") => match client_id {
			Some(client_id) => new_changes(manager, runtime, &client_id),
			None => json_response(400, &serde_json::json!({ "error": "missing clientId" })),
		},
		(&Method::Post, "/sync-stats") => match client_id {
			Some(client_id) => sync_stats(manager, runtime, &client_id),
			None => json_response(400, &serde_json::json!({ "error": "missing clientId" })),
		},
		_ => json_response(404, &serde_json::json!({ "error": "not found" })),
	}
}

fn metrics(manager: &Arc<SessionManager>) -> Response<Cursor<Vec<u8>>> {
	let deps = manager.deps();
	let clients: Vec<serde_json::Value> = deps
		.registry
		.snapshot()
		.into_iter()
		.map(|reg| {
			serde_json::json!({
				"clientId": reg.client_id,
				"active": reg.active,
				"lastSeen": reg.last_seen.timestamp_millis(),
				"lastAckedLSN": reg.last_acked_lsn,
				"syncState": reg.phase,
			})
		})
		.collect();

	let mut body = deps.metrics.snapshot();
	body["clients"] = serde_json::Value::Array(clients);
	json_response(200, &body)
}

/// Force one feed pass and report what the feed currently holds.
fn new_changes(
	manager: &Arc<SessionManager>,
	runtime: &tokio::runtime::Handle,
	client_id: &str,
) -> Response<Cursor<Vec<u8>>> {
	let deps = manager.deps().clone();
	let manager = manager.clone();
	let client_id = client_id.to_string();
	let body = runtime.block_on(async move {
		let since = deps
			.registry
			.get(&client_id)
			.map_or(Lsn::ZERO, |reg| reg.last_acked_lsn);
		let pending = match deps.feed.changes_since(since, deps.config.chunk_size).await {
			Ok(page) => page.items.len(),
			Err(e) => {
				tracing::warn!(client_id = %client_id, error = %e, "feed peek failed");
				0
			}
		};
		let lsn = deps
			.feed
			.current_server_lsn()
			.await
			.unwrap_or(Lsn::ZERO);
		let woke = manager.notify(&client_id, lsn).await;
		serde_json::json!({
			"success": woke,
			"changeCount": pending,
			"lsn": lsn,
		})
	});
	json_response(200, &body)
}

fn sync_stats(
	manager: &Arc<SessionManager>,
	runtime: &tokio::runtime::Handle,
	client_id: &str,
) -> Response<Cursor<Vec<u8>>> {
	let handle = manager.get(client_id);
	let success = match handle {
		Some(handle) => {
			runtime.block_on(handle.push_stats());
			true
		}
		None => false,
	};
	json_response(200, &serde_json::json!({ "success": success }))
}

fn json_response(status: u16, body: &serde_json::Value) -> Response<Cursor<Vec<u8>>> {
	let mut response = Response::from_string(body.to_string()).with_status_code(status);
	if let Ok(header) =
		tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
	{
		response.add_header(header);
	}
	response
}
