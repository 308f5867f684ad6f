// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Host-based ingress routing. A request whose host is a subdomain of the
//! base URL is decoded to a virtual IPv6 address and reverse proxied over
//! the userspace WireGuard stack to the peer's listener on the tunnel
//! port; everything else falls through to the control plane.

use crate::api::{api_response, AppState};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::uri::Uri;
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use burrow_common::net::split_host_port;
use burrow_common::TUNNEL_PORT;
use hyper_util::rt::TokioIo;
use std::net::{Ipv6Addr, SocketAddrV6};
use tracing::{debug, instrument};

pub(crate) async fn ingress_mw(State(state): State<AppState>, req: Request, next: Next) -> Response {
	let Some(host) = request_host(&req) else {
		return api_response(StatusCode::BAD_REQUEST, "Missing Host header.", None);
	};

	let (subdomain, rest) = split_hostname(&host);
	if rest != state.base_host {
		// Not a tunnel request.
		return next.run(req).await;
	}

	// A human-friendly prefix may precede the identifier, separated by
	// hyphens; only the last segment matters.
	let label = subdomain.rsplit('-').next().unwrap_or(subdomain);
	let ip = match state.options.hostname_to_wireguard_ip(label) {
		Ok(ip) => ip,
		Err(e) => {
			return api_response(
				StatusCode::BAD_REQUEST,
				"Invalid tunnel URL.",
				Some(e.to_string()),
			)
		}
	};

	let Some(peer) = state.registry.lookup(ip).await else {
		return peer_not_connected();
	};
	if !state.registry.is_fresh(&peer) {
		return peer_not_connected();
	}
	// The registry is only a cache; the device may have dropped the peer
	// since the last sweep.
	if state.device.lookup_peer(&peer.public_key).await.is_none() {
		return peer_not_connected();
	}

	proxy_request(&state, ip, req).await
}

fn peer_not_connected() -> Response {
	api_response(StatusCode::BAD_GATEWAY, "Peer is not connected.", None)
}

/// Dials the peer's tunnel port through the virtual network and streams the
/// request over a dedicated HTTP/1 connection, preserving the original
/// host.
#[instrument(skip(state, req), fields(%ip))]
async fn proxy_request(state: &AppState, ip: Ipv6Addr, req: Request) -> Response {
	let addr = SocketAddrV6::new(ip, TUNNEL_PORT, 0, 0);

	let dial = tokio::time::timeout(
		state.options.peer_dial_timeout,
		state.device.tcp_connect(addr),
	)
	.await;
	let stream = match dial {
		Ok(Ok(stream)) => stream,
		Ok(Err(e)) => return failed_to_dial(e.to_string()),
		Err(_) => {
			return failed_to_dial(format!(
				"dial timed out after {:?}",
				state.options.peer_dial_timeout
			))
		}
	};

	let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await
	{
		Ok(pair) => pair,
		Err(e) => return failed_to_dial(e.to_string()),
	};
	tokio::spawn(async move {
		if let Err(e) = conn.await {
			debug!(error = %e, "proxy connection closed");
		}
	});

	// Rewrite to origin form; the peer sees plain http with the original
	// Host header.
	let (mut parts, body) = req.into_parts();
	let authority = parts.uri.authority().map(|a| a.as_str().to_string());
	let path_and_query = parts
		.uri
		.path_and_query()
		.map(|pq| pq.as_str())
		.unwrap_or("/");
	parts.uri = match Uri::try_from(path_and_query) {
		Ok(uri) => uri,
		Err(e) => return failed_to_dial(e.to_string()),
	};
	if !parts.headers.contains_key(header::HOST) {
		if let Some(value) = authority.and_then(|a| a.parse().ok()) {
			parts.headers.insert(header::HOST, value);
		}
	}

	match sender.send_request(Request::from_parts(parts, body)).await {
		Ok(res) => res.map(Body::new).into_response(),
		Err(e) => failed_to_dial(e.to_string()),
	}
}

fn failed_to_dial(detail: String) -> Response {
	api_response(StatusCode::BAD_GATEWAY, "Failed to dial peer.", Some(detail))
}

pub(crate) fn request_host(req: &Request) -> Option<String> {
	if let Some(host) = req
		.headers()
		.get(header::HOST)
		.and_then(|v| v.to_str().ok())
	{
		return Some(host.to_string());
	}

	// HTTP/2 carries the host in the :authority pseudo-header, which lands
	// on the request URI.
	req.uri().authority().map(|a| a.as_str().to_string())
}

/// Strips port data and leading/trailing dots from a hostname.
pub(crate) fn canonical_host(hostname: &str) -> &str {
	let hostname = hostname.trim_matches('.');
	match split_host_port(hostname) {
		Some((host, _)) => host,
		None => hostname,
	}
}

/// Splits a hostname into the first label and the rest, stripping any port
/// and leading or trailing dots.
fn split_hostname(hostname: &str) -> (&str, &str) {
	let hostname = canonical_host(hostname);

	match hostname.split_once('.') {
		Some((subdomain, rest)) => (subdomain, rest),
		None => (hostname, ""),
	}
}
