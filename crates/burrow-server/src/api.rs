// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Control-plane HTTP API: client registration (current and legacy shapes)
//! plus the host-based router wiring that puts the ingress reverse proxy in
//! front of it.

use crate::error::Result;
use crate::ingress;
use crate::middleware::{set_body_limit, RateLimiter, CONTROL_PLANE_BODY_LIMIT, INGRESS_BODY_LIMIT};
use crate::options::{Options, OptionsError};
use crate::registry::PeerRegistry;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use burrow_common::{
	ClientRegisterRequest, ClientRegisterResponse, LegacyPostTunRequest, LegacyPostTunResponse,
	TunnelVersion,
};
use burrow_engine::WgDevice;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::instrument;

#[derive(Clone)]
pub(crate) struct AppState {
	pub options: Arc<Options>,
	pub base_host: String,
	pub device: Arc<WgDevice>,
	pub registry: Arc<PeerRegistry>,
	pub rate_limiter: Arc<RateLimiter>,
}

/// JSON error response in the shared `{message, detail}` shape.
pub(crate) fn api_response(
	status: StatusCode,
	message: impl Into<String>,
	detail: Option<String>,
) -> Response {
	(
		status,
		Json(burrow_common::Response {
			message: message.into(),
			detail,
		}),
	)
		.into_response()
}

fn invalid_json(rejection: JsonRejection) -> Response {
	api_response(
		StatusCode::BAD_REQUEST,
		"Request body must be valid JSON.",
		Some(rejection.body_text()),
	)
}

pub(crate) fn build_router(state: AppState) -> Router {
	let control = Router::new()
		.route("/", get(get_root))
		.route("/tun", post(post_tun))
		.route("/api/v2/clients", post(post_clients))
		.fallback(not_found)
		.layer(middleware::from_fn_with_state(
			state.clone(),
			control_plane_mw,
		))
		.with_state(state.clone());

	// Outermost first: tracing, the ingress body cap, then the host split.
	// The control-plane limit and rate limiter above never run for
	// tunneled requests.
	control
		.layer(middleware::from_fn_with_state(state, ingress::ingress_mw))
		.layer(middleware::from_fn(ingress_body_limit_mw))
		.layer(DefaultBodyLimit::disable())
		.layer(TraceLayer::new_for_http())
}

async fn ingress_body_limit_mw(mut req: Request, next: Next) -> Response {
	set_body_limit(&mut req, INGRESS_BODY_LIMIT);
	next.run(req).await
}

async fn control_plane_mw(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
	set_body_limit(&mut req, CONTROL_PLANE_BODY_LIMIT);

	let remote = req
		.extensions()
		.get::<ConnectInfo<SocketAddr>>()
		.map(|ConnectInfo(addr)| *addr);
	let key = state.rate_limiter.key_for(req.headers(), remote);
	if !state.rate_limiter.check(&key) {
		return api_response(
			StatusCode::TOO_MANY_REQUESTS,
			state.rate_limiter.denial_message(),
			None,
		);
	}

	next.run(req).await
}

/// Informational root. Only answers on the base host itself; any other
/// host gets the JSON 404 like every unknown route.
async fn get_root(State(state): State<AppState>, req: Request) -> Response {
	let host = ingress::request_host(&req);
	let is_base_host = host
		.as_deref()
		.map(ingress::canonical_host)
		.is_some_and(|h| h == state.base_host);
	if !is_base_host {
		return not_found().await;
	}

	(
		StatusCode::OK,
		[("content-type", "text/plain; charset=utf-8")],
		"https://github.com/ghuntley/burrow\n",
	)
		.into_response()
}

async fn not_found() -> Response {
	api_response(StatusCode::NOT_FOUND, "Not found.", None)
}

#[instrument(skip_all)]
async fn post_clients(
	State(state): State<AppState>,
	payload: std::result::Result<Json<ClientRegisterRequest>, JsonRejection>,
) -> Response {
	let Json(req) = match payload {
		Ok(payload) => payload,
		Err(rejection) => return invalid_json(rejection),
	};

	match register_client(&state, req).await {
		Ok((res, _)) => (StatusCode::OK, Json(res)).into_response(),
		Err(e) => api_response(
			StatusCode::INTERNAL_SERVER_ERROR,
			"Failed to register client.",
			Some(e.to_string()),
		),
	}
}

/// Compatibility endpoint for tunnel clients that predate the v2 API. It
/// forces a version 1 registration and reshapes the response, including the
/// hex-encoded server key.
#[instrument(skip_all)]
async fn post_tun(
	State(state): State<AppState>,
	payload: std::result::Result<Json<LegacyPostTunRequest>, JsonRejection>,
) -> Response {
	let Json(req) = match payload {
		Ok(payload) => payload,
		Err(rejection) => return invalid_json(rejection),
	};

	let register_req = ClientRegisterRequest {
		version: TunnelVersion::V1,
		public_key: req.public_key,
	};

	let (res, exists) = match register_client(&state, register_req).await {
		Ok(result) => result,
		Err(e) => {
			return api_response(
				StatusCode::INTERNAL_SERVER_ERROR,
				"Failed to register client.",
				Some(e.to_string()),
			)
		}
	};

	let hostname = res
		.tunnel_urls
		.first()
		.and_then(|raw| url::Url::parse(raw).ok())
		.and_then(|u| u.host_str().map(str::to_string));
	let Some(hostname) = hostname else {
		return api_response(
			StatusCode::INTERNAL_SERVER_ERROR,
			"No tunnel URLs found.",
			None,
		);
	};

	let status = if exists {
		StatusCode::OK
	} else {
		StatusCode::CREATED
	};
	(
		status,
		Json(LegacyPostTunResponse {
			hostname,
			server_endpoint: res.server_endpoint,
			server_ip: res.server_ip,
			server_public_key: res.server_public_key.to_hex(),
			client_ip: res.client_ip,
		}),
	)
		.into_response()
}

/// Registers (or refreshes) a client and assembles the response both
/// endpoints share. Returns whether the peer already existed.
pub(crate) async fn register_client(
	state: &AppState,
	req: ClientRegisterRequest,
) -> Result<(ClientRegisterResponse, bool)> {
	let (ip, urls) = state
		.options
		.wireguard_public_key_to_ip_and_urls(&req.public_key, req.version)?;

	let exists = state.registry.upsert(req.public_key, ip).await?;

	let server_key = state
		.options
		.wireguard_key
		.as_ref()
		.ok_or(OptionsError::KeyRequired)?;

	Ok((
		ClientRegisterResponse {
			version: req.version,
			poll_every: state.options.peer_register_interval,
			tunnel_urls: urls.iter().map(|u| u.to_string()).collect(),
			client_ip: ip,
			server_endpoint: state.options.wireguard_endpoint.clone(),
			server_ip: state.options.server_ip()?,
			server_public_key: server_key.public(),
			wireguard_mtu: state.options.wireguard_mtu,
		},
		exists,
	))
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::body::Body;
	use axum::http::{header, Request as HttpRequest};
	use burrow_common::Key;
	use burrow_engine::VirtualTun;
	use http_body_util::BodyExt;
	use std::time::Duration;
	use tower::ServiceExt;

	async fn test_state(real_ip_header: Option<&str>) -> AppState {
		let mut options = Options {
			base_url: Some("http://tunnel.dev".parse().unwrap()),
			wireguard_endpoint: "localhost:51820".to_string(),
			wireguard_port: 51820,
			wireguard_key: Some(Key::generate()),
			real_ip_header: real_ip_header.map(str::to_string),
			..Options::default()
		};
		options.validate().unwrap();

		let key = options.wireguard_key.clone().unwrap();
		let tun = VirtualTun::new(options.server_ip().unwrap(), options.wireguard_mtu).unwrap();
		let device = Arc::new(WgDevice::new(tun));
		device
			.ipc_set(&format!("private_key={}", key.to_hex()))
			.await
			.unwrap();

		let registry = Arc::new(PeerRegistry::new(Arc::clone(&device), options.peer_timeout));
		let rate_limiter = Arc::new(RateLimiter::new(
			10,
			Duration::from_secs(10),
			options.real_ip_header.clone(),
		));

		AppState {
			base_host: "tunnel.dev".to_string(),
			options: Arc::new(options),
			device,
			registry,
			rate_limiter,
		}
	}

	fn register_body(key: &Key, version: i64) -> String {
		format!(
			r#"{{"version":{},"public_key":{}}}"#,
			version,
			serde_json::to_string(&key.public()).unwrap()
		)
	}

	fn post_json(path: &str, host: &str, body: String) -> HttpRequest<Body> {
		HttpRequest::post(path)
			.header(header::HOST, host)
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from(body))
			.unwrap()
	}

	async fn body_json(res: axum::response::Response) -> serde_json::Value {
		let bytes = res.into_body().collect().await.unwrap().to_bytes();
		serde_json::from_slice(&bytes).unwrap()
	}

	#[tokio::test]
	async fn register_returns_urls_and_identity() {
		let state = test_state(None).await;
		let router = build_router(state.clone());
		let key = Key::generate();

		let res = router
			.clone()
			.oneshot(post_json("/api/v2/clients", "tunnel.dev", register_body(&key, 0)))
			.await
			.unwrap();
		assert_eq!(res.status(), StatusCode::OK);

		let body = body_json(res).await;
		assert_eq!(body["version"], 2);
		assert_eq!(body["wireguard_mtu"], 1280);
		assert_eq!(body["server_endpoint"], "localhost:51820");
		assert_eq!(body["tunnel_urls"].as_array().unwrap().len(), 2);

		let first_label = body["tunnel_urls"][0]
			.as_str()
			.unwrap()
			.trim_start_matches("http://")
			.split('.')
			.next()
			.unwrap()
			.to_string();
		assert_eq!(first_label.len(), 13);

		// Registering again is idempotent: same identity, no extra peer.
		let res2 = router
			.oneshot(post_json("/api/v2/clients", "tunnel.dev", register_body(&key, 2)))
			.await
			.unwrap();
		assert_eq!(res2.status(), StatusCode::OK);
		let body2 = body_json(res2).await;
		assert_eq!(body2["client_ip"], body["client_ip"]);
		assert_eq!(body2["tunnel_urls"], body["tunnel_urls"]);
		assert_eq!(state.device.peer_count().await, 1);
	}

	#[tokio::test]
	async fn register_version_1_reverses_url_ordering() {
		let state = test_state(None).await;
		let router = build_router(state);
		let key = Key::generate();

		let res = router
			.clone()
			.oneshot(post_json("/api/v2/clients", "tunnel.dev", register_body(&key, 2)))
			.await
			.unwrap();
		let v2 = body_json(res).await;

		let res = router
			.oneshot(post_json("/api/v2/clients", "tunnel.dev", register_body(&key, 1)))
			.await
			.unwrap();
		let v1 = body_json(res).await;

		assert_eq!(v1["version"], 1);
		assert_eq!(v1["tunnel_urls"][0], v2["tunnel_urls"][1]);
		assert_eq!(v1["tunnel_urls"][1], v2["tunnel_urls"][0]);
	}

	#[tokio::test]
	async fn malformed_json_is_a_400() {
		let state = test_state(None).await;
		let router = build_router(state);

		let res = router
			.oneshot(post_json(
				"/api/v2/clients",
				"tunnel.dev",
				"{not json".to_string(),
			))
			.await
			.unwrap();
		assert_eq!(res.status(), StatusCode::BAD_REQUEST);

		let body = body_json(res).await;
		assert_eq!(body["message"], "Request body must be valid JSON.");
	}

	#[tokio::test]
	async fn legacy_tun_splits_created_and_ok() {
		let state = test_state(None).await;
		let router = build_router(state);

		let key = Key::from_base64("mCW7PwpK8iBmyXEFyGk55G24H0IU/AmJf5ZerzA3jGY=").unwrap();
		let body = format!(
			r#"{{"public_key":{}}}"#,
			serde_json::to_string(&key.public()).unwrap()
		);

		let res = router
			.clone()
			.oneshot(post_json("/tun", "tunnel.dev", body.clone()))
			.await
			.unwrap();
		assert_eq!(res.status(), StatusCode::CREATED);

		let json = body_json(res).await;
		let hostname = json["hostname"].as_str().unwrap();
		assert_eq!(
			hostname.split('.').next().unwrap(),
			"fccabbaf8a9b77f93fa9fa657677155e"
		);
		// Legacy responses hex-encode the server key.
		assert_eq!(json["server_public_key"].as_str().unwrap().len(), 64);

		let res = router
			.oneshot(post_json("/tun", "tunnel.dev", body))
			.await
			.unwrap();
		assert_eq!(res.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn unknown_routes_and_hosts_get_json_404() {
		let state = test_state(None).await;
		let router = build_router(state);

		let res = router
			.clone()
			.oneshot(
				HttpRequest::get("/nope")
					.header(header::HOST, "tunnel.dev")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(res.status(), StatusCode::NOT_FOUND);
		assert_eq!(body_json(res).await["message"], "Not found.");

		let res = router
			.oneshot(
				HttpRequest::get("/")
					.header(header::HOST, "unknown-host")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(res.status(), StatusCode::NOT_FOUND);
		assert_eq!(body_json(res).await["message"], "Not found.");
	}

	#[tokio::test]
	async fn root_on_the_base_host_is_informational() {
		let state = test_state(None).await;
		let router = build_router(state);

		let res = router
			.oneshot(
				HttpRequest::get("/")
					.header(header::HOST, "tunnel.dev")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(res.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn ingress_to_unregistered_peer_is_502() {
		let state = test_state(None).await;
		let router = build_router(state);

		let res = router
			.oneshot(
				HttpRequest::get("/")
					.header(header::HOST, "4mh8kgpei4ak6.tunnel.dev")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
		assert_eq!(body_json(res).await["message"], "Peer is not connected.");
	}

	#[tokio::test]
	async fn ingress_with_undecodable_label_is_400() {
		let state = test_state(None).await;
		let router = build_router(state);

		let res = router
			.oneshot(
				HttpRequest::get("/")
					.header(header::HOST, "!!!bad!!!.tunnel.dev")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(res.status(), StatusCode::BAD_REQUEST);
		assert_eq!(body_json(res).await["message"], "Invalid tunnel URL.");
	}

	#[tokio::test]
	async fn control_plane_is_rate_limited_per_source() {
		let state = test_state(Some("X-Forwarded-For")).await;
		let router = build_router(state);
		let key = Key::generate();

		for i in 0..11 {
			// Different addresses inside one /64 share a bucket.
			let res = router
				.clone()
				.oneshot(
					HttpRequest::post("/api/v2/clients")
						.header(header::HOST, "tunnel.dev")
						.header(header::CONTENT_TYPE, "application/json")
						.header("X-Forwarded-For", format!("2001:db8:aaaa:bbbb::{:x}", i + 1))
						.body(Body::from(register_body(&key, 2)))
						.unwrap(),
				)
				.await
				.unwrap();

			if i < 10 {
				assert_eq!(res.status(), StatusCode::OK, "request {i}");
			} else {
				assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
				let body = body_json(res).await;
				assert_eq!(
					body["message"],
					"You've been rate limited for sending more than 10 requests in 10s."
				);
			}
		}
	}
}
