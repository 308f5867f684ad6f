// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! End-to-end tests: a real server and client talking WireGuard over
//! loopback UDP, with HTTP requests proxied through the tunnel.

use burrow_client::{Client, Tunnel, TunnelConfig};
use burrow_common::{Key, TunnelVersion};
use burrow_server::{Options, TunnelServer};
use http_body_util::Full;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

struct TestServer {
	server: Arc<TunnelServer>,
	http_addr: SocketAddr,
}

impl TestServer {
	fn api_url(&self) -> Url {
		Url::parse(&format!("http://{}", self.http_addr)).unwrap()
	}

	fn client(&self) -> Client {
		Client::new(self.api_url())
	}

	/// An HTTP client that disregards DNS and always connects to the test
	/// server, so generated tunnel hostnames resolve.
	fn tunnel_http_client(&self, hosts: &[String]) -> reqwest::Client {
		let mut builder = reqwest::Client::builder().pool_max_idle_per_host(0);
		for host in hosts {
			builder = builder.resolve(host, self.http_addr);
		}
		builder.build().unwrap()
	}
}

fn free_udp_port() -> u16 {
	let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
	socket.local_addr().unwrap().port()
}

async fn start_server(mut options: Options) -> TestServer {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let http_addr = listener.local_addr().unwrap();

	// Tunnel URLs must carry the real HTTP port: the test HTTP client only
	// overrides DNS for the generated hostnames, not ports.
	match &mut options.base_url {
		Some(url) => url.set_port(Some(http_addr.port())).unwrap(),
		None => {
			options.base_url =
				Some(Url::parse(&format!("http://tunnel.dev:{}", http_addr.port())).unwrap());
		}
	}
	if options.wireguard_endpoint.is_empty() && options.wireguard_port == 0 {
		let port = free_udp_port();
		options.wireguard_endpoint = format!("127.0.0.1:{port}");
		options.wireguard_port = port;
	}
	if options.wireguard_key.is_none() {
		options.wireguard_key = Some(Key::generate());
	}

	let server = Arc::new(TunnelServer::new(options).await.unwrap());

	let app = server
		.router()
		.into_make_service_with_connect_info::<SocketAddr>();
	tokio::spawn(async move {
		let _ = axum::serve(listener, app).await;
	});

	TestServer { server, http_addr }
}

/// Serves `hello world <path>` on every connection accepted from the
/// tunnel.
fn serve_tunnel(tunnel: Arc<Tunnel>) {
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = tunnel.accept().await else {
				break;
			};

			tokio::spawn(async move {
				let service = hyper::service::service_fn(
					|req: hyper::Request<hyper::body::Incoming>| async move {
						let body = format!("hello world {}", req.uri().path());
						Ok::<_, std::convert::Infallible>(
							hyper::Response::builder()
								.header("content-type", "text/plain")
								.body(Full::new(axum::body::Bytes::from(body)))
								.unwrap(),
						)
					},
				);

				let _ = hyper::server::conn::http1::Builder::new()
					.serve_connection(TokioIo::new(stream), service)
					.await;
			});
		}
	});
}

async fn wait_for_tunnel_ready(http: &reqwest::Client, url: &Url) {
	let deadline = Instant::now() + Duration::from_secs(30);
	loop {
		let res = http
			.get(url.clone())
			.timeout(Duration::from_secs(1))
			.send()
			.await;
		if let Ok(res) = res {
			if res.status().as_u16() == 200 {
				return;
			}
		}
		assert!(Instant::now() < deadline, "tunnel never became ready");
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
}

fn hosts_with_prefix_variants(tunnel: &Tunnel) -> Vec<String> {
	let mut hosts = Vec::new();
	for url in std::iter::once(&tunnel.url).chain(tunnel.other_urls.iter()) {
		let host = url.host_str().unwrap().to_string();
		hosts.push(format!("prefix--{host}"));
		hosts.push(host);
	}
	hosts
}

// E1: 1024 concurrent requests across both URL forms, a third of them with
// a human-friendly prefix, all return the echoed path.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_to_end_round_trip() {
	let ts = start_server(Options::default()).await;

	let client = ts.client();
	let tunnel = client
		.launch_tunnel(TunnelConfig::new(Key::generate()))
		.await
		.unwrap();
	assert_eq!(tunnel.other_urls.len(), 1);
	assert_ne!(tunnel.url, tunnel.other_urls[0]);

	let tunnel = Arc::new(tunnel);
	serve_tunnel(Arc::clone(&tunnel));

	let hosts = hosts_with_prefix_variants(&tunnel);
	let http = ts.tunnel_http_client(&hosts);
	wait_for_tunnel_ready(&http, &tunnel.url).await;

	let mut tasks = tokio::task::JoinSet::new();
	for i in 0..1024usize {
		let http = http.clone();
		// Half to the primary URL, half to the compatibility URL.
		let base = if i % 2 == 0 {
			tunnel.other_urls[0].clone()
		} else {
			tunnel.url.clone()
		};

		tasks.spawn(async move {
			let mut url = base.join(&format!("/test/{i}")).unwrap();
			// A third of the requests carry a hostname prefix.
			if i % 3 == 0 {
				let host = format!("prefix--{}", url.host_str().unwrap());
				url.set_host(Some(&host)).unwrap();
			}

			let res = http
				.get(url)
				.timeout(Duration::from_secs(30))
				.send()
				.await
				.unwrap();
			assert_eq!(res.status().as_u16(), 200);
			assert_eq!(res.text().await.unwrap(), format!("hello world /test/{i}"));
		});
	}
	while let Some(result) = tasks.join_next().await {
		result.unwrap();
	}

	tunnel.close();
	tunnel.closed().await;
	ts.server.close().await;
}

// E2: the legacy /tun endpoint returns the pinned legacy hostname and a
// hex server key for a known client key.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn legacy_register_compatibility() {
	let ts = start_server(Options {
		base_url: Some("http://localhost.com".parse().unwrap()),
		..Options::default()
	})
	.await;

	let key = Key::from_base64("mCW7PwpK8iBmyXEFyGk55G24H0IU/AmJf5ZerzA3jGY=").unwrap();
	let body = format!(
		r#"{{"public_key":{}}}"#,
		serde_json::to_string(&key.public()).unwrap()
	);

	let res = reqwest::Client::new()
		.post(ts.api_url().join("/tun").unwrap())
		.header("content-type", "application/json")
		.body(body)
		.send()
		.await
		.unwrap();
	assert_eq!(res.status().as_u16(), 201);

	let json: serde_json::Value = res.json().await.unwrap();
	let hostname = json["hostname"].as_str().unwrap();
	assert_eq!(
		hostname.split('.').next().unwrap(),
		"fccabbaf8a9b77f93fa9fa657677155e"
	);

	let server_key_hex = json["server_public_key"].as_str().unwrap();
	assert_eq!(
		server_key_hex,
		ts.server.options().wireguard_key.as_ref().unwrap().public().to_hex()
	);

	ts.server.close().await;
}

// E3: version 1 on the v2 endpoint returns the legacy 32-character label
// first; version 2 leads with the 13-character short label.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn version_ordering_on_v2_endpoint() {
	let ts = start_server(Options::default()).await;
	let client = ts.client();

	let key = Key::from_base64("mCW7PwpK8iBmyXEFyGk55G24H0IU/AmJf5ZerzA3jGY=").unwrap();

	let v1 = client
		.client_register(&burrow_common::ClientRegisterRequest {
			version: TunnelVersion::V1,
			public_key: key.public(),
		})
		.await
		.unwrap();
	let v1_host = Url::parse(&v1.tunnel_urls[0]).unwrap();
	assert_eq!(
		v1_host.host_str().unwrap().split('.').next().unwrap().len(),
		32
	);

	let v2 = client
		.client_register(&burrow_common::ClientRegisterRequest {
			version: TunnelVersion::V2,
			public_key: key.public(),
		})
		.await
		.unwrap();
	let v2_host = Url::parse(&v2.tunnel_urls[0]).unwrap();
	assert_eq!(
		v2_host.host_str().unwrap().split('.').next().unwrap().len(),
		13
	);

	// Same identity either way, just reordered.
	assert_eq!(v1.client_ip, v2.client_ip);
	assert_eq!(v1.tunnel_urls[0], v2.tunnel_urls[1]);
	assert_eq!(v1.tunnel_urls[1], v2.tunnel_urls[0]);

	ts.server.close().await;
}

// E4: a request for an unknown host gets the JSON 404.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_host_is_not_found() {
	let ts = start_server(Options::default()).await;

	let http = ts.tunnel_http_client(&["unknown-host".to_string()]);
	let res = http
		.get(format!("http://unknown-host:{}/", ts.http_addr.port()))
		.send()
		.await
		.unwrap();
	assert_eq!(res.status().as_u16(), 404);

	let json: serde_json::Value = res.json().await.unwrap();
	assert_eq!(json["message"], "Not found.");

	ts.server.close().await;
}

// E5: once a closed tunnel has aged past the inactivity timeout, requests
// fail fast with 502 instead of hanging on the dial.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_peer_fails_fast() {
	let ts = start_server(Options {
		peer_dial_timeout: Duration::from_secs(1),
		peer_register_interval: Duration::from_millis(500),
		peer_timeout: Duration::from_secs(1),
		..Options::default()
	})
	.await;

	let client = ts.client();
	let tunnel = client
		.launch_tunnel(TunnelConfig::new(Key::generate()))
		.await
		.unwrap();

	let hosts = vec![tunnel.url.host_str().unwrap().to_string()];
	let url = tunnel.url.join("/test/1").unwrap();

	tunnel.close();
	tunnel.closed().await;

	// Wait out twice the inactivity timeout so the sweep runs.
	tokio::time::sleep(Duration::from_secs(2)).await;

	let http = ts.tunnel_http_client(&hosts);
	let started = Instant::now();
	let res = http
		.get(url)
		.timeout(Duration::from_secs(5))
		.send()
		.await
		.unwrap();

	assert_eq!(res.status().as_u16(), 502);
	assert!(started.elapsed() < Duration::from_secs(3));

	let json: serde_json::Value = res.json().await.unwrap();
	assert_eq!(json["message"], "Peer is not connected.");

	ts.server.close().await;
}

// E6: eleven registrations from one IPv6 /64 inside the window yield ten
// 200s and one 429.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn control_plane_rate_limit() {
	let ts = start_server(Options {
		real_ip_header: Some("X-Forwarded-For".to_string()),
		..Options::default()
	})
	.await;

	let key = Key::generate();
	let body = format!(
		r#"{{"version":2,"public_key":{}}}"#,
		serde_json::to_string(&key.public()).unwrap()
	);

	let http = reqwest::Client::new();
	let url = ts.api_url().join("/api/v2/clients").unwrap();

	let mut ok = 0;
	let mut limited = 0;
	for i in 0..11 {
		let res = http
			.post(url.clone())
			.header("content-type", "application/json")
			.header("X-Forwarded-For", format!("2001:db8:1:2::{:x}", i + 1))
			.body(body.clone())
			.send()
			.await
			.unwrap();

		match res.status().as_u16() {
			200 => ok += 1,
			429 => limited += 1,
			other => panic!("unexpected status {other}"),
		}
	}

	assert_eq!(ok, 10);
	assert_eq!(limited, 1);

	ts.server.close().await;
}
