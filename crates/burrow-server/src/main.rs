// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The `burrowd` binary: parses flags, loads or generates the server key,
//! and serves the tunnel router.

use anyhow::Context;
use burrow_common::Key;
use burrow_server::{Options, TunnelServer};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Run a burrow tunnel server.
#[derive(Parser, Debug)]
#[command(name = "burrowd", version, about)]
struct Args {
	/// Enable verbose logging.
	#[arg(short, long, env = "BURROWD_VERBOSE")]
	verbose: bool,

	/// HTTP listen address for the API and tunnel traffic.
	#[arg(short = 'a', long, env = "BURROWD_LISTEN_ADDRESS", default_value = "127.0.0.1:8080")]
	listen_address: SocketAddr,

	/// Base URL, including scheme. All tunnels are subdomains of this host.
	#[arg(short = 'u', long, env = "BURROWD_BASE_URL")]
	base_url: url::Url,

	/// UDP address advertised to clients for wireguard connections, in
	/// host:port form.
	#[arg(long, env = "BURROWD_WIREGUARD_ENDPOINT")]
	wireguard_endpoint: String,

	/// UDP port the wireguard server listens on. Should match the port in
	/// --wireguard-endpoint.
	#[arg(long, env = "BURROWD_WIREGUARD_PORT")]
	wireguard_port: u16,

	/// Base64-encoded private key for the wireguard server. Generate one
	/// with `wg genkey`. Mutually exclusive with --wireguard-key-file.
	#[arg(long, env = "BURROWD_WIREGUARD_KEY", conflicts_with = "wireguard_key_file")]
	wireguard_key: Option<String>,

	/// Path to a file containing the base64-encoded private key. If the
	/// file does not exist a key is generated and written there.
	#[arg(long, env = "BURROWD_WIREGUARD_KEY_FILE")]
	wireguard_key_file: Option<PathBuf>,

	/// MTU of the wireguard interface.
	#[arg(long, env = "BURROWD_WIREGUARD_MTU", default_value_t = 1280)]
	wireguard_mtu: u16,

	/// Virtual IPv6 address of this server inside the wireguard network.
	#[arg(long, env = "BURROWD_WIREGUARD_SERVER_IP")]
	wireguard_server_ip: Option<IpAddr>,

	/// CIDR of the wireguard network; client IPs are derived inside it.
	#[arg(long, env = "BURROWD_WIREGUARD_NETWORK_PREFIX")]
	wireguard_network_prefix: Option<ipnet::Ipv6Net>,

	/// Take the client IP for rate limiting from this header instead of
	/// the remote socket address.
	#[arg(long, env = "BURROWD_REAL_IP_HEADER")]
	real_ip_header: Option<String>,

	/// Timeout in seconds for dialing a peer on an ingress request.
	#[arg(long, env = "BURROWD_PEER_DIAL_TIMEOUT_SECS", default_value_t = 10)]
	peer_dial_timeout_secs: u64,

	/// How often clients should re-register, in seconds.
	#[arg(long, env = "BURROWD_PEER_REGISTER_INTERVAL_SECS", default_value_t = 30)]
	peer_register_interval_secs: u64,

	/// How long an idle peer is kept before eviction, in seconds.
	#[arg(long, env = "BURROWD_PEER_TIMEOUT_SECS", default_value_t = 120)]
	peer_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let default_level = if args.verbose { "debug" } else { "info" };
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| default_level.into()),
		)
		.with(tracing_subscriber::fmt::layer())
		.init();

	let key = load_key(&args).await?;

	let options = Options {
		base_url: Some(args.base_url.clone()),
		wireguard_endpoint: args.wireguard_endpoint.clone(),
		wireguard_port: args.wireguard_port,
		wireguard_key: Some(key),
		wireguard_mtu: args.wireguard_mtu,
		wireguard_server_ip: args.wireguard_server_ip,
		wireguard_network_prefix: args.wireguard_network_prefix,
		real_ip_header: args.real_ip_header.clone(),
		peer_dial_timeout: Duration::from_secs(args.peer_dial_timeout_secs),
		peer_register_interval: Duration::from_secs(args.peer_register_interval_secs),
		peer_timeout: Duration::from_secs(args.peer_timeout_secs),
	};

	let server = TunnelServer::new(options)
		.await
		.context("start tunnel server")?;

	let listener = tokio::net::TcpListener::bind(args.listen_address)
		.await
		.with_context(|| format!("bind {}", args.listen_address))?;
	tracing::info!(listen_address = %args.listen_address, "http server listening");

	let app = server
		.router()
		.into_make_service_with_connect_info::<SocketAddr>();
	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown_signal())
		.await
		.context("serve http")?;

	server.close().await;

	Ok(())
}

async fn load_key(args: &Args) -> anyhow::Result<Key> {
	if let Some(raw) = &args.wireguard_key {
		return Key::from_base64(raw).context("parse --wireguard-key");
	}

	if let Some(path) = &args.wireguard_key_file {
		return burrow_common::load_or_generate_key_file(path)
			.await
			.with_context(|| format!("load key file {}", path.display()));
	}

	anyhow::bail!("either --wireguard-key or --wireguard-key-file is required")
}

async fn shutdown_signal() {
	if let Err(e) = tokio::signal::ctrl_c().await {
		tracing::error!(error = %e, "failed to install ctrl-c handler");
	}
	tracing::info!("shutdown signal received");
}
