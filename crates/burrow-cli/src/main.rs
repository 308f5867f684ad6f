// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The `burrow` binary: launches a tunnel and bridges every connection
//! arriving on the virtual port to a local TCP service.

use anyhow::Context;
use burrow_client::{Client, ClientError, Tunnel, TunnelConfig};
use burrow_common::{Key, TunnelVersion};
use burrow_engine::EngineError;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Expose a local TCP service at a stable public URL through a burrow
/// tunnel server.
#[derive(Parser, Debug)]
#[command(name = "burrow", version, about)]
struct Args {
	/// Enable verbose logging.
	#[arg(short, long, env = "BURROW_VERBOSE")]
	verbose: bool,

	/// Base URL of the tunnel server API.
	#[arg(long, env = "BURROW_API_URL")]
	api_url: url::Url,

	/// Base64-encoded WireGuard private key. Mutually exclusive with
	/// --wireguard-key-file.
	#[arg(long, env = "BURROW_WIREGUARD_KEY", conflicts_with = "wireguard_key_file")]
	wireguard_key: Option<String>,

	/// Path to a file holding the private key. Created with a fresh key if
	/// it does not exist. Keep the file to keep your hostname.
	#[arg(long, env = "BURROW_WIREGUARD_KEY_FILE")]
	wireguard_key_file: Option<PathBuf>,

	/// Local address to forward tunneled connections to, in host:port form.
	#[arg(short, long, env = "BURROW_TARGET")]
	target: String,

	/// Registration protocol version (1 or 2).
	#[arg(long, env = "BURROW_PROTOCOL_VERSION", default_value_t = 2)]
	protocol_version: i64,
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

	let client = Client::new(args.api_url.clone());
	let tunnel = client
		.launch_tunnel(TunnelConfig {
			private_key: key,
			version: TunnelVersion::from_wire(args.protocol_version),
		})
		.await
		.context("launch tunnel")?;

	println!("tunnel running at {}", tunnel.url);
	for url in &tunnel.other_urls {
		println!("             also {url}");
	}
	println!("forwarding to {}", args.target);

	let tunnel = Arc::new(tunnel);
	let accept_tunnel = Arc::clone(&tunnel);
	let target = args.target.clone();
	tokio::spawn(async move {
		serve_tunnel(accept_tunnel, target).await;
	});

	tokio::select! {
		result = tokio::signal::ctrl_c() => {
			result.context("install ctrl-c handler")?;
			tracing::info!("interrupt received, closing tunnel");
		}
		_ = tunnel.closed() => {
			tracing::warn!("tunnel closed by server side");
		}
	}

	tunnel.close();
	tunnel.closed().await;

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

/// Accepts tunneled connections and bridges each one to the local target.
async fn serve_tunnel(tunnel: Arc<Tunnel>, target: String) {
	loop {
		match tunnel.accept().await {
			Ok((mut stream, remote)) => {
				tracing::debug!(%remote, "accepted tunneled connection");

				let target = target.clone();
				tokio::spawn(async move {
					let mut local = match tokio::net::TcpStream::connect(&target).await {
						Ok(local) => local,
						Err(e) => {
							tracing::warn!(target, error = %e, "failed to connect to local target");
							return;
						}
					};

					match tokio::io::copy_bidirectional(&mut stream, &mut local).await {
						Ok((to_local, from_local)) => {
							tracing::debug!(to_local, from_local, "bridged connection finished");
						}
						Err(e) => {
							tracing::debug!(error = %e, "bridged connection errored");
						}
					}
				});
			}
			Err(ClientError::Engine(EngineError::ListenerClosed)) => {
				tracing::debug!("tunnel listener closed, stopping accept loop");
				break;
			}
			Err(e) => {
				tracing::warn!(error = %e, "accept failed");
				break;
			}
		}
	}
}
