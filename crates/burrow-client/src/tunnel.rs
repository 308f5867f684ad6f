// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Tunnel lifecycle: register with the server, bring up the client-side
//! WireGuard device with the server as sole peer, listen on the virtual
//! tunnel port, and keep re-registering until closed.

use crate::client::Client;
use crate::error::{ClientError, Result};
use burrow_common::net::split_host_port;
use burrow_common::{ClientRegisterRequest, Key, TunnelVersion, TUNNEL_PORT};
use burrow_engine::{VirtualTcpListener, VirtualTcpStream, VirtualTun, WgDevice};
use std::net::SocketAddrV6;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use url::Url;

const DEFAULT_REREGISTER_INTERVAL: Duration = Duration::from_secs(30);
const PERSISTENT_KEEPALIVE_SECS: u16 = 21;

pub struct TunnelConfig {
	/// The client's WireGuard private key. Reusing it across sessions
	/// keeps the tunnel hostname stable.
	pub private_key: Key,
	/// Protocol version to register with; controls tunnel URL ordering.
	pub version: TunnelVersion,
}

impl TunnelConfig {
	pub fn new(private_key: Key) -> Self {
		Self {
			private_key,
			version: TunnelVersion::LATEST,
		}
	}
}

/// A live tunnel. Teardown happens on [`Tunnel::close`] (or drop); await
/// [`Tunnel::closed`] to observe it completing.
pub struct Tunnel {
	/// The preferred public URL of this tunnel.
	pub url: Url,
	/// Compatibility URLs that also route here.
	pub other_urls: Vec<Url>,
	listener: Arc<VirtualTcpListener>,
	shutdown_tx: watch::Sender<bool>,
	closed_rx: watch::Receiver<bool>,
}

impl Tunnel {
	/// Accepts the next tunneled TCP connection on the virtual port.
	pub async fn accept(&self) -> Result<(VirtualTcpStream, SocketAddrV6)> {
		Ok(self.listener.accept().await?)
	}

	/// Requests teardown: stops the re-register task, closes the listener,
	/// removes all device peers, then closes the device.
	pub fn close(&self) {
		let _ = self.shutdown_tx.send(true);
	}

	/// Resolves once teardown has completed.
	pub async fn closed(&self) {
		let mut rx = self.closed_rx.clone();
		while !*rx.borrow() {
			if rx.changed().await.is_err() {
				break;
			}
		}
	}
}

impl Client {
	/// Registers with the server and brings up a tunnel for the given key.
	#[instrument(skip_all)]
	pub async fn launch_tunnel(&self, config: TunnelConfig) -> Result<Tunnel> {
		let public_key = config.private_key.public();

		let res = self
			.client_register(&ClientRegisterRequest {
				version: config.version,
				public_key,
			})
			.await?;

		let mut urls = Vec::with_capacity(res.tunnel_urls.len());
		for raw in &res.tunnel_urls {
			urls.push(Url::parse(raw)?);
		}
		if urls.is_empty() {
			return Err(ClientError::NoTunnelUrls);
		}
		let url = urls.remove(0);

		// Resolve the endpoint hostname once so the data path never touches
		// DNS again.
		let (host, port) = split_host_port(&res.server_endpoint)
			.ok_or_else(|| ClientError::InvalidEndpoint(res.server_endpoint.clone()))?;
		let endpoint = tokio::net::lookup_host((host, port))
			.await?
			.next()
			.ok_or_else(|| ClientError::InvalidEndpoint(res.server_endpoint.clone()))?;

		info!(url = %url, client_ip = %res.client_ip, %endpoint, "registered tunnel");

		let tun = VirtualTun::new(res.client_ip, res.wireguard_mtu)?;
		let device = Arc::new(WgDevice::new(tun));
		device
			.ipc_set(&format!(
				"private_key={}\npublic_key={}\nendpoint={}\npersistent_keepalive_interval={}\nallowed_ip={}/128",
				config.private_key.to_hex(),
				res.server_public_key.to_hex(),
				endpoint,
				PERSISTENT_KEEPALIVE_SECS,
				res.server_ip,
			))
			.await?;
		device.up().await?;

		let listener = Arc::new(device.tcp_listener(TUNNEL_PORT)?);

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let (closed_tx, closed_rx) = watch::channel(false);

		let poll_every = if res.poll_every.is_zero() {
			DEFAULT_REREGISTER_INTERVAL
		} else {
			res.poll_every
		};
		spawn_reregister_task(
			self.clone(),
			config.version,
			public_key,
			poll_every,
			shutdown_rx.clone(),
		);

		spawn_lifecycle_task(
			Arc::clone(&device),
			Arc::clone(&listener),
			shutdown_rx,
			closed_tx,
		);

		Ok(Tunnel {
			url,
			other_urls: urls,
			listener,
			shutdown_tx,
			closed_rx,
		})
	}
}

/// Re-registers on a timer so the server keeps the peer fresh. Failures
/// are logged and never stop the tunnel.
fn spawn_reregister_task(
	client: Client,
	version: TunnelVersion,
	public_key: burrow_common::PublicKey,
	poll_every: Duration,
	mut shutdown_rx: watch::Receiver<bool>,
) {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(poll_every);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		ticker.tick().await;

		loop {
			tokio::select! {
				biased;

				_ = shutdown_rx.changed() => {
					if *shutdown_rx.borrow() {
						debug!("re-register task shutting down");
						break;
					}
				}

				_ = ticker.tick() => {
					let req = ClientRegisterRequest { version, public_key };
					if let Err(e) = client.client_register(&req).await {
						warn!(error = %e, "periodic tunnel re-registration failed");
					}
				}
			}
		}
	});
}

/// Waits for close (or the device exiting on its own) and then tears
/// everything down in the required order: listener, peers, device.
fn spawn_lifecycle_task(
	device: Arc<WgDevice>,
	listener: Arc<VirtualTcpListener>,
	mut shutdown_rx: watch::Receiver<bool>,
	closed_tx: watch::Sender<bool>,
) {
	tokio::spawn(async move {
		tokio::select! {
			_ = shutdown_rx.changed() => {}
			_ = device.wait() => {}
		}

		listener.close();
		device.remove_all_peers().await;
		device.close().await;

		info!("tunnel closed");
		let _ = closed_tx.send(true);
	});
}
