// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::api::{build_router, AppState};
use crate::error::Result;
use crate::middleware::RateLimiter;
use crate::options::{Options, OptionsError};
use crate::registry::PeerRegistry;
use axum::Router;
use burrow_engine::{VirtualTun, WgDevice};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, instrument};

const RATE_LIMIT_COUNT: usize = 10;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10);

/// The running tunnel server: the userspace WireGuard device, the peer
/// registry in front of it, and the HTTP router serving both the control
/// plane and tunnel ingress.
pub struct TunnelServer {
	options: Arc<Options>,
	base_host: String,
	device: Arc<WgDevice>,
	registry: Arc<PeerRegistry>,
	rate_limiter: Arc<RateLimiter>,
	shutdown_tx: watch::Sender<bool>,
}

impl TunnelServer {
	/// Validates the options, brings up the WireGuard device on the
	/// configured UDP port, and starts the stale-peer sweeper.
	#[instrument(skip(options))]
	pub async fn new(mut options: Options) -> Result<Self> {
		options.validate()?;

		let server_ip = options.server_ip()?;
		let key = options
			.wireguard_key
			.clone()
			.ok_or(OptionsError::KeyRequired)?;
		let base_host = options.base_host()?.to_string();

		let tun = VirtualTun::new(server_ip, options.wireguard_mtu)?;
		let device = Arc::new(WgDevice::new(tun));
		device
			.ipc_set(&format!(
				"private_key={}\nlisten_port={}",
				key.to_hex(),
				options.wireguard_port
			))
			.await?;
		device.up().await?;

		let options = Arc::new(options);
		let registry = Arc::new(PeerRegistry::new(Arc::clone(&device), options.peer_timeout));
		let rate_limiter = Arc::new(RateLimiter::new(
			RATE_LIMIT_COUNT,
			RATE_LIMIT_WINDOW,
			options.real_ip_header.clone(),
		));

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		spawn_sweeper(Arc::clone(&registry), options.peer_timeout, shutdown_rx);

		info!(
			base_host,
			endpoint = %options.wireguard_endpoint,
			udp_port = options.wireguard_port,
			server_ip = %server_ip,
			"tunnel server up"
		);

		Ok(Self {
			options,
			base_host,
			device,
			registry,
			rate_limiter,
			shutdown_tx,
		})
	}

	pub fn router(&self) -> Router {
		build_router(AppState {
			options: Arc::clone(&self.options),
			base_host: self.base_host.clone(),
			device: Arc::clone(&self.device),
			registry: Arc::clone(&self.registry),
			rate_limiter: Arc::clone(&self.rate_limiter),
		})
	}

	pub fn options(&self) -> &Options {
		&self.options
	}

	/// Stops the sweeper and tears down the device. Peers are removed
	/// first; closing the device while peers still exist races with their
	/// packet tasks.
	#[instrument(skip(self))]
	pub async fn close(&self) {
		let _ = self.shutdown_tx.send(true);

		self.device.remove_all_peers().await;
		self.device.close().await;
		self.device.wait().await;

		info!("tunnel server closed");
	}
}

fn spawn_sweeper(
	registry: Arc<PeerRegistry>,
	period: Duration,
	mut shutdown_rx: watch::Receiver<bool>,
) {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(period);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		// The first tick fires immediately; skip it.
		ticker.tick().await;

		loop {
			tokio::select! {
				biased;

				_ = shutdown_rx.changed() => {
					if *shutdown_rx.borrow() {
						break;
					}
				}

				_ = ticker.tick() => {
					registry.sweep().await;
				}
			}
		}
	});
}
