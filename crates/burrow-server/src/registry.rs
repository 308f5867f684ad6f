// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Cache of registered peers keyed by their derived virtual IPv6 address.
//!
//! The device owns the authoritative peer set; this registry adds the
//! last-registration timestamp that the device does not track, plus a fast
//! freshness check for the ingress path. Ingress handlers re-confirm hits
//! against the device, so divergence only costs one extra lookup.

use burrow_common::PublicKey;
use burrow_engine::{EngineError, WgDevice};
use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone)]
pub struct CachedPeer {
	pub public_key: PublicKey,
	pub last_handshake: Instant,
}

pub struct PeerRegistry {
	peers: RwLock<HashMap<Ipv6Addr, CachedPeer>>,
	device: Arc<WgDevice>,
	peer_timeout: Duration,
}

impl PeerRegistry {
	pub fn new(device: Arc<WgDevice>, peer_timeout: Duration) -> Self {
		Self {
			peers: RwLock::new(HashMap::new()),
			device,
			peer_timeout,
		}
	}

	/// Registers a peer or refreshes its timestamp. Returns whether the
	/// device already knew the peer. The lookup and the device peer-add
	/// happen under the write lock, so two concurrent registrations of the
	/// same key cannot produce a duplicate device peer.
	#[instrument(skip(self), fields(peer = %public_key, %ip))]
	pub async fn upsert(&self, public_key: PublicKey, ip: Ipv6Addr) -> Result<bool, EngineError> {
		let mut peers = self.peers.write().await;

		peers.insert(
			ip,
			CachedPeer {
				public_key,
				last_handshake: Instant::now(),
			},
		);

		let exists = self.device.lookup_peer(&public_key).await.is_some();
		if !exists {
			self.device
				.ipc_set(&format!(
					"public_key={}\nallowed_ip={}/128",
					public_key.to_hex(),
					ip
				))
				.await?;
			info!("registered new peer with device");
		}

		Ok(exists)
	}

	pub async fn lookup(&self, ip: Ipv6Addr) -> Option<CachedPeer> {
		self.peers.read().await.get(&ip).cloned()
	}

	/// A peer is fresh while it keeps re-registering within the inactivity
	/// timeout.
	pub fn is_fresh(&self, peer: &CachedPeer) -> bool {
		peer.last_handshake.elapsed() <= self.peer_timeout
	}

	/// Removes the entry and tears down the corresponding device peer.
	#[instrument(skip(self), fields(%ip))]
	pub async fn evict(&self, ip: Ipv6Addr) {
		let removed = self.peers.write().await.remove(&ip);
		if let Some(peer) = removed {
			self.device.remove_peer(&peer.public_key).await;
			debug!(peer = %peer.public_key, "evicted peer");
		}
	}

	/// Evicts every stale entry. Returns how many peers were removed.
	#[instrument(skip(self))]
	pub async fn sweep(&self) -> usize {
		let stale: Vec<Ipv6Addr> = {
			let peers = self.peers.read().await;
			peers
				.iter()
				.filter(|(_, peer)| !self.is_fresh(peer))
				.map(|(ip, _)| *ip)
				.collect()
		};

		for ip in &stale {
			self.evict(*ip).await;
		}

		if !stale.is_empty() {
			info!(count = stale.len(), "swept stale peers");
		}
		stale.len()
	}

	pub async fn len(&self) -> usize {
		self.peers.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.peers.read().await.is_empty()
	}
}
