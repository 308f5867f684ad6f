// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Parser for the textual device configuration channel. The grammar is a
//! subset of the WireGuard UAPI `set` operation: one `key=value` per line,
//! device-level keys first, then per-peer sections opened by `public_key`.

use crate::error::{EngineError, Result};
use burrow_common::{Key, PublicKey};
use std::net::{Ipv6Addr, SocketAddr};

#[derive(Debug, Default)]
pub(crate) struct ConfigUpdate {
	pub private_key: Option<Key>,
	pub listen_port: Option<u16>,
	pub peers: Vec<PeerUpdate>,
}

#[derive(Debug)]
pub(crate) struct PeerUpdate {
	pub public_key: PublicKey,
	pub allowed_ips: Vec<Ipv6Addr>,
	pub endpoint: Option<SocketAddr>,
	pub persistent_keepalive: Option<u16>,
}

pub(crate) fn parse(config: &str) -> Result<ConfigUpdate> {
	let mut update = ConfigUpdate::default();

	for line in config.lines() {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}

		let (key, value) = line
			.split_once('=')
			.ok_or_else(|| EngineError::Ipc(format!("expected key=value, got {line:?}")))?;

		match key {
			"private_key" => {
				update.private_key =
					Some(Key::from_hex(value).map_err(|e| EngineError::Ipc(format!("private_key: {e}")))?);
			}
			"listen_port" => {
				update.listen_port = Some(
					value
						.parse()
						.map_err(|e| EngineError::Ipc(format!("listen_port: {e}")))?,
				);
			}
			"public_key" => {
				let public_key =
					PublicKey::from_hex(value).map_err(|e| EngineError::Ipc(format!("public_key: {e}")))?;
				update.peers.push(PeerUpdate {
					public_key,
					allowed_ips: Vec::new(),
					endpoint: None,
					persistent_keepalive: None,
				});
			}
			"allowed_ip" => {
				let peer = current_peer(&mut update, key)?;
				peer.allowed_ips.push(parse_allowed_ip(value)?);
			}
			"endpoint" => {
				let peer = current_peer(&mut update, key)?;
				peer.endpoint = Some(
					value
						.parse()
						.map_err(|e| EngineError::Ipc(format!("endpoint: {e}")))?,
				);
			}
			"persistent_keepalive_interval" => {
				let peer = current_peer(&mut update, key)?;
				peer.persistent_keepalive = Some(
					value
						.parse()
						.map_err(|e| EngineError::Ipc(format!("persistent_keepalive_interval: {e}")))?,
				);
			}
			_ => {
				return Err(EngineError::Ipc(format!("unknown configuration key {key:?}")));
			}
		}
	}

	Ok(update)
}

fn current_peer<'a>(update: &'a mut ConfigUpdate, key: &str) -> Result<&'a mut PeerUpdate> {
	update
		.peers
		.last_mut()
		.ok_or_else(|| EngineError::Ipc(format!("{key} must follow a public_key line")))
}

fn parse_allowed_ip(value: &str) -> Result<Ipv6Addr> {
	let (addr, prefix_len) = match value.split_once('/') {
		Some((addr, len)) => (addr, Some(len)),
		None => (value, None),
	};

	if let Some(len) = prefix_len {
		if len != "128" {
			return Err(EngineError::Ipc(format!(
				"allowed_ip: only /128 routes are supported, got /{len}"
			)));
		}
	}

	addr
		.parse()
		.map_err(|e| EngineError::Ipc(format!("allowed_ip: {e}")))
}
