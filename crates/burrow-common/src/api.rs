// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Wire types for the tunnel registration API.

use crate::keys::PublicKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::Ipv6Addr;
use std::time::Duration;

/// The fixed TCP port inside the virtual WireGuard network that every tunnel
/// client listens on and every ingress dial targets.
pub const TUNNEL_PORT: u16 = 8080;

/// Protocol version of a registration request. Determines the order of
/// `tunnel_urls` in the response; the identity set is the same either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelVersion {
	V1,
	V2,
}

impl TunnelVersion {
	pub const LATEST: TunnelVersion = TunnelVersion::V2;

	/// Maps a wire integer to a version. Zero or out-of-range values fall
	/// back to the latest version.
	pub fn from_wire(raw: i64) -> Self {
		match raw {
			1 => TunnelVersion::V1,
			2 => TunnelVersion::V2,
			_ => TunnelVersion::LATEST,
		}
	}

	pub fn as_wire(self) -> i64 {
		match self {
			TunnelVersion::V1 => 1,
			TunnelVersion::V2 => 2,
		}
	}
}

impl Default for TunnelVersion {
	fn default() -> Self {
		TunnelVersion::LATEST
	}
}

impl Serialize for TunnelVersion {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_i64(self.as_wire())
	}
}

impl<'de> Deserialize<'de> for TunnelVersion {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		Ok(TunnelVersion::from_wire(i64::deserialize(deserializer)?))
	}
}

/// Generic API response body. Every error crosses the HTTP boundary in this
/// shape with an appropriate status code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegisterRequest {
	#[serde(default)]
	pub version: TunnelVersion,
	pub public_key: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRegisterResponse {
	pub version: TunnelVersion,
	/// How often the client should re-register, as advised by the server.
	/// Zero means the client falls back to its own default.
	#[serde(default, with = "duration_nanos")]
	pub poll_every: Duration,
	/// Valid URLs that the server will forward to this client once
	/// connected. The first URL is the preferred one; the rest exist for
	/// compatibility with older deployments. Ordering depends on the
	/// requested version.
	pub tunnel_urls: Vec<String>,
	pub client_ip: Ipv6Addr,

	pub server_endpoint: String,
	pub server_ip: Ipv6Addr,
	pub server_public_key: PublicKey,
	pub wireguard_mtu: u16,
}

/// Request shape of the legacy `POST /tun` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyPostTunRequest {
	pub public_key: PublicKey,
}

/// Response shape of the legacy `POST /tun` endpoint. The server public key
/// is hex encoded here, unlike the v2 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyPostTunResponse {
	pub hostname: String,
	pub server_endpoint: String,
	pub server_ip: Ipv6Addr,
	pub server_public_key: String,
	pub client_ip: Ipv6Addr,
}

/// Durations travel on the wire as integer nanoseconds.
mod duration_nanos {
	use serde::{Deserialize, Deserializer, Serializer};
	use std::time::Duration;

	pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(value.as_nanos().min(u64::MAX as u128) as u64)
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
	}
}
