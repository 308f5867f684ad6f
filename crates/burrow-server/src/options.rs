// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Server configuration, its validator, and the key→address→hostname codec.
//!
//! Every registered public key maps deterministically to a virtual IPv6
//! address and two DNS labels. The short label ("good format") is the
//! base32-hex encoding of the first 8 bytes of the key hash and depends on
//! the key alone; the legacy label ("old format") mixes in the network
//! prefix and exists for compatibility with older deployments. Both decode
//! back to the same address, and a migrated deployment keeps accepting both
//! indefinitely.

use burrow_common::net::split_host_port;
use burrow_common::{Key, PublicKey, TunnelVersion};
use data_encoding::BASE32HEX_NOPAD;
use ipnet::Ipv6Net;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv6Addr};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_WIREGUARD_MTU: u16 = 1280;
pub const DEFAULT_PEER_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PEER_REGISTER_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(120);

pub fn default_wireguard_server_ip() -> Ipv6Addr {
	"fcca::1".parse().unwrap()
}

pub fn default_wireguard_network_prefix() -> Ipv6Net {
	"fcca::/16".parse().unwrap()
}

#[derive(Error, Debug)]
pub enum OptionsError {
	#[error("base_url is required")]
	BaseUrlRequired,

	#[error("wireguard_endpoint is required")]
	EndpointRequired,

	#[error("wireguard_endpoint {0:?} is not a valid host:port combination")]
	EndpointInvalid(String),

	#[error("wireguard_port is required")]
	PortRequired,

	#[error("wireguard_key is required")]
	KeyRequired,

	#[error("wireguard_key must be a private key")]
	KeyNotPrivate,

	#[error("wireguard_server_ip must be an IPv6 address")]
	ServerIpNotIpv6,

	#[error("wireguard_network_prefix must have at least 64 bits available")]
	PrefixTooLong,

	#[error("wireguard_network_prefix must be a multiple of 8 bits")]
	PrefixNotByteAligned,

	#[error("wireguard_server_ip must be contained within wireguard_network_prefix")]
	ServerIpNotInPrefix,

	#[error("peer_register_interval ({0:?}) must be less than peer_timeout ({1:?})")]
	RegisterIntervalNotBelowTimeout(Duration, Duration),

	#[error("invalid tunnel URL: {0}")]
	TunnelUrl(#[from] url::ParseError),
}

/// Errors decoding a tunnel hostname label back into a virtual IPv6.
#[derive(Error, Debug)]
pub enum HostnameError {
	#[error("decode new hostname {0:?} as base32: {1}")]
	DecodeNewHostname(String, data_encoding::DecodeError),

	#[error("invalid new hostname length: got {0}, expected 8")]
	InvalidNewHostnameLength(usize),

	#[error("decode old hostname {0:?} as hex: {1}")]
	DecodeOldHostname(String, hex::FromHexError),

	#[error("invalid old hostname length: got {0}, expected 16")]
	InvalidOldHostnameLength(usize),
}

/// Server configuration. Immutable once validated; [`Options::validate`]
/// checks invariants and fills defaults, and is idempotent on valid input.
#[derive(Debug, Clone, Default)]
pub struct Options {
	/// Base URL including scheme. All tunnels are subdomains of this host,
	/// e.g. `https://tunnel.example.com` places tunnels at
	/// `https://xyz.tunnel.example.com`.
	pub base_url: Option<Url>,

	/// UDP address advertised to clients for wireguard connections, in
	/// `host:port` form.
	pub wireguard_endpoint: String,
	/// UDP port the wireguard server listens on. Should match the port in
	/// `wireguard_endpoint`.
	pub wireguard_port: u16,
	/// The server's wireguard private key.
	pub wireguard_key: Option<Key>,

	/// MTU of the wireguard interface. Defaults to 1280.
	pub wireguard_mtu: u16,
	/// Virtual IP address of this server inside the wireguard network. Must
	/// be an IPv6 address contained in `wireguard_network_prefix`. Defaults
	/// to `fcca::1`.
	pub wireguard_server_ip: Option<IpAddr>,
	/// CIDR of the wireguard network; client IPs are derived inside it.
	/// Must leave at least 64 bits of host space and be byte aligned.
	/// Defaults to `fcca::/16`.
	pub wireguard_network_prefix: Option<Ipv6Net>,

	/// Header carrying the real client IP, used for rate limiting. Falls
	/// back to the transport remote address when unset.
	pub real_ip_header: Option<String>,

	/// Timeout for dialing a peer on an ingress request. Defaults to 10s.
	pub peer_dial_timeout: Duration,
	/// How often clients should re-register. Defaults to 30s.
	pub peer_register_interval: Duration,
	/// How long the server keeps an idle peer before eviction. Defaults to
	/// 2 minutes.
	pub peer_timeout: Duration,
}

impl Options {
	pub fn validate(&mut self) -> Result<(), OptionsError> {
		let base_url = self.base_url.as_ref().ok_or(OptionsError::BaseUrlRequired)?;
		if base_url.host_str().is_none() {
			return Err(OptionsError::BaseUrlRequired);
		}

		if self.wireguard_endpoint.is_empty() {
			return Err(OptionsError::EndpointRequired);
		}
		if split_host_port(&self.wireguard_endpoint).is_none() {
			return Err(OptionsError::EndpointInvalid(self.wireguard_endpoint.clone()));
		}
		if self.wireguard_port == 0 {
			return Err(OptionsError::PortRequired);
		}

		match &self.wireguard_key {
			None => return Err(OptionsError::KeyRequired),
			Some(key) if key.is_zero() => return Err(OptionsError::KeyRequired),
			Some(key) if !key.is_private() => return Err(OptionsError::KeyNotPrivate),
			Some(_) => {}
		}

		if self.wireguard_mtu == 0 {
			self.wireguard_mtu = DEFAULT_WIREGUARD_MTU;
		}

		if self.wireguard_server_ip.is_none() {
			self.wireguard_server_ip = Some(IpAddr::V6(default_wireguard_server_ip()));
		}
		let server_ip = match self.wireguard_server_ip {
			Some(IpAddr::V6(ip)) => ip,
			_ => return Err(OptionsError::ServerIpNotIpv6),
		};

		if self.wireguard_network_prefix.is_none() {
			self.wireguard_network_prefix = Some(default_wireguard_network_prefix());
		}
		let prefix = self.network_prefix();
		if prefix.prefix_len() > 64 {
			return Err(OptionsError::PrefixTooLong);
		}
		if prefix.prefix_len() % 8 != 0 {
			return Err(OptionsError::PrefixNotByteAligned);
		}
		if !prefix.contains(&server_ip) {
			return Err(OptionsError::ServerIpNotInPrefix);
		}

		if self.peer_dial_timeout.is_zero() {
			self.peer_dial_timeout = DEFAULT_PEER_DIAL_TIMEOUT;
		}
		if self.peer_register_interval.is_zero() {
			self.peer_register_interval = DEFAULT_PEER_REGISTER_INTERVAL;
		}
		if self.peer_timeout.is_zero() {
			self.peer_timeout = DEFAULT_PEER_TIMEOUT;
		}
		if self.peer_register_interval >= self.peer_timeout {
			return Err(OptionsError::RegisterIntervalNotBelowTimeout(
				self.peer_register_interval,
				self.peer_timeout,
			));
		}

		Ok(())
	}

	/// The virtual IPv6 address of the server; valid after [`validate`].
	///
	/// [`validate`]: Options::validate
	pub fn server_ip(&self) -> Result<Ipv6Addr, OptionsError> {
		match self.wireguard_server_ip {
			Some(IpAddr::V6(ip)) => Ok(ip),
			_ => Err(OptionsError::ServerIpNotIpv6),
		}
	}

	pub(crate) fn network_prefix(&self) -> Ipv6Net {
		self.wireguard_network_prefix
			.unwrap_or_else(default_wireguard_network_prefix)
	}

	pub(crate) fn base_host(&self) -> Result<&str, OptionsError> {
		self.base_url
			.as_ref()
			.and_then(|u| u.host_str())
			.ok_or(OptionsError::BaseUrlRequired)
	}

	/// Returns the virtual IPv6 address for a client public key, plus all
	/// accepted tunnel URLs for it.
	///
	/// The address always takes the top 64 bits from the network prefix and
	/// the bottom 64 bits from the key hash, regardless of prefix length.
	/// The short 13-character label encodes the hash prefix alone; the
	/// legacy 32-character label hex-encodes prefix bytes followed by hash
	/// bytes. The first URL is the preferred one; ordering flips for
	/// version 1 requests, which predate the short form.
	pub fn wireguard_public_key_to_ip_and_urls(
		&self,
		public_key: &PublicKey,
		version: TunnelVersion,
	) -> Result<(Ipv6Addr, Vec<Url>), OptionsError> {
		let base_url = self.base_url.as_ref().ok_or(OptionsError::BaseUrlRequired)?;
		let base_host = self.base_host()?.to_string();
		let prefix = self.network_prefix();

		let key_hash = Sha256::digest(public_key.as_bytes());

		let mut addr_bytes = prefix.network().octets();
		addr_bytes[8..].copy_from_slice(&key_hash[..8]);

		let short_label = BASE32HEX_NOPAD.encode(&key_hash[..8]).to_lowercase();
		let mut short_url = base_url.clone();
		short_url.set_host(Some(&format!("{short_label}.{base_host}")))?;

		let mut legacy_bytes = addr_bytes;
		let prefix_len_bytes = (prefix.prefix_len() / 8) as usize;
		let hash_len = 16 - prefix_len_bytes;
		legacy_bytes[prefix_len_bytes..].copy_from_slice(&key_hash[..hash_len]);
		let legacy_label = hex::encode(legacy_bytes);
		let mut legacy_url = base_url.clone();
		legacy_url.set_host(Some(&format!("{legacy_label}.{base_host}")))?;

		let urls = match version {
			TunnelVersion::V1 => vec![legacy_url, short_url],
			TunnelVersion::V2 => vec![short_url, legacy_url],
		};

		Ok((Ipv6Addr::from(addr_bytes), urls))
	}

	/// Decodes a hostname label produced by
	/// [`wireguard_public_key_to_ip_and_urls`] back into the virtual IPv6.
	/// A 32-character label is treated as the legacy form; everything else
	/// as the short form.
	///
	/// [`wireguard_public_key_to_ip_and_urls`]: Options::wireguard_public_key_to_ip_and_urls
	pub fn hostname_to_wireguard_ip(&self, hostname: &str) -> Result<Ipv6Addr, HostnameError> {
		let prefix = self.network_prefix();

		let mut client_bytes = [0u8; 8];
		if hostname.len() == 32 {
			let decoded = hex::decode(hostname)
				.map_err(|e| HostnameError::DecodeOldHostname(hostname.to_string(), e))?;
			if decoded.len() != 16 {
				return Err(HostnameError::InvalidOldHostnameLength(decoded.len()));
			}

			// The label carries the whole legacy address, but only the 8
			// bytes after the prefix identify the client.
			let offset = (prefix.prefix_len() / 8) as usize;
			client_bytes.copy_from_slice(&decoded[offset..offset + 8]);
		} else {
			let decoded = BASE32HEX_NOPAD
				.decode(hostname.to_uppercase().as_bytes())
				.map_err(|e| HostnameError::DecodeNewHostname(hostname.to_string(), e))?;
			if decoded.len() != 8 {
				return Err(HostnameError::InvalidNewHostnameLength(decoded.len()));
			}

			client_bytes.copy_from_slice(&decoded);
		}

		let mut addr_bytes = prefix.network().octets();
		addr_bytes[8..].copy_from_slice(&client_bytes);
		Ok(Ipv6Addr::from(addr_bytes))
	}
}
