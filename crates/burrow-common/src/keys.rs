// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use base64::prelude::*;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use x25519_dalek::StaticSecret;
use zeroize::Zeroize;

#[derive(Error, Debug)]
pub enum KeyError {
	#[error("invalid key length: expected 32 bytes, got {0}")]
	InvalidLength(usize),

	#[error("invalid base64 encoding: {0}")]
	InvalidBase64(#[from] base64::DecodeError),

	#[error("invalid hex encoding: {0}")]
	InvalidHex(#[from] hex::FromHexError),

	#[error("key is not a private key")]
	NotPrivate,
}

pub type Result<T> = std::result::Result<T, KeyError>;

/// A WireGuard key: 32 bytes of Curve25519 material plus a flag recording
/// whether it is the private or the public half. Parsing assumes private,
/// matching `wg genkey` output; there is no way to tell from the bytes alone.
#[derive(Clone, PartialEq, Eq, Zeroize)]
#[zeroize(drop)]
pub struct Key {
	bytes: [u8; 32],
	is_private: bool,
}

impl Key {
	pub fn generate() -> Self {
		let secret = StaticSecret::random_from_rng(OsRng);
		Self {
			bytes: secret.to_bytes(),
			is_private: true,
		}
	}

	/// Parses a base64 private key as produced by [`Key::to_base64`] or
	/// `wg genkey`.
	pub fn from_base64(s: &str) -> Result<Self> {
		let bytes = BASE64_STANDARD.decode(s.trim())?;
		let len = bytes.len();
		let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength(len))?;
		Ok(Self {
			bytes,
			is_private: true,
		})
	}

	/// Parses a lowercase hex private key as used on the device command
	/// channel.
	pub fn from_hex(s: &str) -> Result<Self> {
		let bytes = hex::decode(s)?;
		let len = bytes.len();
		let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength(len))?;
		Ok(Self {
			bytes,
			is_private: true,
		})
	}

	pub fn is_zero(&self) -> bool {
		self.bytes == [0u8; 32]
	}

	pub fn is_private(&self) -> bool {
		self.is_private
	}

	pub fn to_base64(&self) -> String {
		BASE64_STANDARD.encode(self.bytes)
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.bytes)
	}

	/// The public half as a [`Key`]. Errors when called on a public key.
	pub fn public_key(&self) -> Result<Key> {
		if !self.is_private {
			return Err(KeyError::NotPrivate);
		}
		Ok(Key {
			bytes: *self.public().as_bytes(),
			is_private: false,
		})
	}

	/// The public half in wire form. A public key is returned as-is.
	pub fn public(&self) -> PublicKey {
		if self.is_private {
			let secret = StaticSecret::from(self.bytes);
			PublicKey(*x25519_dalek::PublicKey::from(&secret).as_bytes())
		} else {
			PublicKey(self.bytes)
		}
	}

	pub fn expose_bytes(&self) -> &[u8; 32] {
		&self.bytes
	}
}

impl fmt::Debug for Key {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_private {
			f.debug_struct("Key")
				.field("bytes", &"[REDACTED]")
				.field("is_private", &true)
				.finish()
		} else {
			f.debug_struct("Key")
				.field("bytes", &self.to_base64())
				.field("is_private", &false)
				.finish()
		}
	}
}

impl fmt::Display for Key {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_private {
			f.write_str("[REDACTED]")
		} else {
			f.write_str(&self.to_base64())
		}
	}
}

/// The wire form of a public key. Serializes as a 32-element integer array,
/// the canonical JSON form of the upstream WireGuard tooling.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub(crate) [u8; 32]);

impl PublicKey {
	pub fn from_bytes(bytes: [u8; 32]) -> Self {
		Self(bytes)
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		let bytes = BASE64_STANDARD.decode(s.trim())?;
		let len = bytes.len();
		let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength(len))?;
		Ok(Self(bytes))
	}

	pub fn from_hex(s: &str) -> Result<Self> {
		let bytes = hex::decode(s)?;
		let len = bytes.len();
		let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength(len))?;
		Ok(Self(bytes))
	}

	pub fn to_base64(&self) -> String {
		BASE64_STANDARD.encode(self.0)
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}

	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}
}

impl fmt::Debug for PublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let b64 = self.to_base64();
		let prefix = if b64.len() >= 8 { &b64[..8] } else { &b64 };
		f.debug_struct("PublicKey")
			.field("prefix", &format!("{prefix}..."))
			.finish()
	}
}

impl fmt::Display for PublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_base64())
	}
}

impl Serialize for PublicKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		self.0.serialize(serializer)
	}
}

impl<'de> Deserialize<'de> for PublicKey {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let bytes = <[u8; 32]>::deserialize(deserializer)?;
		Ok(Self(bytes))
	}
}
