// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Types shared between the burrow server, client SDK, and engine: WireGuard
//! key handling, key file persistence, and the registration wire protocol.

pub mod api;
pub mod keys;
pub mod keys_file;
pub mod net;

pub use api::{
	ClientRegisterRequest, ClientRegisterResponse, LegacyPostTunRequest, LegacyPostTunResponse,
	Response, TunnelVersion, TUNNEL_PORT,
};
pub use keys::{Key, KeyError, PublicKey};
pub use keys_file::{load_key_file, load_or_generate_key_file, save_key_file, KeyFileError};
