// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-process userspace WireGuard: a boringtun-based device speaking the
//! WireGuard protocol over a UDP socket, bridged to a smoltcp virtual
//! network stack. TCP connections dialed or accepted here travel through
//! WireGuard rather than the host kernel.

mod device;
mod error;
mod ipc;
mod netstack;

pub use device::{PeerStats, WgDevice};
pub use error::{EngineError, Result};
pub use netstack::{VirtualTcpListener, VirtualTcpStream, VirtualTun};
