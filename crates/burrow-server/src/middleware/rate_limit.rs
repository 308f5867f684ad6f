// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use axum::http::HeaderMap;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

// Bound on tracked buckets; expired entries are pruned when crossed.
const MAX_TRACKED_KEYS: usize = 4096;

struct Bucket {
	count: usize,
	window_start: Instant,
}

/// Fixed-window request limiter keyed by client IP. When a real-IP header
/// is configured, the first comma-separated value wins; otherwise the
/// transport remote address is used. IPv6 keys are canonicalized to their
/// /64 so one client block counts as one key.
pub struct RateLimiter {
	count: usize,
	window: Duration,
	real_ip_header: Option<String>,
	buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
	pub fn new(count: usize, window: Duration, real_ip_header: Option<String>) -> Self {
		Self {
			count,
			window,
			real_ip_header,
			buckets: Mutex::new(HashMap::new()),
		}
	}

	/// Records one request for `key` and reports whether it is allowed.
	pub fn check(&self, key: &str) -> bool {
		let Ok(mut buckets) = self.buckets.lock() else {
			return true;
		};

		if buckets.len() > MAX_TRACKED_KEYS {
			let window = self.window;
			buckets.retain(|_, bucket| bucket.window_start.elapsed() < window);
		}

		let now = Instant::now();
		let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
			count: 0,
			window_start: now,
		});

		if now.duration_since(bucket.window_start) >= self.window {
			bucket.count = 0;
			bucket.window_start = now;
		}

		bucket.count += 1;
		bucket.count <= self.count
	}

	/// Derives the limiter key for a request.
	pub fn key_for(&self, headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
		if let Some(header) = &self.real_ip_header {
			let value = headers
				.get(header.as_str())
				.and_then(|v| v.to_str().ok())
				.and_then(|v| v.split(',').next())
				.map(str::trim)
				.filter(|v| !v.is_empty());

			match value {
				Some(value) => return canonicalize_ip(value),
				None => warn!(header, "real IP header not found on request"),
			}
		}

		match remote {
			Some(addr) => canonicalize_ip(&addr.ip().to_string()),
			None => "unknown".to_string(),
		}
	}

	pub fn denial_message(&self) -> String {
		format!(
			"You've been rate limited for sending more than {} requests in {}.",
			self.count,
			format_window(self.window)
		)
	}
}

/// Returns a form of `ip` suitable for comparison against other IPs. IPv4
/// addresses and non-addresses pass through unchanged; IPv6 addresses are
/// masked to their /64.
pub fn canonicalize_ip(ip: &str) -> String {
	match ip.parse::<IpAddr>() {
		Ok(IpAddr::V6(v6)) => {
			let masked = u128::from(v6) & 0xffff_ffff_ffff_ffff_0000_0000_0000_0000;
			Ipv6Addr::from(masked).to_string()
		}
		_ => ip.to_string(),
	}
}

fn format_window(window: Duration) -> String {
	let secs = window.as_secs();
	if secs < 60 {
		format!("{secs}s")
	} else {
		format!("{}m{}s", secs / 60, secs % 60)
	}
}
