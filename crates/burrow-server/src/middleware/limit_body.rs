// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use axum::body::{Body, Bytes};
use axum::extract::Request;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use thiserror::Error;

/// Cap on ingress request bodies forwarded through tunnels.
pub const INGRESS_BODY_LIMIT: u64 = 50 * 1024 * 1024;

/// Cap on control-plane request bodies.
pub const CONTROL_PLANE_BODY_LIMIT: u64 = 1024 * 1024;

/// Sentinel error surfaced by a limited body once the cumulative read
/// crosses the configured maximum.
#[derive(Debug, Error)]
#[error("i/o limit reached")]
pub struct LimitReached;

struct LimitState {
	limit: u64,
	read: u64,
}

/// Shared counter behind a [`LimitedBody`]. Stored in the request
/// extensions so that an inner middleware can re-apply a different limit
/// without double-wrapping; resetting also clears the running total.
#[derive(Clone)]
pub struct BodyLimitHandle {
	state: Arc<Mutex<LimitState>>,
}

impl BodyLimitHandle {
	fn new(limit: u64) -> Self {
		Self {
			state: Arc::new(Mutex::new(LimitState { limit, read: 0 })),
		}
	}

	pub fn reset(&self, limit: u64) {
		if let Ok(mut state) = self.state.lock() {
			state.limit = limit;
			state.read = 0;
		}
	}

	fn record(&self, n: u64) -> bool {
		match self.state.lock() {
			Ok(mut state) => {
				state.read = state.read.saturating_add(n);
				state.read <= state.limit
			}
			Err(_) => false,
		}
	}
}

/// Counts data frames flowing out of the wrapped body and fails the stream
/// with [`LimitReached`] once the total exceeds the limit.
pub struct LimitedBody {
	inner: Body,
	handle: BodyLimitHandle,
}

impl http_body::Body for LimitedBody {
	type Data = Bytes;
	type Error = axum::Error;

	fn poll_frame(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		match Pin::new(&mut self.inner).poll_frame(cx) {
			Poll::Ready(Some(Ok(frame))) => {
				if let Some(data) = frame.data_ref() {
					if !self.handle.record(data.len() as u64) {
						return Poll::Ready(Some(Err(axum::Error::new(LimitReached))));
					}
				}
				Poll::Ready(Some(Ok(frame)))
			}
			other => other,
		}
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> http_body::SizeHint {
		http_body::Body::size_hint(&self.inner)
	}
}

/// Wraps the request body in a counting limiter, or resets the existing one
/// when the request has already been wrapped by an outer layer.
pub fn set_body_limit(req: &mut Request, limit: u64) {
	if let Some(handle) = req.extensions().get::<BodyLimitHandle>() {
		handle.reset(limit);
		return;
	}

	let handle = BodyLimitHandle::new(limit);
	let inner = std::mem::replace(req.body_mut(), Body::empty());
	*req.body_mut() = Body::new(LimitedBody {
		inner,
		handle: handle.clone(),
	});
	req.extensions_mut().insert(handle);
}

#[cfg(test)]
mod tests {
	use super::*;
	use http_body_util::BodyExt;

	async fn collect(body: LimitedBody) -> Result<Vec<u8>, axum::Error> {
		Ok(body.collect().await?.to_bytes().to_vec())
	}

	fn limited(data: Vec<u8>, limit: u64) -> LimitedBody {
		LimitedBody {
			inner: Body::from(data),
			handle: BodyLimitHandle::new(limit),
		}
	}

	#[tokio::test]
	async fn body_within_limit_passes_through() {
		let data = vec![7u8; 1024];
		let read = collect(limited(data.clone(), 1024)).await.unwrap();
		assert_eq!(read, data);
	}

	#[tokio::test]
	async fn body_over_limit_fails_with_sentinel() {
		let err = collect(limited(vec![7u8; 1025], 1024)).await.unwrap_err();
		assert!(err.to_string().contains("i/o limit reached"));
	}

	#[tokio::test]
	async fn empty_body_is_fine_with_zero_limit() {
		let read = collect(limited(Vec::new(), 0)).await.unwrap();
		assert!(read.is_empty());
	}

	#[tokio::test]
	async fn reset_restores_a_spent_counter() {
		let handle = BodyLimitHandle::new(8);
		assert!(handle.record(8));
		assert!(!handle.record(1));

		handle.reset(16);
		assert!(handle.record(16));
		assert!(!handle.record(1));
	}

	#[tokio::test]
	async fn reapplying_resets_instead_of_double_wrapping() {
		let mut req = Request::new(Body::from(vec![7u8; 600]));

		set_body_limit(&mut req, 100);
		set_body_limit(&mut req, 1024);

		let body = std::mem::replace(req.body_mut(), Body::empty());
		let read = body.collect().await.unwrap().to_bytes();
		assert_eq!(read.len(), 600);
	}
}
