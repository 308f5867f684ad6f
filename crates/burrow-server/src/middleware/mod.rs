// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Control-plane HTTP middleware: request body limits and the IP-keyed
//! rate limiter. Ingress traffic only gets the outer body limit.

mod limit_body;
mod rate_limit;

pub use limit_body::{
	set_body_limit, BodyLimitHandle, LimitReached, LimitedBody, CONTROL_PLANE_BODY_LIMIT,
	INGRESS_BODY_LIMIT,
};
pub use rate_limit::{canonicalize_ip, RateLimiter};
