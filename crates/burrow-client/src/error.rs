// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
	#[error("http request failed: {0}")]
	Http(#[from] reqwest::Error),

	#[error("unexpected status code {status}: {message}")]
	Api {
		status: u16,
		message: String,
		detail: Option<String>,
	},

	#[error("invalid url: {0}")]
	Url(#[from] url::ParseError),

	#[error("invalid server endpoint {0:?}")]
	InvalidEndpoint(String),

	#[error("registration returned no tunnel URLs")]
	NoTunnelUrls,

	#[error("wireguard device: {0}")]
	Engine(#[from] burrow_engine::EngineError),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("key error: {0}")]
	Key(#[from] burrow_common::KeyError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
