// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::options::OptionsError;
use burrow_engine::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
	#[error("invalid options: {0}")]
	Options(#[from] OptionsError),

	#[error("wireguard device: {0}")]
	Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, ServerError>;
