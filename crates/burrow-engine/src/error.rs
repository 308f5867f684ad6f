// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
	#[error("device error: {0}")]
	Device(String),

	#[error("invalid device configuration: {0}")]
	Ipc(String),

	#[error("tcp connect failed: {0}")]
	TcpConnect(String),

	#[error("listener closed")]
	ListenerClosed,

	#[error("device is already running")]
	AlreadyRunning,

	#[error("device is not running")]
	NotRunning,

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("key error: {0}")]
	Key(#[from] burrow_common::KeyError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
