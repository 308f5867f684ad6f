// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::{Key, KeyError};
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::{info, instrument};

#[derive(Error, Debug)]
pub enum KeyFileError {
	#[error("failed to read key file: {0}")]
	Io(#[from] std::io::Error),

	#[error("invalid key format: {0}")]
	InvalidFormat(#[from] KeyError),
}

pub type Result<T> = std::result::Result<T, KeyFileError>;

#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn load_key_file(path: impl AsRef<Path>) -> Result<Key> {
	let content = fs::read_to_string(path.as_ref()).await?;
	Ok(Key::from_base64(content.trim())?)
}

/// Writes the private key base64-encoded, owner-readable only.
#[instrument(skip(key), fields(path = %path.as_ref().display()))]
pub async fn save_key_file(key: &Key, path: impl AsRef<Path>) -> Result<()> {
	let path = path.as_ref();

	if let Some(parent) = path.parent() {
		if !parent.as_os_str().is_empty() {
			fs::create_dir_all(parent).await?;
		}
	}

	let content = format!("{}\n", key.to_base64());

	#[cfg(unix)]
	{
		use tokio::fs::OpenOptions;
		use tokio::io::AsyncWriteExt;

		let mut file = OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.mode(0o600)
			.open(path)
			.await?;
		file.write_all(content.as_bytes()).await?;
	}

	#[cfg(not(unix))]
	{
		fs::write(path, content).await?;
	}

	Ok(())
}

/// Loads the private key at `path`, generating and persisting a fresh one
/// when the file does not exist yet.
#[instrument(fields(path = %path.as_ref().display()))]
pub async fn load_or_generate_key_file(path: impl AsRef<Path>) -> Result<Key> {
	let path = path.as_ref();

	if fs::try_exists(path).await? {
		return load_key_file(path).await;
	}

	info!(path = %path.display(), "generating new private key");
	let key = Key::generate();
	save_key_file(&key, path).await?;
	Ok(key)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[tokio::test]
	async fn save_and_load_key() {
		let temp_dir = TempDir::new().unwrap();
		let path = temp_dir.path().join("wg-key");

		let key = Key::generate();
		save_key_file(&key, &path).await.unwrap();

		let loaded = load_key_file(&path).await.unwrap();
		assert_eq!(key.public(), loaded.public());
	}

	#[tokio::test]
	#[cfg(unix)]
	async fn save_key_sets_permissions() {
		use std::os::unix::fs::PermissionsExt;

		let temp_dir = TempDir::new().unwrap();
		let path = temp_dir.path().join("wg-key");

		save_key_file(&Key::generate(), &path).await.unwrap();

		let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
		assert_eq!(mode, 0o600);
	}

	#[tokio::test]
	async fn load_or_generate_creates_then_reuses() {
		let temp_dir = TempDir::new().unwrap();
		let path = temp_dir.path().join("wg-key");

		let key1 = load_or_generate_key_file(&path).await.unwrap();
		assert!(path.exists());

		let key2 = load_or_generate_key_file(&path).await.unwrap();
		assert_eq!(key1.public(), key2.public());
	}

	#[tokio::test]
	async fn load_rejects_garbage() {
		let temp_dir = TempDir::new().unwrap();
		let path = temp_dir.path().join("wg-key");
		std::fs::write(&path, "not a key").unwrap();

		assert!(load_key_file(&path).await.is_err());
	}
}
