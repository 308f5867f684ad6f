// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{ClientError, Result};
use burrow_common::{ClientRegisterRequest, ClientRegisterResponse, Response};
use tracing::instrument;
use url::Url;

/// HTTP client for the tunnel server's registration API.
#[derive(Clone)]
pub struct Client {
	http: reqwest::Client,
	url: Url,
}

impl Client {
	pub fn new(url: Url) -> Self {
		Self {
			http: reqwest::Client::new(),
			url,
		}
	}

	/// Replaces the underlying HTTP client, e.g. to install custom DNS
	/// resolution in tests.
	pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
		self.http = http;
		self
	}

	pub fn url(&self) -> &Url {
		&self.url
	}

	#[instrument(skip_all, fields(public_key = %req.public_key))]
	pub async fn client_register(
		&self,
		req: &ClientRegisterRequest,
	) -> Result<ClientRegisterResponse> {
		let url = self.url.join("/api/v2/clients")?;

		let res = self.http.post(url).json(req).send().await?;
		if !res.status().is_success() {
			return Err(read_body_as_error(res).await);
		}

		Ok(res.json().await?)
	}
}

/// Decodes an error response body into the shared `{message, detail}`
/// shape, falling back to a generic message for non-JSON bodies.
async fn read_body_as_error(res: reqwest::Response) -> ClientError {
	let status = res.status().as_u16();

	match res.json::<Response>().await {
		Ok(body) => ClientError::Api {
			status,
			message: body.message,
			detail: body.detail,
		},
		Err(e) => ClientError::Api {
			status,
			message: format!("response has no message: {e}"),
			detail: None,
		},
	}
}
