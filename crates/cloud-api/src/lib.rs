pub mod auth;

use auth::OAuthToken;
use sd_sync::StoreId;

pub use sd_sync::TransformPage;

#[derive(Clone, Debug)]
pub struct RequestConfig {
	pub client: reqwest::Client,
	pub api_url: String,
	pub auth_token: Option<OAuthToken>,
}

impl RequestConfig {
	pub fn new(api_url: impl Into<String>) -> Self {
		Self {
			client: reqwest::Client::new(),
			api_url: api_url.into().trim_end_matches('/').to_string(),
			auth_token: None,
		}
	}

	#[must_use]
	pub fn with_auth_token(mut self, token: OAuthToken) -> Self {
		self.auth_token = Some(token);
		self
	}
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("sequencer responded with status {status}: {body}")]
	Status {
		status: reqwest::StatusCode,
		body: String,
	},
	#[error("request to sequencer failed: {0}")]
	Request(String),
	#[error("malformed sequencer response: {0}")]
	Decode(String),
}

trait WithAuth {
	fn with_auth(self, token: Option<&OAuthToken>) -> Self;
}

impl WithAuth for reqwest::RequestBuilder {
	fn with_auth(self, token: Option<&OAuthToken>) -> Self {
		match token {
			Some(token) => self.header("authorization", token.to_header()),
			None => self,
		}
	}
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, Error> {
	let status = response.status();

	if status.is_success() {
		return Ok(response);
	}

	let body = response
		.text()
		.await
		.unwrap_or_else(|e| format!("<unreadable body: {e}>"));

	Err(Error::Status { status, body })
}

pub mod transforms {
	use super::*;

	pub use get::exec as get;
	pub mod get {
		use tracing::trace;

		use super::*;

		/// Fetches at most `count` transforms of `store` with a logical timestamp above `since`.
		pub async fn exec(
			config: &RequestConfig,
			store: StoreId,
			since: u64,
			count: u32,
		) -> Result<Response, Error> {
			let url = format!(
				"{}/transforms/{}",
				config.api_url,
				store.root_oid().as_uuid()
			);

			trace!(%url, since, count, "Requesting transforms;");

			let response = config
				.client
				.get(&url)
				.query(&[("since", since.to_string()), ("count", count.to_string())])
				.with_auth(config.auth_token.as_ref())
				.send()
				.await
				.map_err(|e| Error::Request(e.to_string()))?;

			error_for_status(response)
				.await?
				.json()
				.await
				.map_err(|e| Error::Decode(e.to_string()))
		}

		pub type Response = TransformPage;
	}
}
