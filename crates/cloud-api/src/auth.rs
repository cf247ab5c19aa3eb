use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct OAuthToken {
	pub access_token: String,
	pub token_type: String,
}

impl OAuthToken {
	pub fn bearer(access_token: impl Into<String>) -> Self {
		Self {
			access_token: access_token.into(),
			token_type: "Bearer".to_string(),
		}
	}

	pub fn to_header(&self) -> String {
		format!("{} {}", self.token_type, self.access_token)
	}
}

impl std::fmt::Debug for OAuthToken {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OAuthToken")
			.field("token_type", &self.token_type)
			.finish_non_exhaustive()
	}
}
