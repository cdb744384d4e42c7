//! OpenAlias resolution

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Address an alias resolved to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasRecord {
    /// Wallet address
    pub address: String,
    /// Recipient name published with the record, if any
    #[serde(default)]
    pub name: Option<String>,
}

/// OpenAlias resolver backed by the `openAlias.php` lookup endpoint
#[derive(Debug, Clone)]
pub struct OpenAliasResolver {
    api_url: String,
    client: reqwest::Client,
}

impl OpenAliasResolver {
    /// Create new resolver against `api_url` (base URL, trailing `/` optional)
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(api_url, reqwest::Client::new())
    }

    /// Create resolver sharing an existing HTTP client
    pub fn with_client(api_url: impl Into<String>, client: reqwest::Client) -> Self {
        let mut api_url = api_url.into();
        if !api_url.ends_with('/') {
            api_url.push('/');
        }
        Self { api_url, client }
    }

    /// Lookup endpoint URL
    pub fn endpoint(&self) -> String {
        format!("{}openAlias.php", self.api_url)
    }

    /// Resolve alias to address
    pub async fn resolve(&self, alias: &str) -> Result<AliasRecord> {
        let alias = validate_alias(alias)?;
        tracing::debug!(alias = %alias, "Resolving via OpenAlias");

        let response = self
            .client
            .get(self.endpoint())
            .query(&[("domain", alias)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Resolution(format!(
                "alias service returned HTTP {} for {}",
                status, alias
            )));
        }

        let body = response.text().await?;
        parse_alias_response(alias, &body)
    }
}

/// Names must be dotted domains; bare words are treated as addresses by callers.
pub fn validate_alias(alias: &str) -> Result<&str> {
    let alias = alias.trim();
    if alias.is_empty() || !alias.contains('.') || alias.starts_with('.') || alias.ends_with('.') {
        return Err(Error::InvalidName(format!("Invalid alias: {}", alias)));
    }
    if alias.chars().any(char::is_whitespace) {
        return Err(Error::InvalidName(format!("Invalid alias: {}", alias)));
    }
    Ok(alias)
}

fn parse_alias_response(alias: &str, body: &str) -> Result<AliasRecord> {
    let record: AliasRecord = serde_json::from_str(body)
        .map_err(|e| Error::Resolution(format!("bad alias response for {}: {}", alias, e)))?;
    if record.address.trim().is_empty() {
        return Err(Error::Resolution(format!("no address published for {}", alias)));
    }
    Ok(record)
}
