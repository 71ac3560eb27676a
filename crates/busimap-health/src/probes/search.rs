use async_trait::async_trait;

use crate::error::{HealthError, Result};
use crate::probe::Probe;

/// Requests `{url}/_cluster/health`; any non-200 answer is a failure.
pub struct SearchProbe {
    url: String,
    client: reqwest::Client,
}

impl SearchProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Probe for SearchProbe {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    async fn check(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/_cluster/health", self.url))
            .send()
            .await
            .map_err(HealthError::failure)?;

        let status = resp.status();
        if status == reqwest::StatusCode::OK {
            Ok(())
        } else {
            Err(HealthError::Failure(format!("HTTP {}", status.as_u16())))
        }
    }
}
