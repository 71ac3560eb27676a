use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::{HealthError, Result};
use crate::probe::Probe;

const SENTINEL_KEY: &str = "health_check_test";
const SENTINEL_VALUE: &str = "test";
const SENTINEL_TTL_SECS: u64 = 10;

/// Writes a short-lived sentinel key to Redis and reads it back.
pub struct CacheProbe {
    client: redis::Client,
}

impl CacheProbe {
    /// Fails only on a malformed URL; connectivity is checked per probe run.
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(HealthError::failure)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for CacheProbe {
    fn name(&self) -> &str {
        "redis"
    }

    async fn check(&self) -> Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(HealthError::failure)?;

        let _: () = conn
            .set_ex(SENTINEL_KEY, SENTINEL_VALUE, SENTINEL_TTL_SECS)
            .await
            .map_err(HealthError::failure)?;
        let value: Option<String> = conn.get(SENTINEL_KEY).await.map_err(HealthError::failure)?;

        if value.as_deref() == Some(SENTINEL_VALUE) {
            Ok(())
        } else {
            Err(HealthError::Failure("Cache value mismatch".into()))
        }
    }
}
