use async_trait::async_trait;
use busimap_health::HealthAggregator;

/// Admission check consulted before dispatching a job that declares
/// required services.
#[async_trait]
pub trait DependencyGate: Send + Sync {
    /// The subset of `services` that is currently unavailable.
    async fn unavailable(&self, services: &[String]) -> Vec<String>;
}

/// Runs only the named probes; a name with no registered probe counts as
/// unavailable.
#[async_trait]
impl DependencyGate for HealthAggregator {
    async fn unavailable(&self, services: &[String]) -> Vec<String> {
        self.aggregate_only(services).await.unhealthy_services()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use busimap_health::{HealthError, Probe, ProbeSpec};

    use super::*;

    struct Fixed {
        name: &'static str,
        up: bool,
    }

    #[async_trait]
    impl Probe for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn check(&self) -> busimap_health::Result<()> {
            if self.up {
                Ok(())
            } else {
                Err(HealthError::Failure("connection refused".into()))
            }
        }
    }

    fn spec(name: &'static str, up: bool) -> ProbeSpec {
        ProbeSpec::new(Arc::new(Fixed { name, up }), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn aggregator_reports_only_down_services() {
        let agg = HealthAggregator::builder()
            .probe(spec("database", true))
            .probe(spec("redis", false))
            .build()
            .unwrap();

        let down = agg
            .unavailable(&["database".to_string(), "redis".to_string()])
            .await;
        assert_eq!(down, vec!["redis".to_string()]);

        assert!(agg.unavailable(&["database".to_string()]).await.is_empty());
        assert!(agg.unavailable(&[]).await.is_empty());
    }
}
