use prometheus::{IntGauge, IntGaugeVec, Opts, Registry};

/// Pod-level prometheus metrics.
pub struct ShardingMetrics {
    /// Number of active entities, labelled by recipient type.
    pub entities: IntGaugeVec,
    /// Number of shards currently assigned to this pod.
    pub shards: IntGauge,
    /// Whether a singleton is running on this pod (1/0), labelled by name.
    pub singletons: IntGaugeVec,
}

impl ShardingMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let entities = IntGaugeVec::new(
            Opts::new("sharding_entities", "Number of active entities"),
            &["entity_type"],
        )?;
        let shards = IntGauge::with_opts(Opts::new(
            "sharding_shards",
            "Number of shards assigned to this pod",
        ))?;
        let singletons = IntGaugeVec::new(
            Opts::new(
                "sharding_singletons",
                "Whether a singleton is running on this pod",
            ),
            &["singleton_name"],
        )?;

        registry.register(Box::new(entities.clone()))?;
        registry.register(Box::new(shards.clone()))?;
        registry.register(Box::new(singletons.clone()))?;

        Ok(Self {
            entities,
            shards,
            singletons,
        })
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self {
            entities: IntGaugeVec::new(
                Opts::new("sharding_entities", "entities"),
                &["entity_type"],
            )
            .expect("valid metric name"),
            shards: IntGauge::new("sharding_shards", "shards").expect("valid metric name"),
            singletons: IntGaugeVec::new(
                Opts::new("sharding_singletons", "singletons"),
                &["singleton_name"],
            )
            .expect("valid metric name"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_metrics_work() {
        let m = ShardingMetrics::unregistered();
        m.entities.with_label_values(&["User"]).set(3);
        assert_eq!(m.entities.with_label_values(&["User"]).get(), 3);
    }

    #[test]
    fn registered_metrics_work() {
        let r = Registry::new();
        let m = ShardingMetrics::new(&r).unwrap();
        m.shards.set(10);
        assert_eq!(m.shards.get(), 10);
    }
}
