use crate::types::PodAddress;

/// Errors surfaced by the sharding runtime.
///
/// The first two variants describe transient routing conditions and are
/// recovered internally by the router with constant backoff; they reach
/// callers only through a caller-imposed timeout. Everything else is
/// surfaced through the reply channel or the call's return value.
#[derive(Debug, thiserror::Error)]
pub enum ShardingError {
    #[error("entity {entity_id} is not managed by this pod")]
    EntityNotManagedByThisPod { entity_id: String },

    #[error("pod {address} is unavailable")]
    PodUnavailable { address: PodAddress },

    #[error("send to {entity_type}/{entity_id} timed out")]
    SendTimeout {
        entity_type: String,
        entity_id: String,
    },

    #[error("stream cancelled by peer")]
    StreamCancelled,

    #[error("no reply received from {entity_type}/{entity_id}")]
    NoReplyReceived {
        entity_type: String,
        entity_id: String,
    },

    #[error("unknown recipient type: {name}")]
    UnknownRecipientType { name: String },

    #[error("serialization error: {reason}")]
    Serde {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("transport error: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl ShardingError {
    pub(crate) fn entity_not_managed(entity_id: impl Into<String>) -> Self {
        Self::EntityNotManagedByThisPod {
            entity_id: entity_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = ShardingError::EntityNotManagedByThisPod {
            entity_id: "user-1".into(),
        };
        assert_eq!(err.to_string(), "entity user-1 is not managed by this pod");

        let err = ShardingError::PodUnavailable {
            address: PodAddress::new("10.0.0.3", 54321),
        };
        assert_eq!(err.to_string(), "pod 10.0.0.3:54321 is unavailable");
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ShardingError>();
    }
}
