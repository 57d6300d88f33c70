mod pod_address;
mod recipient_type;
mod shard_id;

pub use pod_address::PodAddress;
pub use recipient_type::{RecipientKind, RecipientType};
pub use shard_id::ShardId;

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! serde_round_trip {
        ($name:ident, $val:expr) => {
            mod $name {
                use super::*;

                #[test]
                fn msgpack() {
                    let val = $val;
                    let bytes = rmp_serde::to_vec(&val).unwrap();
                    let decoded = rmp_serde::from_slice(&bytes).unwrap();
                    assert_eq!(val, decoded);
                }
            }
        };
    }

    serde_round_trip!(pod_address, PodAddress::new("10.0.0.1", 54321));
    serde_round_trip!(shard_id, ShardId::new(7));
    serde_round_trip!(entity_recipient, RecipientType::entity("User"));
    serde_round_trip!(topic_recipient, RecipientType::topic("events"));

    #[test]
    fn pod_address_display() {
        assert_eq!(PodAddress::new("localhost", 8080).to_string(), "localhost:8080");
    }

    #[test]
    fn shard_id_hash_eq() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(ShardId::new(1));
        set.insert(ShardId::new(1));
        assert_eq!(set.len(), 1);
        set.insert(ShardId::new(2));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn recipient_kinds_differ() {
        assert_ne!(RecipientType::entity("a"), RecipientType::topic("a"));
    }
}
