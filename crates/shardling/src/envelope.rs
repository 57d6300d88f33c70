use crate::reply::ReplyId;
use serde::{Deserialize, Serialize};

/// Wire form of a request between pods.
///
/// The body is an opaque MessagePack document; the receiving pod looks up the
/// entity type by name and decodes the body with that type's message codec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryMessage {
    pub entity_id: String,
    pub entity_type: String,
    pub body: Vec<u8>,
    pub reply_id: Option<ReplyId>,
}

impl BinaryMessage {
    pub fn new(
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        body: Vec<u8>,
        reply_id: Option<ReplyId>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            body,
            reply_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_message_serde_round_trip() {
        let msg = BinaryMessage::new("user-1", "User", vec![1, 2, 3], Some(ReplyId::random()));
        let bytes = rmp_serde::to_vec(&msg).unwrap();
        let decoded: BinaryMessage = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded.entity_id, msg.entity_id);
        assert_eq!(decoded.entity_type, msg.entity_type);
        assert_eq!(decoded.body, msg.body);
        assert_eq!(decoded.reply_id, msg.reply_id);
    }

    #[test]
    fn reply_id_defaults_to_none_for_fire_and_forget() {
        let msg = BinaryMessage::new("t", "Topic", vec![], None);
        let bytes = rmp_serde::to_vec(&msg).unwrap();
        let decoded: BinaryMessage = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded.reply_id, None);
    }
}
