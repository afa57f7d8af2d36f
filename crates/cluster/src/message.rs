// Wire format between bus nodes

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::membership::MemberView;

/// A published message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: Uuid,
    pub topic: String,
    /// Name of the node that published the message
    pub origin: String,
    #[serde(with = "direktiv_core::bytes_b64")]
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, origin: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            origin: origin.into(),
            payload,
        }
    }

    /// Payload as UTF-8, lossy
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Frame exchanged between nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireMessage {
    /// Membership state pushed by `from`
    Gossip {
        from: String,
        members: Vec<MemberView>,
    },
    /// Deliver a message to the named channels on the receiving node
    Deliver {
        channels: Vec<String>,
        message: BusMessage,
    },
}
