// Broadcast messages exchanged with peers and local listeners

use crate::core::Timestamp;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broadcast kinds, carried on the wire as `flag`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastKind {
    /// New-transaction announcement
    Transaction,
    /// Mined-hash announcement
    MinedHash,
}

impl BroadcastKind {
    pub fn flag(&self) -> i32 {
        match self {
            BroadcastKind::Transaction => 1,
            BroadcastKind::MinedHash => 2,
        }
    }

    pub fn from_flag(flag: i32) -> Option<Self> {
        match flag {
            1 => Some(BroadcastKind::Transaction),
            2 => Some(BroadcastKind::MinedHash),
            _ => None,
        }
    }
}

/// Rejections at the ingest boundary
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed broadcast payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown broadcast flag {0}")]
    UnknownFlag(i32),

    #[error("mined-hash broadcast without a block id")]
    MissingBlockId,

    #[error("mined-hash broadcast with an empty hash")]
    EmptyHash,
}

/// `{ flag, data, timeStamp, blockId? }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub flag: i32,
    pub data: String,
    pub time_stamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
}

impl BroadcastMessage {
    pub fn new(kind: BroadcastKind, data: String, time_stamp: Timestamp, block_id: Option<String>) -> Self {
        // Only mined-hash announcements carry a block id
        let block_id = match kind {
            BroadcastKind::MinedHash => block_id,
            BroadcastKind::Transaction => None,
        };
        Self {
            flag: kind.flag(),
            data,
            time_stamp,
            block_id,
        }
    }

    pub fn kind(&self) -> Option<BroadcastKind> {
        BroadcastKind::from_flag(self.flag)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse and check a message received from the network
    pub fn parse(raw: &str) -> Result<Self, IngestError> {
        let message: Self = serde_json::from_str(raw)?;
        match message.kind() {
            None => Err(IngestError::UnknownFlag(message.flag)),
            Some(BroadcastKind::MinedHash) => {
                if message.block_id.as_deref().is_none_or(str::is_empty) {
                    return Err(IngestError::MissingBlockId);
                }
                if message.data.is_empty() {
                    return Err(IngestError::EmptyHash);
                }
                Ok(message)
            }
            Some(BroadcastKind::Transaction) => Ok(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_conversion() {
        assert_eq!(BroadcastKind::Transaction.flag(), 1);
        assert_eq!(BroadcastKind::from_flag(2), Some(BroadcastKind::MinedHash));
        assert_eq!(BroadcastKind::from_flag(3), None);
    }

    #[test]
    fn test_wire_format() {
        let msg = BroadcastMessage::new(BroadcastKind::MinedHash, "00ab".into(), 99, Some("blk".into()));
        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"{"flag":2,"data":"00ab","timeStamp":99,"blockId":"blk"}"#);

        let tx = BroadcastMessage::new(BroadcastKind::Transaction, "{}".into(), 5, Some("ignored".into()));
        assert_eq!(tx.to_json().unwrap(), r#"{"flag":1,"data":"{}","timeStamp":5}"#);
    }

    #[test]
    fn test_parse_valid() {
        let msg = BroadcastMessage::parse(r#"{"flag":2,"data":"h","timeStamp":1,"blockId":"b"}"#).unwrap();
        assert_eq!(msg.kind(), Some(BroadcastKind::MinedHash));
        assert_eq!(msg.block_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(BroadcastMessage::parse("not json"), Err(IngestError::Malformed(_))));
        assert!(matches!(
            BroadcastMessage::parse(r#"{"flag":7,"data":"x","timeStamp":1}"#),
            Err(IngestError::UnknownFlag(7))
        ));
        assert!(matches!(
            BroadcastMessage::parse(r#"{"flag":2,"data":"h","timeStamp":1}"#),
            Err(IngestError::MissingBlockId)
        ));
        assert!(matches!(
            BroadcastMessage::parse(r#"{"flag":2,"data":"","timeStamp":1,"blockId":"b"}"#),
            Err(IngestError::EmptyHash)
        ));
    }
}
