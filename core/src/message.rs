use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;

/// Size and chunk count of a published file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub size: u64,
    pub total_chunknum: u32,
}

/// Self-reported address of a node, distinct from its transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SocketAddr> for NodeAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

/// filename -> file info
pub type FileCatalog = BTreeMap<String, FileInfo>;

/// node address -> chunk indices that node claims to hold
pub type ChunkOwnership = BTreeMap<NodeAddress, BTreeSet<u32>>;

/// Answer to a location query: the catalogued info plus who holds which chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocation {
    pub fileinfo: FileInfo,
    pub chunkinfo: ChunkOwnership,
}

impl FileLocation {
    /// Nodes claiming `chunknum`, in address order.
    pub fn providers(&self, chunknum: u32) -> Vec<NodeAddress> {
        self.chunkinfo
            .iter()
            .filter(|(_, chunks)| chunks.contains(&chunknum))
            .map(|(address, _)| address.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum RegisterRejection {
    #[error("connection is already registered under another address")]
    AlreadyRegistered,

    #[error("address is held by another live connection")]
    AddressInUse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum PublishRejection {
    #[error("file already published")]
    AlreadyExists,

    #[error("connection has not registered an address")]
    NotRegistered,

    #[error("file has no chunks")]
    EmptyFile,
}

/// Control messages exchanged between nodes and the coordinator.
///
/// The `type` tag drives dispatch; tags this build does not know decode to
/// [`Message::Unknown`] so a newer peer cannot take a session down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    RequestRegister {
        address: NodeAddress,
    },
    RequestPublish {
        filename: String,
        fileinfo: FileInfo,
    },
    RequestFileList,
    RequestFileLocation {
        filename: String,
    },
    RequestChunkRegister {
        filename: String,
        chunknum: u32,
    },
    ReplyRegister {
        result: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<RegisterRejection>,
    },
    ReplyPublish {
        filename: String,
        result: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<PublishRejection>,
    },
    ReplyFileList {
        file_list: FileCatalog,
    },
    /// `fileinfo` is absent when the file is not catalogued.
    ReplyFileLocation {
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fileinfo: Option<FileInfo>,
        #[serde(default)]
        chunkinfo: ChunkOwnership,
    },
    #[serde(other)]
    Unknown,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestRegister { .. } => "request_register",
            Message::RequestPublish { .. } => "request_publish",
            Message::RequestFileList => "request_file_list",
            Message::RequestFileLocation { .. } => "request_file_location",
            Message::RequestChunkRegister { .. } => "request_chunk_register",
            Message::ReplyRegister { .. } => "reply_register",
            Message::ReplyPublish { .. } => "reply_publish",
            Message::ReplyFileList { .. } => "reply_file_list",
            Message::ReplyFileLocation { .. } => "reply_file_location",
            Message::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tag_is_snake_case() {
        let msg = Message::RequestChunkRegister {
            filename: "doc.bin".to_string(),
            chunknum: 3,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "request_chunk_register");
        assert_eq!(json["chunknum"], 3);

        let unit = serde_json::to_value(Message::RequestFileList).unwrap();
        assert_eq!(unit, serde_json::json!({ "type": "request_file_list" }));
    }

    #[test]
    fn test_unknown_tag_decodes_to_unknown() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"peer_ping_pong","nonce":7}"#).unwrap();
        assert_eq!(msg, Message::Unknown);
    }

    #[test]
    fn test_missing_type_is_an_error() {
        let result: Result<Message, _> = serde_json::from_str(r#"{"filename":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_location_reply_without_fileinfo() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"reply_file_location","filename":"missing"}"#)
                .unwrap();
        assert_eq!(
            msg,
            Message::ReplyFileLocation {
                filename: "missing".to_string(),
                fileinfo: None,
                chunkinfo: ChunkOwnership::new(),
            }
        );
    }

    #[test]
    fn test_publish_rejection_wire_name() {
        let msg = Message::ReplyPublish {
            filename: "a".to_string(),
            result: false,
            reason: Some(PublishRejection::AlreadyExists),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["reason"], "already_exists");
    }
}
