//! Schema codec seam.
//!
//! The relay never interprets message bodies itself; it hands them to a
//! [`SchemaCodec`] keyed by message name and dialect. The default
//! implementation resolves messages against a protobuf descriptor pool per
//! dialect, loaded lazily from `{schema_root}/schema.pb` on first use, so a
//! dialect nobody speaks never touches the disk. Decoded messages are
//! dynamic: mutation hooks address fields by name without generated types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use prost::Message as _;
use prost_reflect::{DescriptorPool, DynamicMessage};
use thiserror::Error;

use relay_shared::ids::ProtocolVersion;

/// Decoded message structure passed to mutation hooks.
pub type Message = DynamicMessage;

#[derive(Debug, Error)]
pub enum SchemaCodecError {
    #[error("no schema root configured for {0}")]
    UnknownVersion(ProtocolVersion),
    #[error("schema pool for {version}: {reason}")]
    Pool {
        version: ProtocolVersion,
        reason: String,
    },
    #[error("message {name:?} unknown to {version}")]
    UnknownMessage {
        name: String,
        version: ProtocolVersion,
    },
    #[error("decode of {name:?} under {version} failed: {source}")]
    Decode {
        name: String,
        version: ProtocolVersion,
        source: prost::DecodeError,
    },
}

/// Decode/encode contract for message bodies and the frame head sub-message.
pub trait SchemaCodec: Send + Sync {
    fn decode(
        &self,
        bytes: &[u8],
        name: &str,
        version: ProtocolVersion,
    ) -> Result<Message, SchemaCodecError>;

    fn encode(
        &self,
        message: &Message,
        name: &str,
        version: ProtocolVersion,
    ) -> Result<Vec<u8>, SchemaCodecError>;

    /// Builds the head sub-message carrying the send timestamp.
    fn encode_head(
        &self,
        version: ProtocolVersion,
        sent_ms: u64,
    ) -> Result<Vec<u8>, SchemaCodecError>;
}

/// Message name of the frame head sub-message.
const HEAD_MESSAGE: &str = "PacketHead";
const HEAD_TIMESTAMP_FIELD: &str = "sent_ms";

/// Descriptor-pool backed codec, one pool per dialect.
pub struct DescriptorCodec {
    pools: HashMap<ProtocolVersion, LazyPool>,
}

struct LazyPool {
    path: PathBuf,
    pool: OnceLock<Result<DescriptorPool, String>>,
}

impl DescriptorCodec {
    /// One entry per dialect: the schema root holding `schema.pb`.
    pub fn new(roots: impl IntoIterator<Item = (ProtocolVersion, PathBuf)>) -> Self {
        Self {
            pools: roots
                .into_iter()
                .map(|(version, root)| {
                    (
                        version,
                        LazyPool {
                            path: root.join("schema.pb"),
                            pool: OnceLock::new(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Builds a codec from already-loaded pools; used by tests and tools.
    pub fn from_pools(pools: impl IntoIterator<Item = (ProtocolVersion, DescriptorPool)>) -> Self {
        Self {
            pools: pools
                .into_iter()
                .map(|(version, pool)| {
                    (
                        version,
                        LazyPool {
                            path: PathBuf::new(),
                            pool: OnceLock::from(Ok(pool)),
                        },
                    )
                })
                .collect(),
        }
    }

    fn pool(&self, version: ProtocolVersion) -> Result<&DescriptorPool, SchemaCodecError> {
        let lazy = self
            .pools
            .get(&version)
            .ok_or(SchemaCodecError::UnknownVersion(version))?;
        lazy.pool
            .get_or_init(|| {
                let bytes = std::fs::read(&lazy.path).map_err(|err| {
                    format!("read {}: {err}", lazy.path.display())
                })?;
                DescriptorPool::decode(bytes.as_slice())
                    .map_err(|err| format!("parse {}: {err}", lazy.path.display()))
            })
            .as_ref()
            .map_err(|reason| SchemaCodecError::Pool {
                version,
                reason: reason.clone(),
            })
    }

    fn descriptor(
        &self,
        name: &str,
        version: ProtocolVersion,
    ) -> Result<prost_reflect::MessageDescriptor, SchemaCodecError> {
        self.pool(version)?
            .get_message_by_name(name)
            .ok_or_else(|| SchemaCodecError::UnknownMessage {
                name: name.to_string(),
                version,
            })
    }
}

impl SchemaCodec for DescriptorCodec {
    fn decode(
        &self,
        bytes: &[u8],
        name: &str,
        version: ProtocolVersion,
    ) -> Result<Message, SchemaCodecError> {
        let descriptor = self.descriptor(name, version)?;
        DynamicMessage::decode(descriptor, bytes).map_err(|source| SchemaCodecError::Decode {
            name: name.to_string(),
            version,
            source,
        })
    }

    fn encode(
        &self,
        message: &Message,
        name: &str,
        version: ProtocolVersion,
    ) -> Result<Vec<u8>, SchemaCodecError> {
        let descriptor = self.descriptor(name, version)?;
        let wire = message.encode_to_vec();
        // Round the bytes through the target dialect's descriptor so a field
        // layout mismatch surfaces here instead of at the far peer.
        DynamicMessage::decode(descriptor, wire.as_slice()).map_err(|source| {
            SchemaCodecError::Decode {
                name: name.to_string(),
                version,
                source,
            }
        })?;
        Ok(wire)
    }

    fn encode_head(
        &self,
        version: ProtocolVersion,
        sent_ms: u64,
    ) -> Result<Vec<u8>, SchemaCodecError> {
        let descriptor = self.descriptor(HEAD_MESSAGE, version)?;
        let mut head = DynamicMessage::new(descriptor.clone());
        if let Some(field) = descriptor.get_field_by_name(HEAD_TIMESTAMP_FIELD) {
            head.set_field(&field, prost_reflect::Value::U64(sent_ms));
        }
        Ok(head.encode_to_vec())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory descriptor pools for codec-dependent tests.

    use prost_reflect::DescriptorPool;
    use prost_types::field_descriptor_proto::{Label, Type};
    use prost_types::{
        DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    };

    fn field(name: &str, number: i32, ty: Type) -> FieldDescriptorProto {
        FieldDescriptorProto {
            name: Some(name.to_string()),
            number: Some(number),
            r#type: Some(ty as i32),
            label: Some(Label::Optional as i32),
            json_name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn message(name: &str, fields: Vec<FieldDescriptorProto>) -> DescriptorProto {
        DescriptorProto {
            name: Some(name.to_string()),
            field: fields,
            ..Default::default()
        }
    }

    /// A pool with the handful of messages the relay tests exercise.
    pub fn pool() -> DescriptorPool {
        let file = FileDescriptorProto {
            name: Some("relay_test.proto".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![
                message("PacketHead", vec![field("sent_ms", 1, Type::Uint64)]),
                message("PingReq", vec![field("value", 1, Type::Uint32)]),
                message(
                    "GetPlayerTokenReq",
                    vec![
                        field("account_uid", 1, Type::String),
                        field("account_token", 2, Type::String),
                    ],
                ),
                message(
                    "GetPlayerTokenRsp",
                    vec![
                        field("secret_key_seed", 1, Type::Uint64),
                        field("uid", 2, Type::Uint32),
                    ],
                ),
            ],
            ..Default::default()
        };
        DescriptorPool::from_file_descriptor_set(FileDescriptorSet { file: vec![file] })
            .expect("test descriptor set is well formed")
    }
}

#[cfg(test)]
mod tests {
    use super::testing::pool;
    use super::*;
    use prost::Message as _;
    use prost_reflect::Value;

    fn codec() -> DescriptorCodec {
        DescriptorCodec::from_pools([
            (ProtocolVersion::new(2), pool()),
            (ProtocolVersion::new(3), pool()),
        ])
    }

    #[test]
    fn decode_encode_roundtrip() {
        let codec = codec();
        let v2 = ProtocolVersion::new(2);

        let descriptor = pool().get_message_by_name("PingReq").unwrap();
        let mut msg = DynamicMessage::new(descriptor.clone());
        msg.set_field(
            &descriptor.get_field_by_name("value").unwrap(),
            Value::U32(7),
        );
        let bytes = msg.encode_to_vec();

        let decoded = codec.decode(&bytes, "PingReq", v2).expect("decode");
        assert_eq!(
            decoded.get_field_by_name("value").unwrap().as_u32(),
            Some(7)
        );
        let encoded = codec.encode(&decoded, "PingReq", v2).expect("encode");
        assert_eq!(encoded, bytes);
    }

    #[test]
    fn cross_version_reencode_preserves_fields() {
        // Two dialects sharing a message: decode under one, encode under the
        // other, decode again — the fields must survive unchanged.
        let codec = codec();
        let v2 = ProtocolVersion::new(2);
        let v3 = ProtocolVersion::new(3);

        let descriptor = pool().get_message_by_name("GetPlayerTokenRsp").unwrap();
        let mut msg = DynamicMessage::new(descriptor.clone());
        msg.set_field(
            &descriptor.get_field_by_name("secret_key_seed").unwrap(),
            Value::U64(0xA1B2_C3D4_E5F6_0718),
        );
        msg.set_field(&descriptor.get_field_by_name("uid").unwrap(), Value::U32(9));

        let decoded_a = codec
            .decode(&msg.encode_to_vec(), "GetPlayerTokenRsp", v2)
            .expect("decode under A");
        let encoded_b = codec
            .encode(&decoded_a, "GetPlayerTokenRsp", v3)
            .expect("encode under B");
        let decoded_b = codec
            .decode(&encoded_b, "GetPlayerTokenRsp", v3)
            .expect("decode under B");

        for field in ["secret_key_seed", "uid"] {
            assert_eq!(
                decoded_a.get_field_by_name(field),
                decoded_b.get_field_by_name(field),
                "field {field} must survive the A → B round trip"
            );
        }
    }

    #[test]
    fn unknown_message_reported() {
        let codec = codec();
        let err = codec
            .decode(&[], "NoSuchMessage", ProtocolVersion::new(2))
            .unwrap_err();
        assert!(matches!(err, SchemaCodecError::UnknownMessage { .. }));
    }

    #[test]
    fn unknown_version_reported() {
        let codec = codec();
        let err = codec
            .decode(&[], "PingReq", ProtocolVersion::new(99))
            .unwrap_err();
        assert!(matches!(err, SchemaCodecError::UnknownVersion(_)));
    }

    #[test]
    fn head_carries_timestamp() {
        let codec = codec();
        let v3 = ProtocolVersion::new(3);
        let head = codec.encode_head(v3, 1_700_000_000_123).expect("head");
        let decoded = codec.decode(&head, "PacketHead", v3).expect("decode head");
        assert_eq!(
            decoded.get_field_by_name("sent_ms").unwrap().as_u64(),
            Some(1_700_000_000_123)
        );
    }
}
