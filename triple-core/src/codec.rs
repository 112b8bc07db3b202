use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TripleError};

/// Serializer half of a message codec. Failures are reported as plain
/// strings and surfaced as `Internal` by the call engine.
pub type SerializeFn<T> = dyn Fn(&T) -> std::result::Result<Bytes, String> + Send + Sync;

/// Deserializer half of a message codec.
pub type DeserializeFn<T> = dyn Fn(Bytes) -> std::result::Result<T, String> + Send + Sync;

/// An opaque (serialize, deserialize) capability pair for one message type.
///
/// The call engine is parametric over the codec and never inspects the
/// value type; anything that can turn a value into bytes and back can be
/// carried over the wire.
pub struct MessageCodec<T> {
    serialize: Arc<SerializeFn<T>>,
    deserialize: Arc<DeserializeFn<T>>,
}

impl<T> Clone for MessageCodec<T> {
    fn clone(&self) -> Self {
        MessageCodec {
            serialize: Arc::clone(&self.serialize),
            deserialize: Arc::clone(&self.deserialize),
        }
    }
}

impl<T> std::fmt::Debug for MessageCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageCodec")
    }
}

impl<T> MessageCodec<T> {
    pub fn new<S, D>(serialize: S, deserialize: D) -> MessageCodec<T>
    where
        S: Fn(&T) -> std::result::Result<Bytes, String> + Send + Sync + 'static,
        D: Fn(Bytes) -> std::result::Result<T, String> + Send + Sync + 'static,
    {
        MessageCodec {
            serialize: Arc::new(serialize),
            deserialize: Arc::new(deserialize),
        }
    }

    pub fn serialize(&self, value: &T) -> Result<Bytes> {
        (self.serialize)(value).map_err(TripleError::Codec)
    }

    pub fn deserialize(&self, bytes: Bytes) -> Result<T> {
        (self.deserialize)(bytes).map_err(TripleError::Codec)
    }
}

impl<T> MessageCodec<T>
where
    T: prost::Message + Default + 'static,
{
    /// Protobuf codec for any `prost` message type.
    pub fn proto() -> MessageCodec<T> {
        MessageCodec::new(
            |value: &T| {
                let mut buf = BytesMut::with_capacity(value.encoded_len());
                value.encode(&mut buf).map_err(|e| e.to_string())?;
                Ok(buf.freeze())
            },
            |bytes| T::decode(bytes).map_err(|e| e.to_string()),
        )
    }
}

impl<T> MessageCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    /// JSON codec for any serde type.
    pub fn json() -> MessageCodec<T> {
        MessageCodec::new(
            |value: &T| {
                let mut buf = BytesMut::new().writer();
                serde_json::to_writer(&mut buf, value).map_err(|e| e.to_string())?;
                Ok(buf.into_inner().freeze())
            },
            |bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Ping {
        #[prost(string, tag = "1")]
        token: String,
        #[prost(uint32, tag = "2")]
        sequence: u32,
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Greeting {
        name: String,
    }

    #[test]
    fn proto_codec_round_trips() {
        let codec = MessageCodec::<Ping>::proto();
        let ping = Ping {
            token: "abc".into(),
            sequence: 7,
        };
        let bytes = codec.serialize(&ping).unwrap();
        let back = codec.deserialize(bytes).unwrap();
        assert_eq!(back, ping);
    }

    #[test]
    fn json_codec_round_trips() {
        let codec = MessageCodec::<Greeting>::json();
        let value = Greeting {
            name: "world".into(),
        };
        let bytes = codec.serialize(&value).unwrap();
        assert_eq!(&bytes[..], br#"{"name":"world"}"#);
        assert_eq!(codec.deserialize(bytes).unwrap(), value);
    }

    #[test]
    fn deserialize_failure_is_a_codec_error() {
        let codec = MessageCodec::<Greeting>::json();
        let err = codec.deserialize(Bytes::from_static(b"not json")).unwrap_err();
        assert!(matches!(err, TripleError::Codec(_)));
    }

    #[test]
    fn custom_codec_functions_are_opaque() {
        let codec = MessageCodec::<u32>::new(
            |v| Ok(Bytes::copy_from_slice(&v.to_be_bytes())),
            |b| {
                let arr: [u8; 4] = b[..].try_into().map_err(|_| "short buffer".to_string())?;
                Ok(u32::from_be_bytes(arr))
            },
        );
        let bytes = codec.serialize(&0xdead_beef).unwrap();
        assert_eq!(codec.deserialize(bytes).unwrap(), 0xdead_beef);
    }
}
