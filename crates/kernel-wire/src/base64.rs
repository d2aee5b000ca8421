//! Base64 (de)serialization for buffers carried in JSON text frames.

use base64::prelude::*;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Serialize buffers as a list of base64 strings.
///
/// Used with `#[serde(serialize_with = "serialize_buffers")]`
pub fn serialize_buffers<S>(data: &[Bytes], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    data.iter()
        .map(|bytes| BASE64_STANDARD.encode(bytes))
        .collect::<Vec<_>>()
        .serialize(serializer)
}

/// Deserialize a list of base64 strings into buffers.
///
/// `null` and a missing field both yield no buffers.
pub fn deserialize_buffers<'de, D>(deserializer: D) -> Result<Vec<Bytes>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded: Option<Vec<String>> = Option::deserialize(deserializer)?;
    encoded
        .unwrap_or_default()
        .iter()
        .map(|s| {
            BASE64_STANDARD
                .decode(s)
                .map(Bytes::from)
                .map_err(serde::de::Error::custom)
        })
        .collect()
}
