//! Request and reply envelopes, encoded with `serde-json-core`.

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use super::table::RequestId;
use crate::error::PayloadError;
use crate::payload::Value;

/// `{"id": .., "method": .., "params": {..}}`
#[derive(Serialize)]
pub(crate) struct RpcCall<'a> {
    pub id: RequestId,
    pub method: &'a str,
    pub params: Params<'a>,
}

/// Named call parameters, written as one JSON object.
pub(crate) struct Params<'a>(pub &'a [(&'a str, Value<'a>)]);

impl Serialize for Params<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(key, value)| (key, value)))
    }
}

/// `{"id": .., "<keys field>": "a,b,c"}`
pub(crate) struct AttributeQuery<'a> {
    pub id: RequestId,
    pub keys_field: &'a str,
    pub keys: &'a str,
}

impl Serialize for AttributeQuery<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry(self.keys_field, self.keys)?;
        map.end()
    }
}

/// Serializes `envelope` into `out`, returning the length written.
pub(crate) fn encode<T: Serialize>(envelope: &T, out: &mut [u8]) -> Result<usize, PayloadError> {
    serde_json_core::to_slice(envelope, out).map_err(|_| PayloadError::BufferTooSmall)
}

#[derive(Deserialize)]
struct NumericId {
    #[serde(default)]
    id: Option<RequestId>,
}

#[derive(Deserialize)]
struct TextId<'a> {
    #[serde(default, borrow)]
    id: Option<&'a str>,
}

/// The `id` field of a reply payload, as a number or a numeric string.
pub(crate) fn payload_id(payload: &[u8]) -> Option<RequestId> {
    if let Ok((NumericId { id: Some(id) }, _)) = serde_json_core::from_slice::<NumericId>(payload) {
        return Some(id);
    }
    let (TextId { id }, _) = serde_json_core::from_slice::<TextId<'_>>(payload).ok()?;
    id?.parse().ok()
}
