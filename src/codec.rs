//! Value codec for binary payloads embedded in JSON columns.
//!
//! Rows written by earlier implementations store binary values (content
//! MD5, for instance) either as `{"type": "Buffer", "data": [..]}` or as an
//! object with numeric keys (`{"0": 18, "1": 52, ..}`). The decoder restores
//! both forms, plus plain byte arrays; the encoder always writes the
//! `Buffer` form.

use serde_json::Value;

/// Decodes a JSON value into raw bytes.
pub fn decode_binary(value: &Value) -> Result<Vec<u8>, String> {
    match value {
        Value::Array(items) => collect_bytes(items),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("data") {
                return collect_bytes(items);
            }
            // Numeric-keyed object form: {"0": 18, "1": 52, ...}
            let mut pairs = Vec::with_capacity(map.len());
            for (key, item) in map {
                let index: usize = key
                    .parse()
                    .map_err(|_| format!("unexpected binary object key `{key}`"))?;
                let byte = item
                    .as_u64()
                    .filter(|&b| b <= u8::MAX as u64)
                    .ok_or_else(|| format!("binary element at `{key}` is not a byte"))?;
                pairs.push((index, byte as u8));
            }
            pairs.sort_by_key(|(index, _)| *index);
            Ok(pairs.into_iter().map(|(_, byte)| byte).collect())
        }
        other => Err(format!("cannot decode binary value from {other}")),
    }
}

/// Encodes raw bytes in the `{"type": "Buffer", "data": [..]}` form.
pub fn encode_binary(bytes: &[u8]) -> Value {
    serde_json::json!({
        "type": "Buffer",
        "data": bytes,
    })
}

fn collect_bytes(items: &[Value]) -> Result<Vec<u8>, String> {
    items
        .iter()
        .map(|item| {
            item.as_u64()
                .filter(|&b| b <= u8::MAX as u64)
                .map(|b| b as u8)
                .ok_or_else(|| format!("binary element {item} is not a byte"))
        })
        .collect()
}

/// Serde adapter for optional binary fields stored in the tolerant form.
pub mod binary_opt {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => super::encode_binary(bytes).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(v) => super::decode_binary(&v).map(Some).map_err(D::Error::custom),
        }
    }
}
