use serde_json::Value;

use super::{DecodeError, EncodeError};
use crate::{
    record::UserRecord,
    schema::{Field, FieldMap},
};

/// One JSON object per message, the default wire format.
pub struct Codec;

impl super::Codec for Codec {
    fn get_name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, record: &UserRecord) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(record).map_err(|e| EncodeError {
            id: record.id.clone(),
            reason: e.to_string(),
        })
    }

    fn decode_fields(&self, message: &[u8]) -> Result<FieldMap, DecodeError> {
        if message.is_empty() {
            return Err(DecodeError::Empty);
        }
        let v: Value =
            serde_json::from_slice(message).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let Value::Object(obj) = v else {
            return Err(DecodeError::NotARecord);
        };
        Ok(obj.into_iter().map(|(k, v)| (k, json2field(v))).collect())
    }
}

fn json2field(v: Value) -> Field {
    match v {
        Value::Null => Field::Null,
        Value::String(s) => Field::Text(s),
        Value::Bool(_) => Field::Other("boolean"),
        Value::Number(_) => Field::Other("number"),
        Value::Array(_) => Field::Other("array"),
        Value::Object(_) => Field::Other("object"),
    }
}
