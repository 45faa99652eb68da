//! Wire codecs for [UserRecord] messages
//!
//! Every codec is self-describing: field names travel with each message, so
//! decoding yields a [FieldMap] that the [schema] validator checks by name.
//! Fields a newer producer adds are ignored by older consumers.
//!
//! [schema]: crate::schema
pub mod avro;
pub mod json;

use std::sync::Arc;

use thiserror::Error;

use crate::{
    record::UserRecord,
    schema::{self, FieldMap, SchemaError},
};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("payload is not a record")]
    NotARecord,
}

#[derive(Debug, Error)]
#[error("encoding record {id}: {reason}")]
pub struct EncodeError {
    pub id: String,
    pub reason: String,
}

/// Either stage of turning message bytes into a valid record.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Codec converts [UserRecord] into message bytes and back
pub trait Codec {
    fn get_name(&self) -> &'static str;
    fn encode(&self, record: &UserRecord) -> Result<Vec<u8>, EncodeError>;
    fn decode_fields(&self, message: &[u8]) -> Result<FieldMap, DecodeError>;

    /// Decodes and validates in one step.
    fn decode(&self, message: &[u8]) -> Result<UserRecord, CodecError> {
        let fields = self.decode_fields(message)?;
        Ok(schema::validate(&fields)?)
    }
}

/// Creates codec of specified name.
/// Producer and consumer of one topic must agree on it.
pub fn get_codec(name: &str) -> Result<Arc<dyn Codec + Send + Sync>, anyhow::Error> {
    match name {
        "json" => Ok(Arc::new(json::Codec)),
        "avro" => Ok(Arc::new(avro::Codec::new()?)),
        _ => Err(anyhow::anyhow!("unknown codec {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry() {
        assert_eq!(get_codec("json").unwrap().get_name(), "json");
        assert_eq!(get_codec("avro").unwrap().get_name(), "avro");
        assert!(get_codec("protobuf").is_err());
    }
}
