//! Avro object container per message
//!
//! Each message carries the writer schema in its header, so consumers decode
//! without a registry and see field names even when the producer's schema
//! has grown.
use apache_avro::{types::Value, Reader, Schema, Writer};

use super::{DecodeError, EncodeError};
use crate::{
    record::UserRecord,
    schema::{Field, FieldMap},
};

const USER_RECORD_SCHEMA: &str = r#"
{
    "type": "record",
    "name": "UserRecord",
    "namespace": "userstream",
    "fields": [
        {"name": "id", "type": "string"},
        {"name": "first_name", "type": "string"},
        {"name": "last_name", "type": "string"},
        {"name": "gender", "type": "string"},
        {"name": "address", "type": "string"},
        {"name": "post_code", "type": "string"},
        {"name": "email", "type": "string"},
        {"name": "username", "type": "string"},
        {"name": "date_of_birth", "type": ["null", "string"], "default": null},
        {"name": "registered_date", "type": "string"},
        {"name": "phone", "type": "string"},
        {"name": "picture_url", "type": "string"}
    ]
}
"#;

pub struct Codec {
    schema: Schema,
}

impl Codec {
    pub fn new() -> Result<Codec, anyhow::Error> {
        Ok(Codec {
            schema: Schema::parse_str(USER_RECORD_SCHEMA)?,
        })
    }
}

fn record2avro(r: &UserRecord) -> Value {
    let s = |v: &str| Value::String(v.to_owned());
    let dob = match &r.date_of_birth {
        Some(d) => Value::Union(1, Box::new(s(d))),
        None => Value::Union(0, Box::new(Value::Null)),
    };
    Value::Record(vec![
        (String::from("id"), s(&r.id)),
        (String::from("first_name"), s(&r.first_name)),
        (String::from("last_name"), s(&r.last_name)),
        (String::from("gender"), s(&r.gender)),
        (String::from("address"), s(&r.address)),
        (String::from("post_code"), s(&r.post_code)),
        (String::from("email"), s(&r.email)),
        (String::from("username"), s(&r.username)),
        (String::from("date_of_birth"), dob),
        (String::from("registered_date"), s(&r.registered_date)),
        (String::from("phone"), s(&r.phone)),
        (String::from("picture_url"), s(&r.picture_url)),
    ])
}

impl super::Codec for Codec {
    fn get_name(&self) -> &'static str {
        "avro"
    }

    fn encode(&self, record: &UserRecord) -> Result<Vec<u8>, EncodeError> {
        let err = |e: apache_avro::Error| EncodeError {
            id: record.id.clone(),
            reason: e.to_string(),
        };
        let mut writer = Writer::new(&self.schema, Vec::new());
        writer.append(record2avro(record)).map_err(err)?;
        writer.into_inner().map_err(err)
    }

    fn decode_fields(&self, message: &[u8]) -> Result<FieldMap, DecodeError> {
        if message.is_empty() {
            return Err(DecodeError::Empty);
        }
        let mut reader = Reader::new(message).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        match reader.next() {
            Some(Ok(Value::Record(fields))) => Ok(fields
                .into_iter()
                .map(|(name, v)| (name, avro2field(v)))
                .collect()),
            Some(Ok(_)) => Err(DecodeError::NotARecord),
            Some(Err(e)) => Err(DecodeError::Malformed(format!("avro unmarshalling: {e}"))),
            None => Err(DecodeError::Malformed(String::from("container holds no datum"))),
        }
    }
}

fn avro2field(v: Value) -> Field {
    match v {
        Value::Null => Field::Null,
        Value::String(x) => Field::Text(x),
        Value::Enum(_, x) => Field::Text(x),
        Value::Union(_, inner) => avro2field(*inner),
        Value::Boolean(_) => Field::Other("boolean"),
        Value::Int(_) | Value::Long(_) => Field::Other("integer"),
        Value::Float(_) | Value::Double(_) => Field::Other("float"),
        Value::Bytes(_) | Value::Fixed(_, _) => Field::Other("bytes"),
        Value::Array(_) => Field::Other("array"),
        Value::Map(_) => Field::Other("map"),
        Value::Record(_) => Field::Other("record"),
        _ => Field::Other("logical"),
    }
}
