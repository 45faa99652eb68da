//! Canonical user record flowing through the pipeline
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One user profile as published on the topic and stored in ClickHouse.
///
/// `id` is assigned once by the producer and is the primary key at the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub gender: String,
    pub address: String,
    pub post_code: String,
    pub email: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    pub registered_date: String,
    pub phone: String,
    pub picture_url: String,
}

/// Record fields that must be present and non-null, in column order.
pub const REQUIRED_FIELDS: [&str; 11] = [
    "id",
    "first_name",
    "last_name",
    "gender",
    "address",
    "post_code",
    "email",
    "username",
    "registered_date",
    "phone",
    "picture_url",
];

/// Record fields that may be absent or null.
pub const OPTIONAL_FIELDS: [&str; 1] = ["date_of_birth"];

impl UserRecord {
    /// Fresh primary key for a newly produced record.
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Value of a named field, `None` for unknown names and absent optionals.
    pub fn field(&self, name: &str) -> Option<&str> {
        let v = match name {
            "id" => &self.id,
            "first_name" => &self.first_name,
            "last_name" => &self.last_name,
            "gender" => &self.gender,
            "address" => &self.address,
            "post_code" => &self.post_code,
            "email" => &self.email,
            "username" => &self.username,
            "date_of_birth" => return self.date_of_birth.as_deref(),
            "registered_date" => &self.registered_date,
            "phone" => &self.phone,
            "picture_url" => &self.picture_url,
            _ => return None,
        };
        Some(v.as_str())
    }
}

#[cfg(test)]
pub(crate) fn sample(id: &str) -> UserRecord {
    UserRecord {
        id: id.to_string(),
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        gender: "female".to_string(),
        address: "12 St James's Square, London, Greater London, United Kingdom".to_string(),
        post_code: "SW1Y 4JH".to_string(),
        email: "ada@x.io".to_string(),
        username: "countess".to_string(),
        date_of_birth: Some("1815-12-10T00:00:00.000Z".to_string()),
        registered_date: "1833-06-05T00:00:00.000Z".to_string(),
        phone: "020 7946 0000".to_string(),
        picture_url: "https://randomuser.me/api/portraits/med/women/1.jpg".to_string(),
    }
}
