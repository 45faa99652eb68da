//! Upstream user profiles over HTTP
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::record::UserRecord;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("requesting {url}: {reason}")]
    Http { url: String, reason: String },
    #[error("malformed profile: {0}")]
    Malformed(String),
}

/// Returns one raw user profile per call.
#[async_trait]
pub trait UserSource: Send + Sync {
    async fn fetch(&self) -> Result<Value, FetchError>;
}

/// randomuser.me style API: `{"results": [<profile>]}`.
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.to_owned(),
        })
    }
}

#[async_trait]
impl UserSource for HttpSource {
    async fn fetch(&self) -> Result<Value, FetchError> {
        let http = |e: reqwest::Error| FetchError::Http {
            url: self.url.clone(),
            reason: e.to_string(),
        };
        let mut body: Value = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http)?
            .json()
            .await
            .map_err(http)?;
        match body.get_mut("results").and_then(|r| r.get_mut(0)) {
            Some(profile) => Ok(profile.take()),
            None => Err(FetchError::Malformed(String::from("no results[0] in response"))),
        }
    }
}

fn text(profile: &Value, path: &[&str]) -> Result<String, FetchError> {
    let mut v = profile;
    for key in path {
        v = v
            .get(key)
            .ok_or_else(|| FetchError::Malformed(format!("missing {}", path.join("."))))?;
    }
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(FetchError::Malformed(format!(
            "{} is not text",
            path.join(".")
        ))),
    }
}

/// Maps one upstream profile into a record carrying the given `id`.
pub fn format_user(profile: &Value, id: String) -> Result<UserRecord, FetchError> {
    let address = format!(
        "{} {}, {}, {}, {}",
        text(profile, &["location", "street", "number"])?,
        text(profile, &["location", "street", "name"])?,
        text(profile, &["location", "city"])?,
        text(profile, &["location", "state"])?,
        text(profile, &["location", "country"])?,
    );
    Ok(UserRecord {
        id,
        first_name: text(profile, &["name", "first"])?,
        last_name: text(profile, &["name", "last"])?,
        gender: text(profile, &["gender"])?,
        address,
        post_code: text(profile, &["location", "postcode"])?,
        email: text(profile, &["email"])?,
        username: text(profile, &["login", "username"])?,
        date_of_birth: text(profile, &["dob", "date"]).ok(),
        registered_date: text(profile, &["registered", "date"])?,
        phone: text(profile, &["phone"])?,
        picture_url: text(profile, &["picture", "medium"])?,
    })
}

#[cfg(test)]
pub(crate) fn sample_profile() -> Value {
    serde_json::json!({
        "gender": "female",
        "name": {"title": "Ms", "first": "Ada", "last": "Lovelace"},
        "location": {
            "street": {"number": 12, "name": "St James's Square"},
            "city": "London",
            "state": "Greater London",
            "country": "United Kingdom",
            "postcode": 40512
        },
        "email": "ada@x.io",
        "login": {"uuid": "ignored", "username": "countess"},
        "dob": {"date": "1815-12-10T00:00:00.000Z", "age": 36},
        "registered": {"date": "1833-06-05T00:00:00.000Z", "age": 19},
        "phone": "020 7946 0000",
        "picture": {"large": "l.jpg", "medium": "m.jpg", "thumbnail": "t.jpg"}
    })
}
