//! Endpoint configuration sanitizing
//!
//! Endpoint fields arrive from the host exactly as the user typed them. A
//! field that still carries an unexpanded `{{ ... }}` template is cleared
//! instead of being sent to the store, and empty fields fall back to the
//! store defaults.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use tracing::warn;

/// Marker of an unresolved template placeholder
pub const PLACEHOLDER_MARKER: &str = "{{";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6379;

/// Endpoint fields as stored by the host, before sanitizing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEndpointConfig {
    #[serde(default, deserialize_with = "text_field")]
    pub host: Option<String>,

    #[serde(default, deserialize_with = "text_field")]
    pub port: Option<String>,

    /// Logical database index
    #[serde(default, alias = "dbase", deserialize_with = "text_field")]
    pub database: Option<String>,

    #[serde(default, alias = "pass", deserialize_with = "text_field")]
    pub password: Option<String>,
}

/// Sanitized endpoint, ready to open a connection with
#[derive(Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub database: Option<i64>,
    pub password: Option<String>,
}

impl EndpointConfig {
    /// Raw form of this endpoint; sanitizing it yields `self` again.
    pub fn to_raw(&self) -> RawEndpointConfig {
        RawEndpointConfig {
            host: Some(self.host.clone()),
            port: Some(self.port.to_string()),
            database: self.database.map(|db| db.to_string()),
            password: self.password.clone(),
        }
    }

    /// `host:port` of the endpoint
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            database: None,
            password: None,
        }
    }
}

// Never print credentials
impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}

impl fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())?;
        if let Some(db) = self.database {
            write!(f, " db={}", db)?;
        }
        if self.password.is_some() {
            write!(f, " auth=****")?;
        }
        Ok(())
    }
}

/// Clear a field value that still contains a template placeholder.
pub fn scrub(value: &str) -> &str {
    if value.contains(PLACEHOLDER_MARKER) {
        ""
    } else {
        value
    }
}

fn scrubbed(value: &Option<String>) -> &str {
    value.as_deref().map(scrub).unwrap_or("")
}

/// Turn raw host configuration into an endpoint. Never fails: anything
/// unusable degrades to the store default for that field.
pub fn sanitize(raw: &RawEndpointConfig) -> EndpointConfig {
    let host = match scrubbed(&raw.host) {
        "" => DEFAULT_HOST.to_string(),
        host => host.to_string(),
    };

    let port = match scrubbed(&raw.port) {
        "" => DEFAULT_PORT,
        port => port.trim().parse::<u16>().unwrap_or_else(|_| {
            warn!("Ignoring invalid store port '{}', using {}", port, DEFAULT_PORT);
            DEFAULT_PORT
        }),
    };

    let database = match scrubbed(&raw.database) {
        "" => None,
        db => match db.trim().parse::<i64>() {
            Ok(index) => Some(index),
            Err(_) => {
                warn!("Ignoring invalid database index '{}', using default", db);
                None
            }
        },
    };

    let password = match scrubbed(&raw.password) {
        "" => None,
        password => Some(password.to_string()),
    };

    EndpointConfig {
        host,
        port,
        database,
        password,
    }
}

/// Accept YAML strings, numbers and booleans alike for endpoint fields
fn text_field<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Text {
        Str(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }

    Ok(Option::<Text>::deserialize(deserializer)?.map(|text| match text {
        Text::Str(s) => s,
        Text::Int(i) => i.to_string(),
        Text::Float(f) => f.to_string(),
        Text::Bool(b) => b.to_string(),
    }))
}
