use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

/// Client flag bits set by the common memcached client libraries.
pub mod flags {
    pub const SERIALIZED: u32 = 1 << 0;
    pub const INTEGER: u32 = 1 << 1;
    pub const LONG: u32 = 1 << 2;
    pub const COMPRESSED: u32 = 1 << 3;
}

/// An item value with its payload kind made explicit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Binary(Vec<u8>),
    Numeric(i64),
}

impl Value {
    /// Classifies a raw payload using the flags word stored alongside it.
    ///
    /// Serialized or compressed payloads are always binary. Payloads flagged
    /// as integers become numeric when they parse; everything else is text if
    /// it is valid UTF-8.
    pub fn from_wire(item_flags: u32, data: Vec<u8>) -> Self {
        if item_flags & (flags::SERIALIZED | flags::COMPRESSED) != 0 {
            return Value::Binary(data);
        }
        if item_flags & (flags::INTEGER | flags::LONG) != 0 {
            if let Some(n) = std::str::from_utf8(&data)
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
            {
                return Value::Numeric(n);
            }
        }
        match String::from_utf8(data) {
            Ok(text) => Value::Text(text),
            Err(e) => Value::Binary(e.into_bytes()),
        }
    }

    /// Only text payloads take part in pattern searches.
    pub fn searchable_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            Value::Binary(_) | Value::Numeric(_) => None,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Value::Binary(_))
    }

    /// Bytes written to the output stream for this value.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Text(text) => text.as_bytes().to_vec(),
            Value::Binary(data) => data.clone(),
            Value::Numeric(n) => n.to_string().into_bytes(),
        }
    }

    pub fn to_lossy_string(&self) -> String {
        match self {
            Value::Text(text) => text.clone(),
            Value::Binary(data) => String::from_utf8_lossy(data).into_owned(),
            Value::Numeric(n) => n.to_string(),
        }
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    Never,
    At(DateTime<Utc>),
}

impl Expiration {
    /// Interprets a unix timestamp as reported by the server; zero or negative
    /// means the item never expires.
    pub fn from_unix(secs: i64) -> Self {
        if secs <= 0 {
            return Expiration::Never;
        }
        match DateTime::from_timestamp(secs, 0) {
            Some(at) => Expiration::At(at),
            None => Expiration::Never,
        }
    }
}

impl fmt::Display for Expiration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expiration::Never => f.write_str("never"),
            Expiration::At(at) => f.write_str(&at.to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }
}

/// One cache entry as reported by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub expiration: Expiration,
    pub size: u64,
    pub value: Option<Value>,
}

impl Item {
    pub fn new(key: impl Into<String>, expiration: Expiration, size: u64) -> Self {
        Self {
            key: key.into(),
            expiration,
            size,
            value: None,
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }
}
