use std::io::{self, Write};

use serde::Serialize;

use crate::item::{Item, Value};
use crate::servers::ServerSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// `server|field|...` records, values on their own line
    #[default]
    Pipe,
    /// One JSON object per record
    Json,
}

#[derive(Serialize)]
struct ItemRecord<'a> {
    server: &'a str,
    expiration: String,
    size: u64,
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    binary: bool,
}

#[derive(Serialize)]
struct KeyRecord<'a> {
    server: &'a str,
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    binary: bool,
}

#[derive(Serialize)]
struct StatRecord<'a> {
    server: &'a str,
    stat: &'a str,
    value: &'a str,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Writes result records to the output stream, one record at a time.
pub struct RecordWriter<W: Write> {
    out: W,
    format: OutputFormat,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self { out, format }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// `server|expiration|size|key`, followed by the value line when the item has one.
    pub fn item(&mut self, server: &ServerSpec, item: &Item) -> io::Result<()> {
        match self.format {
            OutputFormat::Pipe => {
                writeln!(
                    self.out,
                    "{}|{}|{}|{}",
                    server, item.expiration, item.size, item.key
                )?;
                if let Some(value) = &item.value {
                    self.value_line(value)?;
                }
                Ok(())
            }
            OutputFormat::Json => self.json(&ItemRecord {
                server: server.as_str(),
                expiration: item.expiration.to_string(),
                size: item.size,
                key: &item.key,
                value: item.value.as_ref().map(Value::to_lossy_string),
                binary: item.value.as_ref().is_some_and(Value::is_binary),
            }),
        }
    }

    /// `server|key` followed by the value line.
    pub fn keyed_value(&mut self, server: &ServerSpec, key: &str, value: &Value) -> io::Result<()> {
        match self.format {
            OutputFormat::Pipe => {
                writeln!(self.out, "{}|{}", server, key)?;
                self.value_line(value)
            }
            OutputFormat::Json => self.json(&KeyRecord {
                server: server.as_str(),
                key,
                value: Some(value.to_lossy_string()),
                binary: value.is_binary(),
            }),
        }
    }

    /// `server|key`
    pub fn key(&mut self, server: &ServerSpec, key: &str) -> io::Result<()> {
        match self.format {
            OutputFormat::Pipe => writeln!(self.out, "{}|{}", server, key),
            OutputFormat::Json => self.json(&KeyRecord {
                server: server.as_str(),
                key,
                value: None,
                binary: false,
            }),
        }
    }

    /// `server`
    pub fn server(&mut self, server: &ServerSpec) -> io::Result<()> {
        match self.format {
            OutputFormat::Pipe => writeln!(self.out, "{}", server),
            OutputFormat::Json => self.json(&serde_json::json!({ "server": server.as_str() })),
        }
    }

    /// `host|stat|value`
    pub fn stat(&mut self, host: &str, stat: &str, value: &str) -> io::Result<()> {
        match self.format {
            OutputFormat::Pipe => writeln!(self.out, "{}|{}|{}", host, stat, value),
            OutputFormat::Json => self.json(&StatRecord {
                server: host,
                stat,
                value,
            }),
        }
    }

    fn value_line(&mut self, value: &Value) -> io::Result<()> {
        self.out.write_all(&value.to_bytes())?;
        self.out.write_all(b"\n")
    }

    fn json<T: Serialize>(&mut self, record: &T) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")
    }
}
