use std::fmt;

use crate::error::McInspectError;

/// Address used when the operator names no server at all.
pub const DEFAULT_SERVER: &str = "127.0.0.1:11211";

/// Port assumed for addresses given without one.
pub const DEFAULT_PORT: u16 = 11211;

/// A memcached server exactly as the operator wrote it.
///
/// The string is kept verbatim because it is also the identifier printed in
/// every output record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerSpec(String);

impl ServerSpec {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address to hand to the socket layer: `host` alone gets the default port.
    pub fn connect_addr(&self) -> String {
        let addr = self.0.trim();
        let has_port = match addr.rsplit_once(':') {
            // bare IPv6 literals contain colons but no port
            Some((host, port)) => {
                port.parse::<u16>().is_ok() && (!host.contains(':') || host.ends_with(']'))
            }
            None => false,
        };
        if has_port {
            addr.to_string()
        } else if addr.contains(':') && !addr.starts_with('[') {
            format!("[{}]:{}", addr, DEFAULT_PORT)
        } else {
            format!("{}:{}", addr, DEFAULT_PORT)
        }
    }
}

impl fmt::Display for ServerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered servers targeted by one invocation. Duplicates are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSet {
    servers: Vec<ServerSpec>,
}

impl ServerSet {
    /// Builds the set from explicit addresses, falling back to the local default.
    pub fn resolve<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut servers: Vec<ServerSpec> = addrs.into_iter().map(ServerSpec::new).collect();
        if servers.is_empty() {
            tracing::info!("No server provided, defaulting to {}", DEFAULT_SERVER);
            servers.push(ServerSpec::new(DEFAULT_SERVER));
        }
        Self { servers }
    }

    /// Like [`ServerSet::resolve`], additionally reading addresses from the
    /// named environment variables after the explicit ones.
    pub fn from_args_and_env(addrs: &[String], env_names: &[String]) -> Result<Self, McInspectError> {
        let mut all = addrs.to_vec();
        for name in env_names {
            let raw = std::env::var(name).map_err(|_| {
                McInspectError::Config(format!("Environment variable '{name}' is not set"))
            })?;
            let found = split_server_list(&raw);
            if found.is_empty() {
                return Err(McInspectError::Config(format!(
                    "Environment variable '{name}' holds no server address"
                )));
            }
            tracing::info!(env = %name, count = found.len(), "Read servers from environment variable");
            all.extend(found);
        }
        Ok(Self::resolve(all))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ServerSpec> {
        self.servers.iter()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

impl<'a> IntoIterator for &'a ServerSet {
    type Item = &'a ServerSpec;
    type IntoIter = std::slice::Iter<'a, ServerSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.servers.iter()
    }
}

fn split_server_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
