use std::io::Write;

use crate::client::{check_key, CacheClient, Connector, DeltaReply};
use crate::error::{McInspectError, Result};
use crate::filter::{select_items, FilterSpec, ItemFilter, SizeLimit};
use crate::inspector::{BulkInspector, ScanOptions};
use crate::item::Value;
use crate::output::RecordWriter;
use crate::servers::{ServerSet, ServerSpec};

/// Action tokens with the number of positional arguments each one needs.
const ACTIONS: &[(&str, usize)] = &[
    ("list", 0),
    ("dump", 0),
    ("grep", 1),
    ("get", 1),
    ("set", 2),
    ("incr", 1),
    ("decr", 1),
    ("delete", 1),
    ("flush", 0),
    ("stats", 0),
];

/// A validated action with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    List,
    Dump,
    Grep { pattern: String },
    Get { keys: Vec<String> },
    Set { key: String, value: String },
    Incr { keys: Vec<String> },
    Decr { keys: Vec<String> },
    Delete { keys: Vec<String> },
    Flush,
    Stats,
}

impl Action {
    /// Minimum positional arguments for `token`, or `None` for unknown actions.
    pub fn min_args(token: &str) -> Option<usize> {
        ACTIONS
            .iter()
            .find(|(name, _)| *name == token)
            .map(|(_, min)| *min)
    }

    /// Maps an action token and its arguments to an [`Action`].
    ///
    /// Fails with [`McInspectError::Usage`] for a missing or unknown token, too
    /// few arguments, or a key the protocol cannot carry.
    pub fn parse(token: Option<&str>, args: &[String]) -> Result<Self> {
        let token = token.ok_or_else(|| McInspectError::Usage("No action given".to_string()))?;
        let min = Self::min_args(token)
            .ok_or_else(|| McInspectError::Usage(format!("Unknown action '{token}'")))?;
        if args.len() < min {
            return Err(McInspectError::Usage(format!(
                "Action '{token}' needs at least {min} argument(s), got {}",
                args.len()
            )));
        }

        let keys = || -> Result<Vec<String>> {
            for key in args {
                check_key(key).map_err(|e| McInspectError::Usage(e.to_string()))?;
            }
            Ok(args.to_vec())
        };

        let action = match token {
            "list" => Action::List,
            "dump" => Action::Dump,
            "grep" => Action::Grep {
                pattern: args[0].clone(),
            },
            "get" => Action::Get { keys: keys()? },
            "set" => {
                check_key(&args[0]).map_err(|e| McInspectError::Usage(e.to_string()))?;
                Action::Set {
                    key: args[0].clone(),
                    value: args[1].clone(),
                }
            }
            "incr" => Action::Incr { keys: keys()? },
            "decr" => Action::Decr { keys: keys()? },
            "delete" => Action::Delete { keys: keys()? },
            "flush" => Action::Flush,
            "stats" => Action::Stats,
            _ => unreachable!("token validated against ACTIONS"),
        };
        Ok(action)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::List => "list",
            Action::Dump => "dump",
            Action::Grep { .. } => "grep",
            Action::Get { .. } => "get",
            Action::Set { .. } => "set",
            Action::Incr { .. } => "incr",
            Action::Decr { .. } => "decr",
            Action::Delete { .. } => "delete",
            Action::Flush => "flush",
            Action::Stats => "stats",
        }
    }
}

/// Flag values shared by the handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Items larger than this are left out of `list`/`dump`; `<= 0` disables the bound.
    pub max_value_size: i64,
    /// Amount added by `incr` (subtracted by `decr`).
    pub delta: i64,
    pub ignore_case: bool,
    pub invert_match: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_value_size: 0,
            delta: 1,
            ignore_case: false,
            invert_match: false,
        }
    }
}

/// Result of applying a delta to one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOutcome {
    Applied(u64),
    NotFound,
    NotNumeric,
    Connection(String),
}

/// A per-key `incr`/`decr` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOutcome {
    pub server: ServerSpec,
    pub key: String,
    pub outcome: DeltaOutcome,
}

/// Runs actions against every server of a [`ServerSet`], one server at a time.
pub struct McInspect<C, I> {
    connector: C,
    inspector: I,
    servers: ServerSet,
    options: Options,
}

impl<C: Connector, I: BulkInspector> McInspect<C, I> {
    pub fn new(connector: C, inspector: I, servers: ServerSet, options: Options) -> Self {
        Self {
            connector,
            inspector,
            servers,
            options,
        }
    }

    /// Runs `action` and returns the number of records written.
    pub async fn run<W: Write>(&self, action: &Action, out: &mut RecordWriter<W>) -> Result<usize> {
        tracing::debug!(action = action.name(), servers = self.servers.len(), "Dispatching");
        let records = match action {
            Action::List => self.do_list(out).await?,
            Action::Dump => self.do_dump(out).await?,
            Action::Grep { pattern } => self.do_grep(pattern, out).await?,
            Action::Get { keys } => self.do_get(keys, out).await?,
            Action::Set { key, value } => self.do_set(key, value, out).await?,
            Action::Incr { keys } => count_applied(&self.do_incr(keys, out).await?),
            Action::Decr { keys } => count_applied(&self.do_decr(keys, out).await?),
            Action::Delete { keys } => self.do_delete(keys, out).await?,
            Action::Flush => self.do_flush(out).await?,
            Action::Stats => self.do_stats(out).await?,
        };
        tracing::info!(action = action.name(), records, "Done");
        Ok(records)
    }

    async fn scan_into<W: Write>(
        &self,
        options: ScanOptions,
        filter: Option<&ItemFilter>,
        out: &mut RecordWriter<W>,
    ) -> Result<usize> {
        let mut records = 0;
        for server in &self.servers {
            let items = self.inspector.scan(server, options).await?;
            let scanned = items.len();
            let mut selected = select_items(items, options.limit, filter);
            if options.include_values {
                selected.retain(|item| item.value.is_some());
            } else {
                selected.iter_mut().for_each(|item| item.value = None);
            }
            tracing::debug!(server = %server, scanned, selected = selected.len(), "Scan finished");
            for item in &selected {
                out.item(server, item)?;
            }
            records += selected.len();
        }
        Ok(records)
    }

    pub async fn do_list<W: Write>(&self, out: &mut RecordWriter<W>) -> Result<usize> {
        let options = ScanOptions {
            include_values: false,
            limit: SizeLimit::new(self.options.max_value_size),
        };
        self.scan_into(options, None, out).await
    }

    pub async fn do_dump<W: Write>(&self, out: &mut RecordWriter<W>) -> Result<usize> {
        let options = ScanOptions {
            include_values: true,
            limit: SizeLimit::new(self.options.max_value_size),
        };
        self.scan_into(options, None, out).await
    }

    /// Searches keys and text values. Always reads full values, so the size
    /// bound does not apply here.
    pub async fn do_grep<W: Write>(&self, pattern: &str, out: &mut RecordWriter<W>) -> Result<usize> {
        let filter = ItemFilter::compile(&FilterSpec {
            pattern: pattern.to_string(),
            ignore_case: self.options.ignore_case,
            invert_match: self.options.invert_match,
        })?;
        let options = ScanOptions {
            include_values: true,
            limit: SizeLimit::unbounded(),
        };
        self.scan_into(options, Some(&filter), out).await
    }

    pub async fn do_get<W: Write>(&self, keys: &[String], out: &mut RecordWriter<W>) -> Result<usize> {
        let mut records = 0;
        for server in &self.servers {
            let mut conn = self.connector.connect(server).await?;
            for (key, value) in conn.get_multi(keys).await? {
                out.keyed_value(server, &key, &value)?;
                records += 1;
            }
            release(server, conn).await;
        }
        Ok(records)
    }

    pub async fn do_set<W: Write>(
        &self,
        key: &str,
        value: &str,
        out: &mut RecordWriter<W>,
    ) -> Result<usize> {
        let mut records = 0;
        for server in &self.servers {
            let mut conn = self.connector.connect(server).await?;
            if conn.set(key, value.as_bytes()).await? {
                out.keyed_value(server, key, &value.into())?;
                records += 1;
            }
            release(server, conn).await;
        }
        Ok(records)
    }

    pub async fn do_incr<W: Write>(
        &self,
        keys: &[String],
        out: &mut RecordWriter<W>,
    ) -> Result<Vec<KeyOutcome>> {
        self.apply_deltas(keys, true, out).await
    }

    pub async fn do_decr<W: Write>(
        &self,
        keys: &[String],
        out: &mut RecordWriter<W>,
    ) -> Result<Vec<KeyOutcome>> {
        self.apply_deltas(keys, false, out).await
    }

    /// Applies the configured delta to every key on every server.
    ///
    /// Per-key failures never abort the run: they are logged and reported in
    /// the returned outcomes, and no record is written for them. Only output
    /// errors are returned as `Err`.
    async fn apply_deltas<W: Write>(
        &self,
        keys: &[String],
        increment: bool,
        out: &mut RecordWriter<W>,
    ) -> Result<Vec<KeyOutcome>> {
        let mut outcomes = Vec::with_capacity(keys.len() * self.servers.len());
        for server in &self.servers {
            let mut conn = match self.connector.connect(server).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "Cannot connect, skipping keys");
                    outcomes.extend(keys.iter().map(|key| KeyOutcome {
                        server: server.clone(),
                        key: key.clone(),
                        outcome: DeltaOutcome::Connection(e.to_string()),
                    }));
                    continue;
                }
            };

            for key in keys {
                let outcome = apply_delta(&mut conn, key, increment, self.options.delta).await;
                match &outcome {
                    DeltaOutcome::Applied(n) => {
                        out.keyed_value(server, key, &Value::Text(n.to_string()))?;
                    }
                    DeltaOutcome::NotFound => {
                        tracing::warn!(server = %server, key = %key, "Key not found");
                    }
                    DeltaOutcome::NotNumeric => {
                        tracing::warn!(server = %server, key = %key, "Value is not numeric");
                    }
                    DeltaOutcome::Connection(error) => {
                        tracing::warn!(server = %server, key = %key, error = %error, "Delta failed");
                    }
                }
                outcomes.push(KeyOutcome {
                    server: server.clone(),
                    key: key.clone(),
                    outcome,
                });
            }
            release(server, conn).await;
        }
        Ok(outcomes)
    }

    pub async fn do_delete<W: Write>(&self, keys: &[String], out: &mut RecordWriter<W>) -> Result<usize> {
        let mut records = 0;
        for server in &self.servers {
            let mut conn = self.connector.connect(server).await?;
            if conn.delete_multi(keys).await? {
                for key in keys {
                    out.key(server, key)?;
                }
                records += keys.len();
            } else {
                tracing::debug!(server = %server, keys = keys.len(), "Delete batch not acknowledged");
            }
            release(server, conn).await;
        }
        Ok(records)
    }

    pub async fn do_flush<W: Write>(&self, out: &mut RecordWriter<W>) -> Result<usize> {
        for server in &self.servers {
            let mut conn = self.connector.connect(server).await?;
            if !conn.flush_all().await? {
                tracing::debug!(server = %server, "Flush not acknowledged");
            }
            out.server(server)?;
            release(server, conn).await;
        }
        Ok(self.servers.len())
    }

    pub async fn do_stats<W: Write>(&self, out: &mut RecordWriter<W>) -> Result<usize> {
        let mut records = 0;
        for server in &self.servers {
            let mut conn = self.connector.connect(server).await?;
            let stats = conn.stats().await?;
            let host = host_token(&stats.host);
            for (name, value) in &stats.entries {
                out.stat(host, name, value)?;
            }
            records += stats.entries.len();
            release(server, conn).await;
        }
        Ok(records)
    }
}

/// `incr` with a negative delta decrements and vice versa.
async fn apply_delta<T: CacheClient>(
    client: &mut T,
    key: &str,
    increment: bool,
    delta: i64,
) -> DeltaOutcome {
    let magnitude = delta.unsigned_abs();
    let reply = if increment == (delta >= 0) {
        client.incr(key, magnitude).await
    } else {
        client.decr(key, magnitude).await
    };
    match reply {
        Ok(DeltaReply::Applied(n)) => DeltaOutcome::Applied(n),
        Ok(DeltaReply::NotFound) => DeltaOutcome::NotFound,
        Ok(DeltaReply::NotNumeric) => DeltaOutcome::NotNumeric,
        Err(e) => DeltaOutcome::Connection(e.to_string()),
    }
}

async fn release<T: CacheClient>(server: &ServerSpec, conn: T) {
    if let Err(e) = conn.close().await {
        tracing::debug!(server = %server, error = %e, "Failed to close connection cleanly");
    }
}

/// First whitespace-delimited token of a server descriptor.
pub fn host_token(descriptor: &str) -> &str {
    descriptor.split_whitespace().next().unwrap_or(descriptor)
}

fn count_applied(outcomes: &[KeyOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|o| matches!(o.outcome, DeltaOutcome::Applied(_)))
        .count()
}
