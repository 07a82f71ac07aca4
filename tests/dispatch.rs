use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mc_inspect::client::{CacheClient, Connector, DeltaReply, ServerStats};
use mc_inspect::dispatch::{Action, DeltaOutcome, McInspect, Options};
use mc_inspect::error::{McInspectError, Result};
use mc_inspect::inspector::{BulkInspector, ScanOptions};
use mc_inspect::item::{Expiration, Item, Value};
use mc_inspect::output::{OutputFormat, RecordWriter};
use mc_inspect::servers::{ServerSet, ServerSpec};

#[derive(Default)]
struct FakeServer {
    items: Vec<Item>,
    down: bool,
    deny_deletes: bool,
    deny_sets: bool,
    deny_flush: bool,
    closed: usize,
}

/// In-memory stand-in for a set of memcached servers.
#[derive(Clone, Default)]
struct FakeCluster {
    servers: Arc<Mutex<HashMap<String, FakeServer>>>,
}

impl FakeCluster {
    fn with_items(self, server: &str, items: Vec<Item>) -> Self {
        self.servers
            .lock()
            .unwrap()
            .entry(server.to_string())
            .or_default()
            .items = items;
        self
    }

    fn down(self, server: &str) -> Self {
        self.servers.lock().unwrap().entry(server.to_string()).or_default().down = true;
        self
    }

    fn denying_deletes(self, server: &str) -> Self {
        self.servers
            .lock()
            .unwrap()
            .entry(server.to_string())
            .or_default()
            .deny_deletes = true;
        self
    }

    fn denying_sets(self, server: &str) -> Self {
        self.servers.lock().unwrap().entry(server.to_string()).or_default().deny_sets = true;
        self
    }

    fn denying_flush(self, server: &str) -> Self {
        self.servers.lock().unwrap().entry(server.to_string()).or_default().deny_flush = true;
        self
    }

    fn value(&self, server: &str, key: &str) -> Option<Value> {
        self.servers
            .lock()
            .unwrap()
            .get(server)?
            .items
            .iter()
            .find(|i| i.key == key)
            .and_then(|i| i.value.clone())
    }

    fn closed(&self, server: &str) -> usize {
        self.servers.lock().unwrap().get(server).map_or(0, |s| s.closed)
    }

    fn refused(server: &str) -> McInspectError {
        McInspectError::io(
            server,
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        )
    }
}

struct FakeClient {
    server: String,
    cluster: FakeCluster,
}

impl FakeClient {
    fn with_server<T>(&self, f: impl FnOnce(&mut FakeServer) -> T) -> T {
        let mut servers = self.cluster.servers.lock().unwrap();
        f(servers.entry(self.server.clone()).or_default())
    }
}

impl Connector for FakeCluster {
    type Client = FakeClient;

    async fn connect(&self, server: &ServerSpec) -> Result<FakeClient> {
        let down = self
            .servers
            .lock()
            .unwrap()
            .get(server.as_str())
            .is_some_and(|s| s.down);
        if down {
            return Err(Self::refused(server.as_str()));
        }
        Ok(FakeClient {
            server: server.as_str().to_string(),
            cluster: self.clone(),
        })
    }
}

impl CacheClient for FakeClient {
    async fn get_multi(&mut self, keys: &[String]) -> Result<Vec<(String, Value)>> {
        Ok(self.with_server(|s| {
            keys.iter()
                .filter_map(|k| {
                    let item = s.items.iter().find(|i| &i.key == k)?;
                    Some((k.clone(), item.value.clone()?))
                })
                .collect()
        }))
    }

    async fn set(&mut self, key: &str, value: &[u8]) -> Result<bool> {
        let value = Value::from_wire(0, value.to_vec());
        Ok(self.with_server(|s| {
            if s.deny_sets {
                return false;
            }
            s.items.retain(|i| i.key != key);
            let size = value.to_bytes().len() as u64;
            s.items.push(Item::new(key, Expiration::Never, size).with_value(value));
            true
        }))
    }

    async fn incr(&mut self, key: &str, delta: u64) -> Result<DeltaReply> {
        Ok(self.with_server(|s| adjust(s, key, |n| n.wrapping_add(delta))))
    }

    async fn decr(&mut self, key: &str, delta: u64) -> Result<DeltaReply> {
        Ok(self.with_server(|s| adjust(s, key, |n| n.saturating_sub(delta))))
    }

    async fn delete_multi(&mut self, keys: &[String]) -> Result<bool> {
        Ok(self.with_server(|s| {
            if s.deny_deletes {
                return false;
            }
            s.items.retain(|i| !keys.contains(&i.key));
            true
        }))
    }

    async fn flush_all(&mut self) -> Result<bool> {
        Ok(self.with_server(|s| {
            if s.deny_flush {
                return false;
            }
            s.items.clear();
            true
        }))
    }

    async fn stats(&mut self) -> Result<ServerStats> {
        let count = self.with_server(|s| s.items.len());
        Ok(ServerStats {
            host: format!("{} (fake peer)", self.server),
            entries: vec![
                ("curr_items".to_string(), count.to_string()),
                ("version".to_string(), "1.6.0".to_string()),
            ],
        })
    }

    async fn close(self) -> Result<()> {
        self.with_server(|s| s.closed += 1);
        Ok(())
    }
}

fn adjust(s: &mut FakeServer, key: &str, op: impl FnOnce(u64) -> u64) -> DeltaReply {
    let Some(item) = s.items.iter_mut().find(|i| i.key == key) else {
        return DeltaReply::NotFound;
    };
    let current = match &item.value {
        Some(Value::Text(t)) => t.parse::<u64>().ok(),
        Some(Value::Numeric(n)) => u64::try_from(*n).ok(),
        _ => None,
    };
    match current {
        Some(n) => {
            let next = op(n);
            item.value = Some(Value::Text(next.to_string()));
            DeltaReply::Applied(next)
        }
        None => DeltaReply::NotNumeric,
    }
}

impl BulkInspector for FakeCluster {
    // ignores the size bound on purpose: the engine has to enforce it
    async fn scan(&self, server: &ServerSpec, options: ScanOptions) -> Result<Vec<Item>> {
        let servers = self.servers.lock().unwrap();
        let Some(s) = servers.get(server.as_str()) else {
            return Ok(Vec::new());
        };
        if s.down {
            return Err(Self::refused(server.as_str()));
        }
        Ok(s.items
            .iter()
            .cloned()
            .map(|mut item| {
                if !options.include_values {
                    item.value = None;
                }
                item
            })
            .collect())
    }
}

fn text_item(key: &str, value: &str) -> Item {
    Item::new(key, Expiration::Never, value.len() as u64).with_value(Value::from(value))
}

fn sized_item(key: &str, size: u64) -> Item {
    Item::new(key, Expiration::Never, size).with_value(Value::from("x"))
}

fn tool(cluster: &FakeCluster, servers: &[&str], options: Options) -> McInspect<FakeCluster, FakeCluster> {
    McInspect::new(
        cluster.clone(),
        cluster.clone(),
        ServerSet::resolve(servers.iter().copied()),
        options,
    )
}

async fn run(tool: &McInspect<FakeCluster, FakeCluster>, action: Action) -> (Result<usize>, String) {
    let mut out = RecordWriter::new(Vec::new(), OutputFormat::Pipe);
    let result = tool.run(&action, &mut out).await;
    (result, String::from_utf8(out.into_inner()).unwrap())
}

fn keys(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_list_without_bound_shows_every_item() {
    let cluster = FakeCluster::default().with_items("s1", vec![sized_item("a", 10), sized_item("b", 500)]);
    let (result, out) = run(&tool(&cluster, &["s1"], Options::default()), Action::List).await;
    assert_eq!(result.unwrap(), 2);
    assert_eq!(out, "s1|never|10|a\ns1|never|500|b\n");
}

#[tokio::test]
async fn test_dump_respects_max_value_size() {
    let cluster = FakeCluster::default().with_items("s1", vec![sized_item("a", 10), sized_item("b", 500)]);
    let options = Options { max_value_size: 100, ..Options::default() };
    let (result, out) = run(&tool(&cluster, &["s1"], options), Action::Dump).await;
    assert_eq!(result.unwrap(), 1);
    assert_eq!(out, "s1|never|10|a\nx\n");
}

#[tokio::test]
async fn test_grep_ignore_case_and_invert() {
    let cluster = FakeCluster::default().with_items("s1", vec![text_item("FOOBAR", "v"), text_item("other", "v")]);

    let options = Options { ignore_case: true, ..Options::default() };
    let (_, out) = run(&tool(&cluster, &["s1"], options), Action::Grep { pattern: "foo".into() }).await;
    assert_eq!(out, "s1|never|1|FOOBAR\nv\n");

    let options = Options { ignore_case: true, invert_match: true, ..Options::default() };
    let (_, out) = run(&tool(&cluster, &["s1"], options), Action::Grep { pattern: "foo".into() }).await;
    assert_eq!(out, "s1|never|1|other\nv\n");
}

#[tokio::test]
async fn test_grep_searches_text_values_only() {
    let binary = Item::new("blob", Expiration::Never, 6).with_value(Value::Binary(b"needle".to_vec()));
    let cluster = FakeCluster::default().with_items(
        "s1",
        vec![text_item("doc", "a needle here"), binary, text_item("plain", "hay")],
    );
    let (result, out) = run(
        &tool(&cluster, &["s1"], Options::default()),
        Action::Grep { pattern: "needle".into() },
    )
    .await;
    assert_eq!(result.unwrap(), 1);
    assert_eq!(out, "s1|never|13|doc\na needle here\n");
}

#[tokio::test]
async fn test_grep_ignores_size_bound() {
    let cluster = FakeCluster::default().with_items("s1", vec![sized_item("big", 10_000)]);
    let options = Options { max_value_size: 1, ..Options::default() };
    let (result, _) = run(&tool(&cluster, &["s1"], options), Action::Grep { pattern: "big".into() }).await;
    assert_eq!(result.unwrap(), 1);
}

#[tokio::test]
async fn test_invalid_pattern_fails_before_contacting_servers() {
    let cluster = FakeCluster::default().down("s1");
    let (result, out) = run(
        &tool(&cluster, &["s1"], Options::default()),
        Action::Grep { pattern: "(".into() },
    )
    .await;
    assert!(matches!(result, Err(McInspectError::Pattern(_))));
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_results_grouped_by_server_in_order() {
    let cluster = FakeCluster::default()
        .with_items("s1", vec![sized_item("z", 1), sized_item("a", 1)])
        .with_items("s2", vec![sized_item("m", 1)]);
    let (_, out) = run(&tool(&cluster, &["s2", "s1"], Options::default()), Action::List).await;
    assert_eq!(out, "s2|never|1|m\ns1|never|1|z\ns1|never|1|a\n");
}

#[tokio::test]
async fn test_scan_failure_aborts_run() {
    let cluster = FakeCluster::default()
        .with_items("s1", vec![sized_item("a", 1)])
        .down("s2")
        .with_items("s3", vec![sized_item("c", 1)]);
    let (result, out) = run(&tool(&cluster, &["s1", "s2", "s3"], Options::default()), Action::List).await;
    assert!(matches!(result, Err(McInspectError::Io { .. })));
    // records already streamed stay, nothing after the failing server
    assert_eq!(out, "s1|never|1|a\n");
}

#[tokio::test]
async fn test_get_skips_absent_keys() {
    let cluster = FakeCluster::default()
        .with_items("s1", vec![text_item("a", "1")])
        .with_items("s2", vec![]);
    let t = tool(&cluster, &["s1", "s2"], Options::default());
    let (result, out) = run(&t, Action::Get { keys: keys(&["a", "missing"]) }).await;
    assert_eq!(result.unwrap(), 1);
    assert_eq!(out, "s1|a\n1\n");
    assert_eq!(cluster.closed("s1"), 1);
    assert_eq!(cluster.closed("s2"), 1);
}

#[tokio::test]
async fn test_set_writes_every_server() {
    let cluster = FakeCluster::default();
    let t = tool(&cluster, &["s1", "s2"], Options::default());
    let (result, out) = run(&t, Action::Set { key: "k".into(), value: "hello".into() }).await;
    assert_eq!(result.unwrap(), 2);
    assert_eq!(out, "s1|k\nhello\ns2|k\nhello\n");
    assert_eq!(cluster.value("s2", "k"), Some(Value::from("hello")));
}

#[tokio::test]
async fn test_set_not_stored_writes_nothing() {
    let cluster = FakeCluster::default().denying_sets("s1");
    let t = tool(&cluster, &["s1", "s2"], Options::default());
    let (result, out) = run(&t, Action::Set { key: "k".into(), value: "hello".into() }).await;
    assert_eq!(result.unwrap(), 1);
    assert_eq!(out, "s2|k\nhello\n");
    assert_eq!(cluster.value("s1", "k"), None);
    assert_eq!(cluster.closed("s1"), 1);
}

#[tokio::test]
async fn test_incr_suppresses_per_key_failures() {
    let cluster = FakeCluster::default().with_items(
        "s1",
        vec![text_item("hits", "41"), text_item("name", "bob")],
    );
    let t = tool(&cluster, &["s1"], Options::default());
    let mut out = RecordWriter::new(Vec::new(), OutputFormat::Pipe);
    let outcomes = t
        .do_incr(&keys(&["hits", "missing", "name"]), &mut out)
        .await
        .unwrap();

    let kinds: Vec<&DeltaOutcome> = outcomes.iter().map(|o| &o.outcome).collect();
    assert_eq!(
        kinds,
        vec![&DeltaOutcome::Applied(42), &DeltaOutcome::NotFound, &DeltaOutcome::NotNumeric]
    );
    assert_eq!(String::from_utf8(out.into_inner()).unwrap(), "s1|hits\n42\n");
    assert_eq!(cluster.closed("s1"), 1);
}

#[tokio::test]
async fn test_incr_on_unreachable_server_does_not_fail() {
    let cluster = FakeCluster::default()
        .down("s1")
        .with_items("s2", vec![text_item("n", "1")]);
    let t = tool(&cluster, &["s1", "s2"], Options::default());
    let (result, out) = run(&t, Action::Incr { keys: keys(&["n"]) }).await;
    assert_eq!(result.unwrap(), 1);
    assert_eq!(out, "s2|n\n2\n");
}

#[tokio::test]
async fn test_decr_and_negative_delta() {
    let cluster = FakeCluster::default().with_items("s1", vec![text_item("n", "10")]);

    let t = tool(&cluster, &["s1"], Options { delta: 3, ..Options::default() });
    let (_, out) = run(&t, Action::Decr { keys: keys(&["n"]) }).await;
    assert_eq!(out, "s1|n\n7\n");

    // incr by a negative amount decrements
    let t = tool(&cluster, &["s1"], Options { delta: -2, ..Options::default() });
    let (_, out) = run(&t, Action::Incr { keys: keys(&["n"]) }).await;
    assert_eq!(out, "s1|n\n5\n");

    // decr by a negative amount increments
    let t = tool(&cluster, &["s1"], Options { delta: -5, ..Options::default() });
    let (_, out) = run(&t, Action::Decr { keys: keys(&["n"]) }).await;
    assert_eq!(out, "s1|n\n10\n");
}

#[tokio::test]
async fn test_delete_batch_acknowledgment() {
    let cluster = FakeCluster::default()
        .with_items("s1", vec![text_item("a", "1"), text_item("b", "2")])
        .with_items("s2", vec![text_item("a", "1")])
        .denying_deletes("s2");
    let t = tool(&cluster, &["s1", "s2"], Options::default());
    let (result, out) = run(&t, Action::Delete { keys: keys(&["a", "b"]) }).await;
    assert_eq!(result.unwrap(), 2);
    assert_eq!(out, "s1|a\ns1|b\n");
    assert_eq!(cluster.value("s1", "a"), None);
    assert_eq!(cluster.value("s2", "a"), Some(Value::from("1")));
}

#[tokio::test]
async fn test_flush_emits_one_line_per_server() {
    let cluster = FakeCluster::default().with_items("s1", vec![text_item("a", "1")]);
    let t = tool(&cluster, &["s1", "s2", "s1"], Options::default());
    let (result, out) = run(&t, Action::Flush).await;
    assert_eq!(result.unwrap(), 3);
    assert_eq!(out, "s1\ns2\ns1\n");
    assert_eq!(cluster.value("s1", "a"), None);
}

#[tokio::test]
async fn test_flush_not_acknowledged_still_reports_server() {
    let cluster = FakeCluster::default()
        .with_items("s1", vec![text_item("a", "1")])
        .denying_flush("s1");
    let t = tool(&cluster, &["s1", "s2"], Options::default());
    let (result, out) = run(&t, Action::Flush).await;
    assert_eq!(result.unwrap(), 2);
    assert_eq!(out, "s1\ns2\n");
    assert_eq!(cluster.value("s1", "a"), Some(Value::from("1")));
}

#[tokio::test]
async fn test_stats_uses_host_token() {
    let cluster = FakeCluster::default().with_items("s1", vec![text_item("a", "1")]);
    let t = tool(&cluster, &["s1"], Options::default());
    let (first, out) = run(&t, Action::Stats).await;
    assert_eq!(first.unwrap(), 2);
    assert_eq!(out, "s1|curr_items|1\ns1|version|1.6.0\n");

    let (_, again) = run(&t, Action::Stats).await;
    assert_eq!(out, again);
}

#[tokio::test]
async fn test_get_propagates_connection_failure() {
    let cluster = FakeCluster::default().down("s1");
    let t = tool(&cluster, &["s1"], Options::default());
    let (result, out) = run(&t, Action::Get { keys: keys(&["a"]) }).await;
    assert!(result.is_err());
    assert!(out.is_empty());
}
