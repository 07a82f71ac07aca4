use std::collections::HashMap;

use crate::client::{check_key, CacheClient, MemcacheConnection, GET_BATCH_SIZE};
use crate::error::{McInspectError, Result};
use crate::filter::SizeLimit;
use crate::item::{Expiration, Item, Value};
use crate::servers::ServerSpec;

/// What a scan should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanOptions {
    pub include_values: bool,
    pub limit: SizeLimit,
}

/// Enumerates the items stored on a server.
#[allow(async_fn_in_trait)]
pub trait BulkInspector {
    /// Items of one server in the server's own scan order. Values are attached
    /// only when `options.include_values` is set. `Item::size` is the length
    /// of the stored value in bytes.
    async fn scan(&self, server: &ServerSpec, options: ScanOptions) -> Result<Vec<Item>>;
}

/// Walks the item table through the LRU crawler, falling back to slab
/// cachedumps on servers that do not offer `lru_crawler metadump`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrawlerInspector;

/// What the `size` of an enumerated item measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sizes {
    /// Value length, as cachedump reports it.
    ValueBytes,
    /// Whole item footprint (header, key and value), as the crawler reports it.
    ItemTotal,
}

impl BulkInspector for CrawlerInspector {
    async fn scan(&self, server: &ServerSpec, options: ScanOptions) -> Result<Vec<Item>> {
        let mut conn = MemcacheConnection::open(server).await?;

        let (mut items, sizes) = enumerate(&mut conn).await?;
        match sizes {
            Sizes::ValueBytes => {
                items.retain(|item| options.limit.admits(item.size));
                if options.include_values {
                    items = fetch_values(&mut conn, items, true, false).await?;
                }
            }
            Sizes::ItemTotal => {
                // the crawler only knows footprints; value lengths need a fetch
                let values = options.include_values;
                items = fetch_values(&mut conn, items, values, !values).await?;
                items.retain(|item| options.limit.admits(item.size));
            }
        }
        tracing::debug!(server = %server, items = items.len(), "Scanned server");

        if let Err(e) = conn.close().await {
            tracing::debug!(server = %server, error = %e, "Failed to close connection cleanly");
        }
        Ok(items)
    }
}

async fn enumerate(conn: &mut MemcacheConnection) -> Result<(Vec<Item>, Sizes)> {
    match conn.request_lines("lru_crawler metadump all").await {
        Ok(lines) => {
            let items = lines.iter().filter_map(|l| parse_metadump_line(l)).collect();
            Ok((items, Sizes::ItemTotal))
        }
        Err(McInspectError::Server { reply, .. }) => {
            tracing::warn!(server = %conn.server(), reply = %reply, "LRU crawler unavailable, falling back to cachedump");
            Ok((enumerate_cachedump(conn).await?, Sizes::ValueBytes))
        }
        Err(e) => Err(e),
    }
}

async fn enumerate_cachedump(conn: &mut MemcacheConnection) -> Result<Vec<Item>> {
    let slab_lines = conn.request_lines("stats items").await?;
    let mut items = Vec::new();
    for slab in slab_ids(&slab_lines) {
        let lines = conn.request_lines(&format!("stats cachedump {slab} 0")).await?;
        items.extend(lines.iter().filter_map(|l| parse_cachedump_line(l)));
    }
    Ok(items)
}

/// Reads the stored values of `items` and sets each size to its value length.
///
/// Items that vanished since enumeration are dropped. Keys the text protocol
/// cannot address are dropped too, unless `keep_unreadable` is set, in which
/// case they keep their enumerated size.
async fn fetch_values(
    conn: &mut MemcacheConnection,
    items: Vec<Item>,
    keep_values: bool,
    keep_unreadable: bool,
) -> Result<Vec<Item>> {
    let mut readable = Vec::with_capacity(items.len());
    for item in &items {
        match check_key(&item.key) {
            Ok(()) => readable.push(item.key.clone()),
            Err(e) => tracing::warn!(
                server = %conn.server(),
                key = ?item.key,
                error = %e,
                "Cannot read item value"
            ),
        }
    }

    let mut fetched: HashMap<String, (u64, Option<Value>)> = HashMap::with_capacity(readable.len());
    for batch in readable.chunks(GET_BATCH_SIZE) {
        for raw in conn.get_raw(batch).await? {
            let size = raw.data.len() as u64;
            let value = keep_values.then(|| Value::from_wire(raw.flags, raw.data));
            fetched.insert(raw.key, (size, value));
        }
    }

    let mut vanished = 0usize;
    let mut kept = Vec::with_capacity(items.len());
    for mut item in items {
        if check_key(&item.key).is_err() {
            if keep_unreadable {
                kept.push(item);
            }
            continue;
        }
        match fetched.remove(&item.key) {
            Some((size, value)) => {
                item.size = size;
                item.value = value;
                kept.push(item);
            }
            None => vanished += 1,
        }
    }
    if vanished > 0 {
        tracing::debug!(
            server = %conn.server(),
            dropped = vanished,
            "Items disappeared before their values could be read"
        );
    }
    Ok(kept)
}

/// Parses `key=<uri-encoded> exp=<ts|-1> la=<ts> cas=<n> fetch=<yes|no> cls=<n> size=<n>`.
fn parse_metadump_line(line: &str) -> Option<Item> {
    let mut key = None;
    let mut exp = None;
    let mut size = None;
    for field in line.split(' ') {
        match field.split_once('=') {
            Some(("key", raw)) => key = decode_key(raw),
            Some(("exp", raw)) => exp = raw.parse::<i64>().ok(),
            Some(("size", raw)) => size = raw.parse::<u64>().ok(),
            _ => {}
        }
    }
    Some(Item::new(key?, Expiration::from_unix(exp?), size?))
}

/// Metadump keys are percent-encoded.
fn decode_key(raw: &str) -> Option<String> {
    url::form_urlencoded::parse(raw.as_bytes())
        .next()
        .map(|(key, _)| key.into_owned())
}

/// Parses `ITEM <key> [<size> b; <exptime> s]`.
fn parse_cachedump_line(line: &str) -> Option<Item> {
    let rest = line.strip_prefix("ITEM ")?;
    let (key, meta) = rest.split_once(" [")?;
    let meta = meta.strip_suffix(']')?;
    let (size, exp) = meta.split_once("; ")?;
    let size = size.strip_suffix(" b")?.parse().ok()?;
    let exp = exp.strip_suffix(" s")?.parse().ok()?;
    Some(Item::new(key, Expiration::from_unix(exp), size))
}

/// Slab class ids from `stats items` (`STAT items:<id>:<stat> <n>`), in order.
fn slab_ids(lines: &[String]) -> Vec<u32> {
    let mut ids: Vec<u32> = Vec::new();
    for line in lines {
        let id = line
            .strip_prefix("STAT items:")
            .and_then(|rest| rest.split(':').next())
            .and_then(|id| id.parse().ok());
        if let Some(id) = id {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}
