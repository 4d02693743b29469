//! Content-addressed dedup store for upstream records.
//!
//! A record's identity is the SHA-256 of its canonical JSON, so ingesting the
//! same fill twice (same page refetched, process restarted, window overlap)
//! is a no-op. The store itself is a dumb upsert-by-id surface behind
//! [`DealStore`]; dedup policy lives in [`ingest`].

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead as _, BufReader, BufWriter, Write as _};
use std::path::Path;

use serde_json::{Map, Value};
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tracing::info;

use crate::types::Record;

/// Field injected into stored rows to carry the fingerprint. Upstream fields
/// are camelCase, so the underscore name cannot collide.
pub const ID_FIELD: &str = "_id";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("corrupt store line {line}: {detail}")]
    Corrupt { line: usize, detail: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestStatus {
    Inserted,
    Duplicate,
}

/// Canonical form: object keys sorted recursively. Key order must not depend
/// on the `Map` backing or on how the upstream serialized the record.
fn canonical_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonical_value(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

pub fn canonical_string(record: &Record) -> Result<String, StoreError> {
    let canon = canonical_value(&Value::Object(record.clone()));
    Ok(serde_json::to_string(&canon)?)
}

/// Hex SHA-256 of the canonical serialization; the record's stored id.
pub fn fingerprint(record: &Record) -> Result<String, StoreError> {
    Ok(hex::encode(Sha256::digest(
        canonical_string(record)?.as_bytes(),
    )))
}

/// Upsert-by-id key-value surface. Exact-id lookup plus append is all the
/// pipeline needs from a backend.
pub trait DealStore {
    fn find_by_id(&self, id: &str) -> Result<Option<&Record>, StoreError>;
    fn insert(&mut self, id: &str, record: Record) -> Result<(), StoreError>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Idempotent ingest: fingerprint the record, skip if already present,
/// otherwise store it with the fingerprint injected under [`ID_FIELD`].
/// Fingerprints are computed over the raw upstream record, never over the
/// stored row, so reloads and re-fetches agree on identity.
pub fn ingest(store: &mut dyn DealStore, record: &Record) -> Result<IngestStatus, StoreError> {
    let id = fingerprint(record)?;
    if store.find_by_id(&id)?.is_some() {
        return Ok(IngestStatus::Duplicate);
    }
    let mut stored = record.clone();
    stored.insert(ID_FIELD.to_string(), Value::String(id.clone()));
    store.insert(&id, stored)?;
    Ok(IngestStatus::Inserted)
}

/// In-memory backend for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: HashMap<String, Record>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DealStore for MemoryStore {
    fn find_by_id(&self, id: &str) -> Result<Option<&Record>, StoreError> {
        Ok(self.rows.get(id))
    }

    fn insert(&mut self, id: &str, record: Record) -> Result<(), StoreError> {
        self.rows.insert(id.to_string(), record);
        Ok(())
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Append-only JSONL file with an in-memory id index.
///
/// One JSON object per line, each carrying its id under [`ID_FIELD`]; the
/// index is rebuilt from the file at open, so dedup survives restarts.
#[derive(Debug)]
pub struct JsonlStore {
    index: HashMap<String, Record>,
    out: BufWriter<File>,
}

impl JsonlStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let mut index: HashMap<String, Record> = HashMap::new();

        match File::open(path) {
            Ok(f) => {
                let reader = BufReader::new(f);
                for (lineno, line) in reader.lines().enumerate() {
                    let line = line?;
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let record: Record =
                        serde_json::from_str(trimmed).map_err(|e| StoreError::Corrupt {
                            line: lineno + 1,
                            detail: e.to_string(),
                        })?;
                    let id = match record.get(ID_FIELD).and_then(Value::as_str) {
                        Some(s) => s.to_string(),
                        None => {
                            return Err(StoreError::Corrupt {
                                line: lineno + 1,
                                detail: format!("missing {ID_FIELD}"),
                            })
                        }
                    };
                    index.insert(id, record);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(path = %path.display(), rows = index.len(), "opened deal store");
        Ok(Self {
            index,
            out: BufWriter::new(file),
        })
    }
}

impl DealStore for JsonlStore {
    fn find_by_id(&self, id: &str) -> Result<Option<&Record>, StoreError> {
        Ok(self.index.get(id))
    }

    fn insert(&mut self, id: &str, record: Record) -> Result<(), StoreError> {
        // Flush per insert: volume is one page per cycle, and an unflushed
        // line turns into a duplicate alert after a restart.
        let line = serde_json::to_string(&record)?;
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        self.index.insert(id.to_string(), record);
        Ok(())
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{canonical_string, fingerprint, ingest, DealStore as _, IngestStatus, MemoryStore};
    use crate::types::Record;

    fn record(v: Value) -> Record {
        v.as_object().expect("object literal").clone()
    }

    #[test]
    fn canonical_string_sorts_keys_recursively() {
        let r = record(json!({"b": 1, "a": [{"d": 2, "c": 3}]}));
        assert_eq!(canonical_string(&r).unwrap(), r#"{"a":[{"c":3,"d":2}],"b":1}"#);
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = record(json!({"symbol": "BTCUSDT", "side": "BUY", "avgPrice": "42000.1"}));
        let b = record(json!({"avgPrice": "42000.1", "side": "BUY", "symbol": "BTCUSDT"}));
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn fingerprint_sees_every_field() {
        let a = record(json!({"symbol": "BTCUSDT", "executedQty": "1.0"}));
        let b = record(json!({"symbol": "BTCUSDT", "executedQty": "1.1"}));
        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn repeated_ingest_is_idempotent() {
        let mut store = MemoryStore::new();
        let r = record(json!({"symbol": "ETHUSDT", "side": "SELL", "avgPrice": "3100.5"}));

        assert_eq!(ingest(&mut store, &r).unwrap(), IngestStatus::Inserted);
        for _ in 0..99 {
            assert_eq!(ingest(&mut store, &r).unwrap(), IngestStatus::Duplicate);
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn one_field_apart_is_two_entries() {
        let mut store = MemoryStore::new();
        let a = record(json!({"symbol": "ETHUSDT", "executedQty": "2"}));
        let b = record(json!({"symbol": "ETHUSDT", "executedQty": "3"}));

        assert_eq!(ingest(&mut store, &a).unwrap(), IngestStatus::Inserted);
        assert_eq!(ingest(&mut store, &b).unwrap(), IngestStatus::Inserted);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn stored_row_carries_its_id() {
        let mut store = MemoryStore::new();
        let r = record(json!({"symbol": "BNBUSDT"}));
        let id = fingerprint(&r).unwrap();

        ingest(&mut store, &r).unwrap();
        let row = store.find_by_id(&id).unwrap().expect("row present");
        assert_eq!(row.get(super::ID_FIELD).and_then(Value::as_str), Some(id.as_str()));
        assert_eq!(row.get("symbol").and_then(Value::as_str), Some("BNBUSDT"));
    }
}
