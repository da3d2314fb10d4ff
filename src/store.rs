//! Record Store Adapter (§4.3): the abstract interface the engine drives to
//! read, write, and delete rows in a synchronized table, and to read/write
//! the table's `NodeMetadata`.
//!
//! Per the design note in §9, this is deliberately a small, closed trait over
//! opaque byte keys rather than an inheritance hierarchy over typed entities
//! — the host owns the actual schema and durability; the engine only ever
//! sees `Record`s and `entity_key: Vec<u8>`. Tables are identified by name,
//! not by type.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::hlc::Hlc;

pub type EntityKey = Vec<u8>;

/// A single row in a synchronized table, as the engine understands it. The
/// business payload is opaque — the engine hashes and moves it, but never
/// interprets it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    pub entity_key: EntityKey,
    pub created_hlc: Hlc,
    pub modified_hlc: Hlc,
    /// BLAKE3-256 digest of the canonical payload, excluding the HLC fields
    /// themselves (I3/chunk-hash input).
    pub payload_hash: [u8; 32],
    pub payload: Vec<u8>,
}

impl Record {
    /// (I1): every record must satisfy `created_hlc <= modified_hlc`.
    pub fn respects_creation_invariant(&self) -> bool {
        self.created_hlc <= self.modified_hlc
    }

    /// Ordering key used everywhere chunking/diffing needs a total order:
    /// `(modified_hlc, entity_key)`.
    pub fn order_key(&self) -> (Hlc, &[u8]) {
        (self.modified_hlc, &self.entity_key)
    }
}

/// Hashes a business payload the way a host would before stamping a
/// `Record::payload_hash`: serialize `value` to JSON (serde_json sorts
/// struct fields by declaration order, which is stable across nodes running
/// the same schema) and BLAKE3 the resulting bytes. A convenience for hosts
/// whose payload is a typed struct rather than bytes they've already
/// canonicalized themselves; the engine itself never calls this; it only
/// ever compares the `payload_hash` a host already computed.
pub fn canonical_payload_hash<T: Serialize>(value: &T) -> Result<[u8; 32]> {
    let json_bytes = serde_json::to_vec(value)
        .map_err(|e| SyncError::Other(anyhow::Error::new(e).context("canonicalizing payload to JSON")))?;
    Ok(*blake3::hash(&json_bytes).as_bytes())
}

/// Per-table, per-node bookkeeping persisted alongside the table's rows.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeMetadata {
    pub node_id: Uuid,
    pub last_sync_time: Hlc,
    pub master_offset_ms: i64,
    pub last_local_hlc: Hlc,
}

impl NodeMetadata {
    pub fn new(node_id: Uuid) -> Self {
        NodeMetadata {
            node_id,
            last_sync_time: Hlc::MIN,
            master_offset_ms: 0,
            last_local_hlc: Hlc {
                physical_ms: 0,
                counter: 0,
                node_id,
            },
        }
    }
}

/// A mutation the Reconciler has decided to apply to a table.
#[derive(Clone, Debug)]
pub enum Mutation {
    Insert(Record),
    Update(Record),
    Delete(EntityKey),
}

/// An opaque cursor for resuming `enumerate_range` where a previous page left
/// off — the "restartable" half of §4.3's contract, expressed without
/// requiring an async-generator/GAT-based streaming iterator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeCursor {
    pub after_modified_hlc: Hlc,
    pub after_entity_key: EntityKey,
}

pub struct RangePage {
    pub records: Vec<Record>,
    pub next_cursor: Option<RangeCursor>,
}

/// The contract the engine drives every synchronized table through.
/// Implementations own durability, indexing, and transactional guarantees.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Returns up to `page_size` records in `[hlc_lo, hlc_hi]` ordered by
    /// `(modified_hlc, entity_key)` ascending, continuing after `cursor` if
    /// given. Finite and restartable: calling again with the returned
    /// `next_cursor` resumes exactly where the page left off.
    async fn enumerate_range(
        &self,
        table: &str,
        hlc_lo: &Hlc,
        hlc_hi: &Hlc,
        cursor: Option<RangeCursor>,
        page_size: usize,
    ) -> Result<RangePage>;

    async fn get(&self, table: &str, entity_key: &[u8]) -> Result<Option<Record>>;

    /// Applies a batch of mutations and the new `NodeMetadata` atomically:
    /// either the whole batch and the metadata update land, or neither does.
    async fn apply(&self, table: &str, batch: Vec<Mutation>, metadata: NodeMetadata) -> Result<()>;

    async fn read_metadata(&self, table: &str) -> Result<NodeMetadata>;

    /// Persists metadata alone (e.g. a calibrator offset update) without a
    /// batch of row mutations.
    async fn write_metadata(&self, table: &str, metadata: NodeMetadata) -> Result<()>;
}

/// Drains every record in `[hlc_lo, hlc_hi]` by repeatedly paging through
/// `enumerate_range`. Used internally by the Chunker and by drill-down row
/// fetches, which both need the full ordered set for a (usually bounded)
/// range rather than one page of it.
pub async fn collect_range(
    store: &dyn RecordStore,
    table: &str,
    hlc_lo: &Hlc,
    hlc_hi: &Hlc,
    page_size: usize,
) -> Result<Vec<Record>> {
    let mut out = Vec::new();
    let mut cursor = None;
    loop {
        let page = store
            .enumerate_range(table, hlc_lo, hlc_hi, cursor, page_size)
            .await?;
        let next_cursor = page.next_cursor.clone();
        out.extend(page.records);
        match next_cursor {
            Some(c) => cursor = Some(c),
            None => break,
        }
    }
    Ok(out)
}

#[cfg(test)]
mod canonical_hash_tests {
    use super::*;

    #[derive(Serialize)]
    struct Payload {
        title: String,
        duration_ms: u32,
    }

    #[test]
    fn identical_values_hash_identically() {
        let a = Payload { title: "Aubade".into(), duration_ms: 210_000 };
        let b = Payload { title: "Aubade".into(), duration_ms: 210_000 };
        assert_eq!(canonical_payload_hash(&a).unwrap(), canonical_payload_hash(&b).unwrap());
    }

    #[test]
    fn differing_values_hash_differently() {
        let a = Payload { title: "Aubade".into(), duration_ms: 210_000 };
        let b = Payload { title: "Aubade".into(), duration_ms: 210_001 };
        assert_ne!(canonical_payload_hash(&a).unwrap(), canonical_payload_hash(&b).unwrap());
    }
}
