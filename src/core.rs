//! # Reconciler
//!
//! This module is the protocol state machine that drives one pairwise sync
//! session for one table, between an *Initiator* and a *Responder*.
//! It is the piece that ties every other module together: [`crate::hlc`] for
//! ordering, [`crate::clock`] for keeping clocks comparable, [`crate::chunking`]
//! for cheap diffing, [`crate::wire`]/[`crate::transport`] for talking to the
//! peer, [`crate::store`] for reading and committing rows, and
//! [`crate::checkpoint`] for resuming an interrupted session.
//!
//! ## Session shape
//!
//! `Idle -> Handshake -> Calibrate -> Diff -> Resolve -> Commit -> Done`,
//! with any state able to fail into `Aborted` (modeled here as `Err`, not a
//! literal enum variant — callers observe the failure through the `Result`
//! and the [`SyncEvent`] it's turned into, which is simpler to drive than a
//! state machine object while preserving the same transitions).
//!
//! ## A note on symmetry (design decision, recorded again in `DESIGN.md`)
//!
//! §4.5 describes `CHUNKS`/`DRILL`/`ROWS`/`FETCH`/`PAYLOAD` as a "symmetric"
//! exchange without pinning down exactly who requests what from whom. Since
//! both sides chunk identically (determinism, §4.4) and therefore derive the
//! same "needs drill" set from the same exchanged `CHUNKS` lists, this
//! implementation has both sides *independently* compute that set and
//! *both* proactively send `DRILL`+`ROWS` for every member of it, rather than
//! one side soliciting the other. The same trick applies to `FETCH`/`PAYLOAD`:
//! both sides independently compute what they need from the peer and what the
//! peer needs from them (same row descriptors, same deterministic algorithm),
//! so both send `FETCH` (for audit/documentation of intent) and proactively
//! push `PAYLOAD` for whatever the peer is due, rather than waiting to be
//! asked. This keeps the two sides' decisions identical by construction,
//! which is exactly the "given identical exchanges, `Reconciler` yields
//! identical decisions" testable property — and avoids a request/response
//! round trip whose ordering isn't pinned down by the wire format.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[cfg(not(test))]
use log::{debug, info, warn};
#[cfg(test)]
use std::{println as debug, println as info, println as warn};

use async_trait::async_trait;
use uuid::Uuid;

use crate::checkpoint::{derive_session_id, Checkpoint, CheckpointStore};
use crate::chunking::{self, index_by_entity_key, DataChunk};
use crate::clock::{Calibrator, MasterTimeSource};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::events::SyncEvent;
use crate::hlc::{Clock, Hlc};
use crate::store::{collect_range, EntityKey, Mutation, NodeMetadata, Record, RecordStore};
use crate::transport::{with_timeout, Transport};
use crate::wire::{self, ChunkDescriptor, Message, RowDescriptor, PROTOCOL_VERSION};

/// Everything one side of a session needs. Borrowed for the duration of one
/// `run_initiator`/`run_responder` call; nothing here outlives the session.
pub struct SessionConfig<'a> {
    pub table: &'a str,
    pub my_node_id: Uuid,
    pub clock: &'a Clock,
    pub calibrator: Option<&'a Calibrator>,
    pub master_time_source: Option<&'a dyn MasterTimeSource>,
    pub store: &'a dyn RecordStore,
    pub transport: &'a dyn Transport,
    pub checkpoints: &'a dyn CheckpointStore,
    pub config: &'a Config,
    pub events: Option<&'a tokio::sync::broadcast::Sender<SyncEvent>>,
}

/// What a successfully completed session accomplished, reported to the host
/// alongside `SyncEvent::SessionCompleted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub bytes_exchanged: u64,
    pub rows_applied: u64,
    pub new_last_sync_time: Hlc,
}

/// Bridges the Calibrator (§4.2) to a peer reachable over a [`Transport`],
/// round-tripping `TIME_QUERY`/`TIME_REPLY`. The calibration target is
/// "the master", which may or may not be the same node as the sync peer;
/// callers construct this over whichever `Transport` actually reaches their
/// master.
pub struct TransportMasterTimeSource<'a> {
    transport: &'a dyn Transport,
    timeout_ms: u64,
}

impl<'a> TransportMasterTimeSource<'a> {
    pub fn new(transport: &'a dyn Transport, timeout_ms: u64) -> Self {
        TransportMasterTimeSource { transport, timeout_ms }
    }
}

#[async_trait]
impl<'a> MasterTimeSource for TransportMasterTimeSource<'a> {
    async fn query_master_time_ms(&self) -> Result<i64> {
        with_timeout(self.timeout_ms, "TIME_QUERY send", self.transport.send(Message::TimeQuery)).await?;
        match with_timeout(self.timeout_ms, "TIME_REPLY", self.transport.recv()).await? {
            Message::TimeReply { t_master_ms } => Ok(t_master_ms),
            other => Err(SyncError::ProtocolViolation(format!(
                "expected TIME_REPLY, got {:?}",
                other.type_code()
            ))),
        }
    }
}

/// Thin wrapper around a session's `Transport` that applies the per-message
/// timeout (§5) uniformly and tallies the bytes of every message this side
/// sends, for `SessionOutcome::bytes_exchanged`.
struct Wire<'a> {
    transport: &'a dyn Transport,
    timeout_ms: u64,
    bytes_sent: Cell<u64>,
}

impl<'a> Wire<'a> {
    fn new(transport: &'a dyn Transport, timeout_ms: u64) -> Self {
        Wire {
            transport,
            timeout_ms,
            bytes_sent: Cell::new(0),
        }
    }

    async fn send(&self, msg: Message) -> Result<()> {
        self.bytes_sent
            .set(self.bytes_sent.get() + wire::encode_message(&msg).len() as u64);
        with_timeout(self.timeout_ms, "message send", self.transport.send(msg)).await
    }

    async fn recv(&self, expected: &'static str) -> Result<Message> {
        let msg = with_timeout(self.timeout_ms, expected, self.transport.recv()).await?;
        if let Message::Error { kind, detail } = &msg {
            return Err(error_from_wire(kind, detail));
        }
        Ok(msg)
    }
}

fn error_from_wire(kind: &str, detail: &str) -> SyncError {
    match kind {
        "IncompatibleVersion" => SyncError::IncompatibleVersion { local: PROTOCOL_VERSION, remote: 0 },
        "ChecksumMismatch" => SyncError::ChecksumMismatch { table: detail.to_string() },
        "SchemaMismatch" => SyncError::SchemaMismatch { table: detail.to_string(), detail: detail.to_string() },
        _ => SyncError::ProtocolViolation(format!("peer reported {}: {}", kind, detail)),
    }
}

enum Role {
    Initiator { peer_node_id: Uuid },
    Responder,
}

/// Runs this session as the Initiator: sends `HELLO` first. `peer_node_id`
/// must already be known (the host's transport layer connected to a specific
/// peer); it is used to derive the stable, resumable `session_id` before the
/// handshake even starts.
pub async fn run_initiator(session: SessionConfig<'_>, peer_node_id: Uuid) -> Result<SessionOutcome> {
    run(session, Role::Initiator { peer_node_id }).await
}

/// Runs this session as the Responder: waits for `HELLO` and replies.
pub async fn run_responder(session: SessionConfig<'_>) -> Result<SessionOutcome> {
    run(session, Role::Responder).await
}

async fn run(cfg: SessionConfig<'_>, role: Role) -> Result<SessionOutcome> {
    let wire = Wire::new(cfg.transport, cfg.config.transport_message_timeout_ms);

    let handshake = do_handshake(&cfg, &wire, role).await;
    let handshake = match handshake {
        Ok(h) => h,
        Err(e) => return Err(e),
    };

    if let Some(events) = cfg.events {
        let _ = events.send(SyncEvent::SessionStarted {
            peer_id: handshake.peer_node_id,
            table: cfg.table.to_string(),
        });
    }

    let result = run_session_body(&cfg, &wire, &handshake).await;

    match &result {
        Ok(outcome) => {
            if let Some(events) = cfg.events {
                let _ = events.send(SyncEvent::SessionCompleted {
                    peer_id: handshake.peer_node_id,
                    table: cfg.table.to_string(),
                    bytes_exchanged: outcome.bytes_exchanged,
                    rows_applied: outcome.rows_applied,
                });
            }
        }
        Err(e) => {
            if matches!(e, SyncError::WaitingForMaster) {
                if let Some(events) = cfg.events {
                    let _ = events.send(SyncEvent::AwaitingMaster { table: cfg.table.to_string() });
                }
            } else if let Some(events) = cfg.events {
                let _ = events.send(SyncEvent::failed(handshake.peer_node_id, cfg.table, e));
            }
        }
    }

    result
}

struct Handshake {
    peer_node_id: Uuid,
    session_id: Uuid,
    sync_lo: Hlc,
    local_metadata: NodeMetadata,
}

async fn do_handshake(cfg: &SessionConfig<'_>, wire: &Wire<'_>, role: Role) -> Result<Handshake> {
    let local_metadata = cfg.store.read_metadata(cfg.table).await?;

    match role {
        Role::Initiator { peer_node_id } => {
            let session_id = derive_session_id(cfg.my_node_id, peer_node_id, cfg.table);
            debug!(
                "[{}] initiating session {} with peer {} (local last_sync_time={})",
                cfg.table, session_id, peer_node_id, local_metadata.last_sync_time
            );
            wire
                .send(Message::Hello {
                    node_id: cfg.my_node_id,
                    protocol_version: PROTOCOL_VERSION,
                    table: cfg.table.to_string(),
                    last_sync_time: local_metadata.last_sync_time,
                    session_id,
                })
                .await?;
            match wire.recv("HELLO_ACK").await? {
                Message::HelloAck { node_id, last_sync_time } => {
                    if node_id != peer_node_id {
                        return Err(SyncError::ProtocolViolation(format!(
                            "HELLO_ACK from unexpected peer {} (expected {})",
                            node_id, peer_node_id
                        )));
                    }
                    cfg.clock.observe(last_sync_time)?;
                    let sync_lo = local_metadata.last_sync_time.min(last_sync_time);
                    Ok(Handshake { peer_node_id, session_id, sync_lo, local_metadata })
                }
                other => Err(SyncError::ProtocolViolation(format!(
                    "expected HELLO_ACK, got {:?}",
                    other.type_code()
                ))),
            }
        }
        Role::Responder => match wire.recv("HELLO").await? {
            Message::Hello { node_id, protocol_version, table, last_sync_time, session_id } => {
                if protocol_version != PROTOCOL_VERSION {
                    wire
                        .send(Message::Error {
                            kind: "IncompatibleVersion".to_string(),
                            detail: protocol_version.to_string(),
                        })
                        .await
                        .ok();
                    return Err(SyncError::IncompatibleVersion {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }
                if table != cfg.table {
                    return Err(SyncError::ProtocolViolation(format!(
                        "HELLO for table '{}', session opened for '{}'",
                        table, cfg.table
                    )));
                }
                let expected_session_id = derive_session_id(cfg.my_node_id, node_id, cfg.table);
                if expected_session_id != session_id {
                    return Err(SyncError::ProtocolViolation(
                        "HELLO session_id does not match the derived (node, node, table) id".to_string(),
                    ));
                }
                cfg.clock.observe(last_sync_time)?;
                wire
                    .send(Message::HelloAck {
                        node_id: cfg.my_node_id,
                        last_sync_time: local_metadata.last_sync_time,
                    })
                    .await?;
                let sync_lo = local_metadata.last_sync_time.min(last_sync_time);
                debug!(
                    "[{}] accepted session {} from peer {} (sync_lo={})",
                    cfg.table, session_id, node_id, sync_lo
                );
                Ok(Handshake { peer_node_id: node_id, session_id, sync_lo, local_metadata })
            }
            other => Err(SyncError::ProtocolViolation(format!(
                "expected HELLO, got {:?}",
                other.type_code()
            ))),
        },
    }
}

async fn run_session_body(
    cfg: &SessionConfig<'_>,
    wire: &Wire<'_>,
    hs: &Handshake,
) -> Result<SessionOutcome> {
    maybe_calibrate(cfg).await?;

    let now = cfg.clock.now()?;
    let my_chunks = chunking::generate_chunks(
        cfg.store,
        cfg.table,
        &now,
        &cfg.config.chunking,
        cfg.config.enumerate_page_size,
    )
    .await?;

    wire.send(Message::Chunks { chunks: my_chunks.iter().map(to_descriptor).collect() }).await?;
    let peer_chunks = match wire.recv("CHUNKS").await? {
        Message::Chunks { chunks } => chunks,
        other => {
            return Err(SyncError::ProtocolViolation(format!(
                "expected CHUNKS, got {:?}",
                other.type_code()
            )))
        }
    };

    let mut max_hlc_seen = hs.sync_lo;
    for c in my_chunks.iter().map(|c| c.hlc_hi).chain(peer_chunks.iter().map(|c| c.hi)) {
        max_hlc_seen = max_hlc_seen.max(c);
    }

    let needs_drill = align_chunks(&my_chunks, &peer_chunks);
    debug!(
        "[{}] {} local chunks, {} peer chunks, {} need drilling",
        cfg.table,
        my_chunks.len(),
        peer_chunks.len(),
        needs_drill.len()
    );

    let completed_up_to = resolve_checkpoint(cfg, hs).await?;
    let pending: Vec<(Hlc, Hlc)> = needs_drill
        .iter()
        .filter(|(lo, _)| completed_up_to.map_or(true, |c| *lo > c))
        .cloned()
        .collect();
    if pending.len() != needs_drill.len() {
        info!(
            "[{}] resuming session {}: skipping {} already-completed chunk(s)",
            cfg.table,
            hs.session_id,
            needs_drill.len() - pending.len()
        );
    }

    // Diff: fetch and exchange ROWS for every range that needs drilling,
    // including ranges we're about to skip re-applying, so both sides keep
    // a consistent view of the full range set (§4.5, "exchange ROWS").
    let mut my_rows_by_range: BTreeMap<(Hlc, Hlc), Vec<Record>> = BTreeMap::new();
    for &(lo, hi) in &needs_drill {
        let rows = collect_range(cfg.store, cfg.table, &lo, &hi, cfg.config.enumerate_page_size).await?;
        wire.send(Message::Drill { lo, hi }).await?;
        wire.send(Message::Rows { lo, hi, rows: rows.iter().map(to_row_descriptor).collect() }).await?;
        my_rows_by_range.insert((lo, hi), rows);
    }

    let mut peer_rows_by_range: BTreeMap<(Hlc, Hlc), Vec<RowDescriptor>> = BTreeMap::new();
    let mut drills_seen = 0usize;
    let mut rows_seen = 0usize;
    let mut staged_bytes = 0u64;
    while rows_seen < needs_drill.len() || drills_seen < needs_drill.len() {
        let msg = wire.recv("DRILL or ROWS").await?;
        let frame_len = wire::encode_message(&msg).len() as u64;
        match msg {
            Message::Drill { .. } => drills_seen += 1,
            Message::Rows { lo, hi, rows } => {
                staged_bytes += frame_len;
                if staged_bytes > cfg.config.reconciler_max_staged_bytes {
                    return Err(SyncError::StagingOverflow {
                        staged_bytes,
                        limit_bytes: cfg.config.reconciler_max_staged_bytes,
                    });
                }
                for r in &rows {
                    max_hlc_seen = max_hlc_seen.max(r.modified_hlc);
                }
                peer_rows_by_range.insert((lo, hi), rows);
                rows_seen += 1;
            }
            other => {
                return Err(SyncError::ProtocolViolation(format!(
                    "expected DRILL/ROWS, got {:?}",
                    other.type_code()
                )))
            }
        }
    }
    for rows in my_rows_by_range.values() {
        for r in rows {
            max_hlc_seen = max_hlc_seen.max(r.modified_hlc);
        }
    }

    // Resolve: classify every drilled range into a chunk plan, but only
    // build mutations for ranges this session hasn't already committed.
    let mut chunk_plans = Vec::new();
    for &(lo, hi) in &pending {
        let my_rows = my_rows_by_range.get(&(lo, hi)).cloned().unwrap_or_default();
        let peer_rows = peer_rows_by_range.get(&(lo, hi)).cloned().unwrap_or_default();
        chunk_plans.push(plan_chunk(lo, hi, &my_rows, &peer_rows, hs.sync_lo));
    }

    let mut i_need_from_peer: Vec<EntityKey> = Vec::new();
    let mut peer_needs_from_me: Vec<EntityKey> = Vec::new();
    for plan in &chunk_plans {
        i_need_from_peer.extend(plan.needs_from_peer.iter().map(|(k, _)| k.clone()));
        peer_needs_from_me.extend(plan.peer_needs_from_me.iter().cloned());
    }

    if !i_need_from_peer.is_empty() {
        wire.send(Message::Fetch { entity_keys: i_need_from_peer.clone() }).await?;
    }
    if !peer_needs_from_me.is_empty() {
        let mut records = Vec::with_capacity(peer_needs_from_me.len());
        for key in &peer_needs_from_me {
            if let Some(record) = cfg.store.get(cfg.table, key).await? {
                records.push(record);
            } else {
                warn!(
                    "[{}] peer needs entity_key we no longer hold locally; omitting from PAYLOAD",
                    cfg.table
                );
            }
        }
        wire.send(Message::Payload { records }).await?;
    }

    let expect_payload = !i_need_from_peer.is_empty();
    let expect_fetch = !peer_needs_from_me.is_empty();
    let mut fetched: HashMap<EntityKey, Record> = HashMap::new();
    let mut payload_received = !expect_payload;
    let mut fetch_received = !expect_fetch;
    while !payload_received || !fetch_received {
        let msg = wire.recv("FETCH or PAYLOAD").await?;
        let frame_len = wire::encode_message(&msg).len() as u64;
        match msg {
            Message::Fetch { .. } => fetch_received = true,
            Message::Payload { records } => {
                staged_bytes += frame_len;
                if staged_bytes > cfg.config.reconciler_max_staged_bytes {
                    return Err(SyncError::StagingOverflow {
                        staged_bytes,
                        limit_bytes: cfg.config.reconciler_max_staged_bytes,
                    });
                }
                for r in records {
                    max_hlc_seen = max_hlc_seen.max(r.modified_hlc);
                    fetched.insert(r.entity_key.clone(), r);
                }
                payload_received = true;
            }
            other => {
                return Err(SyncError::ProtocolViolation(format!(
                    "expected FETCH/PAYLOAD, got {:?}",
                    other.type_code()
                )))
            }
        }
    }

    let mut rows_applied = 0u64;
    let mut committed_plans = Vec::with_capacity(chunk_plans.len());
    for plan in chunk_plans {
        let mut batch = Vec::new();
        for key in &plan.delete_locally {
            batch.push(Mutation::Delete(key.clone()));
        }
        for (key, kind) in &plan.needs_from_peer {
            let Some(record) = fetched.get(key) else {
                return Err(SyncError::ProtocolViolation(format!(
                    "peer never sent PAYLOAD for entity_key it owes us ({:?})",
                    kind
                )));
            };
            batch.push(match kind {
                PlannedKind::Insert => Mutation::Insert(record.clone()),
                PlannedKind::Update => Mutation::Update(record.clone()),
            });
        }
        rows_applied += batch.len() as u64;
        committed_plans.push((plan.hi, batch));
    }

    // Commit: vote, then (only if both sides are ready) apply each
    // pending chunk's batch in order, checkpointing after each, and
    // finally bump NodeMetadata.last_sync_time in one last apply.
    wire.send(Message::CommitVote { ok: true, reason: String::new() }).await?;
    match wire.recv("COMMIT_VOTE").await? {
        Message::CommitVote { ok: true, .. } => {}
        Message::CommitVote { ok: false, reason } => {
            return Err(SyncError::ProtocolViolation(format!("peer aborted commit: {}", reason)))
        }
        other => {
            return Err(SyncError::ProtocolViolation(format!(
                "expected COMMIT_VOTE, got {:?}",
                other.type_code()
            )))
        }
    }

    let mut running_metadata = hs.local_metadata.clone();
    for (hi, batch) in committed_plans {
        if batch.is_empty() {
            continue;
        }
        cfg.store.apply(cfg.table, batch, running_metadata.clone()).await?;
        // Hash the same range resolve_checkpoint will re-verify against on a
        // resume: the full prefix [MIN, hi] as it stands *after* this apply.
        // Hashing anything narrower, or hashing pre-apply content, makes the
        // saved checkpoint un-verifiable against the live store later.
        let cumulative_hash =
            chunking::hash_range(cfg.store, cfg.table, &Hlc::MIN, &hi, cfg.config.enumerate_page_size).await?;
        cfg.checkpoints
            .save(Checkpoint {
                session_id: hs.session_id,
                table: cfg.table.to_string(),
                last_completed_chunk_hi: hi,
                chunk_hash: cumulative_hash,
                created_at_ms: now.physical_ms as i64,
            })
            .await?;
    }

    running_metadata.last_sync_time = max_hlc_seen;
    running_metadata.master_offset_ms = cfg.clock.master_offset_ms();
    running_metadata.last_local_hlc = cfg.clock.last_local_hlc();
    cfg.store.apply(cfg.table, Vec::new(), running_metadata).await?;
    cfg.checkpoints.clear(hs.session_id, cfg.table).await?;

    wire.send(Message::CommitAck).await?;
    match wire.recv("COMMIT_ACK").await? {
        Message::CommitAck => {}
        other => {
            return Err(SyncError::ProtocolViolation(format!(
                "expected COMMIT_ACK, got {:?}",
                other.type_code()
            )))
        }
    }

    info!(
        "[{}] session {} with peer {} committed: {} row(s) applied, last_sync_time now {}",
        cfg.table, hs.session_id, hs.peer_node_id, rows_applied, max_hlc_seen
    );

    Ok(SessionOutcome {
        bytes_exchanged: wire.bytes_sent.get(),
        rows_applied,
        new_last_sync_time: max_hlc_seen,
    })
}

async fn maybe_calibrate(cfg: &SessionConfig<'_>) -> Result<()> {
    let Some(calibrator) = cfg.calibrator else { return Ok(()) };
    if !calibrator.is_stale() {
        return Ok(());
    }
    let Some(source) = cfg.master_time_source else {
        debug!("calibrator is stale but no master time source was configured; skipping");
        return Ok(());
    };
    let current_offset = cfg.clock.master_offset_ms();
    let new_offset = calibrator.calibrate(source, current_offset).await?;
    cfg.clock.set_master_offset_ms(new_offset);
    Ok(())
}

/// Checks a session's checkpoint, if any, against a fresh recompute of the
/// rows it claims to cover. Returns the boundary up to which this session
/// has already committed, or `None` if there's nothing to resume (or the
/// checkpoint failed verification and was discarded).
async fn resolve_checkpoint(cfg: &SessionConfig<'_>, hs: &Handshake) -> Result<Option<Hlc>> {
    let Some(checkpoint) = cfg.checkpoints.load(hs.session_id, cfg.table).await? else {
        return Ok(None);
    };
    let verified = chunking::verify_chunk(
        cfg.store,
        cfg.table,
        &Hlc::MIN,
        &checkpoint.last_completed_chunk_hi,
        &checkpoint.chunk_hash,
        cfg.config.enumerate_page_size,
    )
    .await?;
    if verified {
        Ok(Some(checkpoint.last_completed_chunk_hi))
    } else {
        warn!(
            "[{}] checkpoint for session {} failed verification; restarting from scratch",
            cfg.table, hs.session_id
        );
        cfg.checkpoints.clear(hs.session_id, cfg.table).await?;
        Ok(None)
    }
}

fn to_descriptor(c: &DataChunk) -> ChunkDescriptor {
    ChunkDescriptor { lo: c.hlc_lo, hi: c.hlc_hi, count: c.count, hash: c.hash }
}

fn to_row_descriptor(r: &Record) -> RowDescriptor {
    RowDescriptor {
        entity_key: r.entity_key.clone(),
        created_hlc: r.created_hlc,
        modified_hlc: r.modified_hlc,
        payload_hash: r.payload_hash,
    }
}

/// Aligns two chunk lists by `(lo, hi)` identity and returns the ranges that
/// need drilling: present on only one side, or present on both with
/// differing hashes. Sorted ascending by `lo` so both sides process ranges
/// in the same deterministic order.
fn align_chunks(mine: &[DataChunk], peer: &[ChunkDescriptor]) -> Vec<(Hlc, Hlc)> {
    let mine_by_range: BTreeMap<(Hlc, Hlc), &DataChunk> =
        mine.iter().map(|c| ((c.hlc_lo, c.hlc_hi), c)).collect();
    let peer_by_range: BTreeMap<(Hlc, Hlc), &ChunkDescriptor> =
        peer.iter().map(|c| ((c.lo, c.hi), c)).collect();

    let mut keys: BTreeSet<(Hlc, Hlc)> = BTreeSet::new();
    keys.extend(mine_by_range.keys().copied());
    keys.extend(peer_by_range.keys().copied());

    keys.into_iter()
        .filter(|range| match (mine_by_range.get(range), peer_by_range.get(range)) {
            (Some(m), Some(p)) => m.hash != p.hash,
            _ => true,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlannedKind {
    Insert,
    Update,
}

struct ChunkPlan {
    hi: Hlc,
    delete_locally: Vec<EntityKey>,
    needs_from_peer: Vec<(EntityKey, PlannedKind)>,
    peer_needs_from_me: Vec<EntityKey>,
}

/// Classifies one drilled range into Only-on-me / Only-on-peer / Conflicting
/// (§4.5) and partitions each group by `sync_lo` into Phase 1 (intersection,
/// historical) or Phase 2 (union with conflict resolution, recent), pure and
/// deterministic given `my_rows`/`peer_rows`.
fn plan_chunk(lo: Hlc, hi: Hlc, my_rows: &[Record], peer_rows: &[RowDescriptor], sync_lo: Hlc) -> ChunkPlan {
    let mine = index_by_entity_key(my_rows);
    let peer: BTreeMap<EntityKey, &RowDescriptor> =
        peer_rows.iter().map(|r| (r.entity_key.clone(), r)).collect();

    let mut delete_locally = Vec::new();
    let mut needs_from_peer = Vec::new();
    let mut peer_needs_from_me = Vec::new();

    for (key, my_record) in &mine {
        match peer.get(key) {
            None => {
                // Only-on-me.
                if my_record.modified_hlc < sync_lo {
                    delete_locally.push(key.clone()); // Phase 1: intersection.
                } else {
                    peer_needs_from_me.push(key.clone()); // Phase 2: peer inserts.
                }
            }
            Some(peer_row) => {
                if peer_row.payload_hash == my_record.payload_hash
                    && peer_row.modified_hlc == my_record.modified_hlc
                {
                    continue; // Identical row on both sides.
                }
                // Conflicting: same entity_key, different content/HLC.
                if peer_row.modified_hlc.resolves_conflict_over(&my_record.modified_hlc) {
                    needs_from_peer.push((key.clone(), PlannedKind::Update));
                } else {
                    peer_needs_from_me.push(key.clone());
                }
            }
        }
    }

    for (key, peer_row) in &peer {
        if mine.contains_key(key) {
            continue; // Already handled above, either matching or conflicting.
        }
        // Only-on-peer.
        if peer_row.modified_hlc >= sync_lo {
            needs_from_peer.push((key.clone(), PlannedKind::Insert)); // Phase 2: I insert.
        }
        // Phase 1 only-on-peer rows are deleted on the peer's own side; I hold
        // nothing here, so there is nothing for me to do.
    }

    ChunkPlan {
        hi,
        delete_locally,
        needs_from_peer,
        peer_needs_from_me,
    }
}
