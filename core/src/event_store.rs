//! Durable append-only run log on SQLite, one database per profile.
//!
//! Writes go through a dedicated thread that owns the write connection; it
//! is fed by a *bounded* channel and callers fail fast with `Backpressure`
//! when the queue is full. Reads use a second connection (WAL gives readers
//! a consistent snapshot) behind a mutex, driven via `spawn_blocking`.
//!
//! The store serializes writes; the *single writer per run* discipline is
//! the orchestrator's job and is enforced by the parent-is-tip check: an
//! append whose parent is not the current tip fails with `ChainConflict`
//! instead of forking the chain.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::mpsc::SyncSender;
use std::sync::mpsc::TrySendError;
use std::sync::mpsc::{self};
use std::thread;

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;
use subtle::ConstantTimeEq;
use tokio::sync::oneshot;
use uuid::Uuid;

use chrono::DateTime;
use chrono::Utc;

use crate::canonical;
use crate::canonical::GENESIS_PREV_HASH;
use crate::clock::Clock;
use crate::error::CoreErr;
use crate::error::Result;
use crate::events::EVENT_SCHEMA_VERSION;
use crate::events::Event;
use crate::events::EventKind;
use crate::events::EventPayload;
use crate::events::RunId;
use crate::events::RunMeta;
use crate::run_state::RunStatus;

/// Writer queue depth. Full queue means the orchestrator is outrunning
/// fsync; failing fast beats buffering unboundedly.
const WRITER_QUEUE: usize = 128;

const DB_FILE: &str = "runs.sqlite3";

/// Current on-disk schema version, recorded in `meta`.
const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS runs (
    id            TEXT PRIMARY KEY,
    created_at    TEXT NOT NULL,
    status        TEXT NOT NULL,
    surface       TEXT NOT NULL,
    origin        TEXT NOT NULL,
    mode          TEXT NOT NULL,
    profile_id    TEXT NOT NULL,
    head_event_id TEXT
);
CREATE TABLE IF NOT EXISTS events (
    id             TEXT PRIMARY KEY,
    run_id         TEXT NOT NULL REFERENCES runs(id),
    seq            INTEGER NOT NULL,
    parent_id      TEXT,
    kind           TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    created_at     TEXT NOT NULL,
    payload_blob   TEXT,
    payload_digest TEXT NOT NULL,
    prev_hash      TEXT NOT NULL,
    hash           TEXT NOT NULL,
    UNIQUE (run_id, seq)
);
CREATE INDEX IF NOT EXISTS idx_events_run_seq ON events (run_id, seq);
CREATE TABLE IF NOT EXISTS chat_events (
    id         TEXT PRIMARY KEY,
    run_id     TEXT NOT NULL REFERENCES runs(id),
    role       TEXT NOT NULL,
    markdown   TEXT NOT NULL,
    citations  TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS artifacts (
    id         TEXT PRIMARY KEY,
    run_id     TEXT NOT NULL REFERENCES runs(id),
    kind       TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

/// Outcome of a full-chain verification walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainVerification {
    Ok,
    BreakAt(u64),
}

enum WriterCmd {
    CreateRun {
        meta: RunMeta,
        genesis: EventPayload,
        reply: oneshot::Sender<Result<Event>>,
    },
    Append {
        run_id: RunId,
        parent_event_id: Option<Uuid>,
        payload: EventPayload,
        reply: oneshot::Sender<Result<Event>>,
    },
    RecordChat {
        run_id: RunId,
        role: String,
        markdown: String,
        citations: Vec<u32>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Artifact bodies live in encrypted external storage; only the opaque
    /// id and kind are recorded here.
    RecordArtifact {
        run_id: RunId,
        artifact_id: Uuid,
        kind: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Null the payload bodies of observation events covered by the latest
    /// checkpoint. The digest/hash columns stay, so the chain still
    /// verifies.
    PruneCovered {
        run_id: RunId,
        up_to_seq: u64,
        reply: oneshot::Sender<Result<usize>>,
    },
}

/// Handle to the store. Cheap to clone; all clones feed the same writer.
#[derive(Clone)]
pub struct EventStore {
    writer: SyncSender<WriterCmd>,
    reader: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl EventStore {
    /// Open (and migrate) the profile database under `profile_dir`.
    pub fn open(profile_dir: &Path, clock: Clock) -> Result<Self> {
        std::fs::create_dir_all(profile_dir)?;
        let path = profile_dir.join(DB_FILE);

        let write_conn = open_connection(&path)?;
        migrate(&write_conn, &clock)?;
        let read_conn = open_connection(&path)?;

        let (tx, rx) = mpsc::sync_channel::<WriterCmd>(WRITER_QUEUE);
        thread::Builder::new()
            .name("event-store-writer".to_string())
            .spawn(move || writer_loop(write_conn, clock, rx))
            .map_err(|e| CoreErr::Durability(format!("spawn writer: {e}")))?;

        Ok(Self {
            writer: tx,
            reader: Arc::new(Mutex::new(read_conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn send(&self, cmd: WriterCmd) -> Result<()> {
        match self.writer.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CoreErr::Backpressure),
            Err(TrySendError::Disconnected(_)) => {
                Err(CoreErr::Durability("event store writer is gone".to_string()))
            }
        }
    }

    async fn reply<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        rx.await
            .map_err(|_| CoreErr::Durability("event store writer dropped a reply".to_string()))?
    }

    /// Create a run and write its genesis event in one transaction.
    pub async fn create_run(&self, meta: RunMeta, genesis: EventPayload) -> Result<Event> {
        let (reply, rx) = oneshot::channel();
        self.send(WriterCmd::CreateRun { meta, genesis, reply })?;
        Self::reply(rx).await
    }

    /// Append one event whose parent must be the current tip.
    pub async fn append(
        &self,
        run_id: RunId,
        parent_event_id: Option<Uuid>,
        payload: EventPayload,
    ) -> Result<Event> {
        let (reply, rx) = oneshot::channel();
        self.send(WriterCmd::Append {
            run_id,
            parent_event_id,
            payload,
            reply,
        })?;
        Self::reply(rx).await
    }

    /// Move the head to a prior event by appending a `run.rollback` marker.
    /// Skipped events stay in the log; subsequent appends are linear on the
    /// new head.
    pub async fn rollback(&self, run_id: RunId, target_seq: u64) -> Result<Event> {
        let Some((_, tip_id)) = self.tip(run_id).await? else {
            return Err(CoreErr::SchemaViolation(format!(
                "run {run_id} has no genesis event"
            )));
        };
        self.append(
            run_id,
            Some(tip_id),
            EventPayload::RunRollback { target_seq },
        )
        .await
    }

    /// Create a sibling head for exploratory paths. Returns the branch id.
    pub async fn branch(&self, run_id: RunId, from_seq: u64) -> Result<(Uuid, Event)> {
        let Some((_, tip_id)) = self.tip(run_id).await? else {
            return Err(CoreErr::SchemaViolation(format!(
                "run {run_id} has no genesis event"
            )));
        };
        let branch_id = Uuid::new_v4();
        let event = self
            .append(
                run_id,
                Some(tip_id),
                EventPayload::RunBranch { from_seq, branch_id },
            )
            .await?;
        Ok((branch_id, event))
    }

    /// Write a `run.checkpoint` covering everything through `up_to_seq`,
    /// making covered observation payloads eligible for pruning.
    pub async fn compact(
        &self,
        run_id: RunId,
        up_to_seq: u64,
        summary: crate::events::CheckpointSummary,
        head_signature: Option<(String, String)>,
    ) -> Result<Event> {
        let Some((_, tip_id)) = self.tip(run_id).await? else {
            return Err(CoreErr::SchemaViolation(format!(
                "run {run_id} has no genesis event"
            )));
        };
        let (signature, key_id) = match head_signature {
            Some((signature, key_id)) => (Some(signature), Some(key_id)),
            None => (None, None),
        };
        self.append(
            run_id,
            Some(tip_id),
            EventPayload::RunCheckpoint {
                summary,
                covered_through_seq: up_to_seq,
                head_signature: signature,
                signing_key_id: key_id,
            },
        )
        .await
    }

    pub async fn record_chat(
        &self,
        run_id: RunId,
        role: &str,
        markdown: &str,
        citations: Vec<u32>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(WriterCmd::RecordChat {
            run_id,
            role: role.to_string(),
            markdown: markdown.to_string(),
            citations,
            reply,
        })?;
        Self::reply(rx).await
    }

    pub async fn record_artifact(&self, run_id: RunId, artifact_id: Uuid, kind: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(WriterCmd::RecordArtifact {
            run_id,
            artifact_id,
            kind: kind.to_string(),
            reply,
        })?;
        Self::reply(rx).await
    }

    pub async fn prune_covered(&self, run_id: RunId, up_to_seq: u64) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(WriterCmd::PruneCovered {
            run_id,
            up_to_seq,
            reply,
        })?;
        Self::reply(rx).await
    }

    async fn with_reader<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let reader = Arc::clone(&self.reader);
        tokio::task::spawn_blocking(move || {
            let conn = reader
                .lock()
                .map_err(|_| CoreErr::Durability("reader mutex poisoned".to_string()))?;
            f(&conn)
        })
        .await?
    }

    /// Stream events in seq order, starting at `from_seq`.
    pub async fn read(&self, run_id: RunId, from_seq: u64, limit: usize) -> Result<Vec<Event>> {
        self.with_reader(move |conn| read_events(conn, run_id, from_seq, limit))
            .await
    }

    pub async fn read_all(&self, run_id: RunId) -> Result<Vec<Event>> {
        self.with_reader(move |conn| read_events(conn, run_id, 0, usize::MAX))
            .await
    }

    /// The current tip `(seq, event_id)`.
    pub async fn tip(&self, run_id: RunId) -> Result<Option<(u64, Uuid)>> {
        self.with_reader(move |conn| {
            conn.query_row(
                "SELECT seq, id FROM events WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![run_id.to_string()],
                |row| {
                    let seq: i64 = row.get(0)?;
                    let id: String = row.get(1)?;
                    Ok((seq as u64, id))
                },
            )
            .optional()
            .map_err(CoreErr::from)?
            .map(|(seq, id)| {
                let id = Uuid::parse_str(&id)
                    .map_err(|e| CoreErr::Durability(format!("bad event id in db: {e}")))?;
                Ok((seq, id))
            })
            .transpose()
        })
        .await
    }

    /// Walk the whole chain, recomputing digests and hashes.
    pub async fn verify(&self, run_id: RunId) -> Result<ChainVerification> {
        let events = self.read_all(run_id).await?;
        let mut prev = GENESIS_PREV_HASH;
        let mut expected_seq = 0u64;
        for event in &events {
            if event.seq != expected_seq {
                return Ok(ChainVerification::BreakAt(event.seq));
            }
            expected_seq += 1;

            let prev_hash = event.prev_hash_bytes()?;
            if prev_hash.ct_eq(&prev).unwrap_u8() == 0 {
                return Ok(ChainVerification::BreakAt(event.seq));
            }
            let digest = event.payload_digest_bytes()?;
            if let Some(payload) = &event.payload {
                let bytes = canonical::canonical_json_bytes(payload)?;
                let recomputed = canonical::payload_digest(&bytes);
                if recomputed.ct_eq(&digest).unwrap_u8() == 0 {
                    return Ok(ChainVerification::BreakAt(event.seq));
                }
            }
            let hash = canonical::chain_hash(&prev, &digest);
            if hash.ct_eq(&event.hash_bytes()?).unwrap_u8() == 0 {
                return Ok(ChainVerification::BreakAt(event.seq));
            }
            prev = hash;
        }
        Ok(ChainVerification::Ok)
    }

    pub async fn load_run(&self, run_id: RunId) -> Result<Option<RunMeta>> {
        self.with_reader(move |conn| {
            conn.query_row(
                "SELECT id, created_at, status, surface, origin, mode, profile_id, head_event_id
                 FROM runs WHERE id = ?1",
                params![run_id.to_string()],
                row_to_run_meta,
            )
            .optional()
            .map_err(CoreErr::from)
        })
        .await
    }

    /// Runs that were alive when the process last stopped.
    pub async fn list_resumable(&self) -> Result<Vec<RunMeta>> {
        self.with_reader(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, created_at, status, surface, origin, mode, profile_id, head_event_id
                 FROM runs WHERE status NOT IN ('completed', 'cancelled', 'failed')
                 ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], row_to_run_meta)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }
}

/// Append cursor owned by a single orchestrator task: tracks the head so
/// sequential appends satisfy the parent-is-tip rule without re-reading.
pub struct RunLog {
    store: EventStore,
    run_id: RunId,
    head: Option<Uuid>,
}

impl RunLog {
    pub fn new(store: EventStore, run_id: RunId, head: Option<Uuid>) -> Self {
        Self { store, run_id, head }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn head(&self) -> Option<Uuid> {
        self.head
    }

    pub async fn append(&mut self, payload: EventPayload) -> Result<Event> {
        let event = self.store.append(self.run_id, self.head, payload).await?;
        self.head = Some(event.event_id);
        Ok(event)
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_millis(5_000))?;
    Ok(conn)
}

fn migrate(conn: &Connection, clock: &Clock) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    let current: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match current {
        None => {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )?;
            conn.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)",
                params![
                    format!("migration_{SCHEMA_VERSION}"),
                    clock.now().to_rfc3339()
                ],
            )?;
        }
        Some(v) if v == SCHEMA_VERSION.to_string() => {}
        Some(v) => {
            return Err(CoreErr::Durability(format!(
                "database schema version {v} is newer than this build ({SCHEMA_VERSION})"
            )));
        }
    }
    Ok(())
}

fn writer_loop(mut conn: Connection, clock: Clock, rx: mpsc::Receiver<WriterCmd>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            WriterCmd::CreateRun { meta, genesis, reply } => {
                let result = create_run_tx(&mut conn, &clock, &meta, &genesis);
                let _ = reply.send(result);
            }
            WriterCmd::Append {
                run_id,
                parent_event_id,
                payload,
                reply,
            } => {
                let result = append_tx(&mut conn, &clock, run_id, parent_event_id, payload);
                let _ = reply.send(result);
            }
            WriterCmd::RecordChat {
                run_id,
                role,
                markdown,
                citations,
                reply,
            } => {
                let result = record_chat_tx(&conn, &clock, run_id, &role, &markdown, &citations);
                let _ = reply.send(result);
            }
            WriterCmd::RecordArtifact {
                run_id,
                artifact_id,
                kind,
                reply,
            } => {
                let result = conn
                    .execute(
                        "INSERT INTO artifacts (id, run_id, kind, created_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![
                            artifact_id.to_string(),
                            run_id.to_string(),
                            kind,
                            clock.now().to_rfc3339(),
                        ],
                    )
                    .map(|_| ())
                    .map_err(CoreErr::from);
                let _ = reply.send(result);
            }
            WriterCmd::PruneCovered {
                run_id,
                up_to_seq,
                reply,
            } => {
                let result = prune_tx(&conn, run_id, up_to_seq);
                let _ = reply.send(result);
            }
        }
    }
    tracing::debug!("event store writer exited");
}

fn insert_event(
    tx: &rusqlite::Transaction<'_>,
    clock: &Clock,
    run_id: RunId,
    seq: u64,
    parent_event_id: Option<Uuid>,
    prev_hash: canonical::Hash,
    payload: EventPayload,
) -> Result<Event> {
    payload.validate()?;
    let (digest, hash) = Event::seal(&payload, &prev_hash)?;
    let event = Event {
        run_id,
        seq,
        event_id: Uuid::new_v4(),
        parent_event_id,
        kind: payload.kind(),
        schema_version: EVENT_SCHEMA_VERSION,
        created_at: clock.now(),
        payload: Some(payload),
        payload_digest: canonical::to_hex(&digest),
        prev_hash: canonical::to_hex(&prev_hash),
        hash: canonical::to_hex(&hash),
    };

    let payload_json = match &event.payload {
        Some(payload) => Some(serde_json::to_string(payload)?),
        None => None,
    };
    tx.execute(
        "INSERT INTO events
         (id, run_id, seq, parent_id, kind, schema_version, created_at,
          payload_blob, payload_digest, prev_hash, hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            event.event_id.to_string(),
            event.run_id.to_string(),
            event.seq as i64,
            event.parent_event_id.map(|id| id.to_string()),
            event.kind.to_string(),
            event.schema_version as i64,
            event.created_at.to_rfc3339(),
            payload_json,
            event.payload_digest,
            event.prev_hash,
            event.hash,
        ],
    )?;
    tx.execute(
        "UPDATE runs SET head_event_id = ?1 WHERE id = ?2",
        params![event.event_id.to_string(), event.run_id.to_string()],
    )?;
    Ok(event)
}

fn create_run_tx(
    conn: &mut Connection,
    clock: &Clock,
    meta: &RunMeta,
    genesis: &EventPayload,
) -> Result<Event> {
    if genesis.kind() != EventKind::UserMessage {
        return Err(CoreErr::SchemaViolation(
            "a run's genesis event must be a user.message".to_string(),
        ));
    }
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO runs (id, created_at, status, surface, origin, mode, profile_id, head_event_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)",
        params![
            meta.run_id.to_string(),
            meta.created_at.to_rfc3339(),
            meta.status.to_string(),
            meta.surface.to_string(),
            meta.origin,
            meta.mode.to_string(),
            meta.profile_id,
        ],
    )?;
    let event = insert_event(
        &tx,
        clock,
        meta.run_id,
        0,
        None,
        GENESIS_PREV_HASH,
        genesis.clone(),
    )?;
    tx.commit()?;
    Ok(event)
}

fn append_tx(
    conn: &mut Connection,
    clock: &Clock,
    run_id: RunId,
    parent_event_id: Option<Uuid>,
    payload: EventPayload,
) -> Result<Event> {
    let tx = conn.transaction()?;

    let tip: Option<(i64, String, String)> = tx
        .query_row(
            "SELECT seq, id, hash FROM events WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1",
            params![run_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((tip_seq, tip_id, tip_hash)) = tip else {
        return Err(CoreErr::SchemaViolation(format!(
            "run {run_id} has no genesis event"
        )));
    };
    if parent_event_id.map(|id| id.to_string()) != Some(tip_id) {
        return Err(CoreErr::ChainConflict);
    }

    let seq = (tip_seq as u64) + 1;
    let prev_hash = canonical::from_hex(&tip_hash)?;

    // Kind-specific side work inside the same transaction.
    match &payload {
        EventPayload::RunRollback { target_seq } | EventPayload::RunBranch { from_seq: target_seq, .. } => {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT seq FROM events WHERE run_id = ?1 AND seq = ?2",
                    params![run_id.to_string(), *target_seq as i64],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() || *target_seq >= seq {
                return Err(CoreErr::SchemaViolation(format!(
                    "target seq {target_seq} does not name a prior event"
                )));
            }
        }
        EventPayload::EventRedaction { target_seq, .. } => {
            let changed = tx.execute(
                "UPDATE events SET payload_blob = NULL WHERE run_id = ?1 AND seq = ?2",
                params![run_id.to_string(), *target_seq as i64],
            )?;
            if changed == 0 || *target_seq >= seq {
                return Err(CoreErr::SchemaViolation(format!(
                    "redaction target seq {target_seq} does not name a prior event"
                )));
            }
        }
        EventPayload::RunState { to, .. } => {
            tx.execute(
                "UPDATE runs SET status = ?1 WHERE id = ?2",
                params![to.to_string(), run_id.to_string()],
            )?;
        }
        _ => {}
    }

    let event = insert_event(&tx, clock, run_id, seq, parent_event_id, prev_hash, payload)?;
    tx.commit()?;
    Ok(event)
}

fn record_chat_tx(
    conn: &Connection,
    clock: &Clock,
    run_id: RunId,
    role: &str,
    markdown: &str,
    citations: &[u32],
) -> Result<()> {
    conn.execute(
        "INSERT INTO chat_events (id, run_id, role, markdown, citations, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            Uuid::new_v4().to_string(),
            run_id.to_string(),
            role,
            markdown,
            serde_json::to_string(citations)?,
            clock.now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn prune_tx(conn: &Connection, run_id: RunId, up_to_seq: u64) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE events SET payload_blob = NULL
         WHERE run_id = ?1 AND seq <= ?2 AND kind = 'page.observe' AND payload_blob IS NOT NULL",
        params![run_id.to_string(), up_to_seq as i64],
    )?;
    Ok(changed)
}

fn read_events(conn: &Connection, run_id: RunId, from_seq: u64, limit: usize) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT id, run_id, seq, parent_id, kind, schema_version, created_at,
                payload_blob, payload_digest, prev_hash, hash
         FROM events WHERE run_id = ?1 AND seq >= ?2 ORDER BY seq LIMIT ?3",
    )?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map(
        params![run_id.to_string(), from_seq as i64, limit],
        row_to_event,
    )?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let id: String = row.get(0)?;
    let run_id: String = row.get(1)?;
    let seq: i64 = row.get(2)?;
    let parent_id: Option<String> = row.get(3)?;
    let kind: String = row.get(4)?;
    let schema_version: i64 = row.get(5)?;
    let created_at: String = row.get(6)?;
    let payload_blob: Option<String> = row.get(7)?;

    let parse = |msg: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, msg.into())
    };

    let payload = match payload_blob {
        Some(json) => Some(
            serde_json::from_str::<EventPayload>(&json)
                .map_err(|e| parse(format!("payload: {e}")))?,
        ),
        None => None,
    };
    Ok(Event {
        event_id: Uuid::parse_str(&id).map_err(|e| parse(format!("id: {e}")))?,
        run_id: Uuid::parse_str(&run_id).map_err(|e| parse(format!("run id: {e}")))?,
        seq: seq as u64,
        parent_event_id: parent_id
            .map(|p| Uuid::parse_str(&p).map_err(|e| parse(format!("parent: {e}"))))
            .transpose()?,
        kind: kind
            .parse::<EventKind>()
            .map_err(|e| parse(format!("kind: {e}")))?,
        schema_version: schema_version as u32,
        created_at: created_at
            .parse::<DateTime<Utc>>()
            .map_err(|e| parse(format!("created_at: {e}")))?,
        payload,
        payload_digest: row.get(8)?,
        prev_hash: row.get(9)?,
        hash: row.get(10)?,
    })
}

fn row_to_run_meta(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunMeta> {
    let parse = |msg: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, msg.into())
    };
    let id: String = row.get(0)?;
    let created_at: String = row.get(1)?;
    let status: String = row.get(2)?;
    let surface: String = row.get(3)?;
    let origin: String = row.get(4)?;
    let mode: String = row.get(5)?;
    let profile_id: String = row.get(6)?;
    let head: Option<String> = row.get(7)?;
    Ok(RunMeta {
        run_id: Uuid::parse_str(&id).map_err(|e| parse(format!("run id: {e}")))?,
        created_at: created_at
            .parse::<DateTime<Utc>>()
            .map_err(|e| parse(format!("created_at: {e}")))?,
        status: serde_json::from_value(serde_json::Value::String(status))
            .map_err(|e| parse(format!("status: {e}")))?,
        surface: serde_json::from_value(serde_json::Value::String(surface))
            .map_err(|e| parse(format!("surface: {e}")))?,
        origin,
        mode: serde_json::from_value(serde_json::Value::String(mode))
            .map_err(|e| parse(format!("mode: {e}")))?,
        profile_id,
        head_event_id: head
            .map(|h| Uuid::parse_str(&h).map_err(|e| parse(format!("head: {e}"))))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use webpilot_protocol::Mode;
    use webpilot_protocol::Surface;

    fn store() -> (EventStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = EventStore::open(dir.path(), Clock::system()).unwrap();
        (store, dir)
    }

    fn meta(run_id: RunId) -> RunMeta {
        RunMeta {
            run_id,
            created_at: Utc::now(),
            status: RunStatus::Idle,
            surface: Surface::Isolated,
            origin: "https://example.com".to_string(),
            mode: Mode::Assist,
            profile_id: "default".to_string(),
            head_event_id: None,
        }
    }

    fn genesis() -> EventPayload {
        EventPayload::UserMessage {
            text: "summarize this page".to_string(),
            origin: "https://example.com".to_string(),
            surface: Surface::Isolated,
            mode: Mode::Assist,
            profile_id: "default".to_string(),
        }
    }

    fn state_change(from: RunStatus, to: RunStatus) -> EventPayload {
        EventPayload::RunState {
            from,
            to,
            reason_code: None,
        }
    }

    #[tokio::test]
    async fn append_chains_and_verifies() {
        let (store, _dir) = store();
        let run_id = Uuid::new_v4();
        let g = store.create_run(meta(run_id), genesis()).await.unwrap();
        assert_eq!(g.seq, 0);
        assert_eq!(g.prev_hash, canonical::to_hex(&GENESIS_PREV_HASH));

        let mut log = RunLog::new(store.clone(), run_id, Some(g.event_id));
        let e1 = log
            .append(state_change(RunStatus::Idle, RunStatus::Observing))
            .await
            .unwrap();
        assert_eq!(e1.seq, 1);
        assert_eq!(e1.prev_hash, g.hash);

        assert_eq!(store.verify(run_id).await.unwrap(), ChainVerification::Ok);
        let (tip_seq, tip_id) = store.tip(run_id).await.unwrap().unwrap();
        assert_eq!((tip_seq, tip_id), (1, e1.event_id));
    }

    #[tokio::test]
    async fn stale_parent_is_a_chain_conflict() {
        let (store, _dir) = store();
        let run_id = Uuid::new_v4();
        let g = store.create_run(meta(run_id), genesis()).await.unwrap();
        let mut log = RunLog::new(store.clone(), run_id, Some(g.event_id));
        log.append(state_change(RunStatus::Idle, RunStatus::Observing))
            .await
            .unwrap();

        // A second writer still holding the genesis head must be refused.
        let err = store
            .append(
                run_id,
                Some(g.event_id),
                state_change(RunStatus::Idle, RunStatus::Observing),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreErr::ChainConflict));
    }

    #[tokio::test]
    async fn tampering_is_detected_by_verify() {
        let (store, dir) = store();
        let run_id = Uuid::new_v4();
        let g = store.create_run(meta(run_id), genesis()).await.unwrap();
        let mut log = RunLog::new(store.clone(), run_id, Some(g.event_id));
        log.append(state_change(RunStatus::Idle, RunStatus::Observing))
            .await
            .unwrap();

        // Flip one byte of a stored payload out of band.
        let conn = Connection::open(dir.path().join(DB_FILE)).unwrap();
        conn.execute(
            "UPDATE events SET payload_blob = replace(payload_blob, 'observing', 'executing')
             WHERE run_id = ?1 AND seq = 1",
            params![run_id.to_string()],
        )
        .unwrap();
        drop(conn);

        assert_eq!(
            store.verify(run_id).await.unwrap(),
            ChainVerification::BreakAt(1)
        );
    }

    #[tokio::test]
    async fn pruned_observations_keep_the_chain_verifiable() {
        let (store, _dir) = store();
        let run_id = Uuid::new_v4();
        let g = store.create_run(meta(run_id), genesis()).await.unwrap();
        let mut log = RunLog::new(store.clone(), run_id, Some(g.event_id));

        let obs = crate::redact::sanitize_observation(webpilot_protocol::Observation {
            url: "https://example.com/a".to_string(),
            title: "Example".to_string(),
            origin: "https://example.com".to_string(),
            document: webpilot_protocol::DocumentIdentity {
                document_id: "D1".to_string(),
                navigation_generation: 1,
            },
            observed_at: Utc::now(),
            visible_text: vec![webpilot_protocol::TextSegment {
                segment_index: 0,
                text: "article".to_string(),
            }],
            interactive: Vec::new(),
            access_signals: Vec::new(),
            redactions: Vec::new(),
        });
        log.append(EventPayload::PageObserve {
            observation: obs,
            scope_handle: None,
        })
        .await
        .unwrap();

        let pruned = store.prune_covered(run_id, 1).await.unwrap();
        assert_eq!(pruned, 1);

        let events = store.read_all(run_id).await.unwrap();
        assert!(events[1].payload.is_none());
        assert_eq!(store.verify(run_id).await.unwrap(), ChainVerification::Ok);
    }

    #[tokio::test]
    async fn rollback_and_branch_keep_the_log_linear() {
        let (store, _dir) = store();
        let run_id = Uuid::new_v4();
        let g = store.create_run(meta(run_id), genesis()).await.unwrap();
        let mut log = RunLog::new(store.clone(), run_id, Some(g.event_id));
        log.append(state_change(RunStatus::Idle, RunStatus::Observing))
            .await
            .unwrap();

        let rollback = store.rollback(run_id, 0).await.unwrap();
        assert_eq!(rollback.seq, 2);
        // Rolled-back events are skipped by the fold, not deleted.
        let events = store.read_all(run_id).await.unwrap();
        assert_eq!(events.len(), 3);
        let snapshot = crate::run_state::fold(run_id, &events).unwrap();
        assert_eq!(snapshot.status, RunStatus::Idle);

        let (branch_id, event) = store.branch(run_id, 0).await.unwrap();
        assert!(matches!(
            event.payload,
            Some(EventPayload::RunBranch { branch_id: b, .. }) if b == branch_id
        ));
        assert_eq!(store.verify(run_id).await.unwrap(), ChainVerification::Ok);

        // A rollback to a seq that never existed is refused.
        assert!(store.rollback(run_id, 99).await.is_err());
    }

    #[tokio::test]
    async fn redaction_tombstones_the_target_payload() {
        let (store, _dir) = store();
        let run_id = Uuid::new_v4();
        let g = store.create_run(meta(run_id), genesis()).await.unwrap();
        let mut log = RunLog::new(store.clone(), run_id, Some(g.event_id));
        log.append(state_change(RunStatus::Idle, RunStatus::Observing))
            .await
            .unwrap();

        log.append(EventPayload::EventRedaction {
            target_seq: 1,
            reason: "user requested removal".to_string(),
        })
        .await
        .unwrap();

        let events = store.read_all(run_id).await.unwrap();
        // The body is gone; id, digest, and chain position survive.
        assert!(events[1].payload.is_none());
        assert!(!events[1].payload_digest.is_empty());
        assert_eq!(store.verify(run_id).await.unwrap(), ChainVerification::Ok);
    }

    #[tokio::test]
    async fn artifact_metadata_round_trips_by_id_only() {
        let (store, _dir) = store();
        let run_id = Uuid::new_v4();
        store.create_run(meta(run_id), genesis()).await.unwrap();
        store
            .record_artifact(run_id, Uuid::new_v4(), "export.markdown")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn compact_writes_a_checkpoint_event() {
        let (store, _dir) = store();
        let run_id = Uuid::new_v4();
        store.create_run(meta(run_id), genesis()).await.unwrap();

        let summary = crate::events::CheckpointSummary {
            goal: "summarize this page".to_string(),
            key_facts: Vec::new(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            next_intent: "answer".to_string(),
        };
        let checkpoint = store
            .compact(run_id, 0, summary, Some(("ab12".to_string(), "k1".to_string())))
            .await
            .unwrap();
        assert!(matches!(
            checkpoint.payload,
            Some(EventPayload::RunCheckpoint {
                covered_through_seq: 0,
                ..
            })
        ));
        assert_eq!(store.verify(run_id).await.unwrap(), ChainVerification::Ok);
    }

    #[tokio::test]
    async fn run_status_row_tracks_state_events() {
        let (store, _dir) = store();
        let run_id = Uuid::new_v4();
        let g = store.create_run(meta(run_id), genesis()).await.unwrap();
        let mut log = RunLog::new(store.clone(), run_id, Some(g.event_id));
        log.append(state_change(RunStatus::Idle, RunStatus::Observing))
            .await
            .unwrap();
        log.append(state_change(RunStatus::Observing, RunStatus::Paused))
            .await
            .unwrap();

        let loaded = store.load_run(run_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Paused);
        let resumable = store.list_resumable().await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].run_id, run_id);
    }
}
