//! Pluggable persistence for update sequence state.
//!
//! Every scope the client receives updates for (the account-wide sequence,
//! scope `0`, and one per channel, keyed by the channel's marked id) keeps its
//! last applied `pts`, `qts` and `date` in a [`StateStorage`]. The pipeline
//! writes on every update batch and reads everything back on start, when gaps
//! are recovered.
//!
//! Three built-in backends are provided:
//! * [`InMemoryStorage`]: nothing survives a restart (default).
//! * [`BinaryFileStorage`]: a compact binary file, rewritten on every change.
//! * [`SqliteStorage`]: SQLite (requires the `sqlite-session` Cargo feature).

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::raw::PeerId;

/// Scope of the account-wide (non-channel) update sequence.
pub const GLOBAL_SCOPE: PeerId = 0;

// ─── StateRecord ──────────────────────────────────────────────────────────────

/// Persisted sequence state of one scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StateRecord {
    /// `0` for the account-wide sequence, otherwise a channel's marked id.
    pub scope: PeerId,
    pub pts:   i32,
    pub qts:   Option<i32>,
    pub date:  Option<i32>,
}

impl StateRecord {
    pub fn new(scope: PeerId, pts: i32, date: Option<i32>) -> Self {
        Self { scope, pts, qts: None, date }
    }

    pub fn is_channel(&self) -> bool {
        self.scope < 0
    }
}

// ─── Trait ────────────────────────────────────────────────────────────────────

/// An abstraction over where and how update state is persisted.
pub trait StateStorage: Send + Sync {
    /// Insert or replace the record for `record.scope`.
    fn set_state(&self, record: StateRecord) -> io::Result<()>;

    /// The record of one scope, if any.
    fn state(&self, scope: PeerId) -> io::Result<Option<StateRecord>>;

    /// Every known scope.
    fn states(&self) -> io::Result<Vec<StateRecord>>;

    /// Forget a scope (e.g. after leaving a channel).
    fn remove_state(&self, scope: PeerId) -> io::Result<()>;

    /// Human-readable name of this backend (for log messages).
    fn name(&self) -> &str;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── InMemoryStorage ──────────────────────────────────────────────────────────

/// An ephemeral backend that stores nothing on disk.
///
/// Useful for testing or for bots that should always start fresh.
#[derive(Default)]
pub struct InMemoryStorage {
    records: Mutex<BTreeMap<PeerId, StateRecord>>,
}

impl InMemoryStorage {
    pub fn new() -> Self { Self::default() }
}

impl StateStorage for InMemoryStorage {
    fn set_state(&self, record: StateRecord) -> io::Result<()> {
        lock(&self.records).insert(record.scope, record);
        Ok(())
    }

    fn state(&self, scope: PeerId) -> io::Result<Option<StateRecord>> {
        Ok(lock(&self.records).get(&scope).copied())
    }

    fn states(&self) -> io::Result<Vec<StateRecord>> {
        Ok(lock(&self.records).values().copied().collect())
    }

    fn remove_state(&self, scope: PeerId) -> io::Result<()> {
        lock(&self.records).remove(&scope);
        Ok(())
    }

    fn name(&self) -> &str { "in-memory" }
}

// ─── BinaryFileStorage ────────────────────────────────────────────────────────

/// Stores every record in one little-endian binary file.
///
/// Layout: `u32` record count, then per record `i64 scope`, `i32 pts`,
/// `u8 has_qts` + `i32 qts`, `u8 has_date` + `i32 date` (the value is only
/// present when its flag is `1`). The whole file is rewritten on each change,
/// which is fine for the few dozen scopes a typical account has.
pub struct BinaryFileStorage {
    path:    PathBuf,
    records: Mutex<BTreeMap<PeerId, StateRecord>>,
}

impl BinaryFileStorage {
    /// Open `path`, loading existing records if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            decode(&std::fs::read(&path)?)?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, records: Mutex::new(records) })
    }

    fn flush(&self, records: &BTreeMap<PeerId, StateRecord>) -> io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, encode(records))?;
        std::fs::rename(&tmp, &self.path)
    }
}

impl StateStorage for BinaryFileStorage {
    fn set_state(&self, record: StateRecord) -> io::Result<()> {
        let mut records = lock(&self.records);
        records.insert(record.scope, record);
        self.flush(&records)
    }

    fn state(&self, scope: PeerId) -> io::Result<Option<StateRecord>> {
        Ok(lock(&self.records).get(&scope).copied())
    }

    fn states(&self) -> io::Result<Vec<StateRecord>> {
        Ok(lock(&self.records).values().copied().collect())
    }

    fn remove_state(&self, scope: PeerId) -> io::Result<()> {
        let mut records = lock(&self.records);
        if records.remove(&scope).is_some() {
            self.flush(&records)?;
        }
        Ok(())
    }

    fn name(&self) -> &str { "binary-file" }
}

fn encode(records: &BTreeMap<PeerId, StateRecord>) -> Vec<u8> {
    let mut b = Vec::with_capacity(4 + records.len() * 22);
    b.extend_from_slice(&(records.len() as u32).to_le_bytes());
    for r in records.values() {
        b.extend_from_slice(&r.scope.to_le_bytes());
        b.extend_from_slice(&r.pts.to_le_bytes());
        for opt in [r.qts, r.date] {
            match opt {
                Some(v) => { b.push(1); b.extend_from_slice(&v.to_le_bytes()); }
                None    => { b.push(0); }
            }
        }
    }
    b
}

fn decode(buf: &[u8]) -> io::Result<BTreeMap<PeerId, StateRecord>> {
    let mut p = 0usize;
    macro_rules! r {
        ($n:literal) => {{
            if p + $n > buf.len() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated update state"));
            }
            let mut a = [0u8; $n];
            a.copy_from_slice(&buf[p..p + $n]);
            p += $n;
            a
        }};
    }
    macro_rules! opt_i32 {
        () => {{
            match r!(1)[0] {
                0 => None,
                1 => Some(i32::from_le_bytes(r!(4))),
                f => return Err(io::Error::new(io::ErrorKind::InvalidData, format!("bad flag {f}"))),
            }
        }};
    }

    let count = u32::from_le_bytes(r!(4)) as usize;
    let mut records = BTreeMap::new();
    for _ in 0..count {
        let scope = i64::from_le_bytes(r!(8));
        let pts   = i32::from_le_bytes(r!(4));
        let qts   = opt_i32!();
        let date  = opt_i32!();
        records.insert(scope, StateRecord { scope, pts, qts, date });
    }
    Ok(records)
}

// ─── SqliteStorage ────────────────────────────────────────────────────────────

#[cfg(feature = "sqlite-session")]
pub use sqlite_backend::SqliteStorage;

#[cfg(feature = "sqlite-session")]
mod sqlite_backend {
    use super::*;
    use rusqlite::{Connection, OptionalExtension, params};

    fn to_io(e: rusqlite::Error) -> io::Error {
        io::Error::other(e)
    }

    /// SQLite-backed update state.
    ///
    /// Creates the `update_state` table if it does not exist.
    ///
    /// Enable with the `sqlite-session` Cargo feature:
    /// ```toml
    /// [dependencies]
    /// layer-updates = { version = "*", features = ["sqlite-session"] }
    /// ```
    pub struct SqliteStorage {
        conn: Mutex<Connection>,
    }

    impl SqliteStorage {
        pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
            Self::init(Connection::open(path.into()).map_err(to_io)?)
        }

        /// A database that lives only as long as this value.
        pub fn in_memory() -> io::Result<Self> {
            Self::init(Connection::open_in_memory().map_err(to_io)?)
        }

        fn init(conn: Connection) -> io::Result<Self> {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS update_state (
                    id   INTEGER PRIMARY KEY,
                    pts  INTEGER NOT NULL,
                    qts  INTEGER,
                    date INTEGER
                );",
            ).map_err(to_io)?;
            Ok(Self { conn: Mutex::new(conn) })
        }
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateRecord> {
        Ok(StateRecord {
            scope: row.get(0)?,
            pts:   row.get(1)?,
            qts:   row.get(2)?,
            date:  row.get(3)?,
        })
    }

    impl StateStorage for SqliteStorage {
        fn set_state(&self, record: StateRecord) -> io::Result<()> {
            lock(&self.conn).execute(
                "REPLACE INTO update_state (id, pts, qts, date) VALUES (?1, ?2, ?3, ?4)",
                params![record.scope, record.pts, record.qts, record.date],
            ).map_err(to_io)?;
            Ok(())
        }

        fn state(&self, scope: PeerId) -> io::Result<Option<StateRecord>> {
            lock(&self.conn)
                .query_row(
                    "SELECT id, pts, qts, date FROM update_state WHERE id = ?1",
                    params![scope],
                    row_to_record,
                )
                .optional()
                .map_err(to_io)
        }

        fn states(&self) -> io::Result<Vec<StateRecord>> {
            let conn = lock(&self.conn);
            let mut stmt = conn
                .prepare("SELECT id, pts, qts, date FROM update_state ORDER BY id")
                .map_err(to_io)?;
            let records = stmt
                .query_map([], row_to_record)
                .map_err(to_io)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(to_io)?;
            Ok(records)
        }

        fn remove_state(&self, scope: PeerId) -> io::Result<()> {
            lock(&self.conn)
                .execute("DELETE FROM update_state WHERE id = ?1", params![scope])
                .map_err(to_io)?;
            Ok(())
        }

        fn name(&self) -> &str { "sqlite" }
    }
}
