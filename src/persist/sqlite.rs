//! SQLite-backed append-only operation journal.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    engine::replay::Snapshot,
    op::{OP_FORMAT_VERSION, Operation, StoredOpEnvelope, now_ms},
    types::OpIndex,
};

use super::{OpJournal, PersistError, PersistResult};

const SNAPSHOT_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEnvelope<S> {
    format_version: u16,
    snapshot: Snapshot<S>,
}

/// SQLite implementation of [`crate::persist::OpJournal`].
pub struct SqliteJournal {
    conn: Connection,
}

impl SqliteJournal {
    /// Opens or creates a journal at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory journal.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Latest snapshot (or an empty one) plus every op above its watermark.
    pub fn load<S: DeserializeOwned + Default>(&self) -> PersistResult<(Snapshot<S>, Vec<Operation>)> {
        let snapshot = self.load_latest_snapshot()?.unwrap_or_default();
        let ops = self.load_ops_after(snapshot.watermark)?;
        Ok((snapshot, ops))
    }

    /// Stores confirmed ops in one transaction; known indices are skipped.
    pub fn append_ops(&mut self, ops: &[Operation]) -> PersistResult<Option<OpIndex>> {
        if ops.is_empty() {
            return self.latest_index();
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO ops(op_index, op_id, request_id, kind, ts_ms, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for op in ops {
                let Some(op_index) = op.op_index else {
                    return Err(PersistError::Message(format!(
                        "operation {} has no op index",
                        op.id
                    )));
                };
                let row_index = sql_index(op_index)?;
                let payload = serde_json::to_vec(&StoredOpEnvelope::new(op.clone()))?;
                stmt.execute(params![
                    row_index,
                    op.id.to_string(),
                    op.request_id.0,
                    op.kind.name(),
                    i64::try_from(op.client_ts).unwrap_or(i64::MAX),
                    payload,
                ])?;
            }
        }
        tx.commit()?;

        Ok(ops.iter().filter_map(|o| o.op_index).max())
    }

    /// Loads ops strictly after `watermark`.
    pub fn load_ops_after(&self, watermark: Option<OpIndex>) -> PersistResult<Vec<Operation>> {
        let lower: i64 = match watermark {
            Some(w) => sql_index(w)?,
            None => -1,
        };
        let mut stmt = self
            .conn
            .prepare("SELECT op_index, payload FROM ops WHERE op_index > ?1 ORDER BY op_index ASC")?;

        let rows = stmt.query_map(params![lower], |row| {
            let op_index: i64 = row.get(0)?;
            let payload: Vec<u8> = row.get(1)?;
            let mut op = decode_op_payload(&payload).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    payload.len(),
                    rusqlite::types::Type::Blob,
                    Box::new(std::io::Error::other(err)),
                )
            })?;
            let op_index = OpIndex::try_from(op_index)
                .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(0, op_index))?;
            op.op_index = Some(op_index);
            Ok(op)
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Writes a snapshot; the newest row wins on load.
    pub fn write_snapshot<S: Serialize + Clone>(&mut self, snapshot: &Snapshot<S>) -> PersistResult<()> {
        let env = SnapshotEnvelope {
            format_version: SNAPSHOT_FORMAT_VERSION,
            snapshot: snapshot.clone(),
        };
        let payload = serde_json::to_vec(&env)?;
        self.conn.execute(
            "INSERT INTO snapshots(watermark, ts_ms, payload) VALUES (?1, ?2, ?3)",
            params![
                snapshot.watermark.map(sql_index).transpose()?,
                i64::try_from(now_ms()).unwrap_or(i64::MAX),
                payload
            ],
        )?;
        Ok(())
    }

    /// Highest op index in the journal.
    pub fn latest_index(&self) -> PersistResult<Option<OpIndex>> {
        let index: Option<i64> = self
            .conn
            .query_row("SELECT MAX(op_index) FROM ops", [], |row| row.get(0))
            .optional()?
            .flatten();
        index
            .map(|i| {
                OpIndex::try_from(i)
                    .map_err(|_| PersistError::Message(format!("negative op index {i} in journal")))
            })
            .transpose()
    }

    fn load_latest_snapshot<S: DeserializeOwned>(&self) -> PersistResult<Option<Snapshot<S>>> {
        let payload: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT payload FROM snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let env: SnapshotEnvelope<S> = serde_json::from_slice(&payload)?;
        if env.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(PersistError::Message(
                "unsupported snapshot format".to_string(),
            ));
        }
        Ok(Some(env.snapshot))
    }
}

impl<S> OpJournal<S> for SqliteJournal
where
    S: Serialize + DeserializeOwned + Clone + Send,
{
    fn append_ops(&mut self, ops: &[Operation]) -> PersistResult<Option<OpIndex>> {
        SqliteJournal::append_ops(self, ops)
    }

    fn load_snapshot(&mut self) -> PersistResult<Option<Snapshot<S>>> {
        self.load_latest_snapshot()
    }

    fn load_ops_after(&mut self, watermark: Option<OpIndex>) -> PersistResult<Vec<Operation>> {
        SqliteJournal::load_ops_after(self, watermark)
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    fn write_snapshot(&mut self, snapshot: &Snapshot<S>) -> PersistResult<()> {
        SqliteJournal::write_snapshot(self, snapshot)
    }
}

/// SQLite integers are signed; indices past `i64::MAX` are refused, not wrapped.
fn sql_index(index: OpIndex) -> PersistResult<i64> {
    i64::try_from(index)
        .map_err(|_| PersistError::Message(format!("op index {index} exceeds the journal range")))
}

fn decode_op_payload(payload: &[u8]) -> Result<Operation, String> {
    let envelope = serde_json::from_slice::<StoredOpEnvelope>(payload)
        .map_err(|e| format!("op payload decode failed: {e}"))?;
    if envelope.format_version != OP_FORMAT_VERSION {
        return Err(format!(
            "unsupported op format version: {}",
            envelope.format_version
        ));
    }
    Ok(envelope.op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        op::{OpKind, Origin},
        types::{ActorId, OpId, RequestId},
    };

    fn op(index: OpIndex) -> Operation {
        Operation {
            id: OpId::new(),
            op_index: Some(index),
            kind: OpKind::DeleteConnector {
                id: "c1".to_string(),
            },
            actor_id: ActorId::from("t"),
            request_id: RequestId::generate(),
            client_ts: 0,
            origin: Origin::User,
        }
    }

    #[test]
    fn indices_past_sqlite_range_are_refused() {
        let mut journal = SqliteJournal::open_in_memory().expect("open");
        let too_big = OpIndex::try_from(i64::MAX).expect("fits") + 1;

        assert!(journal.append_ops(&[op(0), op(too_big)]).is_err());
        assert_eq!(journal.latest_index().expect("latest"), None);
        assert!(journal.load_ops_after(Some(too_big)).is_err());

        assert_eq!(journal.append_ops(&[op(0)]).expect("append"), Some(0));
        assert!(
            journal
                .write_snapshot(&Snapshot {
                    state: 0u8,
                    watermark: Some(too_big),
                })
                .is_err()
        );
    }
}
