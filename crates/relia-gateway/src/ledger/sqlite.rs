//! `SQLite` implementation of the ledger store.
//!
//! Single-file embedded engine. One connection behind a mutex; transactions
//! use `IMMEDIATE` behavior so writers serialize at begin time instead of
//! failing at commit. Receipts persist their canonical body bytes verbatim.

use std::path::Path;
use std::sync::{Arc, Mutex};

use relia_core::state::{ApprovalStatus, IdemStatus};
use relia_core::types::OutcomeStatus;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::debug;

use super::{
    ApprovalRow, ContextRow, DecisionRow, IdempotencyRow, LedgerError, OutboxRow, OutboxStatus,
    PolicyVersionRow, ReceiptRow, SigningKeyRow, Store, Tx,
};

/// Durable ledger store backed by `SQLite`.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and initializes the schema.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the database cannot be opened or the
    /// schema cannot be created.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init_schema(&conn)?;
        debug!(path = %path.display(), "Opened ledger database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database, for tests.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the schema cannot be created.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates all tables and indexes.
    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS contexts (
                context_id TEXT PRIMARY KEY,
                body_json  BLOB NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS decisions (
                decision_id TEXT PRIMARY KEY,
                context_id  TEXT NOT NULL,
                policy_hash TEXT NOT NULL,
                verdict     TEXT NOT NULL,
                body_json   BLOB NOT NULL,
                created_at  TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS policy_versions (
                policy_hash    TEXT PRIMARY KEY,
                policy_id      TEXT NOT NULL,
                policy_version TEXT NOT NULL,
                source         BLOB NOT NULL,
                created_at     TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS receipts (
                receipt_id            TEXT PRIMARY KEY,
                idem_key              TEXT NOT NULL,
                created_at            TEXT NOT NULL,
                supersedes_receipt_id TEXT,
                context_id            TEXT NOT NULL,
                decision_id           TEXT NOT NULL,
                policy_hash           TEXT NOT NULL,
                approval_id           TEXT,
                outcome_status        TEXT NOT NULL,
                final                 INTEGER NOT NULL,
                expires_at            TEXT,
                body_json             BLOB NOT NULL,
                body_digest           TEXT NOT NULL,
                key_id                TEXT NOT NULL,
                sig                   BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_receipts_idem_key ON receipts(idem_key);
            CREATE TABLE IF NOT EXISTS idempotency_keys (
                idem_key          TEXT PRIMARY KEY,
                status            TEXT NOT NULL,
                approval_id       TEXT,
                latest_receipt_id TEXT,
                final_receipt_id  TEXT,
                created_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS approvals (
                approval_id TEXT PRIMARY KEY,
                idem_key    TEXT NOT NULL,
                status      TEXT NOT NULL,
                channel     TEXT,
                message_ts  TEXT,
                approved_by TEXT,
                approved_at TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_approvals_idem_key ON approvals(idem_key);
            CREATE TABLE IF NOT EXISTS slack_outbox (
                notification_id TEXT PRIMARY KEY,
                approval_id     TEXT NOT NULL,
                channel         TEXT NOT NULL,
                message         BLOB NOT NULL,
                attempt_count   INTEGER NOT NULL,
                next_attempt_at TEXT NOT NULL,
                status          TEXT NOT NULL,
                last_error      TEXT,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_slack_outbox_due
                ON slack_outbox(status, next_attempt_at);
            CREATE TABLE IF NOT EXISTS signing_keys (
                key_id     TEXT PRIMARY KEY,
                public_key BLOB NOT NULL,
                created_at TEXT NOT NULL
            );",
        )
    }
}

/// Maps a unique-constraint failure to [`LedgerError::Conflict`].
fn map_conflict(err: rusqlite::Error, table: &'static str) -> LedgerError {
    match err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            LedgerError::Conflict { table }
        },
        other => LedgerError::Sqlite(other),
    }
}

/// Transaction handle over a live `SQLite` transaction.
struct SqliteTx<'conn> {
    tx: &'conn rusqlite::Transaction<'conn>,
}

impl Tx for SqliteTx<'_> {
    fn put_context(&mut self, row: &ContextRow) -> Result<(), LedgerError> {
        self.tx.execute(
            "INSERT OR IGNORE INTO contexts (context_id, body_json, created_at)
             VALUES (?1, ?2, ?3)",
            params![row.context_id, row.body_json, row.created_at],
        )?;
        Ok(())
    }

    fn put_decision(&mut self, row: &DecisionRow) -> Result<(), LedgerError> {
        self.tx.execute(
            "INSERT OR IGNORE INTO decisions
                 (decision_id, context_id, policy_hash, verdict, body_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.decision_id,
                row.context_id,
                row.policy_hash,
                row.verdict,
                row.body_json,
                row.created_at
            ],
        )?;
        Ok(())
    }

    fn put_policy_version(&mut self, row: &PolicyVersionRow) -> Result<(), LedgerError> {
        self.tx.execute(
            "INSERT OR IGNORE INTO policy_versions
                 (policy_hash, policy_id, policy_version, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.policy_hash,
                row.policy_id,
                row.policy_version,
                row.source,
                row.created_at
            ],
        )?;
        Ok(())
    }

    fn put_receipt(&mut self, row: &ReceiptRow) -> Result<(), LedgerError> {
        self.tx
            .execute(
                "INSERT INTO receipts
                     (receipt_id, idem_key, created_at, supersedes_receipt_id, context_id,
                      decision_id, policy_hash, approval_id, outcome_status, final,
                      expires_at, body_json, body_digest, key_id, sig)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    row.receipt_id,
                    row.idem_key,
                    row.created_at,
                    row.supersedes_receipt_id,
                    row.context_id,
                    row.decision_id,
                    row.policy_hash,
                    row.approval_id,
                    row.outcome_status.as_str(),
                    row.is_final,
                    row.expires_at,
                    row.body_json,
                    row.body_digest,
                    row.key_id,
                    row.sig
                ],
            )
            .map_err(|e| map_conflict(e, "receipts"))?;
        Ok(())
    }

    fn put_approval(&mut self, row: &ApprovalRow) -> Result<(), LedgerError> {
        self.tx.execute(
            "INSERT INTO approvals
                 (approval_id, idem_key, status, channel, message_ts,
                  approved_by, approved_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(approval_id) DO UPDATE SET
                 status = excluded.status,
                 channel = excluded.channel,
                 message_ts = excluded.message_ts,
                 approved_by = excluded.approved_by,
                 approved_at = excluded.approved_at,
                 updated_at = excluded.updated_at",
            params![
                row.approval_id,
                row.idem_key,
                row.status.as_str(),
                row.channel,
                row.message_ts,
                row.approved_by,
                row.approved_at,
                row.created_at,
                row.updated_at
            ],
        )?;
        Ok(())
    }

    fn create_idempotency_key(&mut self, row: &IdempotencyRow) -> Result<(), LedgerError> {
        self.tx
            .execute(
                "INSERT INTO idempotency_keys
                     (idem_key, status, approval_id, latest_receipt_id, final_receipt_id,
                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.idem_key,
                    row.status.as_str(),
                    row.approval_id,
                    row.latest_receipt_id,
                    row.final_receipt_id,
                    row.created_at,
                    row.updated_at
                ],
            )
            .map_err(|e| map_conflict(e, "idempotency_keys"))?;
        Ok(())
    }

    fn put_idempotency_key(&mut self, row: &IdempotencyRow) -> Result<(), LedgerError> {
        self.tx.execute(
            "INSERT INTO idempotency_keys
                 (idem_key, status, approval_id, latest_receipt_id, final_receipt_id,
                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(idem_key) DO UPDATE SET
                 status = excluded.status,
                 approval_id = excluded.approval_id,
                 latest_receipt_id = excluded.latest_receipt_id,
                 final_receipt_id = excluded.final_receipt_id,
                 updated_at = excluded.updated_at",
            params![
                row.idem_key,
                row.status.as_str(),
                row.approval_id,
                row.latest_receipt_id,
                row.final_receipt_id,
                row.created_at,
                row.updated_at
            ],
        )?;
        Ok(())
    }

    fn put_outbox(&mut self, row: &OutboxRow) -> Result<(), LedgerError> {
        self.tx.execute(
            "INSERT INTO slack_outbox
                 (notification_id, approval_id, channel, message, attempt_count,
                  next_attempt_at, status, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(notification_id) DO UPDATE SET
                 attempt_count = excluded.attempt_count,
                 next_attempt_at = excluded.next_attempt_at,
                 status = excluded.status,
                 last_error = excluded.last_error,
                 updated_at = excluded.updated_at",
            params![
                row.notification_id,
                row.approval_id,
                row.channel,
                row.message,
                row.attempt_count,
                row.next_attempt_at,
                row.status.as_str(),
                row.last_error,
                row.created_at,
                row.updated_at
            ],
        )?;
        Ok(())
    }

    fn put_signing_key(&mut self, row: &SigningKeyRow) -> Result<(), LedgerError> {
        self.tx.execute(
            "INSERT OR IGNORE INTO signing_keys (key_id, public_key, created_at)
             VALUES (?1, ?2, ?3)",
            params![row.key_id, row.public_key, row.created_at],
        )?;
        Ok(())
    }

    fn get_approval(&mut self, approval_id: &str) -> Result<Option<ApprovalRow>, LedgerError> {
        read_approval(self.tx, approval_id)
    }

    fn get_idempotency_key(
        &mut self,
        idem_key: &str,
    ) -> Result<Option<IdempotencyRow>, LedgerError> {
        read_idempotency_key(self.tx, idem_key)
    }

    fn get_receipt(&mut self, receipt_id: &str) -> Result<Option<ReceiptRow>, LedgerError> {
        read_receipt(self.tx, receipt_id)
    }

    fn get_outbox(&mut self, notification_id: &str) -> Result<Option<OutboxRow>, LedgerError> {
        read_outbox(self.tx, notification_id)
    }
}

impl Store for SqliteStore {
    fn with_tx(
        &self,
        f: &mut dyn FnMut(&mut dyn Tx) -> Result<(), LedgerError>,
    ) -> Result<(), LedgerError> {
        let mut conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let result = {
            let mut handle = SqliteTx { tx: &tx };
            f(&mut handle)
        };

        match result {
            Ok(()) => {
                tx.commit()?;
                Ok(())
            },
            Err(err) => {
                // Dropping the transaction rolls it back.
                drop(tx);
                Err(err)
            },
        }
    }

    fn get_context(&self, context_id: &str) -> Result<Option<ContextRow>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        conn.query_row(
            "SELECT context_id, body_json, created_at FROM contexts WHERE context_id = ?1",
            params![context_id],
            |row| {
                Ok(ContextRow {
                    context_id: row.get(0)?,
                    body_json: row.get(1)?,
                    created_at: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(LedgerError::Sqlite)
    }

    fn get_decision(&self, decision_id: &str) -> Result<Option<DecisionRow>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        conn.query_row(
            "SELECT decision_id, context_id, policy_hash, verdict, body_json, created_at
             FROM decisions WHERE decision_id = ?1",
            params![decision_id],
            |row| {
                Ok(DecisionRow {
                    decision_id: row.get(0)?,
                    context_id: row.get(1)?,
                    policy_hash: row.get(2)?,
                    verdict: row.get(3)?,
                    body_json: row.get(4)?,
                    created_at: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(LedgerError::Sqlite)
    }

    fn get_policy_version(
        &self,
        policy_hash: &str,
    ) -> Result<Option<PolicyVersionRow>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        conn.query_row(
            "SELECT policy_hash, policy_id, policy_version, source, created_at
             FROM policy_versions WHERE policy_hash = ?1",
            params![policy_hash],
            |row| {
                Ok(PolicyVersionRow {
                    policy_hash: row.get(0)?,
                    policy_id: row.get(1)?,
                    policy_version: row.get(2)?,
                    source: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(LedgerError::Sqlite)
    }

    fn get_receipt(&self, receipt_id: &str) -> Result<Option<ReceiptRow>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        read_receipt(&conn, receipt_id)
    }

    fn get_receipts_by_idem(&self, idem_key: &str) -> Result<Vec<ReceiptRow>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT receipt_id FROM receipts
             WHERE idem_key = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![idem_key], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        let mut receipts = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(receipt) = read_receipt(&conn, &id)? {
                receipts.push(receipt);
            }
        }
        Ok(receipts)
    }

    fn get_idempotency_key(&self, idem_key: &str) -> Result<Option<IdempotencyRow>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        read_idempotency_key(&conn, idem_key)
    }

    fn get_approval(&self, approval_id: &str) -> Result<Option<ApprovalRow>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        read_approval(&conn, approval_id)
    }

    fn get_outbox(&self, notification_id: &str) -> Result<Option<OutboxRow>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        read_outbox(&conn, notification_id)
    }

    fn due_outbox(&self, now: &str, limit: usize) -> Result<Vec<OutboxRow>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT notification_id FROM slack_outbox
             WHERE status = 'pending' AND next_attempt_at <= ?1
             ORDER BY next_attempt_at ASC, created_at ASC
             LIMIT ?2",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![now, limit as i64], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = read_outbox(&conn, &id)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn get_signing_key(&self, key_id: &str) -> Result<Option<SigningKeyRow>, LedgerError> {
        let conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        conn.query_row(
            "SELECT key_id, public_key, created_at FROM signing_keys WHERE key_id = ?1",
            params![key_id],
            |row| {
                Ok(SigningKeyRow {
                    key_id: row.get(0)?,
                    public_key: row.get(1)?,
                    created_at: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(LedgerError::Sqlite)
    }
}

fn read_receipt(conn: &Connection, receipt_id: &str) -> Result<Option<ReceiptRow>, LedgerError> {
    let raw = conn
        .query_row(
            "SELECT receipt_id, idem_key, created_at, supersedes_receipt_id, context_id,
                    decision_id, policy_hash, approval_id, outcome_status, final,
                    expires_at, body_json, body_digest, key_id, sig
             FROM receipts WHERE receipt_id = ?1",
            params![receipt_id],
            |row| {
                Ok((
                    ReceiptRow {
                        receipt_id: row.get(0)?,
                        idem_key: row.get(1)?,
                        created_at: row.get(2)?,
                        supersedes_receipt_id: row.get(3)?,
                        context_id: row.get(4)?,
                        decision_id: row.get(5)?,
                        policy_hash: row.get(6)?,
                        approval_id: row.get(7)?,
                        outcome_status: OutcomeStatus::Denied,
                        is_final: row.get(9)?,
                        expires_at: row.get(10)?,
                        body_json: row.get(11)?,
                        body_digest: row.get(12)?,
                        key_id: row.get(13)?,
                        sig: row.get(14)?,
                    },
                    row.get::<_, String>(8)?,
                ))
            },
        )
        .optional()?;

    let Some((mut receipt, status)) = raw else {
        return Ok(None);
    };
    receipt.outcome_status =
        OutcomeStatus::parse(&status).ok_or_else(|| LedgerError::Corrupt {
            entity: "receipt",
            id: receipt.receipt_id.clone(),
            detail: format!("unknown outcome status '{status}'"),
        })?;
    Ok(Some(receipt))
}

fn read_idempotency_key(
    conn: &Connection,
    idem_key: &str,
) -> Result<Option<IdempotencyRow>, LedgerError> {
    let raw = conn
        .query_row(
            "SELECT idem_key, status, approval_id, latest_receipt_id, final_receipt_id,
                    created_at, updated_at
             FROM idempotency_keys WHERE idem_key = ?1",
            params![idem_key],
            |row| {
                Ok((
                    IdempotencyRow {
                        idem_key: row.get(0)?,
                        status: IdemStatus::Errored,
                        approval_id: row.get(2)?,
                        latest_receipt_id: row.get(3)?,
                        final_receipt_id: row.get(4)?,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                    },
                    row.get::<_, String>(1)?,
                ))
            },
        )
        .optional()?;

    let Some((mut idem, status)) = raw else {
        return Ok(None);
    };
    idem.status = IdemStatus::parse(&status).ok_or_else(|| LedgerError::Corrupt {
        entity: "idempotency key",
        id: idem.idem_key.clone(),
        detail: format!("unknown status '{status}'"),
    })?;
    Ok(Some(idem))
}

fn read_approval(conn: &Connection, approval_id: &str) -> Result<Option<ApprovalRow>, LedgerError> {
    let raw = conn
        .query_row(
            "SELECT approval_id, idem_key, status, channel, message_ts,
                    approved_by, approved_at, created_at, updated_at
             FROM approvals WHERE approval_id = ?1",
            params![approval_id],
            |row| {
                Ok((
                    ApprovalRow {
                        approval_id: row.get(0)?,
                        idem_key: row.get(1)?,
                        status: ApprovalStatus::Pending,
                        channel: row.get(3)?,
                        message_ts: row.get(4)?,
                        approved_by: row.get(5)?,
                        approved_at: row.get(6)?,
                        created_at: row.get(7)?,
                        updated_at: row.get(8)?,
                    },
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((mut approval, status)) = raw else {
        return Ok(None);
    };
    approval.status = ApprovalStatus::parse(&status).ok_or_else(|| LedgerError::Corrupt {
        entity: "approval",
        id: approval.approval_id.clone(),
        detail: format!("unknown status '{status}'"),
    })?;
    Ok(Some(approval))
}

fn read_outbox(
    conn: &Connection,
    notification_id: &str,
) -> Result<Option<OutboxRow>, LedgerError> {
    let raw = conn
        .query_row(
            "SELECT notification_id, approval_id, channel, message, attempt_count,
                    next_attempt_at, status, last_error, created_at, updated_at
             FROM slack_outbox WHERE notification_id = ?1",
            params![notification_id],
            |row| {
                Ok((
                    OutboxRow {
                        notification_id: row.get(0)?,
                        approval_id: row.get(1)?,
                        channel: row.get(2)?,
                        message: row.get(3)?,
                        attempt_count: row.get(4)?,
                        next_attempt_at: row.get(5)?,
                        status: OutboxStatus::Pending,
                        last_error: row.get(7)?,
                        created_at: row.get(8)?,
                        updated_at: row.get(9)?,
                    },
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((mut entry, status)) = raw else {
        return Ok(None);
    };
    entry.status = OutboxStatus::parse(&status).ok_or_else(|| LedgerError::Corrupt {
        entity: "outbox entry",
        id: entry.notification_id.clone(),
        detail: format!("unknown status '{status}'"),
    })?;
    Ok(Some(entry))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_idem(key: &str) -> IdempotencyRow {
        IdempotencyRow {
            idem_key: key.to_string(),
            status: IdemStatus::Issuing,
            approval_id: None,
            latest_receipt_id: Some("sha256:r0".to_string()),
            final_receipt_id: None,
            created_at: "2025-12-21T00:00:00Z".to_string(),
            updated_at: "2025-12-21T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn idempotency_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let row = sample_idem("idem:v1:sha256:aa");

        store
            .with_tx(&mut |tx| tx.create_idempotency_key(&row))
            .unwrap();

        let read = store
            .get_idempotency_key("idem:v1:sha256:aa")
            .unwrap()
            .unwrap();
        assert_eq!(read, row);
        assert!(store.get_idempotency_key("idem:v1:sha256:bb").unwrap().is_none());
    }

    #[test]
    fn duplicate_create_is_a_conflict() {
        let store = SqliteStore::in_memory().unwrap();
        let row = sample_idem("idem:v1:sha256:aa");

        store
            .with_tx(&mut |tx| tx.create_idempotency_key(&row))
            .unwrap();
        let result = store.with_tx(&mut |tx| tx.create_idempotency_key(&row));
        assert!(matches!(
            result,
            Err(LedgerError::Conflict {
                table: "idempotency_keys"
            })
        ));
    }

    #[test]
    fn failed_tx_rolls_back_every_write() {
        let store = SqliteStore::in_memory().unwrap();
        let row = sample_idem("idem:v1:sha256:aa");

        let result = store.with_tx(&mut |tx| {
            tx.create_idempotency_key(&row)?;
            tx.put_signing_key(&SigningKeyRow {
                key_id: "k".to_string(),
                public_key: vec![0u8; 32],
                created_at: "2025-12-21T00:00:00Z".to_string(),
            })?;
            Err(LedgerError::Aborted {
                reason: "test".to_string(),
            })
        });
        assert!(matches!(result, Err(LedgerError::Aborted { .. })));

        assert!(store.get_idempotency_key("idem:v1:sha256:aa").unwrap().is_none());
        assert!(store.get_signing_key("k").unwrap().is_none());
    }

    #[test]
    fn policy_version_put_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let row = PolicyVersionRow {
            policy_hash: "sha256:p0".to_string(),
            policy_id: "relia-default".to_string(),
            policy_version: "1".to_string(),
            source: b"rules: []".to_vec(),
            created_at: "2025-12-21T00:00:00Z".to_string(),
        };

        store.with_tx(&mut |tx| tx.put_policy_version(&row)).unwrap();
        store.with_tx(&mut |tx| tx.put_policy_version(&row)).unwrap();

        let read = store.get_policy_version("sha256:p0").unwrap().unwrap();
        assert_eq!(read.source, b"rules: []");
    }

    #[test]
    fn due_outbox_filters_by_status_and_time() {
        let store = SqliteStore::in_memory().unwrap();
        let base = OutboxRow {
            notification_id: String::new(),
            approval_id: "approval-1".to_string(),
            channel: "#relia-approvals".to_string(),
            message: b"{}".to_vec(),
            attempt_count: 0,
            next_attempt_at: String::new(),
            status: OutboxStatus::Pending,
            last_error: None,
            created_at: "2025-12-21T00:00:00Z".to_string(),
            updated_at: "2025-12-21T00:00:00Z".to_string(),
        };

        let due = OutboxRow {
            notification_id: "ntf-due".to_string(),
            next_attempt_at: "2025-12-21T00:00:00Z".to_string(),
            ..base.clone()
        };
        let later = OutboxRow {
            notification_id: "ntf-later".to_string(),
            next_attempt_at: "2025-12-21T01:00:00Z".to_string(),
            ..base.clone()
        };
        let sent = OutboxRow {
            notification_id: "ntf-sent".to_string(),
            next_attempt_at: "2025-12-21T00:00:00Z".to_string(),
            status: OutboxStatus::Sent,
            ..base
        };

        store
            .with_tx(&mut |tx| {
                tx.put_outbox(&due)?;
                tx.put_outbox(&later)?;
                tx.put_outbox(&sent)
            })
            .unwrap();

        let entries = store.due_outbox("2025-12-21T00:30:00Z", 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].notification_id, "ntf-due");
    }
}
