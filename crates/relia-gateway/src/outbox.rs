//! The notification outbox worker.
//!
//! Approval notifications are committed to the `slack_outbox` table in the
//! same transaction as the decision they announce, then delivered
//! asynchronously by this worker. Persistence gives at-least-once delivery;
//! message idempotency is the consumer's concern.
//!
//! # Delivery loop
//!
//! Each pass fetches pending entries whose `next_attempt_at` has arrived and
//! attempts the transport call. Success marks the entry `sent` and records
//! the transport handle on the approval row. Failure increments the attempt
//! count and reschedules with exponential backoff and jitter, up to a bound,
//! after which the entry is marked `failed`.
//!
//! Transport errors never propagate: they are recorded on the entry and the
//! authorize response path is unaffected.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::ledger::{OutboxRow, OutboxStatus, Store};
use crate::notify::NotificationTransport;

/// Configuration for the outbox worker.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Maximum entries to process per pass.
    pub batch_size: usize,

    /// Backoff delay after the first failure.
    pub initial_delay: Duration,

    /// Backoff ceiling.
    pub max_delay: Duration,

    /// Attempts before an entry is marked `failed`.
    pub max_attempts: u32,

    /// Sleep between passes of the run loop.
    pub poll_interval: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 8,
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl OutboxConfig {
    /// Exponential backoff for the given attempt ordinal (1-based), with
    /// ±50% jitter, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);

        let jitter = rand::thread_rng().gen_range(0.5..=1.5);
        base.mul_f64(jitter).min(self.max_delay)
    }
}

/// The single background delivery task.
pub struct OutboxWorker {
    store: Arc<dyn Store>,
    transport: Arc<dyn NotificationTransport>,
    config: OutboxConfig,
}

impl OutboxWorker {
    /// Creates a worker.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn NotificationTransport>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    /// Processes one batch of due entries. Returns the number attempted.
    ///
    /// # Errors
    ///
    /// Returns a ledger error when the due-entry query fails; individual
    /// delivery failures are recorded on their entries instead.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<usize, crate::ledger::LedgerError> {
        let due = self
            .store
            .due_outbox(&rfc3339(now), self.config.batch_size)?;
        let count = due.len();

        for entry in due {
            attempt_delivery(
                self.store.as_ref(),
                self.transport.as_ref(),
                entry,
                &self.config,
                now,
            );
        }

        Ok(count)
    }

    /// Runs the delivery loop until the task is aborted.
    ///
    /// Cancel-safe: an abort between passes loses nothing, and an abort
    /// mid-pass at worst re-attempts an entry (at-least-once).
    pub async fn run(self) {
        info!("Outbox worker started");
        loop {
            match self.run_once(Utc::now()) {
                Ok(0) => {},
                Ok(count) => debug!(count, "Outbox pass processed entries"),
                Err(err) => warn!(error = %err, "Outbox pass failed"),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

/// Attempts one delivery and persists the result. Returns `true` on
/// success.
///
/// Shared by the worker and the coordinator's opportunistic inline send;
/// both paths record the outcome the same way, so a crash between attempt
/// and record only ever causes a duplicate send.
pub fn attempt_delivery(
    store: &dyn Store,
    transport: &dyn NotificationTransport,
    mut entry: OutboxRow,
    config: &OutboxConfig,
    now: DateTime<Utc>,
) -> bool {
    match transport.post_approval(&entry.channel, &entry.message) {
        Ok(handle) => {
            entry.attempt_count += 1;
            entry.status = OutboxStatus::Sent;
            entry.last_error = None;
            entry.updated_at = rfc3339(now);

            let approval_id = entry.approval_id.clone();
            let channel = entry.channel.clone();
            let result = store.with_tx(&mut |tx| {
                tx.put_outbox(&entry)?;
                // Record the transport handle so the approval row points at
                // the posted message.
                if let Some(mut approval) = tx.get_approval(&approval_id)? {
                    approval.channel = Some(channel.clone());
                    approval.message_ts = Some(handle.clone());
                    approval.updated_at = rfc3339(now);
                    tx.put_approval(&approval)?;
                }
                Ok(())
            });
            if let Err(err) = result {
                warn!(
                    notification_id = %entry.notification_id,
                    error = %err,
                    "Delivered but failed to record; entry will be re-sent"
                );
                return false;
            }

            info!(
                notification_id = %entry.notification_id,
                approval_id = %entry.approval_id,
                "Approval notification delivered"
            );
            true
        },
        Err(err) => {
            entry.attempt_count += 1;
            entry.last_error = Some(err.to_string());
            entry.updated_at = rfc3339(now);

            let attempts = u32::try_from(entry.attempt_count).unwrap_or(u32::MAX);
            if attempts >= config.max_attempts {
                entry.status = OutboxStatus::Failed;
                warn!(
                    notification_id = %entry.notification_id,
                    attempts,
                    error = %err,
                    "Notification given up"
                );
            } else {
                let delay = config.delay_for_attempt(attempts);
                entry.next_attempt_at = rfc3339(
                    now + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                );
                debug!(
                    notification_id = %entry.notification_id,
                    attempts,
                    next_attempt_at = %entry.next_attempt_at,
                    error = %err,
                    "Notification attempt failed; rescheduled"
                );
            }

            if let Err(record_err) = store.put_outbox(&entry) {
                warn!(
                    notification_id = %entry.notification_id,
                    error = %record_err,
                    "Failed to record delivery failure"
                );
            }
            false
        },
    }
}

/// RFC 3339 with seconds precision, UTC `Z` suffix.
fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::ledger::SqliteStore;
    use crate::notify::TransportError;

    /// Transport that fails a configured number of times, then succeeds.
    struct FlakyTransport {
        failures_left: Mutex<u32>,
        posts: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl FlakyTransport {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: Mutex::new(failures),
                posts: Mutex::new(Vec::new()),
            }
        }
    }

    impl NotificationTransport for FlakyTransport {
        fn post_approval(&self, channel: &str, message: &[u8]) -> Result<String, TransportError> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(TransportError::Post {
                    message: "simulated outage".to_string(),
                });
            }
            self.posts
                .lock()
                .unwrap()
                .push((channel.to_string(), message.to_vec()));
            Ok("1734775200.000100".to_string())
        }
    }

    fn pending_entry(store: &SqliteStore, now: DateTime<Utc>) -> OutboxRow {
        let entry = OutboxRow {
            notification_id: "ntf-1".to_string(),
            approval_id: "approval-1".to_string(),
            channel: "#relia-approvals".to_string(),
            message: b"{\"blocks\":[]}".to_vec(),
            attempt_count: 0,
            next_attempt_at: rfc3339(now),
            status: OutboxStatus::Pending,
            last_error: None,
            created_at: rfc3339(now),
            updated_at: rfc3339(now),
        };
        store.put_outbox(&entry).unwrap();
        entry
    }

    fn fixed_now() -> DateTime<Utc> {
        "2025-12-21T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn successful_delivery_marks_sent() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let transport = Arc::new(FlakyTransport::new(0));
        let now = fixed_now();
        pending_entry(&store, now);

        let worker = OutboxWorker::new(store.clone(), transport.clone(), OutboxConfig::default());
        assert_eq!(worker.run_once(now).unwrap(), 1);

        let entry = store.get_outbox("ntf-1").unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Sent);
        assert_eq!(entry.attempt_count, 1);
        assert_eq!(transport.posts.lock().unwrap().len(), 1);

        // A second pass finds nothing due.
        assert_eq!(worker.run_once(now).unwrap(), 0);
    }

    #[test]
    fn failure_reschedules_with_backoff() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let transport = Arc::new(FlakyTransport::new(1));
        let now = fixed_now();
        pending_entry(&store, now);

        let worker = OutboxWorker::new(store.clone(), transport.clone(), OutboxConfig::default());
        assert_eq!(worker.run_once(now).unwrap(), 1);

        let entry = store.get_outbox("ntf-1").unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert_eq!(entry.attempt_count, 1);
        assert!(entry.last_error.as_deref().unwrap().contains("outage"));
        assert!(entry.next_attempt_at > rfc3339(now));

        // Not due yet at `now`; due once the clock passes the backoff.
        assert_eq!(worker.run_once(now).unwrap(), 0);
        let later = now + chrono::Duration::seconds(120);
        assert_eq!(worker.run_once(later).unwrap(), 1);

        let entry = store.get_outbox("ntf-1").unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Sent);
    }

    #[test]
    fn entry_fails_after_attempt_bound() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let transport = Arc::new(FlakyTransport::new(u32::MAX));
        let now = fixed_now();
        pending_entry(&store, now);

        let config = OutboxConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            ..OutboxConfig::default()
        };
        let worker = OutboxWorker::new(store.clone(), transport, config);

        let mut clock = now;
        for _ in 0..3 {
            clock += chrono::Duration::seconds(600);
            worker.run_once(clock).unwrap();
        }

        let entry = store.get_outbox("ntf-1").unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Failed);
        assert_eq!(entry.attempt_count, 3);

        // Failed entries are never retried.
        clock += chrono::Duration::seconds(600);
        assert_eq!(worker.run_once(clock).unwrap(), 0);
    }

    #[test]
    fn successful_delivery_records_handle_on_approval() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let transport = Arc::new(FlakyTransport::new(0));
        let now = fixed_now();

        store
            .put_approval(&crate::ledger::ApprovalRow {
                approval_id: "approval-1".to_string(),
                idem_key: "idem:v1:sha256:aa".to_string(),
                status: relia_core::ApprovalStatus::Pending,
                channel: None,
                message_ts: None,
                approved_by: None,
                approved_at: None,
                created_at: rfc3339(now),
                updated_at: rfc3339(now),
            })
            .unwrap();
        pending_entry(&store, now);

        let worker = OutboxWorker::new(store.clone(), transport, OutboxConfig::default());
        worker.run_once(now).unwrap();

        let approval = store.get_approval("approval-1").unwrap().unwrap();
        assert_eq!(approval.channel.as_deref(), Some("#relia-approvals"));
        assert_eq!(approval.message_ts.as_deref(), Some("1734775200.000100"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = OutboxConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            ..OutboxConfig::default()
        };

        // Jitter is ±50%, so bound the expected ranges rather than exact
        // values.
        let first = config.delay_for_attempt(1);
        assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(1500));

        let fourth = config.delay_for_attempt(4);
        assert!(fourth >= Duration::from_secs(4) && fourth <= Duration::from_secs(12));

        for attempt in [10, 20, 30, 60] {
            assert!(config.delay_for_attempt(attempt) <= Duration::from_secs(60));
        }
    }
}
