//! End-to-end coordinator scenarios over an on-disk `SQLite` ledger.
//!
//! Covers the allow / require-approval / deny paths, replay idempotency,
//! broker retry, the approve-then-issue receipt chain, and the concurrent
//! first-writer race.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use relia_core::crypto::LocalSigner;
use relia_core::state::{ApprovalStatus, IdemStatus, Verdict};
use relia_core::types::{ActorContext, Approver, AuthorizeRequest, OutcomeStatus, RequestEvidence};
use relia_gateway::broker::{
    AssumeRoleInput, BrokerError, CredentialBroker, Credentials, DevBroker, validate_input,
};
use relia_gateway::ledger::{OutboxStatus, SqliteStore, Store};
use relia_gateway::notify::{NotificationTransport, TransportError};
use relia_gateway::service::{AuthorizeService, ServiceError};

const POLICY: &str = "\
policy_id: relia-default
policy_version: \"1\"
rules:
  - id: allow-terraform-dev
    match: { action: terraform.apply, env: dev }
    effect:
      verdict: allow
      aws_role_arn: arn:aws:iam::123456789012:role/test
      ttl_seconds: 900
      risk: low
  - id: approve-terraform-prod
    match: { action: terraform.apply, env: prod }
    effect:
      verdict: require_approval
      aws_role_arn: arn:aws:iam::123456789012:role/prod
      ttl_seconds: 900
      risk: high
";

/// Broker that fails a configured number of calls before delegating to
/// [`DevBroker`].
struct FlakyBroker {
    failures_left: Mutex<u32>,
}

impl FlakyBroker {
    fn new(failures: u32) -> Self {
        Self {
            failures_left: Mutex::new(failures),
        }
    }
}

impl CredentialBroker for FlakyBroker {
    fn assume_role(&self, input: &AssumeRoleInput) -> Result<Credentials, BrokerError> {
        validate_input(input)?;
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(BrokerError::Issuance {
                message: "simulated sts outage".to_string(),
            });
        }
        DevBroker.assume_role(input)
    }
}

/// Transport that records every post.
#[derive(Default)]
struct RecordingTransport {
    posts: Mutex<Vec<String>>,
}

impl NotificationTransport for RecordingTransport {
    fn post_approval(&self, channel: &str, _message: &[u8]) -> Result<String, TransportError> {
        self.posts.lock().unwrap().push(channel.to_string());
        Ok("1734775200.000100".to_string())
    }
}

struct Fixture {
    service: AuthorizeService,
    store: Arc<SqliteStore>,
    // Keeps the policy and database files alive for the test's duration.
    _dir: tempfile::TempDir,
}

fn fixture_with_broker(broker: Arc<dyn CredentialBroker>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let policy_path = dir.path().join("policy.yaml");
    std::fs::write(&policy_path, POLICY).unwrap();

    let store = Arc::new(SqliteStore::open(&dir.path().join("relia.db")).unwrap());
    let signer = Arc::new(LocalSigner::generate("relia-dev"));
    let service = AuthorizeService::new(store.clone(), signer, broker, policy_path);

    Fixture {
        service,
        store,
        _dir: dir,
    }
}

fn fixture() -> Fixture {
    fixture_with_broker(Arc::new(DevBroker))
}

fn actor() -> ActorContext {
    ActorContext {
        subject: "repo:org/repo:ref:refs/heads/main".to_string(),
        issuer: "relia-dev".to_string(),
        repo: "org/repo".to_string(),
        workflow: "deploy".to_string(),
        run_id: "123".to_string(),
        sha: "abc".to_string(),
    }
}

fn request(env: &str) -> AuthorizeRequest {
    AuthorizeRequest {
        action: "terraform.apply".to_string(),
        resource: "res".to_string(),
        env: env.to_string(),
        evidence: RequestEvidence {
            plan_digest: "sha256:plan".to_string(),
            diff_url: String::new(),
        },
        ..AuthorizeRequest::default()
    }
}

fn t0() -> DateTime<Utc> {
    "2025-12-21T00:00:00Z".parse().unwrap()
}

#[test]
fn allow_in_dev_issues_credentials_and_replays() {
    let fx = fixture();

    let first = fx.service.authorize(&actor(), &request("dev"), t0()).unwrap();
    assert_eq!(first.verdict, Verdict::Allow);
    assert!(!first.receipt_id.is_empty());
    let creds = first.aws_credentials.as_ref().unwrap();
    assert_eq!(creds.access_key_id, "DEV_ACCESS_KEY");

    // Replay returns the stored final receipt.
    let second = fx
        .service
        .authorize(&actor(), &request("dev"), t0() + Duration::seconds(5))
        .unwrap();
    assert_eq!(second.verdict, Verdict::Allow);
    assert_eq!(second.receipt_id, first.receipt_id);
    assert_eq!(second.context_id, first.context_id);
    assert_eq!(second.decision_id, first.decision_id);

    // The chain is issuing -> issued, tip and final agree.
    let final_receipt = fx.store.get_receipt(&first.receipt_id).unwrap().unwrap();
    assert_eq!(final_receipt.outcome_status, OutcomeStatus::IssuedCredentials);
    assert!(final_receipt.is_final);
    let issuing_id = final_receipt.supersedes_receipt_id.unwrap();
    let issuing = fx.store.get_receipt(&issuing_id).unwrap().unwrap();
    assert_eq!(issuing.outcome_status, OutcomeStatus::IssuingCredentials);
    assert!(issuing.supersedes_receipt_id.is_none());

    let idem = fx
        .store
        .get_idempotency_key(&issuing.idem_key)
        .unwrap()
        .unwrap();
    assert_eq!(idem.status, IdemStatus::Allowed);
    assert_eq!(idem.latest_receipt_id.as_deref(), Some(first.receipt_id.as_str()));
    assert_eq!(idem.final_receipt_id.as_deref(), Some(first.receipt_id.as_str()));
}

#[test]
fn require_approval_in_prod_is_idempotent() {
    let fx = fixture();

    let first = fx.service.authorize(&actor(), &request("prod"), t0()).unwrap();
    assert_eq!(first.verdict, Verdict::RequireApproval);
    assert!(first.aws_credentials.is_none());
    let approval = first.approval.as_ref().unwrap();
    assert!(approval.approval_id.starts_with("approval-"));
    assert_eq!(approval.status, ApprovalStatus::Pending);

    let second = fx
        .service
        .authorize(&actor(), &request("prod"), t0() + Duration::seconds(5))
        .unwrap();
    assert_eq!(second.verdict, Verdict::RequireApproval);
    assert_eq!(
        second.approval.as_ref().unwrap().approval_id,
        approval.approval_id
    );
    assert_eq!(second.receipt_id, first.receipt_id);

    // The pending receipt and the approval row landed in the same commit.
    let receipt = fx.store.get_receipt(&first.receipt_id).unwrap().unwrap();
    assert_eq!(receipt.outcome_status, OutcomeStatus::ApprovalPending);
    let stored = fx
        .store
        .get_approval(&approval.approval_id)
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, ApprovalStatus::Pending);
    assert_eq!(stored.idem_key, receipt.idem_key);
}

#[test]
fn pending_approval_enqueues_outbox_entry() {
    let fx = fixture();

    let response = fx.service.authorize(&actor(), &request("prod"), t0()).unwrap();
    let approval_id = response.approval.unwrap().approval_id;

    // No transport is configured, so the entry stays pending for the worker.
    let due = fx.store.due_outbox("2025-12-21T00:00:00Z", 10).unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].approval_id, approval_id);
    assert_eq!(due[0].status, OutboxStatus::Pending);
    assert_eq!(due[0].attempt_count, 0);

    let message: serde_json::Value = serde_json::from_slice(&due[0].message).unwrap();
    assert!(message["blocks"].is_array());
}

#[test]
fn inline_send_marks_outbox_sent() {
    let dir = tempfile::tempdir().unwrap();
    let policy_path = dir.path().join("policy.yaml");
    std::fs::write(&policy_path, POLICY).unwrap();

    let store = Arc::new(SqliteStore::open(&dir.path().join("relia.db")).unwrap());
    let signer = Arc::new(LocalSigner::generate("relia-dev"));
    let transport = Arc::new(RecordingTransport::default());
    let service = AuthorizeService::new(
        store.clone(),
        signer,
        Arc::new(DevBroker),
        policy_path,
    )
    .with_notifier(transport.clone(), "#relia-approvals");

    service.authorize(&actor(), &request("prod"), t0()).unwrap();

    assert_eq!(transport.posts.lock().unwrap().as_slice(), ["#relia-approvals"]);
    let due = store.due_outbox("2025-12-22T00:00:00Z", 10).unwrap();
    assert!(due.is_empty(), "inline-sent entry must not stay due");
}

#[test]
fn approve_then_authorize_issues_with_chained_receipts() {
    let fx = fixture();

    let pending = fx.service.authorize(&actor(), &request("prod"), t0()).unwrap();
    let approval_id = pending.approval.unwrap().approval_id;
    let pending_receipt_id = pending.receipt_id.clone();

    // Approve.
    let approval_receipt_id = fx
        .service
        .approve(
            &approval_id,
            ApprovalStatus::Approved,
            Some(Approver {
                kind: "slack_user".to_string(),
                id: "U123".to_string(),
                display: "Dana".to_string(),
            }),
            t0() + Duration::seconds(60),
        )
        .unwrap();
    assert_ne!(approval_receipt_id, pending_receipt_id);

    let approved = fx
        .store
        .get_approval(&approval_id)
        .unwrap()
        .unwrap();
    assert_eq!(approved.status, ApprovalStatus::Approved);
    assert_eq!(approved.approved_by.as_deref(), Some("U123"));

    // Approving again is idempotent and returns the current tip.
    let again = fx
        .service
        .approve(
            &approval_id,
            ApprovalStatus::Approved,
            None,
            t0() + Duration::seconds(90),
        )
        .unwrap();
    assert_eq!(again, approval_receipt_id);

    // Authorize now issues.
    let issued = fx
        .service
        .authorize(&actor(), &request("prod"), t0() + Duration::seconds(120))
        .unwrap();
    assert_eq!(issued.verdict, Verdict::Allow);
    assert!(issued.aws_credentials.is_some());
    assert_ne!(issued.receipt_id, approval_receipt_id);

    // Walk the supersedes chain back to the pending receipt.
    let mut cursor = issued.receipt_id.clone();
    let mut chain = vec![cursor.clone()];
    loop {
        let receipt = fx.store.get_receipt(&cursor).unwrap().unwrap();
        match receipt.supersedes_receipt_id {
            Some(prev) => {
                chain.push(prev.clone());
                cursor = prev;
            },
            None => break,
        }
    }
    assert!(
        chain.contains(&pending_receipt_id),
        "final receipt must transitively supersede the pending receipt"
    );
    assert_eq!(chain.len(), 4, "issued -> issuing -> approved -> pending");

    // Observed statuses advanced monotonically to terminal.
    let idem_key = fx
        .store
        .get_receipt(&pending_receipt_id)
        .unwrap()
        .unwrap()
        .idem_key;
    let idem = fx.store.get_idempotency_key(&idem_key).unwrap().unwrap();
    assert_eq!(idem.status, IdemStatus::Allowed);
    assert_eq!(idem.final_receipt_id.as_deref(), Some(issued.receipt_id.as_str()));
}

#[test]
fn deny_by_approval_is_terminal() {
    let fx = fixture();

    let pending = fx.service.authorize(&actor(), &request("prod"), t0()).unwrap();
    let approval_id = pending.approval.unwrap().approval_id;

    let denial_receipt_id = fx
        .service
        .approve(
            &approval_id,
            ApprovalStatus::Denied,
            None,
            t0() + Duration::seconds(30),
        )
        .unwrap();

    let denied = fx
        .service
        .authorize(&actor(), &request("prod"), t0() + Duration::seconds(60))
        .unwrap();
    assert_eq!(denied.verdict, Verdict::Deny);
    assert_eq!(denied.receipt_id, denial_receipt_id);
    assert!(denied.aws_credentials.is_none());

    let receipt = fx.store.get_receipt(&denial_receipt_id).unwrap().unwrap();
    assert_eq!(receipt.outcome_status, OutcomeStatus::ApprovalDenied);
}

#[test]
fn unknown_prod_action_is_default_denied() {
    let fx = fixture();

    let mut unknown = request("prod");
    unknown.action = "s3.delete_bucket".to_string();

    let response = fx.service.authorize(&actor(), &unknown, t0()).unwrap();
    assert_eq!(response.verdict, Verdict::Deny);
    assert!(response.aws_credentials.is_none());
    assert!(response.approval.is_none());

    let receipt = fx.store.get_receipt(&response.receipt_id).unwrap().unwrap();
    assert_eq!(receipt.outcome_status, OutcomeStatus::Denied);
    assert!(receipt.is_final);

    // Replay of a terminal denial returns the stored receipt.
    let replay = fx
        .service
        .authorize(&actor(), &unknown, t0() + Duration::seconds(5))
        .unwrap();
    assert_eq!(replay.receipt_id, response.receipt_id);
}

#[test]
fn broker_failure_leaves_issuing_retryable() {
    let fx = fixture_with_broker(Arc::new(FlakyBroker::new(1)));

    let first = fx.service.authorize(&actor(), &request("dev"), t0());
    assert!(matches!(first, Err(ServiceError::Broker(_))));

    // The issuing receipt is committed and the key stays retryable.
    let key = relia_core::compute_idem_key(&actor(), &request("dev")).unwrap();
    let idem = fx.store.get_idempotency_key(&key).unwrap().unwrap();
    assert_eq!(idem.status, IdemStatus::Issuing);
    assert!(idem.final_receipt_id.is_none());
    let issuing_id = idem.latest_receipt_id.clone().unwrap();

    // Second call retries finalization and succeeds.
    let second = fx
        .service
        .authorize(&actor(), &request("dev"), t0() + Duration::seconds(30))
        .unwrap();
    assert_eq!(second.verdict, Verdict::Allow);
    assert!(second.aws_credentials.is_some());
    assert_ne!(second.receipt_id, issuing_id);

    let final_receipt = fx.store.get_receipt(&second.receipt_id).unwrap().unwrap();
    assert_eq!(
        final_receipt.supersedes_receipt_id.as_deref(),
        Some(issuing_id.as_str())
    );
}

#[test]
fn missing_required_fields_are_user_errors() {
    let fx = fixture();

    let mut incomplete = request("dev");
    incomplete.env = String::new();
    let result = fx.service.authorize(&actor(), &incomplete, t0());
    assert!(matches!(result, Err(ServiceError::Validation(_))));

    // Nothing was written.
    let due = fx.store.due_outbox("2025-12-22T00:00:00Z", 10).unwrap();
    assert!(due.is_empty());
}

#[test]
fn unknown_approval_is_an_error() {
    let fx = fixture();
    let result = fx
        .service
        .approve("approval-doesnotexist", ApprovalStatus::Approved, None, t0());
    assert!(matches!(result, Err(ServiceError::ApprovalNotFound { .. })));
}

#[test]
fn pending_is_not_a_valid_approval_decision() {
    let fx = fixture();
    let result = fx
        .service
        .approve("approval-any", ApprovalStatus::Pending, None, t0());
    assert!(matches!(
        result,
        Err(ServiceError::InvalidApprovalStatus { .. })
    ));
}

#[test]
fn concurrent_first_writers_converge_on_one_approval() {
    let fx = fixture();
    let service = Arc::new(fx.service);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let service = service.clone();
        handles.push(std::thread::spawn(move || {
            service.authorize(&actor(), &request("prod"), t0()).unwrap()
        }));
    }

    let responses: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let first = &responses[0];
    for response in &responses {
        assert_eq!(response.verdict, Verdict::RequireApproval);
        assert_eq!(response.receipt_id, first.receipt_id);
        assert_eq!(
            response.approval.as_ref().unwrap().approval_id,
            first.approval.as_ref().unwrap().approval_id
        );
    }

    // Exactly one pending receipt chain exists for the key.
    let key = relia_core::compute_idem_key(&actor(), &request("prod")).unwrap();
    let receipts = fx.store.get_receipts_by_idem(&key).unwrap();
    assert_eq!(receipts.len(), 1);
}

#[test]
fn policy_edits_do_not_affect_inflight_issuance() {
    let fx = fixture_with_broker(Arc::new(FlakyBroker::new(1)));

    let first = fx.service.authorize(&actor(), &request("dev"), t0());
    assert!(matches!(first, Err(ServiceError::Broker(_))));

    // Rewrite the on-disk policy to deny everything. The retry must use the
    // pinned version from the ledger and still issue.
    std::fs::write(
        fx._dir.path().join("policy.yaml"),
        "policy_id: locked-down\npolicy_version: \"2\"\nrules: []\n",
    )
    .unwrap();

    let second = fx
        .service
        .authorize(&actor(), &request("dev"), t0() + Duration::seconds(30))
        .unwrap();
    assert_eq!(second.verdict, Verdict::Allow);
    assert!(second.aws_credentials.is_some());
}

#[test]
fn stored_policy_version_matches_loaded_hash() {
    let fx = fixture();

    let response = fx.service.authorize(&actor(), &request("dev"), t0()).unwrap();
    let receipt = fx.store.get_receipt(&response.receipt_id).unwrap().unwrap();

    let version = fx
        .store
        .get_policy_version(&receipt.policy_hash)
        .unwrap()
        .unwrap();
    assert_eq!(version.source, POLICY.as_bytes());
    assert_eq!(version.policy_id, "relia-default");
}
