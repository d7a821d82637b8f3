//! # relia-core
//!
//! Core building blocks for Relia, an authorization gateway that issues
//! short-lived cloud credentials to automated workloads after policy
//! evaluation and, when required, human approval — emitting a signed,
//! content-addressed *receipt* for every decision.
//!
//! This crate is the pure half of the system: everything here is
//! deterministic and free of I/O except for policy/key file loading. The
//! persistent half (ledger, coordinator, outbox) lives in `relia-gateway`.
//!
//! ## Modules
//!
//! - [`canonical`]: canonical JSON encoding and SHA-256 content addressing
//! - [`crypto`]: Ed25519 signer capability and verification
//! - [`types`]: receipt wire shapes and the authorize request surface
//! - [`receipt`]: receipt build / verify
//! - [`idem`]: deterministic idempotency keying
//! - [`context`] / [`decision`]: content-addressed context and decision
//!   records
//! - [`policy`]: YAML policy documents and default-deny evaluation
//! - [`state`]: the per-idempotency-key lifecycle state machine
//!
//! ## Example
//!
//! ```
//! use relia_core::crypto::{LocalSigner, Signer};
//! use relia_core::receipt::{MakeReceiptInput, make_receipt, verify_receipt};
//! use relia_core::types::{OutcomeStatus, ReceiptPolicy};
//!
//! let signer = LocalSigner::generate("dev");
//! let mut input = MakeReceiptInput::with_status(OutcomeStatus::Denied);
//! input.idem_key = "idem:v1:sha256:00".into();
//! input.context_id = "sha256:c0".into();
//! input.decision_id = "sha256:d0".into();
//! input.policy = ReceiptPolicy {
//!     policy_id: "p".into(),
//!     policy_version: "1".into(),
//!     policy_hash: "sha256:p0".into(),
//! };
//!
//! let receipt = make_receipt(input, &signer).unwrap();
//! verify_receipt(
//!     &receipt.body_json,
//!     &receipt.body_digest,
//!     &receipt.sig,
//!     &signer.public_key_bytes(),
//! )
//! .unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod canonical;
pub mod context;
pub mod crypto;
pub mod decision;
pub mod idem;
pub mod policy;
pub mod receipt;
pub mod state;
pub mod types;

pub use idem::compute_idem_key;
pub use receipt::{StoredReceipt, make_receipt, verify_receipt};
pub use state::{ApprovalStatus, IdemStatus, Verdict};
