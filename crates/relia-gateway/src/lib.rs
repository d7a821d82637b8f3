//! # relia-gateway
//!
//! Persistent half of the Relia authorization gateway: the transactional
//! receipt ledger, the authorize coordinator, the credential-broker and
//! notification-transport capabilities, and the notification outbox worker.
//!
//! The HTTP surface, caller authentication, and CLI are external adapters:
//! they hand the coordinator a validated [`relia_core::types::AuthorizeRequest`]
//! plus an authenticated [`relia_core::types::ActorContext`] and shape the
//! [`service::AuthorizeResponse`] onto the wire.
//!
//! ## Wiring
//!
//! ```no_run
//! use std::path::{Path, PathBuf};
//! use std::sync::Arc;
//!
//! use relia_core::crypto::LocalSigner;
//! use relia_gateway::broker::DevBroker;
//! use relia_gateway::ledger::SqliteStore;
//! use relia_gateway::service::AuthorizeService;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteStore::open(Path::new("relia.db"))?);
//! let signer = Arc::new(LocalSigner::load_or_generate(
//!     "relia-dev",
//!     Path::new("signing.key"),
//! )?);
//! let service = AuthorizeService::new(
//!     store,
//!     signer,
//!     Arc::new(DevBroker),
//!     PathBuf::from("policy.yaml"),
//! );
//! # let _ = service;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod broker;
pub mod config;
pub mod ledger;
pub mod notify;
pub mod outbox;
pub mod service;

pub use ledger::{SqliteStore, Store};
pub use service::{AuthorizeResponse, AuthorizeService, ServiceError};
