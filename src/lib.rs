//! Cairn: persistence and operation plans for a cluster lifecycle manager.
//!
//! Cluster state (accounts, sites, users, packages, certificate authorities,
//! operations) lives in a hierarchical key-value store with TTL and
//! compare-and-swap semantics. Multi-step cluster operations are modeled as
//! phase trees whose state is derived from their leaves.
//!
//! # Layers
//!
//! - [`kv`]: the [`kv::Engine`] contract and its embedded and multi-client
//!   SQLite implementations
//! - [`backend`]: typed domain API over an engine, including leader election
//! - [`ops`]: operation plans and the builder that assembles them
//! - [`transfer`]: moving a site with its dependencies between stores
//! - [`core`]: errors, value codec, clock and configuration
//!
//! # Example
//!
//! ```no_run
//! use cairn::backend::Backend;
//! use cairn::backend::resources::Account;
//! use cairn::core::config::BackendConfig;
//!
//! let backend = Backend::open(BackendConfig::new("/var/lib/cairn/cairn.db"))?;
//! let account = backend.create_account(Account {
//!     org: "acme".to_string(),
//!     ..Default::default()
//! })?;
//! println!("created account {}", account.id);
//! # Ok::<(), cairn::core::error::CairnError>(())
//! ```

pub mod backend;
pub mod cli;
pub mod core;
pub mod kv;
pub mod ops;
pub mod transfer;
