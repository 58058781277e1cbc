//! Account credentials for the rotation proxy
//!
//! Owns everything that touches token material at rest and on the wire:
//! the on-disk credentials document (parse, validate, atomic persistence)
//! and the OAuth2 refresh-grant client. This crate has no knowledge of the
//! pool or the proxy — it can be tested and reused independently.
//!
//! Credential flow:
//! 1. `CredentialsStore::load()` reads and validates `accounts.json`
//! 2. The pool consumes the ordered `AccountsDocument`
//! 3. The refresh scheduler calls `TokenClient::refresh()` before expiry
//! 4. Refreshed tokens are persisted via `CredentialsStore::save()`,
//!    which records a self-write marker so the file watcher can tell the
//!    proxy's own writes apart from operator edits

pub mod constants;
pub mod document;
pub mod error;
pub mod store;
pub mod token;

pub use constants::*;
pub use document::{AccountsDocument, StoredCredentials};
pub use error::{Error, Result};
pub use store::CredentialsStore;
pub use token::{TokenClient, TokenResponse};
