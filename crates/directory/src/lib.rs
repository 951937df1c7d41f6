//! Warden Directory - LDAP and Active Directory gateway
//!
//! Everything the secrets engine needs from a directory server, behind a
//! connection trait so the engine can be exercised against an in-memory
//! double.
//!
//! # Features
//!
//! - **Dialing** - ordered URL failover, StartTLS, CA bundles and client certificates
//! - **Escaping** - RFC 4515 filter values and RFC 4514 DN values
//! - **Templates** - the restricted helper set used by user filters and LDIF
//! - **Groups** - filter-based lookup or AD `tokenGroups` with SID resolution
//! - **Passwords** - `userPassword`, `unicodePwd` and RACF schemas
//! - **LDIF** - parsing and ordered application with optional continue-on-error
#![deny(unsafe_code)]
#![forbid(unsafe_code)]

/// Connection traits and request/response types
pub mod client;
/// Directory configuration record
pub mod config;
/// Distinguished-name parsing and group name canonicalisation
pub mod dn;
/// Serde adapter for configuration durations
pub mod duration;
/// Error types
pub mod error;
/// Filter and DN escaping
pub mod escape;
/// High-level gateway operations
pub mod gateway;
/// `ldap3`-backed connector
pub mod ldap;
/// LDIF parsing
pub mod ldif;
/// Zeroizing secret strings
pub mod secret;
/// Windows security identifiers
pub mod sid;
/// Restricted template engine
pub mod template;
/// TLS material loading
pub mod tls;
/// Directory URL parsing
pub mod url;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// ── Root re-exports ─────────────────────────────────────────────────────────

pub use crate::client::{
    DirectoryConnection, DirectoryConnector, DirectoryEntry, Modification, ModifyOp, Scope,
    SearchRequest,
};
pub use crate::config::{DirectoryConfig, PasswordSchema, TlsVersion};
pub use crate::error::{DialFailure, DirectoryError, LdifFailure, Result};
pub use crate::gateway::{Directory, UserRef};
pub use crate::ldap::LdapConnector;
pub use crate::ldif::LdifRecord;
pub use crate::secret::SecretString;
pub use crate::template::TemplateEngine;
