//! Shared domain model for the P3394 exemplar agent: the Universal Message
//! Format, principal identities, configuration, and the common error type.

pub mod config;
pub mod error;
pub mod principal;
pub mod trace;
pub mod umf;

pub use error::{Error, Result};
pub use principal::{AssuranceLevel, ClientAssertion, CredentialBinding, Principal, PrincipalType};
pub use umf::{Address, ContentBlock, ContentKind, MessageType, Umf};
