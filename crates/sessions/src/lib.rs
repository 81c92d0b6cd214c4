//! Session lifecycle management.

pub mod manager;

pub use manager::{CreateSession, Session, SessionManager, SHARED_SUBDIRS};
