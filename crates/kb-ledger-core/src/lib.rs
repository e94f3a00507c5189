//! # kb-ledger core
//!
//! Shared, runtime-free logic for kb-ledger: the timeline data model, the
//! error taxonomy, repository path safety, the [`repo::Repository`] trait
//! with an in-memory implementation, history classification, and revert
//! planning.
//!
//! This crate contains no tokio, process spawning, or network code. Everything
//! that touches a real git working tree lives in the application crate.

pub mod error;
pub mod history;
pub mod models;
pub mod path;
pub mod plan;
pub mod repo;

pub use error::{KbError, Result};
