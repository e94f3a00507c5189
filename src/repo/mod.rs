//! Git-backed [`Repository`](kb_ledger_core::repo::Repository) implementations.

pub mod git;
pub mod local;
pub mod remote;

pub use local::LocalRepository;
pub use remote::{RemoteRepository, RemoteSpec};
