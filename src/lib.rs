//! # kb-ledger
//!
//! A knowledge base kept in a git repository, with an append-only timeline
//! of every change and selective undo.
//!
//! Raw content (text, files, web pages) is committed, summarized into
//! knowledge-base pages by a pluggable summarizer, and each step is
//! recorded in a ledger that lives next to the content under `.kb/`.
//! Changes can later be reverted by file, by id or by count, either whole
//! or partially (pages only, source only).
//!
//! ## Architecture
//!
//! ```text
//!   kbl CLI ─┐                        ┌─► ingest ─► Summarizer
//!   HTTP   ──┼─► ToolRegistry ─► KnowledgeService ─┼─► revert (Execute + Record)
//!   stdio  ──┘                        └─► history / browse / search
//!                                              │
//!                              TimelineLedger ─┤
//!                                              ▼
//!                         Repository (local git │ remote git │ memory)
//! ```
//!
//! Pure logic (data model, path guard, history grouping, revert planning)
//! lives in the `kb-ledger-core` crate.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`repo`] | Git-backed local and remote repositories |
//! | [`ledger`] | Append-only timeline ledger |
//! | [`sync`] | Sync-before-access policy |
//! | [`extract`] | Text extraction for HTML, PDF and DOCX uploads |
//! | [`summarizer`] | Page generation and question answering providers |
//! | [`ingest`] | Content ingestion orchestration |
//! | [`revert`] | Revert execution and recording |
//! | [`registry`] | Persisted repository registry |
//! | [`service`] | All user-facing operations, per-repository locking |
//! | [`tools`] | Capability table with schema validation |
//! | [`server`] | HTTP and stdio transports |

pub mod config;
pub mod extract;
pub mod ingest;
pub mod ledger;
pub mod registry;
pub mod repo;
pub mod revert;
pub mod server;
pub mod service;
pub mod summarizer;
pub mod sync;
pub mod tools;
