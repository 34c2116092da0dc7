//! Purpose: Library crate behind the `msglog` CLI: a compact binary log-record store.
//! Exports: `api` (stable surface), `core` (storage, codec, planning, errors).
//! Role: One fixed-size file holds an index directory, a string table, and records.
//! Invariants: Every store operation is serialized by a single mutex per `LogStore`.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
