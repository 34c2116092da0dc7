//! Purpose: Define the public Rust API boundary for msglog.
//! Exports: Store handle, options, message types, reports, and errors.
//! Role: Additive-only surface used by the CLI and embedding applications.
//! Invariants: Storage layout details stay behind `LogStore`.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::format::Geometry;
pub use crate::core::record::{Message, TextField, Timestamp};
pub use crate::core::store::{LogStore, RecoveryReport, StoreInfo, StoreOptions, WriteOutcome};
