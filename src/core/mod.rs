// Core modules implementing storage, encoding, planning, and error modeling.
pub mod error;
pub mod format;
pub mod index;
pub mod io;
pub mod plan;
pub mod record;
pub mod recover;
pub mod rotate;
pub mod store;
pub mod strings;
