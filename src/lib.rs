//! Strobe: live command timeline inspector with search, type filters and exports.

mod cli;
pub mod debounce;
pub mod strobe_core;
pub mod strobe_export;
pub mod strobe_ingest;
pub mod strobe_resolver;
pub mod strobe_timeline;
pub mod strobe_tui;

pub use cli::{run, DynError};
