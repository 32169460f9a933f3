//! Live queries: continuously reconciled projections of one query's result.

mod controller;
pub mod event;
mod refresh;

pub use controller::{LiveQuery, LiveQueryContext};
pub use event::{ChangeRecord, LiveEvent, LiveEvents, Phase, RefreshStats};
