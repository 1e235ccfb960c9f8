//! Queue record model and lifecycle rules shared by every Flowline crate.

#![forbid(unsafe_code)]

mod record;

pub use record::{ClaimedRecord, QueueRecord, RecordId, RecordStatus};
