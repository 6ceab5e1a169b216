//! Domain model: snapshots, timestamp formats, and parent chains.

pub mod chain;
pub mod naming;
mod snapshot;
mod timefmt;

pub use snapshot::{Snapshot, SubvolumeInfo};
pub use timefmt::{DEFAULT_TIMESTAMP_FORMAT, TimeFormatError, TimestampFormat};
