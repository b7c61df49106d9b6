pub mod checkpoint;
pub mod config;
pub mod decode;
pub mod error;
pub mod fetch;
pub mod lifecycle;
pub mod lsn;
pub mod postgres;
pub mod raw;
pub mod source;

pub use checkpoint::{Change, Checkpoint, CheckpointManager, CheckpointTracker};
pub use config::Config;
pub use decode::{Classify, Decoder, MessageClass, SchemaLoader};
pub use error::{Error, Result};
pub use lifecycle::LoopState;
pub use lsn::Lsn;
pub use source::PgLogicalSource;
