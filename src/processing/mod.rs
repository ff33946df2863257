//! Model ownership, derived-data caching and hit record I/O

pub mod cache;
pub mod model_store;
pub mod parser;

pub use cache::{LagMapCache, LagMapKey};
pub use model_store::{DrumModel, ModelStore, PublishError};
pub use parser::{HitFormat, HitRecord, HitRecordParser, ParseError};
