pub mod analysis;
pub mod eviction;
pub mod parser;
pub mod query;
pub mod records;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod state;
pub mod watcher;

pub use service::*;
pub use state::*;
pub use watcher::*;
