pub mod diagnostic;
pub mod file;
pub mod payload;

pub use diagnostic::*;
pub use file::*;
pub use payload::*;
