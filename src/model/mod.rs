pub mod change;
pub mod common;
pub mod context;
pub mod correlation;
pub mod instance;
pub mod query;
pub mod type_def;

pub use change::*;
pub use common::*;
pub use context::*;
pub use correlation::*;
pub use instance::*;
pub use query::*;
pub use type_def::*;
