pub mod coordinator;
pub mod correlation;
pub mod find;
pub mod instance_filter;
pub mod lifecycle;
pub mod propagation;
pub mod validate;

pub use coordinator::*;
pub use correlation::*;
pub use find::*;
pub use instance_filter::*;
pub use lifecycle::*;
pub use propagation::*;
pub use validate::*;
