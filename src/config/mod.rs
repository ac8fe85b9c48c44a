pub mod runtime;
pub mod profiles;
pub mod loader;

pub use runtime::*;
pub use profiles::*;
pub use loader::*;
