pub mod tier;
pub mod prediction;

pub use tier::*;
pub use prediction::*;
