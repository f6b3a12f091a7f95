pub mod constraints;
pub mod dp;
pub mod types;

pub use constraints::*;
pub use dp::*;
pub use types::*;
