pub mod battery;
pub mod decision;
pub mod grid;
pub mod timeline;
pub mod types;

pub use battery::*;
pub use decision::*;
pub use grid::*;
pub use timeline::*;
pub use types::*;
