pub mod order;
pub mod orphan;
pub mod position;

pub use order::*;
pub use orphan::*;
pub use position::*;
