pub mod instance;
pub mod row;
pub mod tag_map;

pub use instance::*;
pub use row::*;
pub use tag_map::*;
