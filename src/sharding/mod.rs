pub mod applier;
pub mod hash;
pub mod sql;

pub use applier::*;
pub use hash::*;
pub use sql::*;
