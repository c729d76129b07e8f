pub mod listener;
pub mod master_info;
pub mod streamer;

pub use listener::*;
pub use master_info::*;
pub use streamer::*;
