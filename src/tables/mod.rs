pub mod user_recording_like;

pub use user_recording_like::*;
