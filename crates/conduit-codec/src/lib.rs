//! Wire encodings for `conduit-net`: length-prefixed framing and a JSON codec.

pub mod framing;
pub mod json;

pub use framing::{FrameConfig, FrameError, read_frame, write_frame};
pub use json::{JsonCodec, JsonMessage, JsonProtocol};
