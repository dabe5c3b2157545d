//! Per-request pipeline components.
//!
//! - **decode**: sniffed bytes → 3-channel [`ImageArray`](crate::types::ImageArray)
//! - **caption**: feature extraction → generation → decoding

pub mod caption;
pub mod decode;

pub use caption::CaptionPipeline;
pub use decode::ImageDecoder;
