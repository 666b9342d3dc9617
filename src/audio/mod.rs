//! Audio module for sourcing and shaping PCM
//!
//! Spawns the fetch/transcode pipeline and applies linear gain

pub mod gain;
pub mod pipeline;
pub mod resolver;

pub use gain::apply_gain;
pub use pipeline::{PcmStream, ProcessPipeline};
pub use resolver::{AudioSourceResolver, MediaMetadata};
