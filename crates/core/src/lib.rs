//! Domain building blocks for the audio normalization service.
//!
//! Zero internal dependencies: the store, pipeline and HTTP crates all build
//! on the types and the process supervisor defined here.

pub mod audio;
pub mod error;
pub mod ffmpeg;
pub mod supervisor;
pub mod types;
