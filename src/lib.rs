//! h264mp4 - Frame-at-a-time H.264 encoding into MP4
//!
//! This library provides:
//! - `Context`: owns encoder and muxer sessions addressed by handles
//! - `encoder`: turns I420 or packed RGB frames into Annex-B H.264
//! - `muxer`: packs H.264/H.265 coded units into progressive, sequential or
//!   fragmented MP4 through a positioned-write sink
//! - `ffi`: the same operations over a C ABI

pub mod context;
pub mod convert;
pub mod encoder;
pub mod error;
pub mod ffi;
pub mod frame;
pub mod muxer;
pub mod registry;

pub use context::{Context, EncoderTarget};
pub use convert::rgb_to_yuv420;
pub use encoder::{Compressor, EncoderOptions, FrameReport, PcmCompressor};
pub use error::{Error, ErrorCode, Result};
pub use frame::{yuv420_size, PackedFormat, PackedFrame, PackedLayout, PlanarFrame};
pub use muxer::sink::{MemorySink, SeekSink, WriteSink};
pub use muxer::{Codec, ContainerMode, MuxerOptions};
pub use registry::{EncoderHandle, MuxerHandle};
