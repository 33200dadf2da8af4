//! Frame-at-a-time H.264 encoding

pub mod bitstream;
pub mod pcm;
pub mod workspace;

use crate::convert::rgb_to_yuv420;
use crate::frame::{validate_dimensions, yuv420_size, PackedFrame, PlanarFrame};
use crate::muxer::MuxerOptions;
use crate::registry::MuxerHandle;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use workspace::{Workspace, WorkspaceSizes};

pub use pcm::PcmCompressor;

/// Highest QP H.264 allows
pub const MAX_QP: u8 = 51;

/// Bitrate assumed for VBV sizing in constant-QP mode
const FALLBACK_KBPS: u32 = 5000;

/// Static compressor configuration fixed at session creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressorConfig {
    pub width: u32,
    pub height: u32,
    /// Keyframe period, 0 for a single leading IDR
    pub gop: u32,
    pub vbv_size_bytes: u32,
    pub temporal_denoise: bool,
}

/// Frame type requested by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Let the compressor decide
    Auto,
    /// Force an IDR picture
    Idr,
}

/// Per-frame run parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunParams {
    pub frame_type: FrameType,
    /// 0 = best quality, 10 = fastest
    pub encode_speed: u8,
    /// 0 disables rate control
    pub desired_frame_bytes: usize,
    pub qp_min: u8,
    pub qp_max: u8,
    /// 0 means one slice per picture
    pub desired_nalu_bytes: usize,
}

/// What the compressor produced for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOutcome {
    pub keyframe: bool,
    pub qp: u8,
    /// Number of emitted NAL units
    pub units: usize,
    /// Total emitted bytes, start codes included
    pub bytes: usize,
}

/// Summary of one encode call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameReport {
    pub frame_index: u64,
    pub keyframe: bool,
    pub qp: u8,
    pub units: usize,
    pub bytes: usize,
}

/// A block-based compressor operating on caller-provided workspaces
///
/// The session owns both workspaces; the compressor only sees them for the
/// duration of each call. Every coded unit is handed to `emit` as a
/// start-code-prefixed NAL, one per call.
pub trait Compressor: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Persistent and scratch workspace sizes for `config`
    fn workspace_sizes(&self, config: &CompressorConfig) -> Result<WorkspaceSizes>;

    /// Initialise state inside the zeroed persistent workspace
    fn init(&mut self, config: &CompressorConfig, persist: &mut [u8]) -> Result<()>;

    /// Encode one planar frame
    fn encode(
        &mut self,
        persist: &mut [u8],
        scratch: &mut [u8],
        run: &RunParams,
        frame: &PlanarFrame<'_>,
        emit: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<FrameOutcome>;

    /// Emit any deferred units
    fn flush(
        &mut self,
        _persist: &mut [u8],
        _scratch: &mut [u8],
        _emit: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Rate-control mode resolved from the options
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateControl {
    ConstantQp {
        qp: u8,
    },
    Bitrate {
        kbps: u32,
        qp_min: u8,
        qp_max: u8,
        frame_bytes: usize,
    },
}

impl RateControl {
    fn bounds(&self) -> (u8, u8, usize) {
        match *self {
            RateControl::ConstantQp { qp } => (qp, qp, 0),
            RateControl::Bitrate {
                qp_min,
                qp_max,
                frame_bytes,
                ..
            } => (qp_min, qp_max, frame_bytes),
        }
    }
}

/// Encoder options, deserializable from the JSON object the C API accepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderOptions {
    pub width: u32,
    pub height: u32,
    /// Frame rate of the muxer the encoder creates for itself
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// 0 = best quality, 10 = fastest
    #[serde(default = "default_speed")]
    pub speed: u8,
    /// Target bitrate; 0 selects constant QP
    #[serde(default)]
    pub kbps: u32,
    #[serde(rename = "quantizationParameter", alias = "qp", default = "default_qp")]
    pub qp: u8,
    #[serde(default = "default_qp")]
    pub qp_min: u8,
    #[serde(default = "default_qp_max")]
    pub qp_max: u8,
    #[serde(rename = "groupOfPictures", alias = "gop", default = "default_gop")]
    pub gop: u32,
    #[serde(default)]
    pub desired_nalu_bytes: usize,
    /// VBV buffer size in bytes; derived from the bitrate when absent
    #[serde(default)]
    pub vbv_size: Option<u32>,
    #[serde(default)]
    pub temporal_denoise: bool,
    /// Read packed input bottom-up
    #[serde(default)]
    pub rgb_flip_y: bool,
    #[serde(default)]
    pub sequential: bool,
    #[serde(default)]
    pub fragmentation: bool,
}

fn default_fps() -> f64 {
    30.0
}

fn default_speed() -> u8 {
    10
}

fn default_qp() -> u8 {
    10
}

fn default_qp_max() -> u8 {
    MAX_QP
}

fn default_gop() -> u32 {
    20
}

impl EncoderOptions {
    /// Options with every field at its default
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            fps: default_fps(),
            speed: default_speed(),
            kbps: 0,
            qp: default_qp(),
            qp_min: default_qp(),
            qp_max: default_qp_max(),
            gop: default_gop(),
            desired_nalu_bytes: 0,
            vbv_size: None,
            temporal_denoise: false,
            rgb_flip_y: false,
            sequential: false,
            fragmentation: false,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        validate_dimensions(self.width, self.height)?;
        if self.speed > 10 {
            return Err(Error::InvalidInput(format!(
                "speed {} is outside 0..=10",
                self.speed
            )));
        }
        for (name, qp) in [
            ("quantizationParameter", self.qp),
            ("qpMin", self.qp_min),
            ("qpMax", self.qp_max),
        ] {
            if qp > MAX_QP {
                return Err(Error::InvalidInput(format!(
                    "{} {} is outside 0..={}",
                    name, qp, MAX_QP
                )));
            }
        }
        if self.kbps != 0 && self.qp_min > self.qp_max {
            return Err(Error::InvalidInput(format!(
                "qpMin {} is greater than qpMax {}",
                self.qp_min, self.qp_max
            )));
        }
        Ok(())
    }

    /// Resolve the rate-control mode for a stream running at `fps`
    pub fn rate_control(&self, fps: f64) -> RateControl {
        if self.kbps == 0 {
            RateControl::ConstantQp { qp: self.qp }
        } else {
            RateControl::Bitrate {
                kbps: self.kbps,
                qp_min: self.qp_min,
                qp_max: self.qp_max,
                frame_bytes: (self.kbps as f64 * 1000.0 / 8.0 / fps) as usize,
            }
        }
    }

    pub fn vbv_size_bytes(&self) -> u32 {
        self.vbv_size.unwrap_or_else(|| {
            let kbps = if self.kbps == 0 { FALLBACK_KBPS } else { self.kbps };
            kbps.saturating_mul(1000) / 8 * 2
        })
    }

    /// Options for the muxer an encoder creates for itself
    pub fn muxer_options(&self) -> MuxerOptions {
        MuxerOptions {
            width: self.width,
            height: self.height,
            fps: self.fps,
            sequential: self.sequential,
            fragmentation: self.fragmentation,
            hevc: false,
        }
    }
}

/// One encoder instance bound to a muxer
pub struct EncodeSession {
    width: u32,
    height: u32,
    rate: RateControl,
    gop: u32,
    speed: u8,
    desired_nalu_bytes: usize,
    flip: bool,
    muxer: MuxerHandle,
    compressor: Box<dyn Compressor>,
    persist: Workspace,
    scratch: Workspace,
    frame_index: u64,
    last_report: Option<FrameReport>,
    convert_buf: Vec<u8>,
}

impl EncodeSession {
    /// Size, allocate and initialise a compressor for `options`
    pub fn new(
        options: &EncoderOptions,
        fps: f64,
        muxer: MuxerHandle,
        mut compressor: Box<dyn Compressor>,
    ) -> Result<Self> {
        options.validate()?;

        let config = CompressorConfig {
            width: options.width,
            height: options.height,
            gop: options.gop,
            vbv_size_bytes: options.vbv_size_bytes(),
            temporal_denoise: options.temporal_denoise,
        };
        let sizes = compressor.workspace_sizes(&config)?;
        sizes.validate()?;

        let mut persist = Workspace::new(sizes.persist)?;
        let scratch = Workspace::new(sizes.scratch)?;
        compressor.init(&config, persist.as_mut_slice())?;

        let rate = options.rate_control(fps);
        tracing::debug!(
            compressor = compressor.name(),
            width = options.width,
            height = options.height,
            ?rate,
            gop = options.gop,
            persist = sizes.persist,
            scratch = sizes.scratch,
            "encoder session created"
        );

        Ok(Self {
            width: options.width,
            height: options.height,
            rate,
            gop: options.gop,
            speed: options.speed,
            desired_nalu_bytes: options.desired_nalu_bytes,
            flip: options.rgb_flip_y,
            muxer,
            compressor,
            persist,
            scratch,
            frame_index: 0,
            last_report: None,
            convert_buf: Vec::new(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn muxer(&self) -> MuxerHandle {
        self.muxer
    }

    pub fn rate_control(&self) -> RateControl {
        self.rate
    }

    /// Frames encoded so far
    pub fn frame_count(&self) -> u64 {
        self.frame_index
    }

    pub fn last_report(&self) -> Option<FrameReport> {
        self.last_report
    }

    fn frame_type(&self) -> FrameType {
        let idr = match self.gop {
            0 => self.frame_index == 0,
            gop => self.frame_index % gop as u64 == 0,
        };
        if idr {
            FrameType::Idr
        } else {
            FrameType::Auto
        }
    }

    /// Encode one I420 frame, forwarding every NAL to `emit`
    pub fn encode(
        &mut self,
        yuv: &[u8],
        emit: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<FrameReport> {
        let frame = PlanarFrame::new(yuv, self.width, self.height)?;
        let (qp_min, qp_max, desired_frame_bytes) = self.rate.bounds();
        let run = RunParams {
            frame_type: self.frame_type(),
            encode_speed: self.speed,
            desired_frame_bytes,
            qp_min,
            qp_max,
            desired_nalu_bytes: self.desired_nalu_bytes,
        };

        let outcome = self.compressor.encode(
            self.persist.as_mut_slice(),
            self.scratch.as_mut_slice(),
            &run,
            &frame,
            emit,
        )?;

        let report = FrameReport {
            frame_index: self.frame_index,
            keyframe: outcome.keyframe,
            qp: outcome.qp,
            units: outcome.units,
            bytes: outcome.bytes,
        };
        tracing::trace!(?report, "frame encoded");
        self.frame_index += 1;
        self.last_report = Some(report);
        Ok(report)
    }

    /// Convert a packed frame into `scratch`, then encode it
    pub fn encode_packed(
        &mut self,
        packed: PackedFrame<'_>,
        scratch: &mut [u8],
        emit: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<FrameReport> {
        let size = yuv420_size(self.width, self.height);
        if scratch.len() < size {
            return Err(Error::InvalidInput(format!(
                "scratch buffer holds {} bytes, {}x{} needs {}",
                scratch.len(),
                self.width,
                self.height,
                size
            )));
        }
        let planar = &mut scratch[..size];
        rgb_to_yuv420(packed.data, self.width, self.height, packed.layout, self.flip, planar)?;
        self.encode(planar, emit)
    }

    /// Like [`encode_packed`](Self::encode_packed) with a session-owned scratch buffer
    pub fn encode_packed_owned(
        &mut self,
        packed: PackedFrame<'_>,
        emit: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<FrameReport> {
        let mut buf = std::mem::take(&mut self.convert_buf);
        buf.resize(yuv420_size(self.width, self.height), 0);
        let result = self.encode_packed(packed, &mut buf, emit);
        self.convert_buf = buf;
        result
    }

    /// Emit any units the compressor still holds
    pub fn flush(&mut self, emit: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        self.compressor.flush(
            self.persist.as_mut_slice(),
            self.scratch.as_mut_slice(),
            emit,
        )
    }
}

impl std::fmt::Debug for EncodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodeSession")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("rate", &self.rate)
            .field("gop", &self.gop)
            .field("muxer", &self.muxer)
            .field("compressor", &self.compressor.name())
            .field("frame_index", &self.frame_index)
            .finish()
    }
}
