//! MP4 muxing of Annex-B coded units

mod boxes;
pub mod fragmented;
pub mod mp4;
pub mod nal;
pub mod sequential;
pub mod sink;

use crate::encoder::bitstream::START_CODE;
use crate::frame::validate_dimensions;
use crate::registry::EncoderHandle;
use crate::{Error, Result};
use nal::{classify, NalKind, NalUnits, ParamSetKind};
use serde::{Deserialize, Serialize};
use sink::WriteSink;

/// Media timescale of the video track
pub const TIMESCALE: u32 = 90_000;

/// Movie header timescale
pub const MOVIE_TIMESCALE: u32 = 1000;

/// Video codec carried by a muxer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// H.264
    Avc,
    /// H.265
    Hevc,
}

/// How container bytes reach the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerMode {
    /// `ftyp` + `mdat` first, `moov` appended at close after patching the
    /// `mdat` size
    Progressive,
    /// `ftyp`, then one sized `mdat` per sample as it arrives, `moov` at
    /// close; forward only
    Sequential,
    /// Init segment then one `moof` + `mdat` per sample, forward only
    Fragmented,
}

/// Muxer options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuxerOptions {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default)]
    pub sequential: bool,
    #[serde(default)]
    pub fragmentation: bool,
    #[serde(default)]
    pub hevc: bool,
}

fn default_fps() -> f64 {
    30.0
}

impl MuxerOptions {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            fps: default_fps(),
            sequential: false,
            fragmentation: false,
            hevc: false,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Validate the options
    pub fn validate(&self) -> Result<()> {
        validate_dimensions(self.width, self.height)?;
        if self.width > u16::MAX as u32 || self.height > u16::MAX as u32 {
            return Err(Error::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if !self.fps.is_finite() || self.fps <= 0.0 {
            return Err(Error::InvalidInput(format!("fps {} must be positive", self.fps)));
        }
        if self.sample_duration() == 0 {
            return Err(Error::InvalidInput(format!(
                "fps {} exceeds the {} Hz timescale",
                self.fps, TIMESCALE
            )));
        }
        if self.sequential && self.fragmentation {
            return Err(Error::InvalidInput(
                "sequential and fragmentation are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn codec(&self) -> Codec {
        if self.hevc {
            Codec::Hevc
        } else {
            Codec::Avc
        }
    }

    pub fn mode(&self) -> ContainerMode {
        if self.fragmentation {
            ContainerMode::Fragmented
        } else if self.sequential {
            ContainerMode::Sequential
        } else {
            ContainerMode::Progressive
        }
    }

    /// Ticks per sample at [`TIMESCALE`]
    pub fn sample_duration(&self) -> u32 {
        (TIMESCALE as f64 / self.fps) as u32
    }
}

/// Track description handed to a container writer when the first slice arrives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackParams {
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    pub sample_duration: u32,
    /// NAL payloads without start codes; empty when not seen
    pub vps: Vec<u8>,
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

/// One access unit as 4-byte length-prefixed NALs
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    pub data: &'a [u8],
    /// Decode time in [`TIMESCALE`] ticks
    pub start_time: u64,
    pub duration: u32,
    pub sync: bool,
}

/// Container writer trait
pub trait ContainerWriter: Send {
    /// Declare the single video track
    fn begin_track(&mut self, track: &TrackParams) -> Result<()>;

    /// Append one sample
    fn write_sample(&mut self, sample: &Sample<'_>) -> Result<()>;

    /// Finish the container and flush everything to the sink
    fn close(self: Box<Self>) -> Result<()>;
}

/// Open the container writer for `mode`
pub fn open_writer(
    mode: ContainerMode,
    codec: Codec,
    sink: Box<dyn WriteSink>,
) -> Result<Box<dyn ContainerWriter>> {
    match mode {
        ContainerMode::Progressive => Ok(Box::new(mp4::ProgressiveWriter::new(sink, codec)?)),
        ContainerMode::Sequential => {
            Ok(Box::new(sequential::SequentialWriter::new(sink, codec)?))
        }
        ContainerMode::Fragmented => Ok(Box::new(fragmented::FragmentedWriter::new(sink))),
    }
}

#[derive(Debug, Default)]
struct ParameterSets {
    vps: Option<Vec<u8>>,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl ParameterSets {
    fn slot(&mut self, kind: ParamSetKind) -> &mut Option<Vec<u8>> {
        match kind {
            ParamSetKind::Vps => &mut self.vps,
            ParamSetKind::Sps => &mut self.sps,
            ParamSetKind::Pps => &mut self.pps,
        }
    }
}

#[derive(Debug, Default)]
struct PendingSample {
    data: Vec<u8>,
    has_vcl: bool,
    sync: bool,
}

impl PendingSample {
    fn push(&mut self, nal: &[u8]) {
        self.data.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        self.data.extend_from_slice(nal);
    }
}

/// One muxer instance writing a single video track to a sink
pub struct MuxSession {
    options: MuxerOptions,
    codec: Codec,
    mode: ContainerMode,
    sample_duration: u32,
    params: ParameterSets,
    track_started: bool,
    pending: PendingSample,
    samples_written: u64,
    writer: Box<dyn ContainerWriter>,
    bound_encoder: Option<EncoderHandle>,
    poisoned: Option<(u64, usize)>,
}

impl MuxSession {
    pub fn new(options: MuxerOptions, sink: Box<dyn WriteSink>) -> Result<Self> {
        options.validate()?;
        let codec = options.codec();
        let mode = options.mode();
        let writer = open_writer(mode, codec, sink)?;

        tracing::debug!(
            width = options.width,
            height = options.height,
            fps = options.fps,
            ?codec,
            ?mode,
            "muxer session created"
        );

        Ok(Self {
            sample_duration: options.sample_duration(),
            options,
            codec,
            mode,
            params: ParameterSets::default(),
            track_started: false,
            pending: PendingSample::default(),
            samples_written: 0,
            writer,
            bound_encoder: None,
            poisoned: None,
        })
    }

    pub fn width(&self) -> u32 {
        self.options.width
    }

    pub fn height(&self) -> u32 {
        self.options.height
    }

    pub fn fps(&self) -> f64 {
        self.options.fps
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn mode(&self) -> ContainerMode {
        self.mode
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    pub fn bound_encoder(&self) -> Option<EncoderHandle> {
        self.bound_encoder
    }

    /// Reserve this muxer for one encoder
    pub fn bind_encoder(&mut self, encoder: EncoderHandle) -> Result<()> {
        if let Some(existing) = self.bound_encoder {
            return Err(Error::InvalidHandle(format!(
                "muxer is already bound to encoder {}",
                existing
            )));
        }
        self.bound_encoder = Some(encoder);
        Ok(())
    }

    pub fn unbind_encoder(&mut self) {
        self.bound_encoder = None;
    }

    /// Feed one start-code-prefixed buffer holding one or more NAL units
    pub fn write_nal(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some((offset, len)) = self.poisoned {
            return Err(poisoned(offset, len));
        }
        if bytes.len() < 5 || bytes[..4] != START_CODE {
            return Err(Error::MalformedUnit(format!(
                "{} byte unit does not start with 00 00 00 01",
                bytes.len()
            )));
        }

        let result = NalUnits::new(bytes).try_for_each(|nal| self.push_nal(nal));
        self.check(result)
    }

    fn check(&mut self, result: Result<()>) -> Result<()> {
        if let Err(Error::SinkWriteFailure { offset, len, source }) = &result {
            tracing::warn!(offset, len, error = %source, "sink write failed, muxer poisoned");
            self.poisoned = Some((*offset, *len));
        }
        result
    }

    fn push_nal(&mut self, nal: &[u8]) -> Result<()> {
        match classify(self.codec, nal) {
            NalKind::Dropped => {
                tracing::trace!(nal_type = nal::nal_type(self.codec, nal), "nal dropped");
                Ok(())
            }
            NalKind::ParameterSet(kind) => self.record_parameter_set(kind, nal),
            NalKind::Sei { prefix: true } => self.push_prefix(nal),
            NalKind::Sei { prefix: false } => {
                self.pending.push(nal);
                Ok(())
            }
            NalKind::Vcl { first_slice, sync } => {
                if first_slice && self.pending.has_vcl {
                    self.flush_pending()?;
                }
                self.ensure_track()?;
                self.pending.push(nal);
                self.pending.has_vcl = true;
                self.pending.sync |= sync;
                Ok(())
            }
        }
    }

    /// Non-VCL units that lead an access unit
    fn push_prefix(&mut self, nal: &[u8]) -> Result<()> {
        if self.pending.has_vcl {
            self.flush_pending()?;
        }
        self.pending.push(nal);
        Ok(())
    }

    fn record_parameter_set(&mut self, kind: ParamSetKind, nal: &[u8]) -> Result<()> {
        if self.codec == Codec::Avc && kind == ParamSetKind::Sps && nal.len() < 4 {
            return Err(Error::MalformedUnit(format!(
                "{} byte SPS is too short",
                nal.len()
            )));
        }

        let known = self.params.slot(kind).as_deref();
        let repeated = known == Some(nal);
        let changed = known.is_some() && !repeated;

        let carry_in_band = if repeated {
            self.codec == Codec::Hevc
        } else if changed && self.track_started {
            tracing::warn!(?kind, "parameter set changed mid-stream, carrying it in-band");
            true
        } else {
            tracing::debug!(?kind, len = nal.len(), "parameter set recorded");
            *self.params.slot(kind) = Some(nal.to_vec());
            self.codec == Codec::Hevc
        };

        if carry_in_band {
            self.push_prefix(nal)
        } else {
            Ok(())
        }
    }

    fn ensure_track(&mut self) -> Result<()> {
        if self.track_started {
            return Ok(());
        }
        let (sps, pps) = match (self.codec, &self.params.sps, &self.params.pps) {
            (Codec::Avc, Some(sps), Some(pps)) => (sps.clone(), pps.clone()),
            (Codec::Avc, _, _) => {
                return Err(Error::MalformedUnit(
                    "slice arrived before SPS and PPS".to_string(),
                ))
            }
            (Codec::Hevc, sps, pps) => (
                sps.clone().unwrap_or_default(),
                pps.clone().unwrap_or_default(),
            ),
        };

        let track = TrackParams {
            codec: self.codec,
            width: self.options.width,
            height: self.options.height,
            sample_duration: self.sample_duration,
            vps: self.params.vps.clone().unwrap_or_default(),
            sps,
            pps,
        };
        self.writer.begin_track(&track)?;
        self.track_started = true;
        tracing::debug!(codec = ?self.codec, mode = ?self.mode, "track started");
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        if !pending.has_vcl {
            if !pending.data.is_empty() {
                tracing::debug!(bytes = pending.data.len(), "dropping units without a picture");
            }
            return Ok(());
        }

        let sample = Sample {
            data: &pending.data,
            start_time: self.samples_written * self.sample_duration as u64,
            duration: self.sample_duration,
            sync: pending.sync,
        };
        self.writer.write_sample(&sample)?;
        tracing::trace!(
            index = self.samples_written,
            bytes = pending.data.len(),
            sync = pending.sync,
            "sample written"
        );
        self.samples_written += 1;

        let mut data = pending.data;
        data.clear();
        self.pending.data = data;
        Ok(())
    }

    /// Write the last sample and close the container
    ///
    /// A poisoned session is released without touching the sink.
    pub fn finalize(mut self) -> Result<()> {
        if let Some((offset, len)) = self.poisoned {
            tracing::warn!(offset, len, "releasing poisoned muxer without finishing the file");
            return Ok(());
        }
        self.flush_pending()?;
        tracing::debug!(samples = self.samples_written, mode = ?self.mode, "muxer finalized");
        self.writer.close()
    }
}

fn poisoned(offset: u64, len: usize) -> Error {
    Error::SinkWriteFailure {
        offset,
        len,
        source: std::io::Error::other("muxer is poisoned by an earlier sink failure"),
    }
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("options", &self.options)
            .field("codec", &self.codec)
            .field("mode", &self.mode)
            .field("samples_written", &self.samples_written)
            .field("bound_encoder", &self.bound_encoder)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
