//! Sequential MP4 writer
//!
//! `ftyp` goes out first, then every sample in its own fully sized `mdat`
//! as soon as it arrives. Closing appends a `moov` whose sample tables point
//! back at those payloads. Every write extends the stream, so no byte is
//! ever rewritten.

use super::boxes::{self, container, full_box, BoxFields};
use super::sink::{sink_error, SinkWriter, WriteSink};
use super::{Codec, ContainerWriter, Sample, TrackParams};
use crate::{Error, Result};
use std::io::Write;

/// Where one sample landed and how it plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SampleRecord {
    /// Stream offset of the payload, past the `mdat` header
    offset: u64,
    size: u32,
    duration: u32,
    sync: bool,
}

/// Forward-only MP4 container writer
pub struct SequentialWriter {
    out: SinkWriter,
    track: Option<TrackParams>,
    samples: Vec<SampleRecord>,
}

impl SequentialWriter {
    pub fn new(sink: Box<dyn WriteSink>, codec: Codec) -> Result<Self> {
        let mut out = SinkWriter::new(sink);
        out.write_all(&boxes::ftyp(codec, &[b"iso2", b"mp41"]))
            .map_err(sink_error)?;
        Ok(Self {
            out,
            track: None,
            samples: Vec::new(),
        })
    }
}

impl ContainerWriter for SequentialWriter {
    fn begin_track(&mut self, track: &TrackParams) -> Result<()> {
        if self.track.is_some() {
            return Err(Error::Mux("track already declared".to_string()));
        }
        self.track = Some(track.clone());
        Ok(())
    }

    fn write_sample(&mut self, sample: &Sample<'_>) -> Result<()> {
        if self.track.is_none() {
            return Err(Error::Mux("sample written before the track".to_string()));
        }
        let size = u32::try_from(sample.data.len())
            .ok()
            .filter(|size| *size <= u32::MAX - 8)
            .ok_or_else(|| Error::Mux(format!("{} byte sample is too large", sample.data.len())))?;

        let mut header = Vec::<u8>::with_capacity(8);
        header.u32(size + 8).bytes(b"mdat");
        let offset = self.out.stream_len() + 8;

        self.out.write_all(&header).map_err(sink_error)?;
        self.out.write_all(sample.data).map_err(sink_error)?;
        self.out.flush().map_err(sink_error)?;

        self.samples.push(SampleRecord {
            offset,
            size,
            duration: sample.duration,
            sync: sample.sync,
        });
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        match self.track.take() {
            Some(track) => {
                let moov = moov(&track, &self.samples);
                tracing::trace!(samples = self.samples.len(), len = moov.len(), "appending moov");
                self.out.write_all(&moov).map_err(sink_error)?;
            }
            None => tracing::warn!("closing sequential file that never received a picture"),
        }
        self.out.flush().map_err(sink_error)
    }
}

fn moov(track: &TrackParams, samples: &[SampleRecord]) -> Vec<u8> {
    let ticks = samples.iter().map(|s| u64::from(s.duration)).sum();
    container(
        b"moov",
        &[
            boxes::mvhd(ticks),
            boxes::trak(track, ticks, &sample_tables(samples)),
        ],
    )
}

/// stts, stsc, stsz, stco (or co64) and, unless every sample is sync, stss
fn sample_tables(samples: &[SampleRecord]) -> Vec<Vec<u8>> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for sample in samples {
        match runs.last_mut() {
            Some((count, duration)) if *duration == sample.duration => *count += 1,
            _ => runs.push((1, sample.duration)),
        }
    }
    let mut stts = Vec::<u8>::with_capacity(4 + runs.len() * 8);
    stts.u32(runs.len() as u32);
    for (count, duration) in runs {
        stts.u32(count).u32(duration);
    }

    // one sample per chunk
    let mut stsc = Vec::<u8>::with_capacity(16);
    stsc.u32(1).u32(1).u32(1).u32(1);

    let mut stsz = Vec::<u8>::with_capacity(8 + samples.len() * 4);
    stsz.u32(0).u32(samples.len() as u32);
    for sample in samples {
        stsz.u32(sample.size);
    }

    let chunk_offsets = if samples.iter().all(|s| s.offset <= u64::from(u32::MAX)) {
        let mut stco = Vec::<u8>::with_capacity(4 + samples.len() * 4);
        stco.u32(samples.len() as u32);
        for sample in samples {
            stco.u32(sample.offset as u32);
        }
        full_box(b"stco", 0, 0, &stco)
    } else {
        let mut co64 = Vec::<u8>::with_capacity(4 + samples.len() * 8);
        co64.u32(samples.len() as u32);
        for sample in samples {
            co64.u64(sample.offset);
        }
        full_box(b"co64", 0, 0, &co64)
    };

    let mut tables = vec![
        full_box(b"stts", 0, 0, &stts),
        full_box(b"stsc", 0, 0, &stsc),
        full_box(b"stsz", 0, 0, &stsz),
        chunk_offsets,
    ];

    if samples.iter().any(|s| !s.sync) {
        let sync: Vec<u32> = samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.sync)
            .map(|(i, _)| i as u32 + 1)
            .collect();
        let mut stss = Vec::<u8>::with_capacity(4 + sync.len() * 4);
        stss.u32(sync.len() as u32);
        for number in sync {
            stss.u32(number);
        }
        tables.push(full_box(b"stss", 0, 0, &stss));
    }
    tables
}
