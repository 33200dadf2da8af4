//! Progressive MP4 writer backed by the mp4 crate

use super::sink::{sink_error, SinkWriter, WriteSink};
use super::{Codec, ContainerWriter, Sample, TrackParams, MOVIE_TIMESCALE, TIMESCALE};
use crate::{Error, Result};
use mp4::{Mp4Config, Mp4Writer, TrackConfig};
use std::io::{Seek, Write};

/// Convert an mp4 crate error, recovering sink failures
pub fn from_mp4_error(err: mp4::Error) -> Error {
    match err {
        mp4::Error::IoError(e) => sink_error(e),
        other => Error::Mux(other.to_string()),
    }
}

/// A single-track mp4 writer over any seekable output
struct Mp4Track<W: Write + Seek> {
    writer: Mp4Writer<W>,
    track_id: u32,
    started: bool,
}

impl<W: Write + Seek> Mp4Track<W> {
    fn start(out: W, codec: Codec) -> Result<Self> {
        let writer = Mp4Writer::write_start(out, &mp4_config(codec)).map_err(from_mp4_error)?;
        Ok(Self {
            writer,
            track_id: 1,
            started: false,
        })
    }

    fn begin_track(&mut self, track: &TrackParams) -> Result<()> {
        if self.started {
            return Err(Error::Mux("track already declared".to_string()));
        }
        let width = u16::try_from(track.width).map_err(|_| Error::InvalidDimensions {
            width: track.width,
            height: track.height,
        })?;
        let height = u16::try_from(track.height).map_err(|_| Error::InvalidDimensions {
            width: track.width,
            height: track.height,
        })?;

        let media_conf = match track.codec {
            Codec::Avc => mp4::MediaConfig::AvcConfig(mp4::AvcConfig {
                width,
                height,
                seq_param_set: track.sps.clone(),
                pic_param_set: track.pps.clone(),
            }),
            Codec::Hevc => mp4::MediaConfig::HevcConfig(mp4::HevcConfig { width, height }),
        };
        let track_config = TrackConfig {
            track_type: mp4::TrackType::Video,
            timescale: TIMESCALE,
            language: String::from("und"),
            media_conf,
        };

        self.writer
            .add_track(&track_config)
            .map_err(from_mp4_error)?;
        self.started = true;
        Ok(())
    }

    fn write_sample(&mut self, sample: &Sample<'_>) -> Result<()> {
        if !self.started {
            return Err(Error::Mux("sample written before the track".to_string()));
        }
        let sample = mp4::Mp4Sample {
            start_time: sample.start_time,
            duration: sample.duration,
            rendering_offset: 0,
            is_sync: sample.sync,
            bytes: mp4::Bytes::copy_from_slice(sample.data),
        };
        self.writer
            .write_sample(self.track_id, &sample)
            .map_err(from_mp4_error)
    }

    /// Patch the mdat size, append moov and hand back the output
    fn finish(mut self) -> Result<W> {
        self.writer.write_end().map_err(from_mp4_error)?;
        Ok(self.writer.into_writer())
    }
}

/// Progressive MP4: ftyp and mdat stream out as samples arrive; closing
/// seeks back to patch the mdat size and appends moov
pub struct ProgressiveWriter {
    track: Mp4Track<SinkWriter>,
}

impl ProgressiveWriter {
    pub fn new(sink: Box<dyn WriteSink>, codec: Codec) -> Result<Self> {
        Ok(Self {
            track: Mp4Track::start(SinkWriter::new(sink), codec)?,
        })
    }
}

impl ContainerWriter for ProgressiveWriter {
    fn begin_track(&mut self, track: &TrackParams) -> Result<()> {
        self.track.begin_track(track)
    }

    fn write_sample(&mut self, sample: &Sample<'_>) -> Result<()> {
        self.track.write_sample(sample)
    }

    fn close(self: Box<Self>) -> Result<()> {
        let mut out = self.track.finish()?;
        out.flush().map_err(sink_error)
    }
}

fn mp4_config(codec: Codec) -> Mp4Config {
    let mut compatible_brands = vec![
        str_to_brand("isom"),
        str_to_brand("iso2"),
        str_to_brand("mp41"),
    ];
    compatible_brands.push(match codec {
        Codec::Avc => str_to_brand("avc1"),
        Codec::Hevc => str_to_brand("hvc1"),
    });
    Mp4Config {
        major_brand: str_to_brand("isom"),
        minor_version: 512,
        compatible_brands,
        timescale: MOVIE_TIMESCALE,
    }
}

fn str_to_brand(s: &str) -> mp4::FourCC {
    let bytes = s.as_bytes();
    mp4::FourCC {
        value: [
            bytes.first().copied().unwrap_or(0),
            bytes.get(1).copied().unwrap_or(0),
            bytes.get(2).copied().unwrap_or(0),
            bytes.get(3).copied().unwrap_or(0),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxer::sink::MemorySink;

    fn track() -> TrackParams {
        TrackParams {
            codec: Codec::Avc,
            width: 64,
            height: 48,
            sample_duration: 3000,
            vps: Vec::new(),
            sps: vec![0x67, 0x42, 0xc0, 0x0a, 0xda],
            pps: vec![0x68, 0xce, 0x38, 0x80],
        }
    }

    fn write_two_samples(writer: &mut dyn ContainerWriter) {
        let data = [0, 0, 0, 2, 0x65, 0x88];
        for i in 0..2u64 {
            writer
                .write_sample(&Sample {
                    data: &data,
                    start_time: i * 3000,
                    duration: 3000,
                    sync: i == 0,
                })
                .unwrap();
        }
    }

    #[test]
    fn test_progressive_patches_mdat_size() {
        let sink = MemorySink::new();
        let mut writer =
            Box::new(ProgressiveWriter::new(Box::new(sink.clone()), Codec::Avc).unwrap());
        writer.begin_track(&track()).unwrap();
        write_two_samples(writer.as_mut());
        writer.close().unwrap();

        let data = sink.contents();
        assert_eq!(&data[4..8], b"ftyp");
        assert!(data.windows(4).any(|w| w == b"moov"));
        // at least one write lands behind the furthest byte already written
        let mut end = 0;
        let mut patched = false;
        for w in sink.writes() {
            if w.offset < end {
                patched = true;
            }
            end = end.max(w.offset + w.len as u64);
        }
        assert!(patched);
    }

    #[test]
    fn test_sample_before_track_is_rejected() {
        let mut writer = ProgressiveWriter::new(Box::new(MemorySink::new()), Codec::Avc).unwrap();
        let err = writer
            .write_sample(&Sample {
                data: &[0, 0, 0, 1, 0x65],
                start_time: 0,
                duration: 3000,
                sync: true,
            })
            .unwrap_err();
        assert!(matches!(err, Error::Mux(_)));
    }

    #[test]
    fn test_mp4_io_error_maps_to_mux() {
        let err = from_mp4_error(mp4::Error::IoError(std::io::Error::other("boom")));
        assert!(matches!(err, Error::Mux(_)));
    }
}
