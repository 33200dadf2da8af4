//! Fragmented MP4 writer
//!
//! Writes `ftyp` + `moov` (with `mvex`) when the track begins, then one
//! `moof` + `mdat` pair per sample. Every write extends the stream, so any
//! append-only sink works.

use super::boxes::{self, container, full_box, BoxFields, TRACK_ID};
use super::sink::{sink_error, SinkWriter, WriteSink};
use super::{ContainerWriter, Sample, TrackParams};
use crate::{Error, Result};
use std::io::Write;

const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x02_0000;
const TRUN_DATA_OFFSET: u32 = 0x00_0001;
const TRUN_SAMPLE_DURATION: u32 = 0x00_0100;
const TRUN_SAMPLE_SIZE: u32 = 0x00_0200;
const TRUN_SAMPLE_FLAGS: u32 = 0x00_0400;

/// sample_depends_on = 2 (no other samples)
const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000;
/// sample_depends_on = 1, sample_is_non_sync_sample = 1
const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;

/// Fragmented MP4 container writer
pub struct FragmentedWriter {
    out: SinkWriter,
    track: Option<TrackParams>,
    sequence: u32,
}

impl FragmentedWriter {
    pub fn new(sink: Box<dyn WriteSink>) -> Self {
        Self {
            out: SinkWriter::new(sink),
            track: None,
            sequence: 0,
        }
    }
}

impl ContainerWriter for FragmentedWriter {
    fn begin_track(&mut self, track: &TrackParams) -> Result<()> {
        if self.track.is_some() {
            return Err(Error::Mux("track already declared".to_string()));
        }
        let mut init = boxes::ftyp(track.codec, &[b"iso5", b"iso6", b"mp41"]);
        init.extend_from_slice(&moov(track));
        self.out.write_all(&init).map_err(sink_error)?;
        self.track = Some(track.clone());
        Ok(())
    }

    fn write_sample(&mut self, sample: &Sample<'_>) -> Result<()> {
        if self.track.is_none() {
            return Err(Error::Mux("sample written before the track".to_string()));
        }
        let mdat_len = u32::try_from(sample.data.len() + 8)
            .map_err(|_| Error::Mux(format!("{} byte sample is too large", sample.data.len())))?;

        self.sequence += 1;
        let moof = moof(self.sequence, sample);
        let mut header = Vec::<u8>::with_capacity(8);
        header.u32(mdat_len).bytes(b"mdat");

        self.out.write_all(&moof).map_err(sink_error)?;
        self.out.write_all(&header).map_err(sink_error)?;
        self.out.write_all(sample.data).map_err(sink_error)?;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        if self.track.is_none() {
            tracing::warn!("closing fragmented file that never received a picture");
        }
        self.out.flush().map_err(sink_error)
    }
}

fn moov(track: &TrackParams) -> Vec<u8> {
    container(
        b"moov",
        &[
            boxes::mvhd(0),
            boxes::trak(track, 0, &boxes::empty_sample_tables()),
            mvex(track),
        ],
    )
}

fn mvex(track: &TrackParams) -> Vec<u8> {
    let mut trex = Vec::<u8>::with_capacity(20);
    trex.u32(TRACK_ID)
        .u32(1) // sample description index
        .u32(track.sample_duration)
        .u32(0)
        .u32(0);
    container(b"mvex", &[full_box(b"trex", 0, 0, &trex)])
}

fn moof(sequence: u32, sample: &Sample<'_>) -> Vec<u8> {
    const TRUN_LEN: usize = 12 + 4 + 4 + 12;

    let mfhd = full_box(b"mfhd", 0, 0, &sequence.to_be_bytes());
    let tfhd = full_box(b"tfhd", 0, TFHD_DEFAULT_BASE_IS_MOOF, &TRACK_ID.to_be_bytes());
    let tfdt = full_box(b"tfdt", 1, 0, &sample.start_time.to_be_bytes());

    let moof_len = 8 + mfhd.len() + 8 + tfhd.len() + tfdt.len() + TRUN_LEN;
    let mut trun = Vec::<u8>::with_capacity(TRUN_LEN - 12);
    trun.u32(1) // sample_count
        .u32((moof_len + 8) as u32) // data_offset from moof to mdat payload
        .u32(sample.duration)
        .u32(sample.data.len() as u32)
        .u32(if sample.sync {
            SAMPLE_FLAGS_SYNC
        } else {
            SAMPLE_FLAGS_NON_SYNC
        });
    let trun = full_box(
        b"trun",
        0,
        TRUN_DATA_OFFSET | TRUN_SAMPLE_DURATION | TRUN_SAMPLE_SIZE | TRUN_SAMPLE_FLAGS,
        &trun,
    );
    debug_assert_eq!(trun.len(), TRUN_LEN);

    let traf = container(b"traf", &[tfhd, tfdt, trun]);
    container(b"moof", &[mfhd, traf])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxer::sink::MemorySink;
    use crate::muxer::Codec;

    fn boxes(data: &[u8]) -> Vec<(String, usize)> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos + 8 <= data.len() {
            let size = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            out.push((String::from_utf8_lossy(&data[pos + 4..pos + 8]).into_owned(), size));
            pos += size;
        }
        out
    }

    fn track(codec: Codec) -> TrackParams {
        TrackParams {
            codec,
            width: 64,
            height: 48,
            sample_duration: 3000,
            vps: Vec::new(),
            sps: vec![0x67, 0x42, 0xc0, 0x0a, 0xda],
            pps: vec![0x68, 0xce, 0x38, 0x80],
        }
    }

    #[test]
    fn test_init_segment_then_fragments() {
        let sink = MemorySink::new();
        let mut writer = Box::new(FragmentedWriter::new(Box::new(sink.clone())));
        writer.begin_track(&track(Codec::Avc)).unwrap();
        for i in 0..3u64 {
            let data = [0, 0, 0, 2, 0x65, 0x88];
            writer
                .write_sample(&Sample {
                    data: &data,
                    start_time: i * 3000,
                    duration: 3000,
                    sync: i == 0,
                })
                .unwrap();
        }
        writer.close().unwrap();

        let data = sink.contents();
        let names: Vec<String> = boxes(&data).into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["ftyp", "moov", "moof", "mdat", "moof", "mdat", "moof", "mdat"]
        );
        // every write extends the stream
        let mut end = 0;
        for w in sink.writes() {
            assert_eq!(w.offset, end);
            end += w.len as u64;
        }
    }

    #[test]
    fn test_trun_data_offset_points_at_payload() {
        let sample = Sample {
            data: &[1, 2, 3, 4],
            start_time: 0,
            duration: 3000,
            sync: true,
        };
        let moof = moof(1, &sample);
        let offset = u32::from_be_bytes(moof[moof.len() - 16..moof.len() - 12].try_into().unwrap());
        assert_eq!(offset as usize, moof.len() + 8);
        assert_eq!(
            u32::from_be_bytes(moof[moof.len() - 4..].try_into().unwrap()),
            SAMPLE_FLAGS_SYNC
        );
    }

    #[test]
    fn test_sample_before_track() {
        let mut writer = FragmentedWriter::new(Box::new(MemorySink::new()));
        let err = writer
            .write_sample(&Sample {
                data: &[],
                start_time: 0,
                duration: 1,
                sync: true,
            })
            .unwrap_err();
        assert!(matches!(err, Error::Mux(_)));
    }
}
