//! ISO BMFF box builders shared by the hand-written container writers

use super::nal::unescape_rbsp;
use super::{Codec, TrackParams, MOVIE_TIMESCALE, TIMESCALE};

pub(super) const TRACK_ID: u32 = 1;

const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// `und` packed as ISO-639-2/T
const LANGUAGE_UND: u16 = 0x55C4;

/// Big-endian field appenders for box payloads
pub(super) trait BoxFields {
    fn u8(&mut self, v: u8) -> &mut Self;
    fn u16(&mut self, v: u16) -> &mut Self;
    fn u32(&mut self, v: u32) -> &mut Self;
    fn u64(&mut self, v: u64) -> &mut Self;
    fn zeros(&mut self, n: usize) -> &mut Self;
    fn bytes(&mut self, b: &[u8]) -> &mut Self;
}

impl BoxFields for Vec<u8> {
    fn u8(&mut self, v: u8) -> &mut Self {
        self.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn u64(&mut self, v: u64) -> &mut Self {
        self.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn zeros(&mut self, n: usize) -> &mut Self {
        self.resize(self.len() + n, 0);
        self
    }

    fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.extend_from_slice(b);
        self
    }
}

pub(super) fn mp4_box(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::<u8>::with_capacity(8 + payload.len());
    out.u32((8 + payload.len()) as u32).bytes(kind).bytes(payload);
    out
}

pub(super) fn full_box(kind: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::<u8>::with_capacity(4 + payload.len());
    body.u32(((version as u32) << 24) | (flags & 0x00FF_FFFF))
        .bytes(payload);
    mp4_box(kind, &body)
}

pub(super) fn container(kind: &[u8; 4], children: &[Vec<u8>]) -> Vec<u8> {
    mp4_box(kind, &children.concat())
}

/// `ftyp` with major brand `isom`, the given brands and the codec brand
pub(super) fn ftyp(codec: Codec, brands: &[&[u8; 4]]) -> Vec<u8> {
    let mut payload = Vec::<u8>::new();
    payload.bytes(b"isom").u32(0x200).bytes(b"isom");
    for brand in brands {
        payload.bytes(*brand);
    }
    payload.bytes(match codec {
        Codec::Avc => b"avc1",
        Codec::Hevc => b"hvc1",
    });
    mp4_box(b"ftyp", &payload)
}

/// Track duration in [`TIMESCALE`] ticks rescaled to [`MOVIE_TIMESCALE`]
fn movie_duration(ticks: u64) -> u64 {
    (ticks as u128 * MOVIE_TIMESCALE as u128 / TIMESCALE as u128) as u64
}

/// Version 1 is needed once a duration no longer fits 32 bits
fn time_fields(p: &mut Vec<u8>, lead: u32, duration: u64) -> u8 {
    match u32::try_from(duration) {
        Ok(short) => {
            p.u32(0).u32(0).u32(lead).u32(short);
            0
        }
        Err(_) => {
            p.u64(0).u64(0).u32(lead).u64(duration);
            1
        }
    }
}

/// Movie header; `ticks` is the track duration at [`TIMESCALE`]
pub(super) fn mvhd(ticks: u64) -> Vec<u8> {
    let mut p = Vec::<u8>::with_capacity(108);
    let version = time_fields(&mut p, MOVIE_TIMESCALE, movie_duration(ticks));
    p.u32(0x0001_0000) // rate 1.0
        .u16(0x0100) // volume 1.0
        .zeros(10);
    for v in UNITY_MATRIX {
        p.u32(v);
    }
    p.zeros(24).u32(TRACK_ID + 1);
    full_box(b"mvhd", version, 0, &p)
}

/// Video `trak` whose `stbl` holds `stsd` followed by `sample_tables`
pub(super) fn trak(track: &TrackParams, ticks: u64, sample_tables: &[Vec<u8>]) -> Vec<u8> {
    container(b"trak", &[tkhd(track, ticks), mdia(track, ticks, sample_tables)])
}

fn tkhd(track: &TrackParams, ticks: u64) -> Vec<u8> {
    let duration = movie_duration(ticks);
    let mut p = Vec::<u8>::with_capacity(92);
    let version = match u32::try_from(duration) {
        Ok(short) => {
            p.u32(0).u32(0).u32(TRACK_ID).u32(0).u32(short);
            0
        }
        Err(_) => {
            p.u64(0).u64(0).u32(TRACK_ID).u32(0).u64(duration);
            1
        }
    };
    p.zeros(8)
        .u16(0) // layer
        .u16(0) // alternate_group
        .u16(0) // volume
        .u16(0);
    for v in UNITY_MATRIX {
        p.u32(v);
    }
    p.u32(track.width << 16).u32(track.height << 16);
    // enabled | in_movie
    full_box(b"tkhd", version, 0x03, &p)
}

fn mdia(track: &TrackParams, ticks: u64, sample_tables: &[Vec<u8>]) -> Vec<u8> {
    let mut mdhd = Vec::<u8>::with_capacity(32);
    let version = time_fields(&mut mdhd, TIMESCALE, ticks);
    mdhd.u16(LANGUAGE_UND).u16(0);

    let mut hdlr = Vec::<u8>::with_capacity(40);
    hdlr.u32(0).bytes(b"vide").zeros(12).bytes(b"VideoHandler\0");

    container(
        b"mdia",
        &[
            full_box(b"mdhd", version, 0, &mdhd),
            full_box(b"hdlr", 0, 0, &hdlr),
            minf(track, sample_tables),
        ],
    )
}

fn minf(track: &TrackParams, sample_tables: &[Vec<u8>]) -> Vec<u8> {
    let vmhd = full_box(b"vmhd", 0, 1, &[0u8; 8]);

    let url = full_box(b"url ", 0, 1, &[]);
    let mut dref = Vec::<u8>::new();
    dref.u32(1).bytes(&url);
    let dinf = container(b"dinf", &[full_box(b"dref", 0, 0, &dref)]);

    let mut stsd = Vec::<u8>::new();
    stsd.u32(1).bytes(&sample_entry(track));
    let mut stbl = vec![full_box(b"stsd", 0, 0, &stsd)];
    stbl.extend_from_slice(sample_tables);

    container(b"minf", &[vmhd, dinf, container(b"stbl", &stbl)])
}

/// Sample tables with no entries, for files whose samples live in fragments
pub(super) fn empty_sample_tables() -> Vec<Vec<u8>> {
    vec![
        full_box(b"stts", 0, 0, &0u32.to_be_bytes()),
        full_box(b"stsc", 0, 0, &0u32.to_be_bytes()),
        full_box(b"stsz", 0, 0, &[0u8; 8]),
        full_box(b"stco", 0, 0, &0u32.to_be_bytes()),
    ]
}

fn sample_entry(track: &TrackParams) -> Vec<u8> {
    let mut p = Vec::<u8>::with_capacity(160);
    p.zeros(6)
        .u16(1) // data_reference_index
        .zeros(16)
        .u16(track.width as u16)
        .u16(track.height as u16)
        .u32(0x0048_0000) // 72 dpi
        .u32(0x0048_0000)
        .u32(0)
        .u16(1) // frame_count
        .zeros(32) // compressorname
        .u16(0x0018) // depth
        .u16(0xFFFF); // pre_defined = -1

    match track.codec {
        Codec::Avc => {
            p.bytes(&avcc(&track.sps, &track.pps));
            mp4_box(b"avc1", &p)
        }
        Codec::Hevc => {
            p.bytes(&hvcc(track));
            // parameter sets also travel in-band
            mp4_box(b"hev1", &p)
        }
    }
}

fn avcc(sps: &[u8], pps: &[u8]) -> Vec<u8> {
    let byte = |i: usize| sps.get(i).copied().unwrap_or(0);
    let mut p = Vec::<u8>::with_capacity(11 + sps.len() + pps.len());
    p.u8(1)
        .u8(byte(1)) // profile_idc
        .u8(byte(2)) // constraint flags
        .u8(byte(3)) // level_idc
        .u8(0xFF) // 4-byte lengths
        .u8(0xE1) // one SPS
        .u16(sps.len() as u16)
        .bytes(sps)
        .u8(1)
        .u16(pps.len() as u16)
        .bytes(pps);
    mp4_box(b"avcC", &p)
}

/// general_profile_tier_level fields copied out of an HEVC SPS
struct HevcProfile {
    profile: u8,
    compatibility: [u8; 4],
    constraints: [u8; 6],
    level: u8,
}

impl HevcProfile {
    const MAIN: HevcProfile = HevcProfile {
        profile: 0x01,
        compatibility: [0x60, 0, 0, 0],
        constraints: [0; 6],
        level: 93,
    };

    /// Profile bytes sit right after the 2-byte header and one byte of ids
    fn from_sps(sps: &[u8]) -> Self {
        let rbsp = unescape_rbsp(sps);
        if rbsp.len() < 15 {
            return Self::MAIN;
        }
        let mut profile = Self::MAIN;
        profile.profile = rbsp[3];
        profile.compatibility.copy_from_slice(&rbsp[4..8]);
        profile.constraints.copy_from_slice(&rbsp[8..14]);
        profile.level = rbsp[14];
        profile
    }
}

fn hvcc(track: &TrackParams) -> Vec<u8> {
    let profile = HevcProfile::from_sps(&track.sps);
    let arrays: Vec<(u8, &[u8])> = [(32u8, &track.vps), (33, &track.sps), (34, &track.pps)]
        .into_iter()
        .filter(|(_, nal)| !nal.is_empty())
        .map(|(kind, nal)| (kind, nal.as_slice()))
        .collect();

    let mut p = Vec::<u8>::new();
    p.u8(1)
        .u8(profile.profile)
        .bytes(&profile.compatibility)
        .bytes(&profile.constraints)
        .u8(profile.level)
        .u16(0xF000) // min_spatial_segmentation_idc
        .u8(0xFC) // parallelismType
        .u8(0xFD) // chroma_format_idc = 4:2:0
        .u8(0xF8) // bit_depth_luma_minus8
        .u8(0xF8) // bit_depth_chroma_minus8
        .u16(0) // avgFrameRate
        .u8(0x0F) // one temporal layer, nested, 4-byte lengths
        .u8(arrays.len() as u8);
    for (kind, nal) in arrays {
        p.u8(kind).u16(1).u16(nal.len() as u16).bytes(nal);
    }
    mp4_box(b"hvcC", &p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avcc_copies_profile_bytes() {
        let avcc = avcc(&[0x67, 0x42, 0xc0, 0x1e, 0xda], &[0x68, 0xce]);
        assert_eq!(&avcc[4..8], b"avcC");
        assert_eq!(&avcc[8..13], &[1, 0x42, 0xc0, 0x1e, 0xff]);
    }

    #[test]
    fn test_hevc_profile_falls_back_to_main() {
        let short = HevcProfile::from_sps(&[0x42, 0x01, 0x01]);
        assert_eq!(short.profile, 0x01);
        assert_eq!(short.level, 93);

        let mut sps: Vec<u8> = vec![
            0x42, 0x01, 0x01, 0x02, 0x20, 0, 0, 0, 0x90, 0, 0, 0, 0, 0, 0x78, 0xa0,
        ];
        let parsed = HevcProfile::from_sps(&sps);
        assert_eq!(parsed.profile, 0x02);
        assert_eq!(parsed.level, 0x78);
        // an emulation-prevention byte ahead of the profile fields is skipped
        sps.splice(3..3, [3]);
        sps[1] = 0;
        sps[2] = 0;
        let escaped = HevcProfile::from_sps(&sps);
        assert_eq!(escaped.profile, 0x02);
        assert_eq!(escaped.level, 0x78);
    }

    #[test]
    fn test_mvhd_switches_to_version_1_for_long_durations() {
        let short = mvhd(90_000);
        assert_eq!(short[8], 0);
        assert_eq!(short.len(), 108);
        // duration field: 1 second at the movie timescale
        assert_eq!(&short[24..28], &MOVIE_TIMESCALE.to_be_bytes());

        let long = mvhd(u64::from(u32::MAX) * 100_000);
        assert_eq!(long[8], 1);
        assert_eq!(long.len(), 120);
    }

    #[test]
    fn test_ftyp_lists_codec_brand_last() {
        let ftyp = ftyp(Codec::Hevc, &[b"iso2"]);
        assert_eq!(&ftyp[4..8], b"ftyp");
        assert_eq!(&ftyp[ftyp.len() - 8..ftyp.len() - 4], b"iso2");
        assert_eq!(&ftyp[ftyp.len() - 4..], b"hvc1");
    }
}
