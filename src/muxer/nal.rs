//! Annex-B splitting and NAL unit classification

use super::Codec;

/// Iterator over the NAL payloads of an Annex-B buffer, start codes removed
///
/// Accepts both 3- and 4-byte start codes. Trailing zero bytes before the
/// next start code are dropped.
#[derive(Debug, Clone)]
pub struct NalUnits<'a> {
    data: &'a [u8],
    next: Option<usize>,
}

impl<'a> NalUnits<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            next: find_start_code(data, 0).map(|(_, payload)| payload),
        }
    }
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        loop {
            let start = self.next?;
            let end = match find_start_code(self.data, start) {
                Some((code, payload)) => {
                    self.next = Some(payload);
                    code
                }
                None => {
                    self.next = None;
                    self.data.len()
                }
            };
            let mut nal = &self.data[start..end];
            while let [rest @ .., 0] = nal {
                nal = rest;
            }
            if !nal.is_empty() {
                return Some(nal);
            }
        }
    }
}

/// Position of the next `00 00 01` at or after `from`, and of the byte after it
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    data.get(from..)?
        .windows(3)
        .position(|w| w == [0, 0, 1])
        .map(|i| (from + i, from + i + 3))
}

/// Parameter set kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamSetKind {
    Vps,
    Sps,
    Pps,
}

/// What the muxer does with a NAL unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalKind {
    ParameterSet(ParamSetKind),
    /// Coded slice
    Vcl { first_slice: bool, sync: bool },
    /// SEI; prefix SEI opens a new sample, suffix SEI trails the current one
    Sei { prefix: bool },
    /// Access unit delimiters, filler data and anything else not carried
    Dropped,
}

/// NAL unit type from the header; 0 for an empty unit
pub fn nal_type(codec: Codec, nal: &[u8]) -> u8 {
    let header = nal.first().copied().unwrap_or(0);
    match codec {
        Codec::Avc => header & 0x1f,
        Codec::Hevc => (header >> 1) & 0x3f,
    }
}

/// Classify a NAL payload (no start code, at least one byte)
pub fn classify(codec: Codec, nal: &[u8]) -> NalKind {
    let Some(&header) = nal.first() else {
        return NalKind::Dropped;
    };
    match codec {
        Codec::Avc => match header & 0x1f {
            // first_mb_in_slice == 0 is a single 1 bit
            t @ 1..=5 => NalKind::Vcl {
                first_slice: nal.get(1).is_some_and(|b| b & 0x80 != 0),
                sync: t == 5,
            },
            6 => NalKind::Sei { prefix: true },
            7 => NalKind::ParameterSet(ParamSetKind::Sps),
            8 => NalKind::ParameterSet(ParamSetKind::Pps),
            _ => NalKind::Dropped,
        },
        Codec::Hevc => match (header >> 1) & 0x3f {
            // first_slice_segment_in_pic_flag follows the two-byte header
            t @ 0..=31 => NalKind::Vcl {
                first_slice: nal.get(2).is_some_and(|b| b & 0x80 != 0),
                sync: (16..=23).contains(&t),
            },
            32 => NalKind::ParameterSet(ParamSetKind::Vps),
            33 => NalKind::ParameterSet(ParamSetKind::Sps),
            34 => NalKind::ParameterSet(ParamSetKind::Pps),
            39 => NalKind::Sei { prefix: true },
            40 => NalKind::Sei { prefix: false },
            _ => NalKind::Dropped,
        },
    }
}

/// Strip emulation-prevention bytes
pub fn unescape_rbsp(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len());
    let mut zeros = 0usize;
    for &byte in nal {
        if zeros >= 2 && byte == 3 {
            zeros = 0;
            continue;
        }
        out.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    out
}
