//! Reference H.264 compressor built from I_PCM macroblocks
//!
//! Produces a conformant Constrained Baseline stream: SPS and PPS ahead of
//! every IDR, then one or more I slices whose macroblocks carry raw samples.
//! There is no prediction, transform or entropy coding, so output size depends
//! only on frame size and slicing, never on content or QP.

use super::bitstream::{write_nal, BitWriter};
use super::workspace::WorkspaceSizes;
use super::{Compressor, CompressorConfig, FrameOutcome, FrameType, RunParams};
use crate::frame::PlanarFrame;
use crate::{Error, Result};

/// Bytes reserved at the start of the persistent workspace for SPS + PPS
const PARAM_REGION: usize = 256;

/// Raw bytes carried by one 4:2:0 macroblock
const MB_SAMPLES: usize = 256 + 64 + 64;

/// Conservative per-slice header cost used when splitting slices
const SLICE_OVERHEAD: usize = 16;

const LOG2_MAX_FRAME_NUM: u8 = 8;

const NAL_SPS: u8 = 0x67;
const NAL_PPS: u8 = 0x68;
const NAL_IDR: u8 = 0x65;
const NAL_NON_IDR: u8 = 0x41;

/// I_PCM reference compressor
#[derive(Debug, Default)]
pub struct PcmCompressor {
    geometry: Option<Geometry>,
    temporal_denoise: bool,
    sps_len: usize,
    pps_len: usize,
    frame_num: u32,
    idr_pic_id: u32,
    qp: Option<u8>,
    last_frame_bytes: usize,
    has_reference: bool,
}

#[derive(Debug, Clone, Copy)]
struct Geometry {
    width: usize,
    height: usize,
    mb_width: usize,
    mb_height: usize,
}

impl Geometry {
    fn new(width: u32, height: u32) -> Self {
        let (width, height) = (width as usize, height as usize);
        Self {
            width,
            height,
            mb_width: width.div_ceil(16),
            mb_height: height.div_ceil(16),
        }
    }

    fn mb_count(&self) -> usize {
        self.mb_width * self.mb_height
    }

    fn padded_luma_width(&self) -> usize {
        self.mb_width * 16
    }

    fn padded_luma_len(&self) -> usize {
        self.mb_count() * 256
    }

    fn padded_chroma_len(&self) -> usize {
        self.mb_count() * 64
    }

    fn padded_len(&self) -> usize {
        self.mb_count() * MB_SAMPLES
    }
}

impl PcmCompressor {
    pub fn new() -> Self {
        Self::default()
    }

    fn geometry(&self) -> Result<Geometry> {
        self.geometry
            .ok_or_else(|| Error::Encode("compressor used before init".to_string()))
    }

    fn choose_qp(&mut self, run: &RunParams) -> u8 {
        let (lo, hi) = (run.qp_min.min(run.qp_max), run.qp_max.max(run.qp_min));
        let qp = match (run.desired_frame_bytes, self.qp) {
            (0, _) => lo,
            (_, None) => 26u8.clamp(lo, hi),
            (budget, Some(prev)) => {
                if self.last_frame_bytes > budget {
                    prev.saturating_add(1)
                } else if self.last_frame_bytes < budget {
                    prev.saturating_sub(1)
                } else {
                    prev
                }
            }
        };
        let qp = qp.clamp(lo, hi);
        self.qp = Some(qp);
        qp
    }
}

impl Compressor for PcmCompressor {
    fn name(&self) -> &'static str {
        "pcm"
    }

    fn workspace_sizes(&self, config: &CompressorConfig) -> Result<WorkspaceSizes> {
        if config.width % 2 != 0 || config.height % 2 != 0 {
            return Err(Error::InvalidSize(format!(
                "frame size {}x{} is not a multiple of 2",
                config.width, config.height
            )));
        }
        let geometry = Geometry::new(config.width, config.height);
        let history = if config.temporal_denoise {
            geometry.padded_len()
        } else {
            0
        };
        Ok(WorkspaceSizes {
            persist: PARAM_REGION + history,
            scratch: geometry.padded_len(),
        })
    }

    fn init(&mut self, config: &CompressorConfig, persist: &mut [u8]) -> Result<()> {
        let geometry = Geometry::new(config.width, config.height);

        let mut params = Vec::with_capacity(64);
        write_nal(&mut params, &[NAL_SPS], &sequence_parameter_set(&geometry));
        let sps_len = params.len();
        write_nal(&mut params, &[NAL_PPS], &picture_parameter_set());
        let pps_len = params.len() - sps_len;

        if params.len() > PARAM_REGION || persist.len() < PARAM_REGION {
            return Err(Error::InvalidSize(format!(
                "parameter sets need {} bytes of a {} byte workspace",
                params.len(),
                persist.len()
            )));
        }
        persist[..params.len()].copy_from_slice(&params);

        *self = Self {
            geometry: Some(geometry),
            temporal_denoise: config.temporal_denoise,
            sps_len,
            pps_len,
            ..Self::default()
        };
        Ok(())
    }

    fn encode(
        &mut self,
        persist: &mut [u8],
        scratch: &mut [u8],
        run: &RunParams,
        frame: &PlanarFrame<'_>,
        emit: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<FrameOutcome> {
        let geometry = self.geometry()?;
        if frame.width as usize != geometry.width || frame.height as usize != geometry.height {
            return Err(Error::Encode(format!(
                "frame is {}x{}, compressor was initialised for {}x{}",
                frame.width, frame.height, geometry.width, geometry.height
            )));
        }
        if scratch.len() < geometry.padded_len() {
            return Err(Error::InvalidSize("scratch workspace too small".to_string()));
        }

        pad_frame(frame, &geometry, scratch);

        if self.temporal_denoise {
            let history = &mut persist[PARAM_REGION..PARAM_REGION + geometry.padded_len()];
            let current = &mut scratch[..geometry.padded_len()];
            if self.has_reference {
                for (cur, prev) in current.iter_mut().zip(history.iter()) {
                    if cur.abs_diff(*prev) <= 2 {
                        *cur = *prev;
                    }
                }
            }
            history.copy_from_slice(current);
            self.has_reference = true;
        }

        let keyframe = run.frame_type == FrameType::Idr || self.qp.is_none();
        let qp = self.choose_qp(run);
        let mut bytes = 0usize;
        let mut units = 0usize;

        if keyframe {
            self.frame_num = 0;
            let (sps, rest) = persist[..self.sps_len + self.pps_len].split_at(self.sps_len);
            emit(sps)?;
            emit(rest)?;
            bytes += self.sps_len + self.pps_len;
            units += 2;
        }

        let total = geometry.mb_count();
        let per_slice = if run.desired_nalu_bytes == 0 {
            total
        } else {
            (run.desired_nalu_bytes.saturating_sub(SLICE_OVERHEAD) / (MB_SAMPLES + 1)).max(1)
        };

        let mut nal = Vec::with_capacity(per_slice.min(total) * (MB_SAMPLES + 8) + SLICE_OVERHEAD);
        let mut first_mb = 0;
        while first_mb < total {
            let last_mb = (first_mb + per_slice).min(total);
            let rbsp = self.slice(&geometry, scratch, keyframe, qp, first_mb..last_mb);
            nal.clear();
            write_nal(&mut nal, &[if keyframe { NAL_IDR } else { NAL_NON_IDR }], &rbsp);
            emit(&nal)?;
            bytes += nal.len();
            units += 1;
            first_mb = last_mb;
        }

        if keyframe {
            self.idr_pic_id = (self.idr_pic_id + 1) % 65536;
        }
        self.frame_num = (self.frame_num + 1) % (1 << LOG2_MAX_FRAME_NUM);
        self.last_frame_bytes = bytes;

        Ok(FrameOutcome {
            keyframe,
            qp,
            units,
            bytes,
        })
    }
}

impl PcmCompressor {
    fn slice(
        &self,
        geometry: &Geometry,
        padded: &[u8],
        idr: bool,
        qp: u8,
        mbs: std::ops::Range<usize>,
    ) -> Vec<u8> {
        let mut w = BitWriter::with_capacity(mbs.len() * (MB_SAMPLES + 2) + SLICE_OVERHEAD);

        w.put_ue(mbs.start as u32); // first_mb_in_slice
        w.put_ue(7); // slice_type: I, all slices
        w.put_ue(0); // pic_parameter_set_id
        w.put_bits(self.frame_num, LOG2_MAX_FRAME_NUM);
        if idr {
            w.put_ue(self.idr_pic_id);
            w.put_bit(false); // no_output_of_prior_pics_flag
            w.put_bit(false); // long_term_reference_flag
        } else {
            w.put_bit(false); // adaptive_ref_pic_marking_mode_flag
        }
        w.put_se(qp as i32 - 26); // slice_qp_delta
        w.put_ue(1); // disable_deblocking_filter_idc

        let luma_stride = geometry.padded_luma_width();
        let chroma_stride = luma_stride / 2;
        let (luma, chroma) = padded.split_at(geometry.padded_luma_len());
        let (cb, cr) = chroma.split_at(geometry.padded_chroma_len());

        for mb in mbs {
            let mb_x = mb % geometry.mb_width;
            let mb_y = mb / geometry.mb_width;

            w.put_ue(25); // mb_type I_PCM
            w.align_zero();
            for row in 0..16 {
                let start = (mb_y * 16 + row) * luma_stride + mb_x * 16;
                w.put_bytes(&luma[start..start + 16]);
            }
            for plane in [cb, cr] {
                for row in 0..8 {
                    let start = (mb_y * 8 + row) * chroma_stride + mb_x * 8;
                    w.put_bytes(&plane[start..start + 8]);
                }
            }
        }

        w.finish_rbsp()
    }
}

/// Copy a frame into the macroblock-aligned scratch layout, replicating the
/// right and bottom edges. Zero samples become 1 so no PCM sample is zero.
fn pad_frame(frame: &PlanarFrame<'_>, geometry: &Geometry, scratch: &mut [u8]) {
    let (luma, chroma) = scratch[..geometry.padded_len()].split_at_mut(geometry.padded_luma_len());
    let (cb, cr) = chroma.split_at_mut(geometry.padded_chroma_len());

    let luma_stride = geometry.padded_luma_width();
    pad_plane(
        frame.y(),
        geometry.width,
        geometry.height,
        luma,
        luma_stride,
        geometry.mb_height * 16,
    );
    for (src, dst) in [(frame.u(), cb), (frame.v(), cr)] {
        pad_plane(
            src,
            geometry.width / 2,
            geometry.height / 2,
            dst,
            luma_stride / 2,
            geometry.mb_height * 8,
        );
    }
}

fn pad_plane(src: &[u8], width: usize, height: usize, dst: &mut [u8], stride: usize, rows: usize) {
    for y in 0..rows {
        let src_row = &src[y.min(height - 1) * width..][..width];
        let dst_row = &mut dst[y * stride..(y + 1) * stride];
        for (x, out) in dst_row.iter_mut().enumerate() {
            *out = src_row[x.min(width - 1)].max(1);
        }
    }
}

fn sequence_parameter_set(geometry: &Geometry) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.put_bits(66, 8); // profile_idc: Baseline
    w.put_bits(0b1100_0000, 8); // constraint_set0 + constraint_set1
    w.put_bits(level_idc(geometry.mb_count()) as u32, 8);
    w.put_ue(0); // seq_parameter_set_id
    w.put_ue(LOG2_MAX_FRAME_NUM as u32 - 4);
    w.put_ue(2); // pic_order_cnt_type
    w.put_ue(1); // max_num_ref_frames
    w.put_bit(false); // gaps_in_frame_num_value_allowed_flag
    w.put_ue(geometry.mb_width as u32 - 1);
    w.put_ue(geometry.mb_height as u32 - 1);
    w.put_bit(true); // frame_mbs_only_flag
    w.put_bit(true); // direct_8x8_inference_flag

    let crop_right = (geometry.mb_width * 16 - geometry.width) / 2;
    let crop_bottom = (geometry.mb_height * 16 - geometry.height) / 2;
    let cropped = crop_right > 0 || crop_bottom > 0;
    w.put_bit(cropped);
    if cropped {
        w.put_ue(0);
        w.put_ue(crop_right as u32);
        w.put_ue(0);
        w.put_ue(crop_bottom as u32);
    }
    w.put_bit(false); // vui_parameters_present_flag
    w.finish_rbsp()
}

fn picture_parameter_set() -> Vec<u8> {
    let mut w = BitWriter::new();
    w.put_ue(0); // pic_parameter_set_id
    w.put_ue(0); // seq_parameter_set_id
    w.put_bit(false); // entropy_coding_mode_flag: CAVLC
    w.put_bit(false); // bottom_field_pic_order_in_frame_present_flag
    w.put_ue(0); // num_slice_groups_minus1
    w.put_ue(0); // num_ref_idx_l0_default_active_minus1
    w.put_ue(0); // num_ref_idx_l1_default_active_minus1
    w.put_bit(false); // weighted_pred_flag
    w.put_bits(0, 2); // weighted_bipred_idc
    w.put_se(0); // pic_init_qp_minus26
    w.put_se(0); // pic_init_qs_minus26
    w.put_se(0); // chroma_qp_index_offset
    w.put_bit(true); // deblocking_filter_control_present_flag
    w.put_bit(false); // constrained_intra_pred_flag
    w.put_bit(false); // redundant_pic_cnt_present_flag
    w.finish_rbsp()
}

/// Smallest level whose MaxFS admits the frame
fn level_idc(mb_count: usize) -> u8 {
    const LEVELS: [(usize, u8); 10] = [
        (99, 10),
        (396, 11),
        (792, 21),
        (1620, 22),
        (3600, 31),
        (5120, 32),
        (8192, 40),
        (22080, 50),
        (36864, 51),
        (139264, 60),
    ];
    LEVELS
        .iter()
        .find(|(max_fs, _)| mb_count <= *max_fs)
        .map(|(_, level)| *level)
        .unwrap_or(62)
}
