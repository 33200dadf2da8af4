//! Packed RGB to planar I420 conversion
//!
//! Uses the integer BT.601 studio-range approximation:
//!
//! ```text
//! Y  = ((  66 R + 129 G +  25 B) >> 8) +  16
//! Cb = (( -38 R -  74 G + 112 B) >> 8) + 128
//! Cr = (( 112 R -  94 G -  18 B) >> 8) + 128
//! ```
//!
//! Chroma is taken from the top-left pixel of every 2x2 output block rather
//! than averaged, so odd output rows only contribute luma.

use crate::frame::{validate_dimensions, yuv420_size, PackedFrame, PackedLayout};
use crate::{Error, Result};

#[inline]
fn luma(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b) >> 8) + 16) as u8
}

#[inline]
fn chroma_b(r: i32, g: i32, b: i32) -> u8 {
    (((-38 * r - 74 * g + 112 * b) >> 8) + 128) as u8
}

#[inline]
fn chroma_r(r: i32, g: i32, b: i32) -> u8 {
    (((112 * r - 94 * g - 18 * b) >> 8) + 128) as u8
}

/// Convert a packed image into `dst` as I420.
///
/// `width` and `height` must be positive and even. With `flip` set, output
/// row `y` is read from source row `height - 1 - y`; chroma subsampling
/// follows the parity of the output row.
pub fn rgb_to_yuv420(
    src: &[u8],
    width: u32,
    height: u32,
    layout: PackedLayout,
    flip: bool,
    dst: &mut [u8],
) -> Result<()> {
    validate_dimensions(width, height)?;

    let w = width as usize;
    let h = height as usize;
    let bpp = layout.format.bytes_per_pixel();
    let stride = layout.row_stride;
    let row_bytes = w
        .checked_mul(bpp)
        .ok_or_else(|| Error::InvalidInput(format!("row of {} pixels overflows", w)))?;

    if stride < row_bytes {
        return Err(Error::InvalidInput(format!(
            "row stride {} is smaller than one row of {} pixels ({} bytes)",
            stride,
            w,
            row_bytes
        )));
    }
    let needed = (h - 1)
        .checked_mul(stride)
        .and_then(|n| n.checked_add(row_bytes))
        .ok_or_else(|| {
            Error::InvalidInput(format!(
                "row stride {} over {} rows exceeds the address space",
                stride,
                h
            ))
        })?;
    if src.len() < needed {
        return Err(Error::InvalidInput(format!(
            "packed buffer holds {} bytes, {}x{} with stride {} needs {}",
            src.len(),
            w,
            h,
            stride,
            needed
        )));
    }
    let planar_len = yuv420_size(width, height);
    if dst.len() < planar_len {
        return Err(Error::InvalidInput(format!(
            "planar buffer holds {} bytes, {}x{} needs {}",
            dst.len(),
            w,
            h,
            planar_len
        )));
    }

    let (y_plane, chroma) = dst[..planar_len].split_at_mut(w * h);
    let (u_plane, v_plane) = chroma.split_at_mut((w / 2) * (h / 2));

    for y in 0..h {
        let src_row = if flip { h - 1 - y } else { y };
        let start = src_row * stride;
        let row = &src[start..start + row_bytes];
        let out = &mut y_plane[y * w..(y + 1) * w];

        for (x, px) in row.chunks_exact(bpp).enumerate() {
            out[x] = luma(px[0] as i32, px[1] as i32, px[2] as i32);
        }

        if y % 2 == 0 {
            let chroma_row = (y / 2) * (w / 2);
            for cx in 0..w / 2 {
                let px = &row[cx * 2 * bpp..cx * 2 * bpp + 3];
                let (r, g, b) = (px[0] as i32, px[1] as i32, px[2] as i32);
                u_plane[chroma_row + cx] = chroma_b(r, g, b);
                v_plane[chroma_row + cx] = chroma_r(r, g, b);
            }
        }
    }

    Ok(())
}

/// Convert a borrowed packed frame into a freshly allocated I420 buffer
pub fn rgb_to_yuv420_vec(
    frame: PackedFrame<'_>,
    width: u32,
    height: u32,
    flip: bool,
) -> Result<Vec<u8>> {
    validate_dimensions(width, height)?;
    let mut out = vec![0u8; yuv420_size(width, height)];
    rgb_to_yuv420(frame.data, width, height, frame.layout, flip, &mut out)?;
    Ok(out)
}
