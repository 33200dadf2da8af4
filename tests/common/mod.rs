//! Common test utilities

#![allow(dead_code)]

use h264mp4::WriteSink;
use image::{ImageBuffer, Rgb, RgbImage};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Route library logs through the test harness
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Generate a test image with a solid color and a subtle gradient
pub fn generate_test_image(width: u32, height: u32, base_color: [u8; 3]) -> RgbImage {
    let mut img = ImageBuffer::new(width, height);

    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let r = base_color[0].saturating_add((x % 50) as u8);
        let g = base_color[1].saturating_add((y % 50) as u8);
        *pixel = Rgb([r, g, base_color[2]]);
    }

    img
}

/// Solid-color image without gradient
pub fn solid_image(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
    ImageBuffer::from_pixel(width, height, Rgb(color))
}

/// I420 frame with every luma sample at `luma` and neutral chroma
pub fn gray_frame(width: u32, height: u32, luma: u8) -> Vec<u8> {
    let luma_len = (width * height) as usize;
    let chroma_len = luma_len / 4;
    let mut frame = vec![luma; luma_len];
    frame.resize(luma_len + 2 * chroma_len, 128);
    frame
}

/// Prefix `payload` with a four-byte start code
pub fn annex_b(payload: &[u8]) -> Vec<u8> {
    let mut unit = vec![0, 0, 0, 1];
    unit.extend_from_slice(payload);
    unit
}

/// Sink that accepts `budget` calls and rejects every call after that
#[derive(Debug, Clone)]
pub struct FailingSink {
    budget: usize,
    calls: Arc<AtomicUsize>,
}

impl FailingSink {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl WriteSink for FailingSink {
    fn write_at(&mut self, _offset: u64, _data: &[u8]) -> io::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.budget {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::WriteZero, "disk full"))
        }
    }
}

/// Top-level MP4 boxes as (type, offset, size)
pub fn top_level_boxes(data: &[u8]) -> Vec<(String, usize, usize)> {
    let mut boxes = Vec::new();
    let mut pos = 0;
    while pos + 8 <= data.len() {
        let size =
            u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        let kind = String::from_utf8_lossy(&data[pos + 4..pos + 8]).into_owned();
        if size < 8 || pos + size > data.len() {
            break;
        }
        boxes.push((kind, pos, size));
        pos += size;
    }
    boxes
}

/// Names of the top-level boxes in order
pub fn box_names(data: &[u8]) -> Vec<String> {
    top_level_boxes(data).into_iter().map(|(kind, _, _)| kind).collect()
}

/// Whether `needle` occurs anywhere in `haystack`
pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Whether any write landed before the end of bytes already written
pub fn has_patch(writes: &[h264mp4::muxer::sink::WriteRecord]) -> bool {
    let mut end = 0u64;
    let mut patched = false;
    for w in writes {
        if w.offset < end {
            patched = true;
        }
        end = end.max(w.offset + w.len as u64);
    }
    patched
}

/// Every write starts at 0, then either extends the stream exactly or
/// overwrites bytes already written
pub fn assert_no_gaps(writes: &[h264mp4::muxer::sink::WriteRecord]) {
    assert_eq!(writes.first().map(|w| w.offset), Some(0));
    let mut end = 0u64;
    for w in writes {
        let w_end = w.offset + w.len as u64;
        assert!(
            w.offset == end || w_end <= end,
            "write at {} of {} bytes leaves a gap after {}",
            w.offset,
            w.len,
            end
        );
        end = end.max(w_end);
    }
}

/// Every write lands exactly at the end of the bytes already written
pub fn assert_forward_only(writes: &[h264mp4::muxer::sink::WriteRecord]) {
    let mut end = 0u64;
    for w in writes {
        assert_eq!(w.offset, end, "write of {} bytes does not extend the stream", w.len);
        end += w.len as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_test_image() {
        let img = generate_test_image(100, 100, [255, 0, 0]);
        assert_eq!(img.width(), 100);
        assert_eq!(img.height(), 100);
    }

    #[test]
    fn test_gray_frame_size() {
        assert_eq!(gray_frame(16, 8, 16).len(), 16 * 8 * 3 / 2);
    }

    #[test]
    fn test_top_level_boxes() {
        let mut data = vec![0, 0, 0, 8];
        data.extend_from_slice(b"free");
        data.extend_from_slice(&[0, 0, 0, 9]);
        data.extend_from_slice(b"mdat");
        data.push(7);
        assert_eq!(box_names(&data), ["free", "mdat"]);
    }
}
