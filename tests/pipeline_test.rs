//! Integration tests for the encode -> mux pipeline

mod common;

use common::*;
use h264mp4::{
    Context, EncoderOptions, Error, MemorySink, MuxerOptions, PackedFormat, PackedFrame,
};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;

fn encode_gray_clip(
    options: EncoderOptions,
    frames: u32,
) -> (MemorySink, Vec<h264mp4::FrameReport>) {
    init_tracing();
    let sink = MemorySink::new();
    let mut ctx = Context::new();
    let encoder = ctx.create_encoder(options, Box::new(sink.clone())).unwrap();

    let reports = (0..frames)
        .map(|i| {
            let frame = gray_frame(WIDTH, HEIGHT, 16 + (i % 200) as u8);
            ctx.encode_yuv(encoder, &frame).unwrap()
        })
        .collect();
    ctx.finalize_encoder(encoder).unwrap();
    assert_eq!(ctx.encoder_count(), 0);
    assert_eq!(ctx.muxer_count(), 0);
    (sink, reports)
}

#[test]
fn test_progressive_clip() {
    let (sink, reports) = encode_gray_clip(EncoderOptions::new(WIDTH, HEIGHT), 30);
    assert_eq!(reports.len(), 30);

    let data = sink.contents();
    let names = box_names(&data);
    assert_eq!(names.first().map(String::as_str), Some("ftyp"));
    assert!(names.iter().any(|n| n == "mdat"));
    assert_eq!(names.last().map(String::as_str), Some("moov"));
    assert!(has_patch(&sink.writes()), "mdat size should be patched");
}

#[test]
fn test_gray_clip_through_caller_muxer_has_no_gaps() {
    init_tracing();
    let sink = MemorySink::new();
    let mut ctx = Context::new();
    let muxer = ctx
        .create_muxer(MuxerOptions::new(WIDTH, HEIGHT), Box::new(sink.clone()))
        .unwrap();
    let encoder = ctx
        .create_encoder_for_muxer(EncoderOptions::new(WIDTH, HEIGHT), muxer)
        .unwrap();

    let frame = gray_frame(WIDTH, HEIGHT, 128);
    let mut coded_bytes = 0;
    for _ in 0..30 {
        coded_bytes += ctx.encode_yuv(encoder, &frame).unwrap().bytes;
    }
    ctx.finalize_encoder(encoder).unwrap();

    assert!(coded_bytes > 0);
    assert!(!sink.is_empty());
    assert_no_gaps(&sink.writes());
}

#[test]
fn test_sequential_clip_has_no_patch() {
    let mut options = EncoderOptions::new(WIDTH, HEIGHT);
    options.sequential = true;
    let (sink, _) = encode_gray_clip(options, 10);

    let writes = sink.writes();
    assert_forward_only(&writes);
    assert!(!has_patch(&writes));
    let names = box_names(&sink.contents());
    assert_eq!(names.first().map(String::as_str), Some("ftyp"));
    assert_eq!(names.iter().filter(|n| *n == "mdat").count(), 10);
    assert_eq!(names.last().map(String::as_str), Some("moov"));
}

#[test]
fn test_sequential_clip_reaches_sink_before_finalize() {
    init_tracing();
    let sink = MemorySink::new();
    let mut ctx = Context::new();
    let mut options = EncoderOptions::new(WIDTH, HEIGHT);
    options.sequential = true;
    let encoder = ctx.create_encoder(options, Box::new(sink.clone())).unwrap();

    let mut coded_bytes = 0;
    for i in 0..30 {
        let report = ctx
            .encode_yuv(encoder, &gray_frame(WIDTH, HEIGHT, 16 + i))
            .unwrap();
        coded_bytes += report.bytes;
    }

    // 29 pictures are closed; only the last one is still pending
    assert!(sink.writes().len() >= 29);
    assert!(sink.len() > coded_bytes / 2);
    assert_forward_only(&sink.writes());

    ctx.finalize_encoder(encoder).unwrap();
    assert_forward_only(&sink.writes());
    assert!(sink.len() > coded_bytes);
    assert_eq!(
        box_names(&sink.contents()).last().map(String::as_str),
        Some("moov")
    );
}

#[test]
fn test_fragmented_clip_has_one_fragment_per_frame() {
    let mut options = EncoderOptions::new(WIDTH, HEIGHT);
    options.fragmentation = true;
    let (sink, _) = encode_gray_clip(options, 12);

    assert!(!has_patch(&sink.writes()));
    let names = box_names(&sink.contents());
    assert_eq!(&names[..2], ["ftyp", "moov"]);
    assert_eq!(names.iter().filter(|n| *n == "moof").count(), 12);
    assert_eq!(names.iter().filter(|n| *n == "mdat").count(), 12);
}

#[test]
fn test_constant_qp_is_reported() {
    let mut options = EncoderOptions::new(WIDTH, HEIGHT);
    options.qp = 30;
    let (_, reports) = encode_gray_clip(options, 5);
    assert!(reports.iter().all(|r| r.qp == 30));
}

#[test]
fn test_bitrate_qp_stays_within_bounds() {
    let mut options = EncoderOptions::new(WIDTH, HEIGHT);
    options.kbps = 500;
    options.qp_min = 18;
    options.qp_max = 34;
    let (_, reports) = encode_gray_clip(options, 20);
    assert!(reports.iter().all(|r| (18..=34).contains(&r.qp)));
}

#[test]
fn test_gop_places_keyframes() {
    let mut options = EncoderOptions::new(WIDTH, HEIGHT);
    options.gop = 10;
    let (_, reports) = encode_gray_clip(options, 25);
    let keyframes: Vec<u64> = reports
        .iter()
        .filter(|r| r.keyframe)
        .map(|r| r.frame_index)
        .collect();
    assert_eq!(keyframes, [0, 10, 20]);
}

#[test]
fn test_finalize_invalidates_both_handles() {
    let mut ctx = Context::new();
    let encoder = ctx
        .create_encoder(EncoderOptions::new(WIDTH, HEIGHT), Box::new(MemorySink::new()))
        .unwrap();
    let muxer = ctx.encoder_muxer(encoder).unwrap();
    ctx.encode_yuv(encoder, &gray_frame(WIDTH, HEIGHT, 80)).unwrap();
    ctx.finalize_encoder(encoder).unwrap();

    assert!(matches!(
        ctx.encode_yuv(encoder, &gray_frame(WIDTH, HEIGHT, 80)),
        Err(Error::InvalidHandle(_))
    ));
    assert!(matches!(
        ctx.mux_write_nal(muxer, &annex_b(&[0x09, 0xf0])),
        Err(Error::InvalidHandle(_))
    ));
    assert!(matches!(
        ctx.finalize_encoder(encoder),
        Err(Error::InvalidHandle(_))
    ));
}

#[test]
fn test_encoder_sharing_a_caller_muxer() {
    init_tracing();
    let sink = MemorySink::new();
    let mut ctx = Context::new();
    let muxer = ctx
        .create_muxer(MuxerOptions::new(WIDTH, HEIGHT), Box::new(sink.clone()))
        .unwrap();
    let encoder = ctx
        .create_encoder_for_muxer(EncoderOptions::new(WIDTH, HEIGHT), muxer)
        .unwrap();
    assert_eq!(ctx.encoder_muxer(encoder).unwrap(), muxer);

    // a second encoder cannot take the same muxer
    assert!(matches!(
        ctx.create_encoder_for_muxer(EncoderOptions::new(WIDTH, HEIGHT), muxer),
        Err(Error::InvalidHandle(_))
    ));

    for i in 0..3 {
        ctx.encode_yuv(encoder, &gray_frame(WIDTH, HEIGHT, 40 + i)).unwrap();
    }
    ctx.finalize_encoder(encoder).unwrap();
    assert_eq!(ctx.muxer_count(), 0);
    assert!(box_names(&sink.contents()).iter().any(|n| n == "moov"));
}

#[test]
fn test_muxer_finalized_before_its_encoder() {
    init_tracing();
    let mut ctx = Context::new();
    let muxer = ctx
        .create_muxer(MuxerOptions::new(WIDTH, HEIGHT), Box::new(MemorySink::new()))
        .unwrap();
    let encoder = ctx
        .create_encoder_for_muxer(EncoderOptions::new(WIDTH, HEIGHT), muxer)
        .unwrap();
    ctx.encode_yuv(encoder, &gray_frame(WIDTH, HEIGHT, 50)).unwrap();
    ctx.finalize_muxer(muxer).unwrap();

    assert!(matches!(
        ctx.encode_yuv(encoder, &gray_frame(WIDTH, HEIGHT, 50)),
        Err(Error::InvalidHandle(_))
    ));
    ctx.finalize_encoder(encoder).unwrap();
    assert_eq!(ctx.encoder_count(), 0);
}

#[test]
fn test_rgb_and_image_inputs() {
    init_tracing();
    let sink = MemorySink::new();
    let mut ctx = Context::new();
    let encoder = ctx
        .create_encoder(EncoderOptions::new(WIDTH, HEIGHT), Box::new(sink.clone()))
        .unwrap();

    let img = generate_test_image(WIDTH, HEIGHT, [200, 40, 40]);
    let mut scratch = vec![0u8; h264mp4::yuv420_size(WIDTH, HEIGHT)];
    let report = ctx
        .encode_rgb(encoder, PackedFrame::from_rgb_image(&img), &mut scratch)
        .unwrap();
    assert!(report.keyframe);

    ctx.encode_packed(encoder, PackedFrame::from_rgb_image(&img))
        .unwrap();
    ctx.encode_image(encoder, &image::DynamicImage::ImageRgb8(img))
        .unwrap();
    assert_eq!(ctx.last_frame_report(encoder).unwrap().map(|r| r.frame_index), Some(2));

    ctx.finalize_encoder(encoder).unwrap();
    assert!(!sink.is_empty());
}

#[test]
fn test_oversized_row_stride_is_rejected() {
    let sink = MemorySink::new();
    let mut ctx = Context::new();
    let encoder = ctx
        .create_encoder(EncoderOptions::new(WIDTH, HEIGHT), Box::new(sink.clone()))
        .unwrap();

    let src = vec![0u8; (WIDTH * HEIGHT * 3) as usize];
    let frame = PackedFrame::new(&src, PackedFormat::Rgb, usize::MAX / 64);
    let err = ctx.encode_packed(encoder, frame).unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    // the session is still usable
    ctx.encode_packed(encoder, PackedFrame::rgb(&src, WIDTH)).unwrap();
    ctx.finalize_encoder(encoder).unwrap();
}

#[test]
fn test_dropping_context_leaves_sink_unfinished() {
    let sink = MemorySink::new();
    {
        let mut ctx = Context::new();
        let encoder = ctx
            .create_encoder(EncoderOptions::new(WIDTH, HEIGHT), Box::new(sink.clone()))
            .unwrap();
        ctx.encode_yuv(encoder, &gray_frame(WIDTH, HEIGHT, 90)).unwrap();
    }
    assert!(!contains(&sink.contents(), b"moov"));
}
