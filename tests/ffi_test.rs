//! Integration tests for the C ABI

mod common;

use common::*;
use h264mp4::ffi::*;
use h264mp4::ErrorCode;
use libc::{c_int, c_void, size_t};
use std::ffi::{CStr, CString};
use std::ptr;

/// Positioned writes into the `Vec<u8>` behind `user_data`
unsafe extern "C" fn write_to_vec(
    user_data: *mut c_void,
    data: *const u8,
    size: size_t,
    offset: i64,
) -> c_int {
    let out = &mut *(user_data as *mut Vec<u8>);
    let bytes = std::slice::from_raw_parts(data, size);
    let start = offset as usize;
    if out.len() < start + size {
        out.resize(start + size, 0);
    }
    out[start..start + size].copy_from_slice(bytes);
    0
}

unsafe extern "C" fn always_fail(_: *mut c_void, _: *const u8, _: size_t, _: i64) -> c_int {
    -1
}

fn check(mut result: FfiResult) {
    if result.code != ErrorCode::Ok {
        let message = unsafe { CStr::from_ptr(result.message) }
            .to_string_lossy()
            .into_owned();
        unsafe { h264mp4_free_result(&mut result) };
        panic!("ffi call failed: {}", message);
    }
}

#[test]
fn test_encode_round_trip() {
    init_tracing();
    let mut out: Vec<u8> = Vec::new();
    let options = CString::new(r#"{"width": 64, "height": 48, "groupOfPictures": 5}"#).unwrap();

    unsafe {
        let ctx = h264mp4_context_new();
        let mut encoder = 0u32;
        check(h264mp4_create_encoder(
            ctx,
            options.as_ptr(),
            Some(write_to_vec),
            &mut out as *mut Vec<u8> as *mut c_void,
            &mut encoder,
        ));
        assert_ne!(encoder, 0);

        let yuv = gray_frame(64, 48, 100);
        for _ in 0..3 {
            check(h264mp4_encode_yuv(ctx, encoder, yuv.as_ptr(), yuv.len()));
        }

        let img = generate_test_image(64, 48, [20, 200, 20]);
        let scratch_len = h264mp4::yuv420_size(64, 48);
        let scratch = h264mp4_buffer_alloc(scratch_len);
        check(h264mp4_encode_rgb(
            ctx,
            encoder,
            img.as_raw().as_ptr(),
            img.as_raw().len(),
            64 * 3,
            3,
            scratch,
            scratch_len,
        ));
        check(h264mp4_encode_rgb(
            ctx,
            encoder,
            img.as_raw().as_ptr(),
            img.as_raw().len(),
            64 * 3,
            3,
            ptr::null_mut(),
            0,
        ));
        h264mp4_buffer_free(scratch, scratch_len);

        check(h264mp4_finalize_encoder(ctx, encoder));
        h264mp4_context_free(ctx);
    }

    let names = box_names(&out);
    assert_eq!(names.first().map(String::as_str), Some("ftyp"));
    assert_eq!(names.last().map(String::as_str), Some("moov"));
}

#[test]
fn test_errors_carry_codes_and_messages() {
    let mut out: Vec<u8> = Vec::new();
    unsafe {
        let ctx = h264mp4_context_new();
        let mut handle = 0u32;

        let odd = CString::new(r#"{"width": 63, "height": 48}"#).unwrap();
        let mut result = h264mp4_create_muxer(
            ctx,
            odd.as_ptr(),
            Some(write_to_vec),
            &mut out as *mut Vec<u8> as *mut c_void,
            &mut handle,
        );
        assert_eq!(result.code, ErrorCode::InvalidDimensions);
        assert!(!result.message.is_null());
        h264mp4_free_result(&mut result);
        assert!(result.message.is_null());

        let bad_json = CString::new("{").unwrap();
        let mut result = h264mp4_create_muxer(
            ctx,
            bad_json.as_ptr(),
            Some(write_to_vec),
            &mut out as *mut Vec<u8> as *mut c_void,
            &mut handle,
        );
        assert_eq!(result.code, ErrorCode::InvalidInput);
        h264mp4_free_result(&mut result);

        let options = CString::new(r#"{"width": 64, "height": 48}"#).unwrap();
        let mut result =
            h264mp4_create_muxer(ctx, options.as_ptr(), None, ptr::null_mut(), &mut handle);
        assert_eq!(result.code, ErrorCode::InvalidInput);
        h264mp4_free_result(&mut result);

        let nal = [0u8, 0, 0, 1, 0x65, 0x88];
        let mut result = h264mp4_mux_write_nal(ctx, 0, nal.as_ptr(), nal.len());
        assert_eq!(result.code, ErrorCode::InvalidHandle);
        h264mp4_free_result(&mut result);

        let mut result = h264mp4_finalize_muxer(ctx, 42);
        assert_eq!(result.code, ErrorCode::InvalidHandle);
        h264mp4_free_result(&mut result);

        let options = CString::new(r#"{"width": 64, "height": 48}"#).unwrap();
        let mut encoder = 0u32;
        check(h264mp4_create_encoder(
            ctx,
            options.as_ptr(),
            Some(write_to_vec),
            &mut out as *mut Vec<u8> as *mut c_void,
            &mut encoder,
        ));
        let rgb = vec![0u8; 64 * 48 * 3];
        let mut result = h264mp4_encode_rgb(
            ctx,
            encoder,
            rgb.as_ptr(),
            rgb.len(),
            usize::MAX / 64,
            3,
            ptr::null_mut(),
            0,
        );
        assert_eq!(result.code, ErrorCode::InvalidInput);
        h264mp4_free_result(&mut result);
        let mut result = h264mp4_finalize_encoder(ctx, encoder);
        h264mp4_free_result(&mut result);
        out.clear();

        let mut result = h264mp4_encode_yuv(ptr::null_mut(), 1, nal.as_ptr(), nal.len());
        assert_eq!(result.code, ErrorCode::InvalidInput);
        h264mp4_free_result(&mut result);

        h264mp4_context_free(ctx);
    }
    assert!(out.is_empty());
}

#[test]
fn test_callback_failure_surfaces_as_sink_error() {
    let options =
        CString::new(r#"{"width": 64, "height": 48, "sequential": true}"#).unwrap();
    unsafe {
        let ctx = h264mp4_context_new();
        let mut encoder = 0u32;
        check(h264mp4_create_encoder(
            ctx,
            options.as_ptr(),
            Some(always_fail),
            ptr::null_mut(),
            &mut encoder,
        ));
        let yuv = gray_frame(64, 48, 60);
        check(h264mp4_encode_yuv(ctx, encoder, yuv.as_ptr(), yuv.len()));

        let mut result = h264mp4_finalize_encoder(ctx, encoder);
        assert_eq!(result.code, ErrorCode::SinkWriteFailure);
        h264mp4_free_result(&mut result);
        h264mp4_context_free(ctx);
    }
}

#[test]
fn test_version() {
    let version = unsafe { CStr::from_ptr(h264mp4_version()) };
    assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
}
