//! FFI (Foreign Function Interface) for C/Go interoperability
//!
//! Every call takes the `Context` returned by `h264mp4_context_new`. Sessions
//! are referred to by the raw `u32` handle values; 0 is never a valid handle.
//! Buffers passed in are borrowed for the duration of the call only.

use crate::error::ErrorCode;
use crate::frame::{PackedFormat, PackedFrame};
use crate::muxer::sink::WriteSink;
use crate::registry::{EncoderHandle, Handle, MuxerHandle};
use crate::{Context, EncoderOptions, Error, MuxerOptions, Result};
use libc::{c_char, c_int, c_void, size_t};
use std::ffi::{CStr, CString};
use std::io;
use std::ptr;
use std::slice;

/// FFI result structure
#[repr(C)]
pub struct FfiResult {
    pub code: ErrorCode,
    pub message: *mut c_char,
}

impl FfiResult {
    fn ok() -> Self {
        Self {
            code: ErrorCode::Ok,
            message: ptr::null_mut(),
        }
    }

    fn error(err: &Error) -> Self {
        let message = CString::new(err.to_string().replace('\0', " ")).unwrap_or_default();
        Self {
            code: ErrorCode::from(err),
            message: message.into_raw(),
        }
    }
}

impl From<Result<()>> for FfiResult {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => FfiResult::ok(),
            Err(e) => FfiResult::error(&e),
        }
    }
}

/// Positioned write callback; returns 0 on success
pub type WriteFn = Option<
    unsafe extern "C" fn(
        user_data: *mut c_void,
        data: *const u8,
        size: size_t,
        offset: i64,
    ) -> c_int,
>;

struct CallbackSink {
    write_fn: unsafe extern "C" fn(*mut c_void, *const u8, size_t, i64) -> c_int,
    user_data: *mut c_void,
}

// SAFETY: the caller guarantees `user_data` may be used from whichever thread
// drives the context.
unsafe impl Send for CallbackSink {}

impl WriteSink for CallbackSink {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let offset = i64::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset exceeds i64"))?;
        // SAFETY: data is valid for data.len() bytes for the duration of the call.
        let status = unsafe { (self.write_fn)(self.user_data, data.as_ptr(), data.len(), offset) };
        if status == 0 {
            Ok(())
        } else {
            Err(io::Error::other(format!("write callback returned {}", status)))
        }
    }
}

unsafe fn context<'a>(ctx: *mut Context) -> Result<&'a mut Context> {
    ctx.as_mut()
        .ok_or_else(|| Error::InvalidInput("Context is null".to_string()))
}

unsafe fn c_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(Error::InvalidInput(format!("{} is null", what)));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| Error::InvalidInput(format!("{} is not valid UTF-8", what)))
}

unsafe fn bytes<'a>(ptr: *const u8, len: size_t, what: &str) -> Result<&'a [u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(Error::InvalidInput(format!("{} is null", what)));
    }
    Ok(slice::from_raw_parts(ptr, len))
}

fn handle<K>(raw: u32) -> Result<Handle<K>> {
    Handle::from_raw(raw).ok_or_else(|| Error::InvalidHandle("handle 0".to_string()))
}

fn sink(write_fn: WriteFn, user_data: *mut c_void) -> Result<Box<dyn WriteSink>> {
    let write_fn =
        write_fn.ok_or_else(|| Error::InvalidInput("Write callback is null".to_string()))?;
    Ok(Box::new(CallbackSink {
        write_fn,
        user_data,
    }))
}

/// Create a context
#[no_mangle]
pub extern "C" fn h264mp4_context_new() -> *mut Context {
    Box::into_raw(Box::new(Context::new()))
}

/// Destroy a context, dropping any sessions it still holds
///
/// # Safety
/// - `ctx` must come from `h264mp4_context_new` and not be used afterwards, or be null
#[no_mangle]
pub unsafe extern "C" fn h264mp4_context_free(ctx: *mut Context) {
    if !ctx.is_null() {
        drop(Box::from_raw(ctx));
    }
}

/// Create a muxer
///
/// # Safety
/// - `ctx` must be a live context
/// - `options_json` must be a valid null-terminated string
/// - `write_fn` must stay callable with `user_data` until the muxer is finalized
/// - `out_handle` must be valid for writes
#[no_mangle]
pub unsafe extern "C" fn h264mp4_create_muxer(
    ctx: *mut Context,
    options_json: *const c_char,
    write_fn: WriteFn,
    user_data: *mut c_void,
    out_handle: *mut u32,
) -> FfiResult {
    let result = (|| -> Result<()> {
        let ctx = context(ctx)?;
        if out_handle.is_null() {
            return Err(Error::InvalidInput("Output handle is null".to_string()));
        }
        let options = MuxerOptions::from_json(c_str(options_json, "Options")?)?;
        let handle = ctx.create_muxer(options, sink(write_fn, user_data)?)?;
        *out_handle = handle.raw();
        Ok(())
    })();
    result.into()
}

/// Create an encoder together with its own muxer
///
/// # Safety
/// Same as `h264mp4_create_muxer`.
#[no_mangle]
pub unsafe extern "C" fn h264mp4_create_encoder(
    ctx: *mut Context,
    options_json: *const c_char,
    write_fn: WriteFn,
    user_data: *mut c_void,
    out_handle: *mut u32,
) -> FfiResult {
    let result = (|| -> Result<()> {
        let ctx = context(ctx)?;
        if out_handle.is_null() {
            return Err(Error::InvalidInput("Output handle is null".to_string()));
        }
        let options = EncoderOptions::from_json(c_str(options_json, "Options")?)?;
        let handle = ctx.create_encoder(options, sink(write_fn, user_data)?)?;
        *out_handle = handle.raw();
        Ok(())
    })();
    result.into()
}

/// Encode one I420 frame
///
/// # Safety
/// - `ctx` must be a live context
/// - `yuv` must be valid for `len` bytes
#[no_mangle]
pub unsafe extern "C" fn h264mp4_encode_yuv(
    ctx: *mut Context,
    encoder: u32,
    yuv: *const u8,
    len: size_t,
) -> FfiResult {
    let result = (|| -> Result<()> {
        let ctx = context(ctx)?;
        let handle: EncoderHandle = handle(encoder)?;
        ctx.encode_yuv(handle, bytes(yuv, len, "Frame")?).map(|_| ())
    })();
    result.into()
}

/// Encode one packed RGB/RGBA frame
///
/// `scratch` may be null, in which case the encoder converts through its
/// own buffer.
///
/// # Safety
/// - `ctx` must be a live context
/// - `rgb` must be valid for `len` bytes
/// - `scratch`, when not null, must be valid for writes of `scratch_len` bytes
#[no_mangle]
pub unsafe extern "C" fn h264mp4_encode_rgb(
    ctx: *mut Context,
    encoder: u32,
    rgb: *const u8,
    len: size_t,
    row_stride: size_t,
    bytes_per_pixel: size_t,
    scratch: *mut u8,
    scratch_len: size_t,
) -> FfiResult {
    let result = (|| -> Result<()> {
        let ctx = context(ctx)?;
        let handle: EncoderHandle = handle(encoder)?;
        let format = PackedFormat::from_bytes_per_pixel(bytes_per_pixel)?;
        let packed = PackedFrame::new(bytes(rgb, len, "Frame")?, format, row_stride);
        if scratch.is_null() {
            ctx.encode_packed(handle, packed)?;
        } else {
            let scratch = slice::from_raw_parts_mut(scratch, scratch_len);
            ctx.encode_rgb(handle, packed, scratch)?;
        }
        Ok(())
    })();
    result.into()
}

/// Feed Annex-B coded units into a muxer
///
/// # Safety
/// - `ctx` must be a live context
/// - `nal` must be valid for `len` bytes
#[no_mangle]
pub unsafe extern "C" fn h264mp4_mux_write_nal(
    ctx: *mut Context,
    muxer: u32,
    nal: *const u8,
    len: size_t,
) -> FfiResult {
    let result = (|| -> Result<()> {
        let ctx = context(ctx)?;
        let handle: MuxerHandle = handle(muxer)?;
        ctx.mux_write_nal(handle, bytes(nal, len, "Unit")?)
    })();
    result.into()
}

/// Finalize an encoder and its muxer
///
/// # Safety
/// - `ctx` must be a live context
#[no_mangle]
pub unsafe extern "C" fn h264mp4_finalize_encoder(ctx: *mut Context, encoder: u32) -> FfiResult {
    let result = (|| -> Result<()> {
        let ctx = context(ctx)?;
        ctx.finalize_encoder(handle(encoder)?)
    })();
    result.into()
}

/// Finalize a muxer
///
/// # Safety
/// - `ctx` must be a live context
#[no_mangle]
pub unsafe extern "C" fn h264mp4_finalize_muxer(ctx: *mut Context, muxer: u32) -> FfiResult {
    let result = (|| -> Result<()> {
        let ctx = context(ctx)?;
        ctx.finalize_muxer(handle(muxer)?)
    })();
    result.into()
}

/// Allocate a zeroed buffer the caller may fill and pass back in
///
/// Returns null when `len` is 0. Release with `h264mp4_buffer_free`.
#[no_mangle]
pub extern "C" fn h264mp4_buffer_alloc(len: size_t) -> *mut u8 {
    if len == 0 {
        return ptr::null_mut();
    }
    let buf = vec![0u8; len].into_boxed_slice();
    Box::into_raw(buf) as *mut u8
}

/// Free a buffer from `h264mp4_buffer_alloc`
///
/// # Safety
/// - `ptr` must come from `h264mp4_buffer_alloc(len)` with the same `len`, or be null
#[no_mangle]
pub unsafe extern "C" fn h264mp4_buffer_free(ptr: *mut u8, len: size_t) {
    if ptr.is_null() || len == 0 {
        return;
    }
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, len)));
}

/// Free a result's message string
///
/// # Safety
/// - `result` must point to a valid `FfiResult` that was returned by an h264mp4 function
#[no_mangle]
pub unsafe extern "C" fn h264mp4_free_result(result: *mut FfiResult) {
    if result.is_null() {
        return;
    }

    let result = &mut *result;
    if !result.message.is_null() {
        let _ = CString::from_raw(result.message);
        result.message = ptr::null_mut();
    }
}

/// Get version string
#[no_mangle]
pub extern "C" fn h264mp4_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
