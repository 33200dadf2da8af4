//! Caller-owned session context
//!
//! A [`Context`] owns every encoder and muxer created through it. Nothing is
//! global: two contexts never share handles, and dropping a context releases
//! whatever it still holds without finishing any file.

use crate::encoder::{Compressor, EncodeSession, EncoderOptions, FrameReport, PcmCompressor};
use crate::frame::{OwnedPackedImage, PackedFrame};
use crate::muxer::sink::WriteSink;
use crate::muxer::{Codec, MuxSession, MuxerOptions};
use crate::registry::{EncoderHandle, EncoderKind, MuxerHandle, MuxerKind, Registry};
use crate::{Error, Result};
use image::DynamicImage;

/// Where a new encoder sends its output
pub enum EncoderTarget {
    /// Create a muxer over this sink, owned by the encoder
    NewMuxer(Box<dyn WriteSink>),
    /// Feed an existing, unbound AVC muxer
    Muxer(MuxerHandle),
}

/// Registry of encoder and muxer sessions
pub struct Context {
    encoders: Registry<EncodeSession, EncoderKind>,
    muxers: Registry<MuxSession, MuxerKind>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Self {
            encoders: Registry::new("encoder"),
            muxers: Registry::new("muxer"),
        }
    }

    /// Create a muxer writing to `sink`
    pub fn create_muxer(
        &mut self,
        options: MuxerOptions,
        sink: Box<dyn WriteSink>,
    ) -> Result<MuxerHandle> {
        let session = MuxSession::new(options, sink)?;
        let handle = self.muxers.register(session)?;
        tracing::debug!(%handle, "muxer registered");
        Ok(handle)
    }

    /// Create an encoder with its own muxer over `sink`
    pub fn create_encoder(
        &mut self,
        options: EncoderOptions,
        sink: Box<dyn WriteSink>,
    ) -> Result<EncoderHandle> {
        self.create_encoder_with(
            options,
            EncoderTarget::NewMuxer(sink),
            Box::new(PcmCompressor::new()),
        )
    }

    /// Create an encoder feeding an existing muxer
    pub fn create_encoder_for_muxer(
        &mut self,
        options: EncoderOptions,
        muxer: MuxerHandle,
    ) -> Result<EncoderHandle> {
        self.create_encoder_with(
            options,
            EncoderTarget::Muxer(muxer),
            Box::new(PcmCompressor::new()),
        )
    }

    /// Create an encoder around a caller-supplied compressor
    pub fn create_encoder_with(
        &mut self,
        options: EncoderOptions,
        target: EncoderTarget,
        compressor: Box<dyn Compressor>,
    ) -> Result<EncoderHandle> {
        options.validate()?;

        let (muxer, owned) = match target {
            EncoderTarget::NewMuxer(sink) => {
                (self.create_muxer(options.muxer_options(), sink)?, true)
            }
            EncoderTarget::Muxer(handle) => {
                let session = self.muxers.get(handle)?;
                if let Some(bound) = session.bound_encoder() {
                    return Err(Error::InvalidHandle(format!(
                        "muxer {} is already fed by encoder {}",
                        handle, bound
                    )));
                }
                if session.codec() != Codec::Avc {
                    return Err(Error::InvalidHandle(format!(
                        "muxer {} does not carry H.264",
                        handle
                    )));
                }
                if session.width() != options.width || session.height() != options.height {
                    return Err(Error::InvalidHandle(format!(
                        "muxer {} is {}x{}, encoder is {}x{}",
                        handle,
                        session.width(),
                        session.height(),
                        options.width,
                        options.height
                    )));
                }
                (handle, false)
            }
        };

        match self.register_encoder(&options, muxer, compressor) {
            Ok(handle) => {
                tracing::debug!(%handle, %muxer, owned, "encoder registered");
                Ok(handle)
            }
            Err(err) => {
                if owned {
                    // nothing reached the sink yet; drop without finishing
                    let _ = self.muxers.release(muxer);
                }
                Err(err)
            }
        }
    }

    fn register_encoder(
        &mut self,
        options: &EncoderOptions,
        muxer: MuxerHandle,
        compressor: Box<dyn Compressor>,
    ) -> Result<EncoderHandle> {
        let fps = self.muxers.get(muxer)?.fps();
        let session = EncodeSession::new(options, fps, muxer, compressor)?;
        let handle = self.encoders.register(session)?;
        self.muxers.get_mut(muxer)?.bind_encoder(handle)?;
        Ok(handle)
    }

    /// Split borrow of an encoder and the muxer it feeds
    fn encoder_and_muxer(
        &mut self,
        handle: EncoderHandle,
    ) -> Result<(&mut EncodeSession, &mut MuxSession)> {
        let Self { encoders, muxers } = self;
        let encoder = encoders.get_mut(handle)?;
        let muxer_handle = encoder.muxer();
        let muxer = muxers.get_mut(muxer_handle).map_err(|_| {
            Error::InvalidHandle(format!(
                "encoder {} feeds muxer {} which was already finalized",
                handle, muxer_handle
            ))
        })?;
        Ok((encoder, muxer))
    }

    /// Encode one I420 frame
    pub fn encode_yuv(&mut self, handle: EncoderHandle, yuv: &[u8]) -> Result<FrameReport> {
        let (encoder, muxer) = self.encoder_and_muxer(handle)?;
        encoder.encode(yuv, &mut |nal: &[u8]| muxer.write_nal(nal))
    }

    /// Convert a packed frame through `scratch`, then encode it
    pub fn encode_rgb(
        &mut self,
        handle: EncoderHandle,
        packed: PackedFrame<'_>,
        scratch: &mut [u8],
    ) -> Result<FrameReport> {
        let (encoder, muxer) = self.encoder_and_muxer(handle)?;
        encoder.encode_packed(packed, scratch, &mut |nal: &[u8]| muxer.write_nal(nal))
    }

    /// Convert a packed frame through an encoder-owned buffer, then encode it
    pub fn encode_packed(
        &mut self,
        handle: EncoderHandle,
        packed: PackedFrame<'_>,
    ) -> Result<FrameReport> {
        let (encoder, muxer) = self.encoder_and_muxer(handle)?;
        encoder.encode_packed_owned(packed, &mut |nal: &[u8]| muxer.write_nal(nal))
    }

    /// Encode a decoded image; its size must match the encoder
    pub fn encode_image(
        &mut self,
        handle: EncoderHandle,
        image: &DynamicImage,
    ) -> Result<FrameReport> {
        let encoder = self.encoders.get(handle)?;
        if image.width() != encoder.width() || image.height() != encoder.height() {
            return Err(Error::InvalidInput(format!(
                "image is {}x{}, encoder expects {}x{}",
                image.width(),
                image.height(),
                encoder.width(),
                encoder.height()
            )));
        }
        let packed = OwnedPackedImage::from_dynamic_image(image);
        self.encode_packed(handle, packed.as_frame())
    }

    /// Feed coded units straight into a muxer
    pub fn mux_write_nal(&mut self, handle: MuxerHandle, nal: &[u8]) -> Result<()> {
        self.muxers.get_mut(handle)?.write_nal(nal)
    }

    /// Flush the encoder, finalize its muxer and release both handles
    ///
    /// Both handles are gone afterwards even on failure; the first error wins.
    pub fn finalize_encoder(&mut self, handle: EncoderHandle) -> Result<()> {
        let mut encoder = self.encoders.release(handle)?;
        let muxer_handle = encoder.muxer();
        let mut first_err = None;

        match self.muxers.release(muxer_handle) {
            Ok(mut muxer) => {
                if let Err(e) = encoder.flush(&mut |nal: &[u8]| muxer.write_nal(nal)) {
                    first_err.get_or_insert(e);
                }
                muxer.unbind_encoder();
                if let Err(e) = muxer.finalize() {
                    first_err.get_or_insert(e);
                }
            }
            Err(_) => {
                tracing::warn!(%handle, muxer = %muxer_handle, "encoder finalized after its muxer");
            }
        }

        tracing::debug!(
            %handle,
            frames = encoder.frame_count(),
            ok = first_err.is_none(),
            "encoder finalized"
        );
        first_err.map_or(Ok(()), Err)
    }

    /// Finish a muxer's file and release its handle
    pub fn finalize_muxer(&mut self, handle: MuxerHandle) -> Result<()> {
        let muxer = self.muxers.release(handle)?;
        if let Some(encoder) = muxer.bound_encoder() {
            tracing::warn!(
                %handle,
                %encoder,
                "finalizing a muxer that an encoder still feeds"
            );
        }
        muxer.finalize()
    }

    /// Muxer an encoder feeds
    pub fn encoder_muxer(&self, handle: EncoderHandle) -> Result<MuxerHandle> {
        Ok(self.encoders.get(handle)?.muxer())
    }

    pub fn last_frame_report(&self, handle: EncoderHandle) -> Result<Option<FrameReport>> {
        Ok(self.encoders.get(handle)?.last_report())
    }

    pub fn encoder_count(&self) -> usize {
        self.encoders.len()
    }

    pub fn muxer_count(&self) -> usize {
        self.muxers.len()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        for (handle, _) in self.encoders.drain() {
            tracing::debug!(%handle, "dropping encoder that was never finalized");
        }
        for (handle, _) in self.muxers.drain() {
            tracing::debug!(%handle, "dropping muxer that was never finalized");
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("encoders", &self.encoders.len())
            .field("muxers", &self.muxers.len())
            .finish()
    }
}
