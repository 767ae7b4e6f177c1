use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use ffmpeg_next::{
    self as ffmpeg,
    ffi::{
        av_buffer_ref, av_buffer_unref, av_hwframe_ctx_init, AVHWDeviceContext, AVHWFramesContext,
        AVPixelFormat, AV_CODEC_FLAG_GLOBAL_HEADER,
    },
};

use crate::types::config::QualityPreset;
use crate::types::error::{ReplayError, Result};
use crate::types::video_frame::EncodedVideoFrame;
use crate::utils::TICKS_PER_SECOND;

use super::video::{
    create_hw_device, create_hw_frame_ctx, target_bitrate, tick_timebase, HwDevice, VideoEncoder,
    VideoFrameSink, GOP_SIZE,
};

/// Submitted-but-unencoded frames the input queue will hold before
/// `submit` starts reporting backpressure.
const INPUT_QUEUE_DEPTH: usize = 8;

enum PumpMsg {
    SetSink(Box<dyn VideoFrameSink>),
    Frame(ffmpeg::frame::Video, i64),
    Flush(Sender<Result<()>>),
    Shutdown,
}

/// `h264_vaapi` encoder with a decoupled output pump.
///
/// `submit` only enqueues; a dedicated pump thread owns the FFmpeg
/// encoder, feeds it, drains finished packets, and hands each one to the
/// registered sink. The pump keeps at most one finished frame pending so
/// that every emitted frame except the newest carries an exact
/// next-minus-current duration.
pub struct VaapiEncoder {
    input_tx: Option<Sender<PumpMsg>>,
    pump: Option<JoinHandle<()>>,
    device: HwDevice,
    sequence_header: Option<Vec<u8>>,
    sink_installed: bool,
}

impl VaapiEncoder {
    pub fn create(width: u32, height: u32, fps: u32, quality: QualityPreset) -> Result<Self> {
        if width % 2 != 0 || height % 2 != 0 {
            return Err(ReplayError::EncoderInit(format!(
                "encoder dimensions must be even, got {width}x{height}"
            )));
        }

        let (encoder, device) = Self::create_encoder(width, height, fps, quality)?;
        let sequence_header = extract_extradata(&encoder);
        if sequence_header.is_none() {
            log::warn!("encoder produced no sequence header at init");
        }

        let (input_tx, input_rx) = bounded::<PumpMsg>(INPUT_QUEUE_DEPTH);
        let pump = std::thread::Builder::new()
            .name("video-encoder-pump".into())
            .spawn(move || run_pump(encoder, input_rx, fps))
            .map_err(|e| ReplayError::EncoderInit(format!("could not spawn pump: {e}")))?;

        Ok(Self {
            input_tx: Some(input_tx),
            pump: Some(pump),
            device,
            sequence_header,
            sink_installed: false,
        })
    }

    /// Read-only handle to the VAAPI device, shared with the color
    /// converter.
    pub fn device(&self) -> HwDevice {
        self.device.clone()
    }

    fn create_encoder(
        width: u32,
        height: u32,
        fps: u32,
        quality: QualityPreset,
    ) -> Result<(ffmpeg::codec::encoder::Video, HwDevice)> {
        let encoder_codec = ffmpeg::codec::encoder::find_by_name("h264_vaapi")
            .ok_or(ffmpeg::Error::EncoderNotFound)
            .map_err(|_| {
                ReplayError::EncoderInit("h264_vaapi encoder not available".into())
            })?;

        let mut encoder_ctx = ffmpeg::codec::context::Context::new_with_codec(encoder_codec)
            .encoder()
            .video()?;

        encoder_ctx.set_width(width);
        encoder_ctx.set_height(height);
        encoder_ctx.set_format(ffmpeg::format::Pixel::VAAPI);
        encoder_ctx.set_frame_rate(Some(ffmpeg::Rational::new(fps as i32, 1)));

        let mut vaapi_device =
            create_hw_device(ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI)?;
        let mut frame_ctx = create_hw_frame_ctx(vaapi_device)?;

        unsafe {
            let hw_frame_context = &mut *((*frame_ctx).data as *mut AVHWFramesContext);
            hw_frame_context.width = width as i32;
            hw_frame_context.height = height as i32;
            hw_frame_context.sw_format = AVPixelFormat::AV_PIX_FMT_NV12;
            hw_frame_context.format = encoder_ctx.format().into();
            hw_frame_context.device_ref = av_buffer_ref(vaapi_device);
            hw_frame_context.device_ctx = (*vaapi_device).data as *mut AVHWDeviceContext;
            // Small pool; the input queue provides the slack, not GPU
            // surfaces.
            hw_frame_context.initial_pool_size = 2;

            let err = av_hwframe_ctx_init(frame_ctx);
            if err < 0 {
                av_buffer_unref(&mut vaapi_device);
                av_buffer_unref(&mut frame_ctx);
                return Err(ReplayError::EncoderInit(format!(
                    "error initializing hw frame context: {err}"
                )));
            }

            (*encoder_ctx.as_mut_ptr()).hw_device_ctx = av_buffer_ref(vaapi_device);
            (*encoder_ctx.as_mut_ptr()).hw_frames_ctx = av_buffer_ref(frame_ctx);
            // The muxer needs parameter sets out of band.
            (*encoder_ctx.as_mut_ptr()).flags |= AV_CODEC_FLAG_GLOBAL_HEADER as i32;

            av_buffer_unref(&mut frame_ctx);
        }

        // All pipeline timestamps are ticks.
        encoder_ctx.set_time_base(tick_timebase());
        encoder_ctx.set_gop(GOP_SIZE);
        encoder_ctx.set_bit_rate(target_bitrate(width, height, fps, quality) as usize);

        let mut opts = ffmpeg::Dictionary::new();
        opts.set("vsync", "vfr");
        opts.set("rc", "VBR");

        let encoder = encoder_ctx.open_with(opts).map_err(|e| {
            ReplayError::EncoderInit(format!("h264_vaapi refused configuration: {e}"))
        })?;

        Ok((encoder, HwDevice::from_owned(vaapi_device)))
    }

    fn tx(&self) -> Result<&Sender<PumpMsg>> {
        self.input_tx
            .as_ref()
            .ok_or_else(|| ReplayError::Validation("encoder already destroyed".into()))
    }
}

impl VideoEncoder for VaapiEncoder {
    fn sequence_header(&self) -> Option<Vec<u8>> {
        self.sequence_header.clone()
    }

    fn set_sink(&mut self, sink: Box<dyn VideoFrameSink>) -> Result<()> {
        self.tx()?
            .send(PumpMsg::SetSink(sink))
            .map_err(|_| ReplayError::Fatal("encoder pump is gone".into()))?;
        self.sink_installed = true;
        Ok(())
    }

    fn submit(&mut self, texture: ffmpeg::frame::Video, pts: i64) -> Result<()> {
        if !self.sink_installed {
            return Err(ReplayError::Validation(
                "submit called before a sink was installed".into(),
            ));
        }
        match self.tx()?.try_send(PumpMsg::Frame(texture, pts)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ReplayError::Backpressure),
            Err(TrySendError::Disconnected(_)) => {
                Err(ReplayError::Fatal("encoder pump is gone".into()))
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.tx()?
            .send(PumpMsg::Flush(ack_tx))
            .map_err(|_| ReplayError::Fatal("encoder pump is gone".into()))?;
        ack_rx
            .recv_timeout(Duration::from_secs(10))
            .map_err(|_| ReplayError::Fatal("encoder flush timed out".into()))?
    }

    fn destroy(&mut self) -> Result<()> {
        if let Some(tx) = self.input_tx.take() {
            let _ = tx.send(PumpMsg::Shutdown);
        }
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
        Ok(())
    }
}

impl Drop for VaapiEncoder {
    fn drop(&mut self) {
        let _ = self.destroy();
    }
}

fn extract_extradata(encoder: &ffmpeg::codec::encoder::Video) -> Option<Vec<u8>> {
    unsafe {
        let ptr = (*encoder.as_ptr()).extradata;
        let len = (*encoder.as_ptr()).extradata_size;
        if ptr.is_null() || len <= 0 {
            None
        } else {
            Some(std::slice::from_raw_parts(ptr, len as usize).to_vec())
        }
    }
}

struct PumpState {
    sink: Option<Box<dyn VideoFrameSink>>,
    pending: Option<EncodedVideoFrame>,
    fallback_duration: i64,
    flushed: bool,
}

impl PumpState {
    /// Emit `frame`'s predecessor with its now-known duration and hold
    /// `frame` as the new pending tail.
    fn push(&mut self, frame: EncodedVideoFrame) {
        if let Some(mut prev) = self.pending.take() {
            let gap = frame.pts - prev.pts;
            prev.duration = if gap > 0 { gap } else { self.fallback_duration };
            self.emit(prev);
        }
        self.pending = Some(frame);
    }

    fn emit(&mut self, frame: EncodedVideoFrame) {
        match self.sink {
            Some(ref mut sink) => sink.accept(frame),
            None => log::error!("encoded frame dropped: no sink installed"),
        }
    }

    fn emit_pending(&mut self) {
        if let Some(tail) = self.pending.take() {
            self.emit(tail);
        }
    }
}

fn run_pump(mut encoder: ffmpeg::codec::encoder::Video, rx: Receiver<PumpMsg>, fps: u32) {
    let mut state = PumpState {
        sink: None,
        pending: None,
        fallback_duration: (TICKS_PER_SECOND / fps.max(1) as u64) as i64,
        flushed: false,
    };

    while let Ok(msg) = rx.recv() {
        match msg {
            PumpMsg::SetSink(sink) => state.sink = Some(sink),
            PumpMsg::Frame(mut frame, pts) => {
                if state.flushed {
                    log::debug!("frame at {pts} dropped: encoder already flushed");
                    continue;
                }
                frame.set_pts(Some(pts));
                if let Err(e) = encoder.send_frame(&frame) {
                    log::error!("encoder rejected frame at {pts}: {e}");
                    continue;
                }
                drain_packets(&mut encoder, &mut state);
            }
            PumpMsg::Flush(ack) => {
                let result = if state.flushed {
                    Ok(())
                } else {
                    state.flushed = true;
                    flush_encoder(&mut encoder, &mut state)
                };
                let _ = ack.send(result);
            }
            PumpMsg::Shutdown => break,
        }
    }
}

fn drain_packets(encoder: &mut ffmpeg::codec::encoder::Video, state: &mut PumpState) {
    let mut packet = ffmpeg::codec::packet::Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        if let Some(data) = packet.data() {
            state.push(EncodedVideoFrame {
                data: data.to_vec(),
                is_keyframe: packet.is_key(),
                pts: packet.pts().unwrap_or(0),
                duration: state.fallback_duration,
            });
        }
        packet = ffmpeg::codec::packet::Packet::empty();
    }
}

fn flush_encoder(encoder: &mut ffmpeg::codec::encoder::Video, state: &mut PumpState) -> Result<()> {
    encoder.send_eof()?;
    drain_packets(encoder, state);
    // The newest frame has no successor; it keeps the 1/fps fallback.
    state.emit_pending();
    Ok(())
}
