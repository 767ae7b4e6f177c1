use std::path::Path;

use ffmpeg_next::{
    self as ffmpeg,
    ffi::{
        av_channel_layout_default, av_mallocz, AVCodecID, AVMediaType, AVPixelFormat,
        AV_INPUT_BUFFER_PADDING_SIZE,
    },
};

use crate::encoders::video::{target_bitrate, tick_timebase};
use crate::types::audio_frame::EncodedAudioFrame;
use crate::types::config::QualityPreset;
use crate::types::error::{ReplayError, Result};
use crate::types::video_frame::EncodedVideoFrame;

/// Parameters for the video track of a saved clip.
pub struct VideoTrackParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: QualityPreset,
    /// Codec parameter sets captured from the encoder at startup
    pub sequence_header: Vec<u8>,
}

/// Parameters for the optional audio track.
pub struct AudioTrackParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u64,
    /// Codec configuration captured from the audio encoder
    pub codec_config: Vec<u8>,
}

/// Writes store snapshots into a playable container without re-encoding.
pub trait Muxer: Send {
    fn write(
        &mut self,
        path: &Path,
        video: &[EncodedVideoFrame],
        video_params: &VideoTrackParams,
        audio: Option<(&[EncodedAudioFrame], &AudioTrackParams)>,
    ) -> Result<()>;
}

/// Passthrough MP4 writer.
///
/// Stream parameters are populated straight from the stored headers; the
/// frames go in as pre-compressed packets in tick timebase, rescaled to
/// whatever timebase the container assigns at header time.
pub struct Mp4Muxer;

impl Mp4Muxer {
    pub fn new() -> Self {
        Self
    }

    fn write_inner(
        path: &Path,
        video: &[EncodedVideoFrame],
        video_params: &VideoTrackParams,
        audio: Option<(&[EncodedAudioFrame], &AudioTrackParams)>,
    ) -> Result<()> {
        let mut octx = ffmpeg::format::output(&path)
            .map_err(|e| ReplayError::Mux(format!("could not open output '{}': {e}", path.display())))?;

        Self::add_video_stream(&mut octx, video_params)?;
        if let Some((_, audio_params)) = audio {
            Self::add_audio_stream(&mut octx, audio_params)?;
        }

        octx.write_header()
            .map_err(|e| ReplayError::Mux(format!("container refused configuration: {e}")))?;

        let video_tb = octx
            .stream(0)
            .ok_or_else(|| ReplayError::Mux("video stream vanished".into()))?
            .time_base();
        let audio_tb = audio.and_then(|_| octx.stream(1)).map(|s| s.time_base());

        // Interleave by raw tick timestamp; video wins ties so a frame and
        // the audio that accompanies it land in presentation order.
        let audio_frames = audio.map(|(frames, _)| frames).unwrap_or(&[]);
        let (mut vi, mut ai) = (0usize, 0usize);
        while vi < video.len() || ai < audio_frames.len() {
            let take_video = match (video.get(vi), audio_frames.get(ai)) {
                (Some(v), Some(a)) => v.pts <= a.pts,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };

            if take_video {
                let frame = &video[vi];
                vi += 1;
                let mut packet = ffmpeg::codec::packet::Packet::copy(&frame.data);
                packet.set_stream(0);
                packet.set_pts(Some(frame.pts));
                packet.set_dts(Some(frame.pts));
                packet.set_duration(frame.duration);
                if frame.is_keyframe {
                    packet.set_flags(ffmpeg::codec::packet::Flags::KEY);
                }
                packet.rescale_ts(tick_timebase(), video_tb);
                packet
                    .write_interleaved(&mut octx)
                    .map_err(|e| ReplayError::Mux(format!("video packet write failed: {e}")))?;
            } else {
                let frame = &audio_frames[ai];
                ai += 1;
                let mut packet = ffmpeg::codec::packet::Packet::copy(&frame.data);
                packet.set_stream(1);
                packet.set_pts(Some(frame.pts));
                packet.set_dts(Some(frame.pts));
                packet.set_duration(frame.duration);
                let tb = audio_tb.ok_or_else(|| ReplayError::Mux("audio stream vanished".into()))?;
                packet.rescale_ts(tick_timebase(), tb);
                packet
                    .write_interleaved(&mut octx)
                    .map_err(|e| ReplayError::Mux(format!("audio packet write failed: {e}")))?;
            }
        }

        octx.write_trailer()
            .map_err(|e| ReplayError::Mux(format!("could not finalize container: {e}")))?;
        Ok(())
    }

    fn add_video_stream(
        octx: &mut ffmpeg::format::context::Output,
        params: &VideoTrackParams,
    ) -> Result<()> {
        let codec = ffmpeg::codec::encoder::find(ffmpeg::codec::Id::H264)
            .ok_or_else(|| ReplayError::Mux("H.264 not available in this build".into()))?;
        let mut stream = octx
            .add_stream(codec)
            .map_err(|e| ReplayError::Mux(format!("could not add video stream: {e}")))?;
        stream.set_time_base(tick_timebase());

        unsafe {
            let par = (*stream.as_mut_ptr()).codecpar;
            (*par).codec_type = AVMediaType::AVMEDIA_TYPE_VIDEO;
            (*par).codec_id = AVCodecID::AV_CODEC_ID_H264;
            (*par).width = params.width as i32;
            (*par).height = params.height as i32;
            (*par).format = AVPixelFormat::AV_PIX_FMT_NV12 as i32;
            (*par).bit_rate =
                target_bitrate(params.width, params.height, params.fps, params.quality) as i64;
            set_extradata(par, &params.sequence_header)?;
        }
        Ok(())
    }

    fn add_audio_stream(
        octx: &mut ffmpeg::format::context::Output,
        params: &AudioTrackParams,
    ) -> Result<()> {
        let codec = ffmpeg::codec::encoder::find(ffmpeg::codec::Id::AAC)
            .ok_or_else(|| ReplayError::Mux("AAC not available in this build".into()))?;
        let mut stream = octx
            .add_stream(codec)
            .map_err(|e| ReplayError::Mux(format!("could not add audio stream: {e}")))?;
        stream.set_time_base(tick_timebase());

        unsafe {
            let par = (*stream.as_mut_ptr()).codecpar;
            (*par).codec_type = AVMediaType::AVMEDIA_TYPE_AUDIO;
            (*par).codec_id = AVCodecID::AV_CODEC_ID_AAC;
            (*par).sample_rate = params.sample_rate as i32;
            (*par).bit_rate = params.bitrate as i64;
            av_channel_layout_default(&mut (*par).ch_layout, params.channels as i32);
            set_extradata(par, &params.codec_config)?;
        }
        Ok(())
    }
}

impl Default for Mp4Muxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Muxer for Mp4Muxer {
    fn write(
        &mut self,
        path: &Path,
        video: &[EncodedVideoFrame],
        video_params: &VideoTrackParams,
        audio: Option<(&[EncodedAudioFrame], &AudioTrackParams)>,
    ) -> Result<()> {
        if video.is_empty() {
            return Err(ReplayError::Mux("nothing to write: no video frames".into()));
        }
        if video_params.sequence_header.is_empty() {
            return Err(ReplayError::Mux("missing video sequence header".into()));
        }

        let result = Self::write_inner(path, video, video_params, audio);
        if result.is_err() {
            // Never leave a half-written clip behind.
            let _ = std::fs::remove_file(path);
        }
        result
    }
}

unsafe fn set_extradata(
    par: *mut ffmpeg::ffi::AVCodecParameters,
    bytes: &[u8],
) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    let buf = av_mallocz(bytes.len() + AV_INPUT_BUFFER_PADDING_SIZE as usize) as *mut u8;
    if buf.is_null() {
        return Err(ReplayError::Mux("could not allocate extradata".into()));
    }
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, bytes.len());
    (*par).extradata = buf;
    (*par).extradata_size = bytes.len() as i32;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vframe(pts: i64) -> EncodedVideoFrame {
        EncodedVideoFrame {
            data: vec![0; 4],
            is_keyframe: false,
            pts,
            duration: 166_667,
        }
    }

    fn aframe(pts: i64) -> EncodedAudioFrame {
        EncodedAudioFrame {
            data: vec![0; 4],
            pts,
            duration: 213_333,
        }
    }

    /// Mirror of the interleave decision in `write_inner`, for order tests.
    fn interleaved_order(video: &[EncodedVideoFrame], audio: &[EncodedAudioFrame]) -> Vec<(usize, i64)> {
        let (mut vi, mut ai) = (0usize, 0usize);
        let mut order = Vec::new();
        while vi < video.len() || ai < audio.len() {
            let take_video = match (video.get(vi), audio.get(ai)) {
                (Some(v), Some(a)) => v.pts <= a.pts,
                (Some(_), None) => true,
                _ => false,
            };
            if take_video {
                order.push((0, video[vi].pts));
                vi += 1;
            } else {
                order.push((1, audio[ai].pts));
                ai += 1;
            }
        }
        order
    }

    #[test]
    fn interleave_is_nondecreasing_with_video_first_on_ties() {
        let video = vec![vframe(0), vframe(100), vframe(200)];
        let audio = vec![aframe(0), aframe(150), aframe(400)];
        let order = interleaved_order(&video, &audio);

        for pair in order.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
        assert_eq!(order[0], (0, 0));
        assert_eq!(order[1], (1, 0));
        assert_eq!(order.last(), Some(&(1, 400)));
    }

    #[test]
    fn interleave_handles_missing_audio() {
        let video = vec![vframe(0), vframe(100)];
        let order = interleaved_order(&video, &[]);
        assert_eq!(order, vec![(0, 0), (0, 100)]);
    }
}
