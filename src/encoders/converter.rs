use std::ptr::null_mut;

use drm_fourcc::DrmFourcc;
use ffmpeg_next::{
    self as ffmpeg,
    ffi::{
        av_buffer_create, av_buffer_default_free, av_buffer_ref, av_buffer_unref,
        av_hwframe_ctx_init, AVBufferRef, AVDRMFrameDescriptor, AVHWDeviceContext,
        AVHWFramesContext, AVPixelFormat,
    },
};

use crate::types::config::Rect;
use crate::types::error::{ReplayError, Result};
use crate::types::video_frame::RawVideoFrame;

use super::video::{create_hw_frame_ctx, HwDevice};

/// GPU-side pixel format conversion from the capture-native format to the
/// encoder's 4:2:0 layout. No CPU readback on any path.
pub trait ColorConverter: Send {
    /// Convert one captured frame. `Ok(None)` means the filter buffered
    /// the input without producing output yet (a transient, not an
    /// error); `Err` means the GPU pipeline failed and the owner should
    /// treat it as fatal.
    fn convert(&mut self, frame: &RawVideoFrame) -> Result<Option<ffmpeg::frame::Video>>;
}

/// Filter-graph converter targeting VAAPI surfaces in NV12.
///
/// Two input paths, built lazily from the first frame of each kind:
/// mapped SHM pixels go through `crop` + `hwupload`, DMA-BUF frames are
/// wrapped in a DRM-PRIME descriptor and mapped in place with `hwmap`.
/// Both end in `scale_vaapi` which lands the frame in the encoder's
/// format.
pub struct VaapiConverter {
    device: HwDevice,
    frames_ctx: *mut AVBufferRef,
    src_width: u32,
    src_height: u32,
    crop: Rect,
    out_width: u32,
    out_height: u32,
    shm_graph: Option<ffmpeg::filter::Graph>,
    dma_graph: Option<ffmpeg::filter::Graph>,
}

// The graphs and contexts are only touched from the thread that owns the
// converter; the device handle itself is refcounted.
unsafe impl Send for VaapiConverter {}

impl VaapiConverter {
    pub fn new(device: HwDevice, src_width: u32, src_height: u32, crop: Rect) -> Result<Self> {
        let bounds = Rect::new(0, 0, src_width, src_height);
        if crop.is_empty() || !bounds.contains(&crop) {
            return Err(ReplayError::RegionOutOfBounds(format!(
                "crop {crop:?} does not fit capture surface {src_width}x{src_height}"
            )));
        }
        let out_width = crop.width & !1;
        let out_height = crop.height & !1;

        let frames_ctx = Self::create_frames_ctx(&device, src_width, src_height)?;

        Ok(Self {
            device,
            frames_ctx,
            src_width,
            src_height,
            crop,
            out_width,
            out_height,
            shm_graph: None,
            dma_graph: None,
        })
    }

    pub fn output_size(&self) -> (u32, u32) {
        (self.out_width, self.out_height)
    }

    fn create_frames_ctx(
        device: &HwDevice,
        width: u32,
        height: u32,
    ) -> Result<*mut AVBufferRef> {
        let frames_ctx = create_hw_frame_ctx(device.as_ptr())?;
        unsafe {
            let ctx = &mut *((*frames_ctx).data as *mut AVHWFramesContext);
            ctx.width = width as i32;
            ctx.height = height as i32;
            ctx.sw_format = AVPixelFormat::AV_PIX_FMT_NV12;
            ctx.format = AVPixelFormat::AV_PIX_FMT_VAAPI;
            ctx.device_ref = av_buffer_ref(device.as_ptr());
            ctx.device_ctx = (*device.as_ptr()).data as *mut AVHWDeviceContext;
            ctx.initial_pool_size = 2;

            let err = av_hwframe_ctx_init(frames_ctx);
            if err < 0 {
                return Err(ReplayError::GpuOperation(format!(
                    "error initializing converter frame context: {err}"
                )));
            }
        }
        Ok(frames_ctx)
    }

    fn buffer_src_args(&self) -> String {
        format!(
            "video_size={}x{}:pix_fmt=bgra:time_base=1/10000000",
            self.src_width, self.src_height
        )
    }

    fn scale_args(&self) -> String {
        format!(
            "w={}:h={}:format=nv12:out_range=tv",
            self.out_width, self.out_height
        )
    }

    fn build_shm_graph(&self) -> Result<ffmpeg::filter::Graph> {
        let mut graph = ffmpeg::filter::Graph::new();

        let mut input = graph.add(
            &ffmpeg::filter::find("buffer")
                .ok_or_else(|| ReplayError::GpuOperation("buffer filter missing".into()))?,
            "in",
            &self.buffer_src_args(),
        )?;

        let crop_args = format!(
            "w={}:h={}:x={}:y={}:exact=1",
            self.out_width, self.out_height, self.crop.x, self.crop.y
        );
        let mut crop = graph.add(
            &ffmpeg::filter::find("crop")
                .ok_or_else(|| ReplayError::GpuOperation("crop filter missing".into()))?,
            "crop",
            &crop_args,
        )?;

        let mut upload = graph.add(
            &ffmpeg::filter::find("hwupload")
                .ok_or_else(|| ReplayError::GpuOperation("hwupload filter missing".into()))?,
            "upload",
            "",
        )?;

        let mut scale = graph.add(
            &ffmpeg::filter::find("scale_vaapi")
                .ok_or_else(|| ReplayError::GpuOperation("scale_vaapi filter missing".into()))?,
            "scale",
            &self.scale_args(),
        )?;

        let mut out = graph.add(
            &ffmpeg::filter::find("buffersink")
                .ok_or_else(|| ReplayError::GpuOperation("buffersink filter missing".into()))?,
            "out",
            "",
        )?;

        unsafe {
            (*upload.as_mut_ptr()).hw_device_ctx = av_buffer_ref(self.device.as_ptr());
        }

        input.link(0, &mut crop, 0);
        crop.link(0, &mut upload, 0);
        upload.link(0, &mut scale, 0);
        scale.link(0, &mut out, 0);

        graph.validate()?;
        log::trace!("SHM conversion graph\n{}", graph.dump());
        Ok(graph)
    }

    fn build_dma_graph(&self) -> Result<ffmpeg::filter::Graph> {
        let mut graph = ffmpeg::filter::Graph::new();

        let mut input = graph.add(
            &ffmpeg::filter::find("buffer")
                .ok_or_else(|| ReplayError::GpuOperation("buffer filter missing".into()))?,
            "in",
            &self.buffer_src_args(),
        )?;

        let mut hwmap = graph.add(
            &ffmpeg::filter::find("hwmap")
                .ok_or_else(|| ReplayError::GpuOperation("hwmap filter missing".into()))?,
            "hwmap",
            "mode=read+write:derive_device=vaapi",
        )?;

        let mut scale = graph.add(
            &ffmpeg::filter::find("scale_vaapi")
                .ok_or_else(|| ReplayError::GpuOperation("scale_vaapi filter missing".into()))?,
            "scale",
            &self.scale_args(),
        )?;

        let mut out = graph.add(
            &ffmpeg::filter::find("buffersink")
                .ok_or_else(|| ReplayError::GpuOperation("buffersink filter missing".into()))?,
            "out",
            "",
        )?;

        unsafe {
            (*hwmap.as_mut_ptr()).hw_device_ctx = av_buffer_ref(self.device.as_ptr());
        }

        input.link(0, &mut hwmap, 0);
        hwmap.link(0, &mut scale, 0);
        scale.link(0, &mut out, 0);

        graph.validate()?;
        log::trace!("DMA-BUF conversion graph\n{}", graph.dump());
        Ok(graph)
    }

    fn full_frame_crop(&self) -> bool {
        self.crop.x == 0
            && self.crop.y == 0
            && self.out_width == self.src_width & !1
            && self.out_height == self.src_height & !1
    }

    /// Wrap a DMA-BUF fd in a DRM-PRIME frame the graph can map.
    fn drm_prime_frame(&self, frame: &RawVideoFrame, fd: i32) -> ffmpeg::frame::Video {
        let mut drm_frame = ffmpeg::util::frame::Video::new(
            ffmpeg::format::Pixel::DRM_PRIME,
            self.src_width,
            self.src_height,
        );
        unsafe {
            let drm_desc = Box::into_raw(Box::new(std::mem::zeroed::<AVDRMFrameDescriptor>()));

            (*drm_desc).nb_objects = 1;
            (*drm_desc).objects[0].fd = fd;
            (*drm_desc).objects[0].size = 0;
            (*drm_desc).objects[0].format_modifier = 0;

            (*drm_desc).nb_layers = 1;
            (*drm_desc).layers[0].format = DrmFourcc::Argb8888 as u32;
            (*drm_desc).layers[0].nb_planes = 1;
            (*drm_desc).layers[0].planes[0].object_index = 0;
            (*drm_desc).layers[0].planes[0].offset = frame.offset as isize;
            (*drm_desc).layers[0].planes[0].pitch = frame.stride as isize;

            (*drm_frame.as_mut_ptr()).data[0] = drm_desc as *mut u8;
            (*drm_frame.as_mut_ptr()).buf[0] = av_buffer_create(
                drm_desc as *mut u8,
                std::mem::size_of::<AVDRMFrameDescriptor>(),
                Some(av_buffer_default_free),
                null_mut(),
                0,
            );

            (*drm_frame.as_mut_ptr()).hw_frames_ctx = av_buffer_ref(self.frames_ctx);
        }
        drm_frame.set_pts(Some(frame.timestamp));
        drm_frame
    }

    /// Copy mapped BGRA bytes into a software frame, honoring the capture
    /// stride.
    fn software_frame(&self, frame: &RawVideoFrame) -> Result<ffmpeg::frame::Video> {
        let mut sw_frame = ffmpeg::util::frame::Video::new(
            ffmpeg::format::Pixel::BGRA,
            self.src_width,
            self.src_height,
        );
        let src_stride = if frame.stride > 0 {
            frame.stride as usize
        } else {
            self.src_width as usize * 4
        };
        let row_bytes = self.src_width as usize * 4;
        let dst_stride = sw_frame.stride(0);
        let height = self.src_height as usize;

        if frame.data.len() < frame.offset as usize + (height - 1) * src_stride + row_bytes {
            return Err(ReplayError::GpuOperation(format!(
                "mapped frame too short: {} bytes for {}x{} stride {src_stride}",
                frame.data.len(),
                self.src_width,
                self.src_height
            )));
        }

        let src = &frame.data[frame.offset as usize..];
        let dst = sw_frame.data_mut(0);
        for row in 0..height {
            let s = &src[row * src_stride..row * src_stride + row_bytes];
            dst[row * dst_stride..row * dst_stride + row_bytes].copy_from_slice(s);
        }
        sw_frame.set_pts(Some(frame.timestamp));
        Ok(sw_frame)
    }

    fn run_graph(
        graph: &mut ffmpeg::filter::Graph,
        input: &ffmpeg::frame::Video,
    ) -> Result<Option<ffmpeg::frame::Video>> {
        graph
            .get("in")
            .ok_or_else(|| ReplayError::GpuOperation("graph lost its input".into()))?
            .source()
            .add(input)
            .map_err(|e| ReplayError::GpuOperation(format!("filter rejected frame: {e}")))?;

        let mut converted = ffmpeg::util::frame::Video::empty();
        match graph
            .get("out")
            .ok_or_else(|| ReplayError::GpuOperation("graph lost its output".into()))?
            .sink()
            .frame(&mut converted)
        {
            Ok(()) => Ok(Some(converted)),
            // The graph may legitimately hold on to the first frame.
            Err(ffmpeg::Error::Other { errno: libc::EAGAIN }) => Ok(None),
            Err(e) => Err(ReplayError::GpuOperation(format!(
                "filter sink failed: {e}"
            ))),
        }
    }
}

impl ColorConverter for VaapiConverter {
    fn convert(&mut self, frame: &RawVideoFrame) -> Result<Option<ffmpeg::frame::Video>> {
        match frame.dmabuf_fd {
            Some(fd) if self.full_frame_crop() => {
                if self.dma_graph.is_none() {
                    self.dma_graph = Some(self.build_dma_graph()?);
                }
                let drm_frame = self.drm_prime_frame(frame, fd);
                let graph = self.dma_graph.as_mut().expect("graph just built");
                Self::run_graph(graph, &drm_frame)
            }
            _ => {
                if frame.data.is_empty() {
                    return Err(ReplayError::GpuOperation(
                        "sub-region capture needs mapped pixels but the frame is zero-copy only"
                            .into(),
                    ));
                }
                if self.shm_graph.is_none() {
                    self.shm_graph = Some(self.build_shm_graph()?);
                }
                let sw_frame = self.software_frame(frame)?;
                let graph = self.shm_graph.as_mut().expect("graph just built");
                Self::run_graph(graph, &sw_frame)
            }
        }
    }
}

impl Drop for VaapiConverter {
    fn drop(&mut self) {
        unsafe {
            av_buffer_unref(&mut self.frames_ctx);
        }
    }
}
