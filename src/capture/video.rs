use std::{
    os::fd::{FromRawFd, OwnedFd, RawFd},
    sync::{mpsc, Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use portal_screencast_waycap::ActiveScreenCast;

use pipewire::{
    self as pw,
    context::Context,
    core::{Core, Listener},
    main_loop::MainLoop,
    spa::{
        buffer::{Data, DataType},
        pod::Pod,
        utils::Direction,
    },
    stream::{Stream, StreamFlags, StreamListener, StreamState},
};
use pw::{properties::properties, spa};

use crate::types::{
    config::Rect,
    error::{ReplayError, Result},
    video_frame::RawVideoFrame,
};
use crate::utils::{even, ticks_since};

use super::{FrameSource, Terminate};

/// Longest `acquire_latest` will wait for the compositor before falling
/// back to the cached frame.
const ACQUIRE_WAIT: Duration = Duration::from_millis(3);

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy)]
struct Negotiated {
    width: u32,
    height: u32,
    refresh: u32,
}

/// Newest-wins slot the stream callback publishes into and the pacing
/// thread drains. An unconsumed frame is simply replaced; the replay
/// window only ever wants the latest one.
struct FrameMailbox {
    slot: Mutex<Option<RawVideoFrame>>,
    cond: Condvar,
    fatal: Mutex<Option<String>>,
}

impl FrameMailbox {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
            fatal: Mutex::new(None),
        }
    }

    fn publish(&self, frame: RawVideoFrame) {
        *self.slot.lock().unwrap() = Some(frame);
        self.cond.notify_one();
    }

    fn take_within(&self, timeout: Duration) -> Option<RawVideoFrame> {
        let guard = self.slot.lock().unwrap();
        let (mut guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |slot| slot.is_none())
            .unwrap();
        guard.take()
    }

    fn set_fatal(&self, reason: String) {
        let mut fatal = self.fatal.lock().unwrap();
        if fatal.is_none() {
            *fatal = Some(reason);
        }
        self.cond.notify_one();
    }

    fn fatal(&self) -> Option<String> {
        self.fatal.lock().unwrap().clone()
    }
}

/// Display-compositor frame source backed by a PipeWire screencast
/// stream running on its own thread.
pub struct PipewireFrameSource {
    mailbox: Arc<FrameMailbox>,
    cached: Option<RawVideoFrame>,
    region: Rect,
    width: u32,
    height: u32,
    refresh: u32,
    terminate_tx: Option<pw::channel::Sender<Terminate>>,
    worker: Option<std::thread::JoinHandle<Result<()>>>,
    /// Portal session backing the stream; closed on stop.
    session: Option<ActiveScreenCast>,
}

impl PipewireFrameSource {
    /// Bind to the portal session's stream and wait for format
    /// negotiation. `start_time` is the pipeline's t=0; frame timestamps
    /// are ticks since then.
    pub fn connect(session: ActiveScreenCast, start_time: Instant) -> Result<Self> {
        let pipewire_fd = session.pipewire_fd();
        let stream_node = session
            .streams()
            .next()
            .ok_or_else(|| ReplayError::Portal("portal session has no streams".into()))?
            .pipewire_node();
        Self::connect_node(session, pipewire_fd, stream_node, start_time)
    }

    fn connect_node(
        session: ActiveScreenCast,
        pipewire_fd: RawFd,
        stream_node: u32,
        start_time: Instant,
    ) -> Result<Self> {
        let mailbox = Arc::new(FrameMailbox::new());
        let mailbox_pw = Arc::clone(&mailbox);

        let (pw_sender, pw_recv) = pw::channel::channel();
        let (format_tx, format_rx) = mpsc::channel::<Negotiated>();

        let worker = std::thread::Builder::new()
            .name("pw-video-capture".into())
            .spawn(move || -> Result<()> {
                let mut stream = match PipewireStream::new(
                    pipewire_fd,
                    stream_node,
                    mailbox_pw,
                    format_tx,
                    start_time,
                    pw_recv,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        log::error!("error initializing pipewire video stream: {e}");
                        return Err(e);
                    }
                };
                stream.run()
            })
            .map_err(|e| ReplayError::DeviceInit(format!("could not spawn capture thread: {e}")))?;

        // Wait for the negotiated format before handing the source out.
        let deadline = Instant::now() + NEGOTIATION_TIMEOUT;
        let negotiated = loop {
            match format_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(n) => break n,
                Err(mpsc::RecvTimeoutError::Timeout) if Instant::now() < deadline => continue,
                Err(_) => {
                    let _ = pw_sender.send(Terminate);
                    let _ = worker.join();
                    return Err(ReplayError::DeviceInit(
                        "timed out waiting for pipewire to negotiate a video format".into(),
                    ));
                }
            }
        };
        log::info!(
            "video capture negotiated {}x{} @ {} Hz",
            negotiated.width,
            negotiated.height,
            negotiated.refresh
        );

        Ok(Self {
            mailbox,
            cached: None,
            region: Rect::new(
                0,
                0,
                even(negotiated.width),
                even(negotiated.height),
            ),
            width: negotiated.width,
            height: negotiated.height,
            refresh: negotiated.refresh.max(30),
            terminate_tx: Some(pw_sender),
            worker: Some(worker),
            session: Some(session),
        })
    }
}

impl FrameSource for PipewireFrameSource {
    fn acquire_latest(&mut self) -> Result<Option<RawVideoFrame>> {
        if let Some(reason) = self.mailbox.fatal() {
            return Err(ReplayError::Fatal(reason));
        }
        match self.mailbox.take_within(ACQUIRE_WAIT) {
            Some(frame) => {
                if frame.repeatable() {
                    self.cached = Some(frame.clone());
                }
                Ok(Some(frame))
            }
            // Compositor reported nothing new: repeat the last frame when
            // we safely can, so the encoder keeps its cadence on a static
            // screen.
            None => Ok(self.cached.clone()),
        }
    }

    fn set_region(&mut self, rect: Rect) -> Result<()> {
        let bounds = Rect::new(0, 0, self.width, self.height);
        let rect = Rect {
            width: even(rect.width),
            height: even(rect.height),
            ..rect
        };
        if rect.is_empty() || !bounds.contains(&rect) {
            return Err(ReplayError::RegionOutOfBounds(format!(
                "{rect:?} outside capture surface {}x{}",
                self.width, self.height
            )));
        }
        self.region = rect;
        Ok(())
    }

    fn region(&self) -> Rect {
        self.region
    }

    fn capture_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn refresh_rate(&self) -> u32 {
        self.refresh
    }

    fn stop(&mut self) {
        if let Some(tx) = self.terminate_tx.take() {
            let _ = tx.send(Terminate);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some(session) = self.session.take() {
            let _ = session.close();
        }
    }
}

impl Drop for PipewireFrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PipewireStream {
    termination_recv: Option<pw::channel::Receiver<Terminate>>,
    state: PipewireState,
}

// Need to keep all of these alive even if never referenced
struct PipewireState {
    pw_loop: MainLoop,
    _pw_context: Context,
    _core: Core,
    _core_listener: Listener,
    _stream: Stream,
    _stream_listener: StreamListener<UserData>,
}

#[derive(Clone, Copy, Default)]
struct UserData {
    video_format: spa::param::video::VideoInfoRaw,
}

impl PipewireStream {
    fn new(
        pipewire_fd: RawFd,
        stream_node: u32,
        mailbox: Arc<FrameMailbox>,
        format_tx: mpsc::Sender<Negotiated>,
        start_time: Instant,
        termination_recv: pw::channel::Receiver<Terminate>,
    ) -> Result<Self> {
        let pw_loop = MainLoop::new(None)?;
        let context = Context::new(&pw_loop)?;
        let mut core = context.connect_fd(unsafe { OwnedFd::from_raw_fd(pipewire_fd) }, None)?;
        let core_listener = Self::setup_core_listener(&mut core, Arc::clone(&mailbox))?;
        let mut stream = Self::create_stream(&core)?;
        let stream_listener = Self::setup_stream_listener(
            &mut stream,
            UserData::default(),
            mailbox,
            format_tx,
            start_time,
        )?;
        Self::connect_stream(&mut stream, stream_node)?;

        Ok(Self {
            termination_recv: Some(termination_recv),
            state: PipewireState {
                pw_loop,
                _pw_context: context,
                _core: core,
                _core_listener: core_listener,
                _stream: stream,
                _stream_listener: stream_listener,
            },
        })
    }

    fn create_stream(core: &Core) -> Result<Stream> {
        Stream::new(
            core,
            "replaycap-video",
            properties! {
                *pw::keys::MEDIA_TYPE => "Video",
                *pw::keys::MEDIA_CATEGORY => "Capture",
                *pw::keys::MEDIA_ROLE => "Screen",
            },
        )
        .map_err(ReplayError::from)
    }

    fn setup_core_listener(core: &mut Core, mailbox: Arc<FrameMailbox>) -> Result<Listener> {
        Ok(core
            .add_listener_local()
            .info(|i| log::debug!("VIDEO CORE:\n{i:#?}"))
            .error(move |id, seq, res, message| {
                log::error!("pipewire core error: {id},{seq},{res},{message}");
                mailbox.set_fatal(format!("pipewire core error: {message}"));
            })
            .done(|d, _| log::debug!("DONE: {d}"))
            .register())
    }

    fn setup_stream_listener(
        stream: &mut Stream,
        data: UserData,
        mailbox: Arc<FrameMailbox>,
        format_tx: mpsc::Sender<Negotiated>,
        start_time: Instant,
    ) -> Result<StreamListener<UserData>> {
        let mailbox_process = Arc::clone(&mailbox);

        let stream_listener = stream
            .add_local_listener_with_user_data(data)
            .state_changed(move |_, _, old, new| {
                log::info!("Video Stream State Changed: {old:?} -> {new:?}");
                if matches!(new, StreamState::Error(_)) {
                    mailbox.set_fatal("video stream entered error state".into());
                }
            })
            .param_changed(move |_, user_data, id, param| {
                let Some(param) = param else {
                    return;
                };

                if id != pw::spa::param::ParamType::Format.as_raw() {
                    return;
                }

                let (media_type, media_subtype) =
                    match pw::spa::param::format_utils::parse_format(param) {
                        Ok(v) => v,
                        Err(_) => return,
                    };

                if media_type != pw::spa::param::format::MediaType::Video
                    || media_subtype != pw::spa::param::format::MediaSubtype::Raw
                {
                    return;
                }

                if user_data.video_format.parse(param).is_err() {
                    log::error!("failed to parse negotiated video format");
                    return;
                }

                let size = user_data.video_format.size();
                let rate = user_data.video_format.framerate();
                let refresh = if rate.denom > 0 { rate.num / rate.denom } else { 0 };
                log::debug!(
                    "  format: {} size: {}x{} rate: {}/{}",
                    user_data.video_format.format().as_raw(),
                    size.width,
                    size.height,
                    rate.num,
                    rate.denom
                );
                if format_tx
                    .send(Negotiated {
                        width: size.width,
                        height: size.height,
                        refresh,
                    })
                    .is_err()
                {
                    log::debug!("format update after negotiation: {}x{}", size.width, size.height);
                }
            })
            .process(move |stream, udata| match stream.dequeue_buffer() {
                None => log::debug!("out of video buffers"),
                Some(mut buffer) => {
                    let datas = buffer.datas_mut();
                    if datas.is_empty() {
                        return;
                    }

                    let timestamp = ticks_since(start_time);
                    let size = udata.video_format.size();

                    let data = &mut datas[0];
                    let fd = Self::get_dmabuf_fd(data);
                    let chunk_stride = data.chunk().stride();
                    let chunk_offset = data.chunk().offset();
                    let chunk_size = data.chunk().size();

                    mailbox_process.publish(RawVideoFrame {
                        data: data.data().unwrap_or_default().to_vec(),
                        timestamp,
                        dmabuf_fd: fd,
                        stride: chunk_stride,
                        offset: chunk_offset,
                        size: chunk_size,
                        width: size.width,
                        height: size.height,
                    });
                }
            })
            .register()?;

        Ok(stream_listener)
    }

    fn connect_stream(stream: &mut Stream, stream_node: u32) -> Result<()> {
        let pw_obj = pw::spa::pod::object!(
            pw::spa::utils::SpaTypes::ObjectParamFormat,
            pw::spa::param::ParamType::EnumFormat,
            pw::spa::pod::property!(
                pw::spa::param::format::FormatProperties::MediaType,
                Id,
                pw::spa::param::format::MediaType::Video
            ),
            pw::spa::pod::property!(
                pw::spa::param::format::FormatProperties::MediaSubtype,
                Id,
                pw::spa::param::format::MediaSubtype::Raw
            ),
            pw::spa::pod::property!(
                pw::spa::param::format::FormatProperties::VideoModifier,
                Long,
                0
            ),
            pw::spa::pod::property!(
                pw::spa::param::format::FormatProperties::VideoFormat,
                Choice,
                Enum,
                Id,
                pw::spa::param::video::VideoFormat::BGRA,
                pw::spa::param::video::VideoFormat::BGRx,
            ),
            pw::spa::pod::property!(
                pw::spa::param::format::FormatProperties::VideoSize,
                Choice,
                Range,
                Rectangle,
                pw::spa::utils::Rectangle {
                    width: 2560,
                    height: 1440
                }, // Default
                pw::spa::utils::Rectangle {
                    width: 1,
                    height: 1
                }, // Min
                pw::spa::utils::Rectangle {
                    width: 8192,
                    height: 8192
                } // Max
            ),
            pw::spa::pod::property!(
                pw::spa::param::format::FormatProperties::VideoFramerate,
                Choice,
                Range,
                Fraction,
                pw::spa::utils::Fraction { num: 240, denom: 1 }, // Default
                pw::spa::utils::Fraction { num: 0, denom: 1 },   // Min
                pw::spa::utils::Fraction { num: 244, denom: 1 }  // Max
            ),
        );

        let video_spa_values: Vec<u8> = pw::spa::pod::serialize::PodSerializer::serialize(
            std::io::Cursor::new(Vec::new()),
            &pw::spa::pod::Value::Object(pw_obj),
        )
        .map_err(|e| ReplayError::PipeWire(format!("could not serialize format pod: {e:?}")))?
        .0
        .into_inner();

        let mut video_params = [Pod::from_bytes(&video_spa_values)
            .ok_or_else(|| ReplayError::PipeWire("invalid format pod".into()))?];
        stream.connect(
            Direction::Input,
            Some(stream_node),
            StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS,
            &mut video_params,
        )?;

        Ok(())
    }

    /// Finalizes the pipewire run loop with a terminate receiver and runs it.
    /// Blocks the current thread so this must be called in a separate thread.
    fn run(&mut self) -> Result<()> {
        let terminate_loop = self.state.pw_loop.clone();
        let terminate_recv = self
            .termination_recv
            .take()
            .ok_or_else(|| ReplayError::Validation("stream already running".into()))?;
        let _recv = terminate_recv.attach(self.state.pw_loop.loop_(), move |_| {
            log::debug!("Terminating video capture loop");
            terminate_loop.quit();
        });

        self.state.pw_loop.run();

        Ok(())
    }

    fn get_dmabuf_fd(data: &Data) -> Option<RawFd> {
        let raw_data = data.as_raw();

        if data.type_() == DataType::DmaBuf {
            let fd = raw_data.fd;

            if fd > 0 {
                return Some(fd as i32);
            }
        }

        None
    }
}
