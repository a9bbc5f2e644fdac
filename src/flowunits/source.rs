use async_trait::async_trait;
use flowbox_macros::FlowUnitDesc;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::buffers::{Buffer, DataMeta};
use crate::core::{
    Configuration, DataContext, DeferCond, FlowError, FlowType, FlowUnit, FlowUnitEvent, Result,
    StatusCode, WeakContext,
};
use crate::engine::{StreamState, TimerScheduler, TimerTask};
use crate::observability::FlowUnitMetrics;
use crate::resilience::{RetryDecision, RetryPolicy, SourceContext};

pub const STREAM_META_INPUT: &str = "in_video_url";
pub const PACKET_OUTPUT: &str = "out_video_packet";

pub const SOURCE_URL_META: &str = "source_url";
pub const CODEC_META: &str = "codec_id";
pub const PROFILE_META: &str = "profile_id";
/// Input stream meta key holding a `RetryPolicy` for this stream
pub const RETRY_META: &str = "source_retry";
/// Set on the single end-of-stream buffer
pub const EOS_META: &str = "eos";

const SESSION_KEY: &str = "packet_source_session";

/// One demuxed packet
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub pts: i64,
    pub dts: i64,
}

/// Properties of an opened stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamInfo {
    pub codec_id: i32,
    pub profile_id: i32,
    pub time_base: f64,
    pub rate_num: i32,
    pub rate_den: i32,
    pub width: i32,
    pub height: i32,
    pub rotate_angle: i32,
    pub duration: i64,
}

/// An opened packet stream
pub trait StreamReader: Send {
    fn stream_info(&self) -> StreamInfo;

    /// `Ok(None)` at the end of data; errors are treated as transient
    fn read_packet(&mut self) -> Result<Option<Packet>>;
}

/// Opens readers for source locators
pub trait ReaderFactory: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn StreamReader>>;
}

struct SourceSession {
    state: StreamState,
    reader: Option<Box<dyn StreamReader>>,
    info: StreamInfo,
    retry: Option<SourceContext>,
    timer: Option<TimerTask>,
    meta: Arc<DataMeta>,
    end_written: bool,
    packets: u64,
}

impl SourceSession {
    fn new(meta: Arc<DataMeta>) -> Self {
        Self {
            state: StreamState::Idle,
            reader: None,
            info: StreamInfo::default(),
            retry: None,
            timer: None,
            meta,
            end_written: false,
            packets: 0,
        }
    }

    fn transition(&mut self, next: StreamState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(&next) {
            warn!(from = self.state.name(), to = next.name(), "ignoring invalid stream transition");
            return;
        }
        debug!(from = self.state.name(), to = next.name(), "stream transition");
        self.state = next;
    }

    fn fail(&mut self, error: &FlowError) {
        self.transition(StreamState::Failed {
            error_msg: error.to_string(),
        });
    }
}

type SharedSession = Mutex<SourceSession>;

fn lock(session: &SharedSession) -> MutexGuard<'_, SourceSession> {
    session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Opens `url` and publishes its stream properties
fn init_reader(
    factory: &dyn ReaderFactory,
    session: &mut SourceSession,
    url: &str,
    statistics: Option<&FlowUnitMetrics>,
) -> Result<()> {
    let reader = factory.open(url)?;
    let info = reader.stream_info();

    session.meta.set(CODEC_META, info.codec_id);
    session.meta.set(PROFILE_META, info.profile_id);
    session.meta.set(SOURCE_URL_META, url.to_string());

    if let Some(statistics) = statistics {
        statistics.set_item("frame_rate_num", info.rate_num);
        statistics.set_item("frame_rate_den", info.rate_den);
    }

    info!(
        url,
        codec_id = info.codec_id,
        rate_num = info.rate_num,
        rate_den = info.rate_den,
        "source opened"
    );
    session.reader = Some(reader);
    session.info = info;
    Ok(())
}

/// Timer callback: reopens the source and wakes the stream up
fn reconnect_now(ctx: &WeakContext, factory: &Weak<dyn ReaderFactory>) {
    let (Some(factory), Some(session)) = (
        factory.upgrade(),
        ctx.private::<SharedSession>(SESSION_KEY),
    ) else {
        return;
    };

    {
        let mut session = lock(&session);
        let url = session
            .retry
            .as_ref()
            .and_then(|retry| retry.source_url())
            .map(str::to_string);

        let statistics = ctx.statistics();
        let status = match url {
            Some(url) => match init_reader(factory.as_ref(), &mut session, &url, statistics.as_deref()) {
                Ok(()) => StatusCode::Ok,
                Err(e) => {
                    info!(url, error = %e, "reconnect failed");
                    session.reader = None;
                    StatusCode::Fault
                }
            },
            None => StatusCode::Fault,
        };

        if let Some(retry) = session.retry.as_mut() {
            retry.set_last_process_status(status);
        }
    }

    ctx.send_event(FlowUnitEvent::new("source_reconnect"));
}

/// Reconnecting stream source
///
/// Emits one packet per `process` call and asks for continuation. Read
/// failures, and the end of data when `reconnect_on_eof` is set, go through
/// the stream's retry context: reconnection runs on the timer, and the stream
/// ends with a single end-of-stream buffer once retrying stops.
#[derive(FlowUnitDesc)]
#[flowunit(
    name = "packet_source",
    group = "Video",
    flow_type = "stream",
    description = "reads packets from a stream locator and reconnects on failure",
    external_factory
)]
pub struct PacketSourceFlowUnit {
    #[input(name = "in_video_url")]
    _input: (),

    #[output(name = "out_video_packet")]
    _output: (),

    #[option(name = "reconnect_on_eof", kind = "bool", default = "false", description = "reconnect when the source reports end of data")]
    reconnect_on_eof: bool,

    #[option(name = "retry", kind = "object", description = "retry policy used when the input stream provides none")]
    retry: Option<RetryPolicy>,

    factory: Arc<dyn ReaderFactory>,
    timer: Arc<TimerScheduler>,
}

struct ReconnectScope<'a> {
    ctx: &'a mut DataContext,
    session: &'a mut SourceSession,
}

impl PacketSourceFlowUnit {
    pub fn new(factory: Arc<dyn ReaderFactory>, timer: Arc<TimerScheduler>) -> Self {
        Self {
            _input: (),
            _output: (),
            reconnect_on_eof: false,
            retry: None,
            factory,
            timer,
        }
    }

    /// Current state of the stream handled in `ctx`
    pub fn stream_state(ctx: &DataContext) -> Option<StreamState> {
        let session = ctx.private::<SharedSession>(SESSION_KEY)?;
        let state = lock(&session).state.clone();
        Some(state)
    }

    fn source_url(ctx: &DataContext) -> Option<String> {
        let from_meta = ctx
            .input_meta(STREAM_META_INPUT)
            .and_then(|meta| meta.get::<String>(SOURCE_URL_META));
        if from_meta.is_some() {
            return from_meta;
        }

        let Some(inputs) = ctx.input(STREAM_META_INPUT).filter(|inputs| !inputs.is_empty()) else {
            error!("source url not found in input");
            return None;
        };
        if inputs.len() > 1 {
            warn!("only one url per stream is supported");
        }

        let bytes = inputs.const_buffer_data(0)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    fn create_retry_task(&self, ctx: &DataContext, session: &mut SourceSession, url: &str) -> bool {
        let policy = ctx
            .input_meta(STREAM_META_INPUT)
            .and_then(|meta| meta.get::<RetryPolicy>(RETRY_META))
            .or_else(|| self.retry.clone());
        let Some(policy) = policy else {
            return false;
        };

        let mut retry = SourceContext::new(policy).with_reconnect_on_eof(self.reconnect_on_eof);
        retry.set_source_url(url);
        retry.set_last_process_status(StatusCode::Fault);
        session.retry = Some(retry);

        let weak_ctx = ctx.downgrade();
        let factory = Arc::downgrade(&self.factory);
        session.timer = Some(TimerTask::new("source_reconnect", move || {
            reconnect_now(&weak_ctx, &factory)
        }));
        true
    }

    fn write_packet(ctx: &mut DataContext, info: &StreamInfo, packet: Packet) -> Result<()> {
        let mut buffer = Buffer::new(ctx.device().clone());
        let (pts, dts) = (packet.pts, packet.dts);
        if packet.data.is_empty() {
            // a zero sized packet tells the decoder that packets ended
            buffer.build(1)?;
        } else {
            buffer.build_from_owned(packet.data, drop)?;
        }

        buffer.set("pts", pts);
        buffer.set("dts", dts);
        buffer.set("time_base", info.time_base);
        buffer.set("rate_num", info.rate_num);
        buffer.set("rate_den", info.rate_den);
        buffer.set("width", info.width);
        buffer.set("height", info.height);
        buffer.set("rotate_angle", info.rotate_angle);
        buffer.set("duration", info.duration);
        ctx.output(PACKET_OUTPUT).push_back(buffer);
        Ok(())
    }

    fn write_end(ctx: &mut DataContext, session: &mut SourceSession) -> Result<()> {
        if session.end_written {
            return Ok(());
        }

        let mut end = Buffer::new(ctx.device().clone());
        if let Err(e) = end.build(1) {
            error!(error = %e, "failed to build end of stream buffer");
            return Err(FlowError::fault(format!("cannot write end of stream: {}", e.message())));
        }
        let info = &session.info;
        end.set(EOS_META, true);
        end.set("rate_num", info.rate_num);
        end.set("rate_den", info.rate_den);
        end.set("duration", info.duration);
        end.set("time_base", info.time_base);
        ctx.output(PACKET_OUTPUT).push_back(end);

        session.end_written = true;
        info!(packets = session.packets, "end of stream written");
        Ok(())
    }

    fn reconnect(&self, scope: &mut ReconnectScope<'_>, status: StatusCode) -> Result<StatusCode> {
        DeferCond::new(
            |outcome: &Result<StatusCode>| matches!(outcome, Ok(StatusCode::Success)),
            |scope: &mut ReconnectScope<'_>| Self::write_end(scope.ctx, scope.session),
        )
        .try_run(scope, |scope| {
            let session = &mut *scope.session;
            let Some(retry) = session.retry.as_mut() else {
                if status == StatusCode::NoData {
                    session.transition(StreamState::Stopped);
                    return Ok(StatusCode::Success);
                }
                let err = FlowError::new(status, "source failed and no retry is configured");
                session.fail(&err);
                return Err(err);
            };

            retry.set_last_process_status(status);
            let decision = retry.need_retry();
            let attempts = retry.attempts();
            let interval = retry.retry_interval();

            match decision {
                RetryDecision::NoNeed => {
                    let err = FlowError::fault(format!("source failed after {attempts} reconnect attempts"));
                    session.fail(&err);
                    Err(err)
                }
                RetryDecision::Stop => {
                    session.transition(StreamState::Stopped);
                    Ok(StatusCode::Success)
                }
                RetryDecision::Retry => {
                    session.transition(StreamState::Retrying { attempt: attempts });
                    if let Some(task) = &session.timer {
                        info!(attempt = attempts, delay_ms = interval.as_millis() as u64, "reconnect scheduled");
                        self.timer.schedule(task, interval, Duration::ZERO);
                    }
                    Ok(StatusCode::Continue)
                }
            }
        })
    }
}

#[async_trait]
impl FlowUnit for PacketSourceFlowUnit {
    async fn open(&mut self, config: &Configuration) -> Result<()> {
        self.reconnect_on_eof = config.get_bool("reconnect_on_eof", false);
        self.retry = config
            .get_value("retry")
            .map(|value| serde_json::from_value::<RetryPolicy>(value.clone()))
            .transpose()
            .map_err(|e| FlowError::bad_config(format!("invalid retry policy: {e}")))?;
        Ok(())
    }

    async fn data_pre(&self, ctx: &mut DataContext) -> Result<StatusCode> {
        let Some(url) = Self::source_url(ctx) else {
            error!("source url is missing, fill the input url correctly");
            return Err(FlowError::fault("source url is missing"));
        };

        let meta = DataMeta::new();
        meta.set(CODEC_META, 0i32);
        meta.set(PROFILE_META, 0i32);
        meta.set(SOURCE_URL_META, String::new());
        ctx.set_output_meta(PACKET_OUTPUT, meta.clone());

        let shared = Arc::new(Mutex::new(SourceSession::new(meta)));
        ctx.set_private(SESSION_KEY, shared.clone());
        let mut session = lock(&shared);
        session.transition(StreamState::Connecting);

        let opened = init_reader(self.factory.as_ref(), &mut session, &url, Some(ctx.statistics().as_ref()));
        if let Err(e) = &opened {
            info!(url, error = %e, "failed to open source");
        }
        let can_retry = self.create_retry_task(ctx, &mut session, &url);

        match opened {
            Ok(()) => {
                session.transition(StreamState::Streaming);
                Ok(StatusCode::Success)
            }
            Err(_) if can_retry => {
                session.transition(StreamState::Retrying { attempt: 0 });
                Ok(StatusCode::Success)
            }
            Err(e) => {
                session.fail(&e);
                Err(e)
            }
        }
    }

    async fn process(&self, ctx: &mut DataContext) -> Result<StatusCode> {
        let shared = ctx
            .private::<SharedSession>(SESSION_KEY)
            .ok_or_else(|| FlowError::fault("stream was not opened"))?;
        let mut session = lock(&shared);

        match &session.state {
            StreamState::Stopped => return Ok(StatusCode::Success),
            StreamState::Failed { error_msg } => return Err(FlowError::fault(error_msg.clone())),
            _ => {}
        }

        let read = match session.reader.as_mut() {
            Some(reader) => reader.read_packet(),
            None => Err(FlowError::fault("source is not connected")),
        };

        match read {
            Ok(Some(packet)) => {
                Self::write_packet(ctx, &session.info, packet)?;
                session.packets += 1;
                if let Some(retry) = session.retry.as_mut() {
                    retry.record_delivery();
                }
                session.transition(StreamState::Streaming);
                ctx.send_event(FlowUnitEvent::new("packet"));
                Ok(StatusCode::Continue)
            }
            Ok(None) => {
                let mut scope = ReconnectScope { ctx, session: &mut *session };
                self.reconnect(&mut scope, StatusCode::NoData)
            }
            Err(e) => {
                debug!(error = %e, "read failed");
                let mut scope = ReconnectScope { ctx, session: &mut *session };
                self.reconnect(&mut scope, e.code())
            }
        }
    }

    async fn data_post(&self, ctx: &mut DataContext) -> Result<StatusCode> {
        let Some(shared) = ctx.private::<SharedSession>(SESSION_KEY) else {
            return Ok(StatusCode::Ok);
        };

        // Stopping waits for a running callback, which needs the session lock
        let timer = lock(&shared).timer.take();
        if let Some(timer) = timer {
            timer.stop();
        }
        Ok(StatusCode::Ok)
    }

    fn flow_type(&self) -> FlowType {
        FlowType::Stream
    }
}
