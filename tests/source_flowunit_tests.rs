use flowbox::buffers::{Buffer, BufferList, DataMeta};
use flowbox::core::{Configuration, DataContext, FlowUnit, RuntimeConfig};
use flowbox::engine::{OutputBatch, StreamExecutor, StreamOutcome, StreamState, TimerScheduler};
use flowbox::flowunits::source::{
    CODEC_META, EOS_META, PACKET_OUTPUT, RETRY_META, SOURCE_URL_META, STREAM_META_INPUT,
};
use flowbox::flowunits::{Packet, PacketSourceFlowUnit, ReaderFactory, StreamInfo, StreamReader};
use flowbox::hal::{Device, DeviceRegistry, MockAccelerator};
use flowbox::memory::{MemoryManager, PoolConfig};
use flowbox::resilience::RetryPolicy;
use flowbox::{FlowError, Result, StatusCode};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// One scripted connection: `packets` packets, then an error or the end of data
#[derive(Clone, Copy)]
struct Connection {
    packets: u32,
    then_error: bool,
}

impl Connection {
    fn clean(packets: u32) -> Option<Self> {
        Some(Self { packets, then_error: false })
    }

    fn broken(packets: u32) -> Option<Self> {
        Some(Self { packets, then_error: true })
    }
}

/// Hands out scripted connections in order; `None` or an empty script fails the open
#[derive(Default)]
struct ScriptedFactory {
    script: Mutex<VecDeque<Option<Connection>>>,
    urls: Mutex<Vec<String>>,
}

impl ScriptedFactory {
    fn new(script: Vec<Option<Connection>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            urls: Mutex::new(Vec::new()),
        })
    }

    fn opens(&self) -> usize {
        self.urls.lock().unwrap().len()
    }

    fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

struct ScriptedReader {
    connection: Connection,
    sent: u32,
}

impl StreamReader for ScriptedReader {
    fn stream_info(&self) -> StreamInfo {
        StreamInfo {
            codec_id: 173,
            profile_id: 1,
            time_base: 0.001,
            rate_num: 30,
            rate_den: 1,
            width: 320,
            height: 240,
            rotate_angle: 90,
            duration: 4,
        }
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        if self.sent < self.connection.packets {
            self.sent += 1;
            let pts = i64::from(self.sent) * 33;
            return Ok(Some(Packet {
                data: vec![self.sent as u8; 16],
                pts,
                dts: pts - 1,
            }));
        }
        if self.connection.then_error {
            return Err(FlowError::fault("connection reset by peer"));
        }
        Ok(None)
    }
}

impl ReaderFactory for ScriptedFactory {
    fn open(&self, url: &str) -> Result<Box<dyn StreamReader>> {
        self.urls.lock().unwrap().push(url.to_string());
        match self.script.lock().unwrap().pop_front().flatten() {
            Some(connection) => Ok(Box::new(ScriptedReader { connection, sent: 0 })),
            None => Err(FlowError::fault(format!("cannot connect to {url}"))),
        }
    }
}

fn device() -> Arc<Device> {
    DeviceRegistry::default().create_device("cpu", "0").unwrap()
}

fn stream_context(url: &str) -> DataContext {
    let mut ctx = DataContext::new(device());
    let meta = DataMeta::new();
    meta.set(SOURCE_URL_META, url.to_string());
    ctx.set_input_meta(STREAM_META_INPUT, meta);
    ctx
}

async fn source(
    factory: Arc<ScriptedFactory>,
    timer: Arc<TimerScheduler>,
    config: Configuration,
) -> PacketSourceFlowUnit {
    let mut unit = PacketSourceFlowUnit::new(factory, timer);
    unit.open(&config).await.unwrap();
    unit
}

fn fixed_retry(interval_ms: u64, max_attempts: u32) -> Configuration {
    Configuration::new().with(
        "retry",
        json!({"type": "fixed", "interval_ms": interval_ms, "max_attempts": max_attempts}),
    )
}

fn take_packets(ctx: &mut DataContext) -> Vec<Buffer> {
    ctx.take_outputs()
        .remove(PACKET_OUTPUT)
        .map(BufferList::into_vec)
        .unwrap_or_default()
}

async fn run(
    executor: &StreamExecutor,
    unit: PacketSourceFlowUnit,
    ctx: DataContext,
) -> (flowbox::engine::StreamReport, Vec<OutputBatch>) {
    let (tx, mut rx) = mpsc::channel(256);
    let report = executor
        .run_stream("source", Arc::new(unit), ctx, tx)
        .await
        .unwrap();

    let mut batches = Vec::new();
    while let Some(batch) = rx.recv().await {
        batches.push(batch);
    }
    (report, batches)
}

fn executor(event_timeout_ms: u64) -> StreamExecutor {
    let config = RuntimeConfig {
        event_timeout_ms: Some(event_timeout_ms),
        ..RuntimeConfig::default()
    };
    StreamExecutor::new(&config)
}

#[tokio::test]
async fn test_end_of_data_without_retry_writes_one_eos() {
    let factory = ScriptedFactory::new(vec![Connection::clean(3)]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let unit = source(factory.clone(), timer.clone(), Configuration::new()).await;
    let mut ctx = stream_context("rtsp://camera/1");

    assert_eq!(unit.data_pre(&mut ctx).await.unwrap(), StatusCode::Success);
    assert_eq!(PacketSourceFlowUnit::stream_state(&ctx), Some(StreamState::Streaming));

    for expected_pts in [33i64, 66, 99] {
        assert_eq!(unit.process(&mut ctx).await.unwrap(), StatusCode::Continue);
        let packets = take_packets(&mut ctx);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].get::<i64>("pts"), Some(expected_pts));
        assert!(ctx.try_event().is_some());
    }

    assert_eq!(unit.process(&mut ctx).await.unwrap(), StatusCode::Success);
    let packets = take_packets(&mut ctx);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].get::<bool>(EOS_META), Some(true));
    assert_eq!(packets[0].get::<i32>("rate_num"), Some(30));
    assert_eq!(packets[0].get::<i64>("duration"), Some(4));
    assert_eq!(PacketSourceFlowUnit::stream_state(&ctx), Some(StreamState::Stopped));

    // a stopped stream stays quiet
    assert_eq!(unit.process(&mut ctx).await.unwrap(), StatusCode::Success);
    assert!(take_packets(&mut ctx).is_empty());

    unit.data_post(&mut ctx).await.unwrap();
    assert_eq!(timer.scheduled_count(), 0);
    assert_eq!(factory.opens(), 1);
}

#[tokio::test]
async fn test_packet_meta_and_stream_meta() {
    let factory = ScriptedFactory::new(vec![Connection::clean(1)]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let unit = source(factory, timer, Configuration::new()).await;
    let mut ctx = stream_context("file:///videos/a.mp4");

    unit.data_pre(&mut ctx).await.unwrap();
    let meta = ctx.output_meta(PACKET_OUTPUT).unwrap();
    assert_eq!(meta.get::<i32>(CODEC_META), Some(173));
    assert_eq!(meta.get::<String>(SOURCE_URL_META).as_deref(), Some("file:///videos/a.mp4"));
    assert_eq!(ctx.statistics().item("frame_rate_num"), Some(json!(30)));

    unit.process(&mut ctx).await.unwrap();
    let packets = take_packets(&mut ctx);
    let packet = &packets[0];
    assert_eq!(packet.data().unwrap(), &[1u8; 16]);
    assert_eq!(packet.get::<i64>("dts"), Some(32));
    assert_eq!(packet.get::<f64>("time_base"), Some(0.001));
    assert_eq!(packet.get::<i32>("width"), Some(320));
    assert_eq!(packet.get::<i32>("height"), Some(240));
    assert_eq!(packet.get::<i32>("rotate_angle"), Some(90));
}

#[tokio::test]
async fn test_url_from_input_buffer() {
    let factory = ScriptedFactory::new(vec![Connection::clean(0)]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let unit = source(factory.clone(), timer, Configuration::new()).await;

    let mut ctx = DataContext::new(device());
    let mut urls = BufferList::new(ctx.device().clone());
    urls.build_from_host(&[10], b"udp://feed").unwrap();
    ctx.set_input(STREAM_META_INPUT, urls);

    assert_eq!(unit.data_pre(&mut ctx).await.unwrap(), StatusCode::Success);
    assert_eq!(factory.urls(), vec!["udp://feed".to_string()]);
}

#[tokio::test]
async fn test_missing_url_fails_data_pre() {
    let factory = ScriptedFactory::new(vec![]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let unit = source(factory.clone(), timer, Configuration::new()).await;
    let mut ctx = DataContext::new(device());

    let err = unit.data_pre(&mut ctx).await.unwrap_err();
    assert_eq!(err.code(), StatusCode::Fault);
    assert_eq!(factory.opens(), 0);
}

#[tokio::test]
async fn test_open_failure_without_retry_fails() {
    let factory = ScriptedFactory::new(vec![None]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let unit = source(factory, timer, Configuration::new()).await;
    let mut ctx = stream_context("rtsp://down");

    assert!(unit.data_pre(&mut ctx).await.is_err());
    assert!(matches!(
        PacketSourceFlowUnit::stream_state(&ctx),
        Some(StreamState::Failed { .. })
    ));
}

#[tokio::test]
async fn test_bounded_retry_ends_failed() {
    let factory = ScriptedFactory::new(vec![]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let unit = source(factory.clone(), timer.clone(), fixed_retry(10, 3)).await;

    let (report, batches) = run(&executor(2000), unit, stream_context("rtsp://down")).await;

    match &report.outcome {
        StreamOutcome::Failed(err) => assert_eq!(err.code(), StatusCode::Fault),
        other => panic!("Expected Failed, got {:?}", other),
    }
    assert!(batches.is_empty());
    assert_eq!(timer.scheduled_count(), 3);
    assert_eq!(factory.opens(), 4);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(timer.scheduled_count(), 3);
    assert_eq!(factory.opens(), 4);
}

#[tokio::test]
async fn test_reconnect_after_read_error() {
    let factory = ScriptedFactory::new(vec![
        Connection::broken(2),
        None,
        Connection::clean(2),
    ]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let unit = source(factory.clone(), timer.clone(), fixed_retry(10, 3)).await;

    let (report, batches) = run(&executor(2000), unit, stream_context("rtsp://flaky")).await;

    assert_eq!(report.outcome, StreamOutcome::Finished(StatusCode::Success));
    assert_eq!(factory.opens(), 3);
    // read error, then failed reopen
    assert_eq!(timer.scheduled_count(), 2);

    let packets: Vec<_> = batches
        .into_iter()
        .inspect(|batch| assert_eq!(batch.port, PACKET_OUTPUT))
        .flat_map(|batch| batch.buffers.into_vec())
        .collect();
    assert_eq!(packets.len(), 5);
    let eos: Vec<_> = packets
        .iter()
        .filter(|p| p.get::<bool>(EOS_META) == Some(true))
        .collect();
    assert_eq!(eos.len(), 1);
    assert_eq!(packets[4].get::<bool>(EOS_META), Some(true));
}

#[tokio::test]
async fn test_success_resets_attempts() {
    // each connection breaks after one packet; four reconnects exceed max_attempts
    // only if the counter is never reset
    let factory = ScriptedFactory::new(vec![
        Connection::broken(1),
        Connection::broken(1),
        Connection::broken(1),
        Connection::broken(1),
        Connection::clean(1),
    ]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let unit = source(factory.clone(), timer.clone(), fixed_retry(5, 2)).await;

    let (report, _) = run(&executor(2000), unit, stream_context("rtsp://flaky")).await;

    assert_eq!(report.outcome, StreamOutcome::Finished(StatusCode::Success));
    assert_eq!(factory.opens(), 5);
    assert_eq!(timer.scheduled_count(), 4);
}

fn eos_count(packets: &[Buffer]) -> usize {
    packets
        .iter()
        .filter(|p| p.get::<bool>(EOS_META) == Some(true))
        .count()
}

fn flatten(batches: Vec<OutputBatch>) -> Vec<Buffer> {
    batches
        .into_iter()
        .flat_map(|batch| batch.buffers.into_vec())
        .collect()
}

#[tokio::test]
async fn test_open_without_data_does_not_reset_attempts() {
    // every reconnect succeeds but the connection breaks before the first packet
    let factory = ScriptedFactory::new(vec![Connection::broken(0); 20]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let unit = source(factory.clone(), timer.clone(), fixed_retry(1, 2)).await;

    let (report, batches) = run(&executor(2000), unit, stream_context("rtsp://half-open")).await;

    match &report.outcome {
        StreamOutcome::Failed(err) => assert_eq!(err.code(), StatusCode::Fault),
        other => panic!("Expected Failed, got {:?}", other),
    }
    assert!(batches.is_empty());
    assert_eq!(timer.scheduled_count(), 2);
    assert_eq!(factory.opens(), 3);
}

#[tokio::test]
async fn test_end_of_data_enters_retrying_with_reconnect_on_eof() {
    let factory = ScriptedFactory::new(vec![Connection::clean(1)]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let config = fixed_retry(100, 3).with("reconnect_on_eof", true);
    let unit = source(factory.clone(), timer.clone(), config).await;
    let mut ctx = stream_context("rtsp://camera/eof");

    unit.data_pre(&mut ctx).await.unwrap();
    assert_eq!(unit.process(&mut ctx).await.unwrap(), StatusCode::Continue);
    assert_eq!(PacketSourceFlowUnit::stream_state(&ctx), Some(StreamState::Streaming));
    assert_eq!(take_packets(&mut ctx).len(), 1);

    assert_eq!(unit.process(&mut ctx).await.unwrap(), StatusCode::Continue);
    assert_eq!(
        PacketSourceFlowUnit::stream_state(&ctx),
        Some(StreamState::Retrying { attempt: 1 })
    );
    assert!(take_packets(&mut ctx).is_empty());
    assert_eq!(timer.scheduled_count(), 1);

    unit.data_post(&mut ctx).await.unwrap();
}

#[tokio::test]
async fn test_reconnect_on_eof_resumes_streaming() {
    let factory = ScriptedFactory::new(vec![Connection::clean(1), Connection::clean(1)]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let config = fixed_retry(5, 2).with("reconnect_on_eof", true);
    let unit = source(factory.clone(), timer.clone(), config).await;

    let (report, batches) = run(&executor(2000), unit, stream_context("rtsp://loop")).await;

    assert_eq!(report.outcome, StreamOutcome::Finished(StatusCode::Success));
    // second connection delivered data, so the final cycle gets both attempts
    assert_eq!(factory.opens(), 4);
    assert_eq!(timer.scheduled_count(), 3);

    let packets = flatten(batches);
    assert_eq!(packets.len(), 3);
    assert_eq!(eos_count(&packets), 1);
    assert_eq!(packets[2].get::<bool>(EOS_META), Some(true));
}

#[tokio::test]
async fn test_reconnect_on_eof_exhausted_stops_with_one_eos() {
    let factory = ScriptedFactory::new(vec![Connection::clean(1)]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let config = fixed_retry(5, 2).with("reconnect_on_eof", true);
    let unit = source(factory.clone(), timer.clone(), config).await;

    let (report, batches) = run(&executor(2000), unit, stream_context("rtsp://gone")).await;

    assert_eq!(report.outcome, StreamOutcome::Finished(StatusCode::Success));
    assert_eq!(factory.opens(), 3);
    assert_eq!(timer.scheduled_count(), 2);

    let packets = flatten(batches);
    assert_eq!(packets.len(), 2);
    assert_eq!(eos_count(&packets), 1);
}

#[tokio::test]
async fn test_reconnect_on_eof_state_ends_stopped() {
    let factory = ScriptedFactory::new(vec![Connection::clean(0)]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let config = fixed_retry(1, 1).with("reconnect_on_eof", true);
    let unit = source(factory.clone(), timer.clone(), config).await;
    let mut ctx = stream_context("rtsp://gone");

    unit.data_pre(&mut ctx).await.unwrap();
    assert_eq!(unit.process(&mut ctx).await.unwrap(), StatusCode::Continue);
    ctx.wait_event(Some(Duration::from_secs(2))).await.unwrap();
    assert_eq!(factory.opens(), 2);

    assert_eq!(unit.process(&mut ctx).await.unwrap(), StatusCode::Success);
    assert_eq!(PacketSourceFlowUnit::stream_state(&ctx), Some(StreamState::Stopped));
    assert_eq!(eos_count(&take_packets(&mut ctx)), 1);

    unit.data_post(&mut ctx).await.unwrap();
}

#[tokio::test]
async fn test_end_of_stream_build_failure_is_an_error() {
    // packets wrap reader-owned bytes, only the end marker needs device memory
    let manager = MemoryManager::new(
        "mock:0",
        Arc::new(MockAccelerator::with_capacity(0)),
        &PoolConfig::default(),
    );
    let device = Arc::new(Device::new("mock", "0", manager));

    let factory = ScriptedFactory::new(vec![Connection::clean(1)]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let unit = source(factory, timer, Configuration::new()).await;
    let mut ctx = DataContext::new(device);
    let meta = DataMeta::new();
    meta.set(SOURCE_URL_META, "rtsp://camera/full".to_string());
    ctx.set_input_meta(STREAM_META_INPUT, meta);

    unit.data_pre(&mut ctx).await.unwrap();
    assert_eq!(unit.process(&mut ctx).await.unwrap(), StatusCode::Continue);
    assert_eq!(take_packets(&mut ctx).len(), 1);

    let err = unit.process(&mut ctx).await.unwrap_err();
    assert_eq!(err.code(), StatusCode::Fault);
    assert!(take_packets(&mut ctx).is_empty());
}

#[tokio::test]
async fn test_retry_policy_from_stream_meta() {
    let factory = ScriptedFactory::new(vec![]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let unit = source(factory.clone(), timer.clone(), fixed_retry(10, 5)).await;

    let ctx = stream_context("rtsp://down");
    ctx.input_meta(STREAM_META_INPUT)
        .unwrap()
        .set(RETRY_META, RetryPolicy::Immediate { max_attempts: 1 });

    let (report, _) = run(&executor(2000), unit, ctx).await;
    assert!(matches!(report.outcome, StreamOutcome::Failed(_)));
    assert_eq!(timer.scheduled_count(), 1);
    assert_eq!(factory.opens(), 2);
}

#[tokio::test]
async fn test_data_post_cancels_pending_reconnect() {
    let factory = ScriptedFactory::new(vec![]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let unit = source(factory.clone(), timer.clone(), fixed_retry(100, 5)).await;
    let mut ctx = stream_context("rtsp://down");

    assert_eq!(unit.data_pre(&mut ctx).await.unwrap(), StatusCode::Success);
    assert_eq!(
        PacketSourceFlowUnit::stream_state(&ctx),
        Some(StreamState::Retrying { attempt: 0 })
    );

    assert_eq!(unit.process(&mut ctx).await.unwrap(), StatusCode::Continue);
    assert_eq!(
        PacketSourceFlowUnit::stream_state(&ctx),
        Some(StreamState::Retrying { attempt: 1 })
    );
    assert_eq!(timer.scheduled_count(), 1);

    unit.data_post(&mut ctx).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(factory.opens(), 1);
    assert!(ctx.try_event().is_none());
}

#[tokio::test]
async fn test_event_timeout_ends_stream() {
    let factory = ScriptedFactory::new(vec![]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let unit = source(factory.clone(), timer.clone(), fixed_retry(1000, 5)).await;

    let (report, _) = run(&executor(50), unit, stream_context("rtsp://down")).await;

    assert_eq!(report.outcome, StreamOutcome::TimedOut);
    assert_eq!(report.invocations, 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(factory.opens(), 1);
}

#[tokio::test]
async fn test_invalid_retry_option_is_bad_config() {
    let factory = ScriptedFactory::new(vec![]);
    let timer = Arc::new(TimerScheduler::new().unwrap());
    let mut unit = PacketSourceFlowUnit::new(factory, timer);

    let config = Configuration::new().with("retry", json!({"type": "sometimes"}));
    let err = unit.open(&config).await.unwrap_err();
    assert_eq!(err.code(), StatusCode::BadConfig);
}
