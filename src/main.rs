use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use flowbox::buffers::BufferList;
use flowbox::core::{Configuration, DataContext, FlowUnit};
use flowbox::engine::{StreamExecutor, TimerScheduler};
use flowbox::flowunits::{
    Packet, PacketSourceFlowUnit, ReaderFactory, ResizeFlowUnit, StreamInfo, StreamReader,
};
use flowbox::hal::DeviceRegistry;
use flowbox::registry::FlowUnitRegistry;
use flowbox::{FlowError, Result, StatusCode};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

/// Synthetic source that drops its connection once
struct FlakySource {
    opened: AtomicU32,
}

struct CountingReader {
    remaining: u32,
    fail_after: Option<u32>,
}

impl StreamReader for CountingReader {
    fn stream_info(&self) -> StreamInfo {
        StreamInfo {
            codec_id: 27,
            time_base: 1.0 / 90_000.0,
            rate_num: 25,
            rate_den: 1,
            width: 64,
            height: 48,
            duration: 10,
            ..StreamInfo::default()
        }
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        if self.fail_after == Some(self.remaining) {
            return Err(FlowError::fault("connection reset"));
        }
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let pts = i64::from(10 - self.remaining) * 3600;
        Ok(Some(Packet {
            data: vec![0x47; 188],
            pts,
            dts: pts,
        }))
    }
}

impl ReaderFactory for FlakySource {
    fn open(&self, url: &str) -> Result<Box<dyn StreamReader>> {
        let attempt = self.opened.fetch_add(1, Ordering::SeqCst);
        info!(url, attempt, "opening synthetic source");
        let fail_after = (attempt == 0).then_some(5);
        Ok(Box::new(CountingReader {
            remaining: 10,
            fail_after,
        }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    flowbox::logging::init_logging();

    let config = flowbox::core::RuntimeConfig::from_json(json!({
        "max_workers": 2,
        "event_timeout_ms": 5000,
        "pool": { "maintenance_interval_ms": 1000 }
    }))?;

    let timer = Arc::new(TimerScheduler::new()?);
    let devices = DeviceRegistry::with_defaults(config.pool.clone());
    let cpu = devices.create_device("cpu", "0")?;
    cpu.start_maintenance(&timer, config.maintenance_interval());

    let units = FlowUnitRegistry::from_inventory();
    info!(units = ?units.list(), "flow units registered");

    let executor = StreamExecutor::new(&config);
    let (tx, mut rx) = mpsc::channel(64);

    let mut source = PacketSourceFlowUnit::new(
        Arc::new(FlakySource { opened: AtomicU32::new(0) }),
        timer.clone(),
    );
    source
        .open(&Configuration::new().with("retry", json!({ "type": "fixed", "interval_ms": 100, "max_attempts": 3 })))
        .await?;

    let mut urls = BufferList::new(cpu.clone());
    urls.build_from_host(&[17], b"demo://camera/one")?;
    let mut ctx = DataContext::new(cpu.clone());
    ctx.set_input("in_video_url", urls);

    let handle = executor.spawn_stream("packet_source", Arc::new(source), ctx, tx);
    let mut packets = 0;
    while let Some(batch) = rx.recv().await {
        for buffer in &batch.buffers {
            if buffer.get::<bool>("eos").unwrap_or(false) {
                info!(rate_num = buffer.get_or("rate_num", 0i32), "end of stream");
            } else {
                packets += 1;
            }
        }
    }
    let report = handle.await??;
    info!(packets, outcome = ?report.outcome, invocations = report.invocations, "source finished");

    let descriptor = ResizeFlowUnit::descriptor();
    let resize_config = descriptor.resolve(&Configuration::new().with("image_width", 32).with("image_height", 24))?;
    let mut resize = ResizeFlowUnit::new();
    resize.open(&resize_config).await?;

    let mut images = BufferList::new(cpu.clone());
    images.build_from_host(&[64 * 48 * 3], &vec![128u8; 64 * 48 * 3])?;
    images.set_meta("width", 64i32);
    images.set_meta("height", 48i32);
    images.set_meta("pix_fmt", "rgb".to_string());

    let mut ctx = DataContext::new(cpu.clone());
    ctx.set_input("in_image", images);
    let status = resize.process(&mut ctx).await?;
    let out = ctx.output("out_image");
    info!(%status, bytes = out.bytes(), "resize finished");
    anyhow::ensure!(status == StatusCode::Ok, "resize returned {status}");

    for (id, snapshot) in executor.collector().snapshot() {
        info!(unit = %id, snapshot = %serde_json::to_string(&snapshot)?, "metrics");
    }

    timer.shutdown();
    Ok(())
}
