//! frametap-client: demo consumer for the shared-memory frame transport.
//!
//! Attaches to a frame region published by a capture-engine process,
//! drains frames as they arrive, and prints a transport/diagnostics
//! summary as JSON on exit.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use frametap::config::TransportConfig;
use frametap::transport::{SharedMemoryRingTransport, WaitOutcome};
use frametap::Diagnostics;

/// Consecutive wait timeouts before the client assumes the producer is
/// gone and exits.
const IDLE_TIMEOUTS: u32 = 10;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let region_name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "UndownUnlockFrameData".to_string());

    let diag = Arc::new(Diagnostics::default());
    let transport = SharedMemoryRingTransport::open_or_create(
        &region_name,
        &TransportConfig::default(),
        Arc::clone(&diag),
    )
    .with_context(|| format!("attaching to frame region '{region_name}'"))?;

    if transport.is_creator() {
        warn!(
            region = region_name,
            "region did not exist yet, created it; waiting for a producer"
        );
    } else {
        info!(region = region_name, "attached to frame region");
    }

    let mut idle = 0u32;
    let mut frames = 0u64;
    while idle < IDLE_TIMEOUTS {
        match transport.wait_for_frame(Duration::from_secs(1)) {
            WaitOutcome::Signalled => idle = 0,
            WaitOutcome::TimedOut => {
                idle += 1;
                continue;
            }
            WaitOutcome::Failed => {
                anyhow::bail!("frame signal wait failed for region '{region_name}'");
            }
        }
        while let Some(frame) = transport.read_frame() {
            frames += 1;
            info!(
                sequence = frame.sequence,
                width = frame.width,
                height = frame.height,
                stride = frame.stride,
                bytes = frame.data.len(),
                evicted_predecessor = frame
                    .flags
                    .contains(frametap::FrameFlags::EVICTED_PREDECESSOR),
                "frame received"
            );
        }
    }

    info!(frames, "no frames for {IDLE_TIMEOUTS} seconds, exiting");
    let summary = serde_json::json!({
        "region": region_name,
        "frames_received": frames,
        "transport": transport.stats(),
        "operations": diag.perf.operation_statistics(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("serializing summary")?
    );
    Ok(())
}
