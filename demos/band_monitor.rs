//! Find a nearby band, stream its heart rate for a while, then sync the week
//! of step counts.
//!
//! Run with: cargo run --example band_monitor

use async_trait::async_trait;
use chrono::NaiveDate;
use fitband_ble::{
    BtleplugAdapter, CharacteristicKind, ConnectOutcome, ConnectionSupervisor, Error,
    HealthStore, HistoryStore, MemoryStore, Result, SupervisorConfig, SyncConfig,
    TelemetrySyncPipeline, TracingSink,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Host health store with no data. The band only reports today, so the
/// other six dates are recorded with no source.
struct EmptyHealthStore;

#[async_trait]
impl HealthStore for EmptyHealthStore {
    async fn daily_step_count(&self, _date: NaiveDate) -> Result<Option<u32>> {
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fitband_ble=debug".parse().unwrap()),
        )
        .init();

    println!("Looking for a fitness band...");
    println!("Make sure the band is awake and not paired to a phone!\n");

    let adapter = BtleplugAdapter::new()
        .await
        .map_err(|_| Error::RadioStateUnknown)?;
    let sink = Arc::new(TracingSink);
    let supervisor = ConnectionSupervisor::builder(Arc::new(adapter))
        .config(SupervisorConfig::default())
        .telemetry(sink.clone(), "demo-user")
        .build();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let session = match supervisor.connect(None, &cancel).await {
        Ok(ConnectOutcome::Connected(session)) => session,
        Ok(ConnectOutcome::NotFound) => {
            println!("No band found nearby.");
            return Ok(());
        }
        Err(e) => {
            println!("Could not connect: {} ({:?})", e, e.category());
            return Err(e);
        }
    };

    println!("\nConnected:");
    println!("  ID: {:?}", session.peripheral_id);
    println!("  Matched by: {:?}", session.match_reasons);
    println!("  Services: {}", session.services.len());

    // Stream heart rate for 30 seconds
    let mut heart_rate = supervisor.monitor(CharacteristicKind::HeartRate).await?;
    let deadline = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = cancel.cancelled() => break,
            sample = heart_rate.next() => match sample {
                Some(sample) => match sample.heart_rate() {
                    Some(bpm) => println!("  Heart rate: {} BPM", bpm),
                    None => println!("  Undecodable sample: {:02X?}", sample.raw.as_ref()),
                },
                None => {
                    println!("Heart rate stream ended");
                    break;
                }
            },
        }
    }
    heart_rate.cancel();

    if supervisor.is_monitoring() {
        let pipeline = TelemetrySyncPipeline::new(
            Arc::new(EmptyHealthStore),
            HistoryStore::new(Arc::new(MemoryStore::new())),
            SyncConfig::new("demo-user"),
        )
        .with_device(Arc::new(supervisor.clone()))
        .with_sink(sink);

        match pipeline.sync_weekly_history(&cancel).await {
            Ok(week) => {
                println!("\nLast 7 days:");
                for record in &week.records {
                    println!("  {}: {} steps ({})", record.date, record.steps, record.source);
                }
                if !week.anomalies.is_clean() {
                    println!("  Anomalies: {:?}", week.anomalies.anomalies());
                }
            }
            Err(e) => println!("Sync failed: {}", e),
        }
    }

    println!("\nShutting down...");
    supervisor.shutdown().await?;

    Ok(())
}
