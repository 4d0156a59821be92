//! Sleeplink command-line tool
//!
//! Runs a watch-to-phone session transfer over the in-process simulated
//! radio, optionally with injected faults, and prints what the phone stored.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast;
use uuid::Uuid;

use sleeplink::ble::simulated::{SimBleNetwork, SimMtu};
use sleeplink::{
    JsonFileSessionStore, LinkClient, LinkConfig, LinkServer, LinkStatus, MemorySessionStore,
    ReceivedSession, ServerEvent, SessionRecorder, SessionStore,
};

#[derive(Parser)]
#[command(name = "sleeplink")]
#[command(about = "Sleep session transfer over a BLE GATT link")]
struct Cli {
    /// JSON config file; missing fields use defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a synthetic night and send it from a simulated watch to a
    /// simulated phone
    Demo {
        /// Minutes of readings to record
        #[arg(short, long, default_value = "480")]
        minutes: u32,

        /// Store received sessions as JSON files under this directory
        #[arg(long)]
        store_dir: Option<PathBuf>,

        #[command(flatten)]
        faults: FaultArgs,
    },
    /// Print the effective configuration as JSON
    Config,
}

#[derive(Args, Debug, Clone, Default)]
struct FaultArgs {
    /// The watch cannot request a larger MTU
    #[arg(long)]
    no_mtu: bool,

    /// The phone rejects the MTU request
    #[arg(long)]
    reject_mtu: bool,

    /// Acknowledge this many writes with a failure
    #[arg(long, default_value = "0")]
    fail_writes: u32,

    /// Refuse to issue this many writes
    #[arg(long, default_value = "0")]
    busy_writes: u32,

    /// Refuse this many connection attempts
    #[arg(long, default_value = "0")]
    refuse_connects: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => LinkConfig::load(path)?,
        None => LinkConfig::default(),
    };

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Demo {
            minutes,
            store_dir,
            faults,
        } => {
            let session = match store_dir {
                Some(dir) => {
                    let store = Arc::new(JsonFileSessionStore::new(dir));
                    let id = run_demo(Arc::clone(&store), config, &faults, minutes).await?;
                    store
                        .load_all()?
                        .into_iter()
                        .find(|s| s.session_id == id)
                }
                None => {
                    let store = Arc::new(MemorySessionStore::new());
                    let id = run_demo(Arc::clone(&store), config, &faults, minutes).await?;
                    store.get(&id).await
                }
            };
            match session {
                Some(session) => print_session(&session)?,
                None => return Err("session was stored but could not be read back".into()),
            }
        }
    }

    Ok(())
}

/// Build a night of readings with a slow heart-rate drift and occasional
/// restlessness.
fn record_night(recorder: &mut SessionRecorder, start: i64, minutes: u32) -> i64 {
    for minute in 0..minutes as i64 {
        let t = start + minute * 60_000;
        let bpm = 52 + ((minute * 7) % 15) as i32;
        recorder.record_heart_rate(t, bpm);
        let restless = if minute % 45 == 0 { 1.2 } else { 0.1 };
        recorder.record_acceleration(t, restless, 0.05, 0.02);
    }
    start + minutes as i64 * 60_000
}

async fn run_demo<S: SessionStore>(
    store: Arc<S>,
    config: LinkConfig,
    faults: &FaultArgs,
    minutes: u32,
) -> Result<Uuid, Box<dyn std::error::Error>> {
    let network = SimBleNetwork::new();
    let central = Arc::new(network.create_central());
    let peripheral = Arc::new(network.create_peripheral());

    central.set_mtu_supported(!faults.no_mtu);
    if faults.reject_mtu {
        central.set_mtu_behaviour(SimMtu::Reject);
    }
    central.fail_next_writes(faults.fail_writes);
    central.busy_next_writes(faults.busy_writes);
    central.refuse_next_connects(faults.refuse_connects);

    let server = LinkServer::start(peripheral, store, config.clone()).await?;
    let mut server_events = server.subscribe();
    let client = LinkClient::spawn(central, config.clone());
    let mut statuses = client.subscribe();

    let mut recorder = SessionRecorder::start_now().with_live_status(client.status_sender());
    let start = recorder.session().start_time;
    let end = record_night(&mut recorder, start, minutes);
    let payload = recorder.finish(end).payload().to_bytes()?;
    println!("Sending {} byte session", payload.len());

    client.send(payload).await?;

    let budget = config.scan_timeout()
        + config.reconnect_delay() * (faults.refuse_connects + 1)
        + Duration::from_secs(30);
    let outcome = tokio::time::timeout(budget, async {
        loop {
            match statuses.recv().await {
                Ok(LinkStatus::HeartRateSample { .. }) => {}
                Ok(LinkStatus::TransferComplete { bytes, chunks }) => {
                    println!("Transfer complete: {} bytes in {} chunks", bytes, chunks);
                    return Ok(());
                }
                Ok(status @ (LinkStatus::TransferFailed { .. }
                | LinkStatus::ConnectionFailed
                | LinkStatus::ScanTimeout)) => {
                    return Err(format!("transfer did not complete: {:?}", status));
                }
                Ok(status) => println!("Link: {:?}", status),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("Skipped {} status updates", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err("link client stopped".to_string());
                }
            }
        }
    })
    .await
    .map_err(|_| "timed out waiting for the transfer")?;
    outcome?;

    let session_id = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match server_events.recv().await {
                Ok(ServerEvent::SessionStored { session_id }) => return Ok(session_id),
                Ok(ServerEvent::StoreFailed { error, .. }) => return Err(error),
                Ok(_) => {}
                Err(e) => return Err(e.to_string()),
            }
        }
    })
    .await
    .map_err(|_| "timed out waiting for the phone to store the session")??;

    client.shutdown().await;
    server.stop().await;
    Ok(session_id)
}

fn print_session(session: &ReceivedSession) -> Result<(), Box<dyn std::error::Error>> {
    println!("Stored session {}", session.session_id);
    println!("  from:        {}", session.device_address);
    println!("  received at: {}", session.received_at.to_rfc3339());
    if let Some(summary) = &session.summary {
        println!("{}", serde_json::to_string_pretty(summary)?);
    }
    Ok(())
}
