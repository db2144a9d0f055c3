//! Switching core demo
//!
//! Bridges two in-memory channels, plays a scripted sequence of frames into
//! the caller and prints how the bridge ended.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, ValueEnum};
use rvoip_switch_core::logging::setup_logging;
use rvoip_switch_core::prelude::*;
use rvoip_switch_core::tech::mock::MockTech;
use tracing::info;

/// What the caller does once bridged
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Send some audio, then hang up
    Relay,
    /// Dial the disconnect code
    Disconnect,
    /// Blind transfer the callee to an extension
    Transfer,
    /// Park the callee
    Park,
}

/// Switching core demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scenario to run
    #[arg(short, long, value_enum, default_value = "relay")]
    scenario: Scenario,

    /// Extension to blind transfer to
    #[arg(short, long, default_value = "2000")]
    exten: String,

    /// Log level, overrides the configuration
    #[arg(short, long)]
    log_level: Option<String>,

    /// Give up after this many seconds
    #[arg(short, long, default_value = "10")]
    time_limit: u64,
}

/// Code used to park the callee when the configuration has none
const DEMO_PARK_CODE: &str = "70";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SwitchConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => SwitchConfig::default(),
    };
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.scenario == Scenario::Park && config.features.parkcall.is_empty() {
        config.features.parkcall = DEMO_PARK_CODE.to_string();
    }
    config.validate().map_err(|e| anyhow!(e))?;
    setup_logging(&config.logging)?;

    let registry = ChannelRegistry::from_config(&config);
    let tech = Arc::new(MockTech::new("Mock"));
    registry.register_driver(tech.clone());

    let (alice, _) = tech.create(&registry, "Mock/alice")?;
    let (bob, bob_ep) = tech.create(&registry, "Mock/bob")?;

    let lot = ParkingLot::new(registry.clone(), &config.parking);
    let features = FeatureMap::from_config(&config.features)?.with_parking(lot.clone());
    let bridge_config = BridgeConfig {
        caller_features: FeaturePermissions::all(),
        time_limit: Some(Duration::from_secs(args.time_limit)),
        ..BridgeConfig::new(Arc::new(features))
    };

    let script = script_for(args.scenario, &config, &args.exten)?;
    info!("📞 Running {:?} scenario: {} scripted frames", args.scenario, script.len());
    let feeder = tokio::spawn(play_script(alice.clone(), script));

    let outcome = bridge(&alice, &bob, &bridge_config).await?;
    feeder.abort();

    println!("Bridge outcome: {}", serde_json::to_string(&outcome)?);
    println!("Frames relayed to bob: {}", bob_ep.written().len());

    match &outcome {
        BridgeOutcome::Transfer { exten, .. } => {
            let location = bob.location();
            println!("Bob continues at {}@{} (asked for {})", location.exten, location.context, exten);
        }
        BridgeOutcome::FeatureTerminated { feature, .. } if feature == "parkcall" => {
            println!("Parked calls: {}", serde_json::to_string_pretty(&lot.parked_calls())?);
        }
        _ => {}
    }
    println!("Channels: {}", serde_json::to_string_pretty(&registry.snapshots())?);

    for channel in registry.channels() {
        channel.hangup().ok();
    }
    Ok(())
}

/// Frames the caller sends, each after a pause
fn script_for(scenario: Scenario, config: &SwitchConfig, exten: &str) -> anyhow::Result<Vec<Frame>> {
    let silence = || Frame::voice(Format::Ulaw, vec![0xffu8; 160], 160);
    let mut script: Vec<Frame> = (0..5).map(|_| silence()).collect();

    let digits = match scenario {
        Scenario::Relay => {
            script.push(Frame::control(ControlKind::Hangup));
            return Ok(script);
        }
        Scenario::Disconnect => config.features.disconnect.clone(),
        Scenario::Transfer => format!("{}{}#", config.features.blindxfer, exten),
        Scenario::Park => config.features.parkcall.clone(),
    };
    if digits.is_empty() {
        return Err(anyhow!("no feature code configured for {:?}", scenario));
    }
    for c in digits.chars() {
        let digit = DtmfDigit::from_char(c).ok_or_else(|| anyhow!("{} is not a DTMF digit", c))?;
        script.push(Frame::dtmf_begin(digit));
        script.push(Frame::dtmf_end(digit, 120));
    }
    Ok(script)
}

async fn play_script(channel: Arc<Channel>, script: Vec<Frame>) {
    for frame in script {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !channel.queue_frame(frame) {
            break;
        }
    }
}
