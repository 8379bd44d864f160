// Copyright 2024 nvr-snap Authors
// SPDX-License-Identifier: Apache-2.0

//! nvr-snap CLI entry point
//!
//! Logs in to a recorder and saves a snapshot of every enabled channel.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use clap::{value_parser, Arg, ArgMatches, Command};
use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;

use nvr_snap::device::stub::{StubConfig, StubDevice};
use nvr_snap::{
    AgentConfig, CaptureConfig, Credentials, DeviceRuntime, DirectorySink, Dispatch,
    FanOutConfig, RuntimeConfig, SnapAgent, StreamType, MAX_IP_CHANNELS,
};

fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let matches = Command::new("nvr-snap")
        .version("0.1.0")
        .author("nvr-snap Authors")
        .about("Capture still images from every enabled channel of an NVR")
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .value_name("ADDR")
                .default_value("192.168.1.64")
                .help("Device address"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .default_value("8000")
                .help("Device port"),
        )
        .arg(
            Arg::new("user")
                .short('u')
                .long("user")
                .value_name("USER")
                .default_value("admin")
                .help("Login user name"),
        )
        .arg(
            Arg::new("password")
                .long("password")
                .value_name("PASSWORD")
                .default_value("")
                .help("Login password"),
        )
        .arg(
            Arg::new("output-dir")
                .short('o')
                .long("output-dir")
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .default_value("./snapshots")
                .help("Directory snapshots are written to"),
        )
        .arg(
            Arg::new("rounds")
                .short('n')
                .long("rounds")
                .value_name("N")
                .value_parser(value_parser!(u32))
                .default_value("1")
                .help("Number of capture rounds (0 runs until Ctrl+C)"),
        )
        .arg(
            Arg::new("interval-ms")
                .long("interval-ms")
                .value_name("MS")
                .value_parser(value_parser!(u64))
                .default_value("1000")
                .help("Minimum time between round starts"),
        )
        .arg(
            Arg::new("force-iframe")
                .long("force-iframe")
                .action(clap::ArgAction::SetTrue)
                .help("Request a key frame before each capture"),
        )
        .arg(
            Arg::new("stream")
                .long("stream")
                .value_name("0|1")
                .value_parser(value_parser!(u32))
                .default_value("0")
                .help("Stream the key frame is requested on (0 main, 1 sub)"),
        )
        .arg(
            Arg::new("serial")
                .long("serial")
                .action(clap::ArgAction::SetTrue)
                .help("Run captures one at a time on a single worker"),
        )
        .arg(
            Arg::new("buffer-ceiling-mb")
                .long("buffer-ceiling-mb")
                .value_name("MB")
                .value_parser(value_parser!(usize))
                .default_value("64")
                .help("Largest capture buffer in MiB"),
        )
        .arg(
            Arg::new("sim-channels")
                .long("sim-channels")
                .value_name("N")
                .value_parser(value_parser!(usize))
                .default_value("4")
                .help("Enabled channels of the simulated device"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(clap::ArgAction::SetTrue)
                .help("Print a JSON report after each round"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
        .get_matches();

    // Initialize logging
    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(log_level)
        .init()
        .context("Failed to initialize logging")?;

    let config = agent_config(&matches)?;
    info!("Starting nvr-snap with config: {config:?}");

    let sim_channels: usize = arg(&matches, "sim-channels")?;
    if sim_channels > MAX_IP_CHANNELS {
        return Err(anyhow!("At most {MAX_IP_CHANNELS} simulated channels are supported"));
    }
    let device = StubDevice::new(StubConfig {
        credentials: config.credentials.clone(),
        ..StubConfig::with_enabled_slots(sim_channels)
    });

    let runtime = DeviceRuntime::init(Arc::new(device), RuntimeConfig::default())
        .context("Failed to initialize device runtime")?;
    let sink = DirectorySink::new(&config.output_dir).with_context(|| {
        format!("Failed to create output directory {}", config.output_dir.display())
    })?;

    let rounds = config.rounds;
    let interval = config.interval;
    let json = matches.get_flag("json");

    let mut agent = SnapAgent::new(config, runtime, Arc::new(sink))?;
    agent.start().context("Failed to start snapshot agent")?;

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl+C handler")?;

    info!("Snapshot agent running, press Ctrl+C to stop");

    let mut done = 0u32;
    while running.load(Ordering::SeqCst) && (rounds == 0 || done < rounds) {
        let round_start = Instant::now();
        match agent.run_round() {
            Ok(report) => {
                if json {
                    println!("{}", serde_json::to_string(&report)?);
                }
            }
            Err(e) => error!("Capture round failed: {e}"),
        }
        done += 1;

        if rounds != 0 && done >= rounds {
            break;
        }
        let elapsed = round_start.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }

    info!("Stopping snapshot agent...");
    agent.stop();

    info!("Snapshot agent stopped");
    Ok(())
}

fn agent_config(matches: &ArgMatches) -> anyhow::Result<AgentConfig> {
    let key_frame = if matches.get_flag("force-iframe") {
        let stream: u32 = arg(matches, "stream")?;
        Some(StreamType::try_from(stream).map_err(|e| anyhow!("--stream {stream}: {e}"))?)
    } else {
        None
    };
    let ceiling_mb: usize = arg(matches, "buffer-ceiling-mb")?;
    let dispatch = if matches.get_flag("serial") {
        Dispatch::Serialized
    } else {
        Dispatch::Parallel
    };

    let user: String = arg(matches, "user")?;
    let password: String = arg(matches, "password")?;

    Ok(AgentConfig {
        address: arg(matches, "address")?,
        port: arg(matches, "port")?,
        credentials: Credentials::new(user, password),
        output_dir: arg(matches, "output-dir")?,
        rounds: arg(matches, "rounds")?,
        interval: Duration::from_millis(arg(matches, "interval-ms")?),
        capture: CaptureConfig {
            buffer_ceiling: ceiling_mb.saturating_mul(1024 * 1024),
            key_frame,
            ..Default::default()
        },
        fanout: FanOutConfig { dispatch },
        ..Default::default()
    })
}

fn arg<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, name: &str) -> anyhow::Result<T> {
    matches
        .get_one::<T>(name)
        .cloned()
        .ok_or_else(|| anyhow!("Missing value for --{name}"))
}
