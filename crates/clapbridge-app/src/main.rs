//! clapbridge - command-line host for the bridge plugins
//!
//! Lists devices and hosts the capture and render plugins on a block-timed
//! loop, so a device bridge can be exercised without a DAW.

mod host;
mod wav;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use clapbridge_audio::{BridgeConfig, StreamSession};
use clapbridge_clap::{AppLoopback, DeviceRender, InputCapture};
use clapbridge_core::Frames;
use clapbridge_device::cpal_backend::{input_devices, output_devices};
use clapbridge_device::{
    CpalBackend, DeviceBackend, DeviceError, DeviceId, DeviceInfo, LoopbackMode, LoopbackTarget,
};
use clapbridge_plugin::Plugin;
use host::{Host, Pacing, RunReport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use wav::WavSink;

/// Bridge OS audio devices and application loopback into a block-based host
#[derive(Parser, Debug)]
#[command(name = "clapbridge")]
#[command(about = "Bridge OS audio devices into fixed-block plugin hosts", long_about = None)]
struct Args {
    /// Bridge config file (RON); flags below override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Host sample rate (Hz)
    #[arg(short, long, global = true)]
    rate: Option<u32>,

    /// Host block size (frames)
    #[arg(short, long, global = true)]
    block: Option<Frames>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List input and output devices
    Devices,

    /// List the bridge plugins
    Plugins,

    /// Capture a device or loopback source into a WAV file
    Record(RecordArgs),

    /// Play an input device on an output device through the host loop
    Route(RouteArgs),

    /// Write the effective config to a RON file
    InitConfig {
        /// Output config file
        path: PathBuf,
    },
}

#[derive(ClapArgs, Debug)]
struct RecordArgs {
    /// Output WAV file
    #[arg(short, long)]
    output: PathBuf,

    /// Recording length (seconds)
    #[arg(short, long, default_value_t = 10.0)]
    seconds: f64,

    /// Input device name (default input device if omitted)
    #[arg(short, long, conflicts_with_all = ["loopback", "pid"])]
    device: Option<String>,

    /// Capture everything the system plays
    #[arg(long)]
    loopback: bool,

    /// Capture what this process tree plays
    #[arg(long, conflicts_with = "loopback")]
    pid: Option<u32>,

    /// With --pid, capture everything except that process tree
    #[arg(long, requires = "pid")]
    exclude: bool,
}

#[derive(ClapArgs, Debug)]
struct RouteArgs {
    /// Input device name (default input device if omitted)
    #[arg(long)]
    from: Option<String>,

    /// Output device name (default output device if omitted)
    #[arg(long)]
    to: Option<String>,

    /// How long to route (seconds)
    #[arg(short, long, default_value_t = 10.0)]
    seconds: f64,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "clapbridge=info".into()))
        .with(fmt::layer())
        .init();

    let args = Args::parse();
    let config = effective_config(&args)?;

    match args.command {
        Command::Devices => list_devices(),
        Command::Plugins => {
            list_plugins();
            Ok(())
        }
        Command::Record(record_args) => record(&config, &record_args),
        Command::Route(route_args) => route(&config, &route_args),
        Command::InitConfig { path } => {
            config
                .save(&path)
                .with_context(|| format!("Failed to write config: {}", path.display()))?;
            tracing::info!("Config written to {}", path.display());
            Ok(())
        }
    }
}

/// Config file, if any, with command-line overrides applied
fn effective_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    if let Some(rate) = args.rate {
        config.host.sample_rate = rate;
    }
    if let Some(block) = args.block {
        config.host.max_block_frames = block;
    }
    anyhow::ensure!(config.host.sample_rate > 0, "Sample rate must be non-zero");
    anyhow::ensure!(config.host.max_block_frames > 0, "Block size must be non-zero");
    config.host.min_block_frames = config.host.min_block_frames.min(config.host.max_block_frames);
    Ok(config)
}

fn print_devices(title: &str, devices: &[DeviceInfo]) {
    println!("{title}:");
    if devices.is_empty() {
        println!("  (none)");
    }
    for device in devices {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("  {}{}", device.name, marker);
    }
}

fn list_devices() -> Result<()> {
    let inputs = input_devices().context("Failed to list input devices")?;
    let outputs = output_devices().context("Failed to list output devices")?;
    print_devices("Input devices", &inputs);
    print_devices("Output devices", &outputs);
    Ok(())
}

fn list_plugins() {
    for descriptor in clapbridge_clap::descriptors() {
        println!(
            "{:<22} {:<10} {}",
            descriptor.id, descriptor.name, descriptor.description
        );
    }
}

/// The named device, or the default one of that list
fn pick_device(
    name: Option<&str>,
    devices: Result<Vec<DeviceInfo>, DeviceError>,
    kind: &str,
) -> Result<DeviceId> {
    if let Some(name) = name {
        return Ok(DeviceId::from(name));
    }
    devices
        .with_context(|| format!("Failed to list {kind} devices"))?
        .into_iter()
        .find(|device| device.is_default)
        .map(|device| device.id)
        .with_context(|| format!("No default {kind} device"))
}

fn frames_for(config: &BridgeConfig, seconds: f64) -> Result<Frames> {
    let duration = Duration::try_from_secs_f64(seconds)
        .with_context(|| format!("Invalid duration: {seconds} s"))?;
    Ok(config.host.format().frames_for(duration))
}

fn backend(config: &BridgeConfig) -> Arc<dyn DeviceBackend> {
    let backend = CpalBackend::with_default_period(config.tuning.device_period);
    tracing::info!("Using {} backend", backend.name());
    Arc::new(backend)
}

fn log_session(name: &str, session: &StreamSession) {
    tracing::info!("{} stats: {:?}", name, session.stats());
}

fn log_report(report: &RunReport) {
    tracing::info!(
        "Ran {} blocks ({} frames), {} sleeping, {} restarts",
        report.blocks,
        report.frames,
        report.sleeping_blocks,
        report.restarts
    );
}

fn record(config: &BridgeConfig, args: &RecordArgs) -> Result<()> {
    let total = frames_for(config, args.seconds)?;
    let backend = backend(config);
    let mut host = Host::new(config.host, Pacing::RealTime);
    let mut wav = WavSink::create(&args.output, config.host.sample_rate)?;

    let target = match (args.loopback, args.pid) {
        (true, _) => Some(LoopbackTarget::System),
        (false, Some(pid)) => Some(LoopbackTarget::Process {
            pid,
            mode: if args.exclude {
                LoopbackMode::ExcludeTree
            } else {
                LoopbackMode::IncludeTree
            },
        }),
        (false, None) => None,
    };

    tracing::info!("Recording {:.1} s to {}", args.seconds, args.output.display());
    if let Some(target) = target {
        let mut plugin =
            AppLoopback::new(host.handle(), backend).with_tuning(config.tuning.clone());
        plugin.select_target(target);
        host.activate(&mut plugin)?;
        let report = host.run_source(&mut plugin, total, |l, r| wav.write_block(l, r))?;
        log_session("Loopback", plugin.session());
        plugin.deactivate();
        log_report(&report);
    } else {
        let device = pick_device(args.device.as_deref(), input_devices(), "input")?;
        let mut plugin =
            InputCapture::new(host.handle(), backend).with_tuning(config.tuning.clone());
        plugin.select_device(device);
        host.activate(&mut plugin)?;
        let report = host.run_source(&mut plugin, total, |l, r| wav.write_block(l, r))?;
        log_session("Capture", plugin.session());
        plugin.deactivate();
        log_report(&report);
    }

    wav.finalize()?;
    tracing::info!("Done! Output written to {}", args.output.display());
    Ok(())
}

fn route(config: &BridgeConfig, args: &RouteArgs) -> Result<()> {
    let total = frames_for(config, args.seconds)?;
    let from = pick_device(args.from.as_deref(), input_devices(), "input")?;
    let to = pick_device(args.to.as_deref(), output_devices(), "output")?;
    let backend = backend(config);
    let mut host = Host::new(config.host, Pacing::RealTime);

    let mut source =
        InputCapture::new(host.handle(), backend.clone()).with_tuning(config.tuning.clone());
    source.select_device(from.clone());
    let mut sink = DeviceRender::new(host.handle(), backend).with_tuning(config.tuning.clone());
    sink.select_device(to.clone());

    host.activate(&mut source)?;
    host.activate(&mut sink)?;

    tracing::info!("Routing '{}' to '{}' for {:.1} s", from, to, args.seconds);
    let report = host.run_route(&mut source, &mut sink, total)?;

    log_session("Capture", source.session());
    log_session("Render", sink.session());
    source.deactivate();
    sink.deactivate();
    log_report(&report);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("clapbridge").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = parse(&["--rate", "44100", "--block", "256", "devices"]);
        let config = effective_config(&args).unwrap();
        assert_eq!(config.host.sample_rate, 44100);
        assert_eq!(config.host.max_block_frames, 256);
        assert_eq!(config.tuning, BridgeConfig::default().tuning);
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.ron");
        let mut saved = BridgeConfig::default();
        saved.host.sample_rate = 96000;
        saved.host.max_block_frames = 64;
        saved.save(&path).unwrap();

        let path_arg = path.to_string_lossy().into_owned();
        let args = parse(&["plugins", "--config", &path_arg, "--block", "128"]);
        let config = effective_config(&args).unwrap();
        assert_eq!(config.host.sample_rate, 96000);
        assert_eq!(config.host.max_block_frames, 128);
    }

    #[test]
    fn test_zero_block_rejected() {
        let args = parse(&["--block", "0", "devices"]);
        assert!(effective_config(&args).is_err());
    }

    #[test]
    fn test_record_source_flags() {
        let args = parse(&["record", "-o", "out.wav", "--pid", "42", "--exclude"]);
        let Command::Record(record) = args.command else {
            panic!("expected record");
        };
        assert_eq!(record.pid, Some(42));
        assert!(record.exclude);
        assert!(!record.loopback);

        assert!(
            Args::try_parse_from(["clapbridge", "record", "-o", "x.wav", "--exclude"]).is_err()
        );
        assert!(
            Args::try_parse_from([
                "clapbridge", "record", "-o", "x.wav", "--loopback", "--device", "mic"
            ])
            .is_err()
        );
    }

    #[test]
    fn test_named_device_skips_listing() {
        let listing = Err(DeviceError::Backend("no host".to_string()));
        let id = pick_device(Some("Mic"), listing, "input").unwrap();
        assert_eq!(id.as_str(), "Mic");
    }

    #[test]
    fn test_default_device_picked() {
        let listing = Ok(vec![
            DeviceInfo {
                id: "a".into(),
                name: "a".to_string(),
                is_default: false,
            },
            DeviceInfo {
                id: "b".into(),
                name: "b".to_string(),
                is_default: true,
            },
        ]);
        assert_eq!(pick_device(None, listing, "output").unwrap().as_str(), "b");
        assert!(pick_device(None, Ok(Vec::new()), "output").is_err());
    }

    #[test]
    fn test_negative_duration_rejected() {
        assert!(frames_for(&BridgeConfig::default(), -1.0).is_err());
        assert_eq!(frames_for(&BridgeConfig::default(), 0.5).unwrap(), 24000);
    }
}
