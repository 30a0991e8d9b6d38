use anyhow::{Context, bail};
use scanout::{
    FrameClock, KmsDisplay,
    backend::kms::{self, output},
    config::{self, DisplayConfig, ModeRequest},
};
use smithay::reexports::drm::control::{connector, from_u32};
use smithay_drm_extras::display_info;
use std::{backtrace::Backtrace, fs, path::PathBuf, time::Instant};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "\
usage: scanout [--device PATH] [--mode NAME[@RATE]] [--config PATH] [COMMAND]

commands:
  check                 resolve device, output, mode and crtc (default)
  outputs               list connectors and their modes
  clock [FPS] [FRAMES]  run the frame clock and report the observed interval";

const DEFAULT_CLOCK_FRAMES: u64 = 120;

#[derive(Debug, Default)]
struct Args {
    device: Option<PathBuf>,
    mode: Option<String>,
    config: Option<PathBuf>,
    command: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    init_backtrace_defaults();
    init_logging()?;
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = Backtrace::force_capture();
        tracing::error!("panic: {panic_info}\n{backtrace}");
        eprintln!("panic: {panic_info}\n{backtrace}");
    }));

    let args = parse_args(std::env::args().skip(1))?;
    let config = load_config(&args)?;
    tracing::debug!(?config, "effective config");

    match args.command.first().map(String::as_str) {
        None | Some("check") => check(&config),
        Some("outputs") => list_outputs(&config),
        Some("clock") => run_clock(&config, &args.command[1..]),
        Some("help") => {
            println!("{USAGE}");
            Ok(())
        }
        Some(other) => bail!("unknown command {other:?}\n{USAGE}"),
    }
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut args = Args::default();
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--device" | "--mode" | "--config" => {
                let Some(value) = raw.next() else {
                    bail!("{arg} needs a value\n{USAGE}");
                };
                match arg.as_str() {
                    "--device" => args.device = Some(PathBuf::from(value)),
                    "--mode" => args.mode = Some(value),
                    _ => args.config = Some(PathBuf::from(value)),
                }
            }
            "-h" | "--help" => args.command = vec!["help".to_owned()],
            flag if flag.starts_with("--") => bail!("unknown flag {flag}\n{USAGE}"),
            _ => args.command.push(arg),
        }
    }
    Ok(args)
}

fn load_config(args: &Args) -> anyhow::Result<DisplayConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let mut config = config::load_from_path(path)?;
            config::apply_overrides(&mut config, |key| std::env::var(key).ok())?;
            config
        }
        None => config::load()?,
    };

    if let Some(device) = &args.device {
        config.device = Some(device.clone());
    }
    if let Some(mode) = &args.mode {
        config.mode = Some(ModeRequest::parse(mode, "--mode")?);
    }
    Ok(config)
}

fn check(config: &DisplayConfig) -> anyhow::Result<()> {
    let display = KmsDisplay::initialize(config).context("failed to initialize display")?;
    let mode = display.mode();
    let binding = display.binding();
    let (width, height) = display.surface_size();

    println!("device:    {}", display.device_path().display());
    println!(
        "connector: {} (encoder {}, crtc {} at index {})",
        binding.connector_id, binding.encoder_id, binding.crtc_id, binding.crtc_index
    );
    println!(
        "mode:      {} {}x{}@{}{}",
        mode.name,
        mode.width,
        mode.height,
        mode.refresh,
        if mode.preferred { " (preferred)" } else { "" }
    );
    println!(
        "surface:   {width}x{height} {:?} {:?}",
        display.format(),
        display.modifier()
    );

    display.shutdown();
    Ok(())
}

fn list_outputs(config: &DisplayConfig) -> anyhow::Result<()> {
    let (device, snapshot) =
        kms::read_outputs(config.device.as_deref()).context("failed to read outputs")?;
    println!("{}", device.path().display());

    for connector in &snapshot.connectors {
        let state = if connector.connected {
            "connected"
        } else {
            "disconnected"
        };
        let info = from_u32::<connector::Handle>(connector.id)
            .and_then(|handle| display_info::for_connector(device.fd(), handle));
        let make = info
            .as_ref()
            .and_then(|info| info.make())
            .unwrap_or_else(|| "Unknown".into());
        let model = info
            .as_ref()
            .and_then(|info| info.model())
            .unwrap_or_else(|| "Unknown".into());

        println!("{} [{}] {state}, {make} {model}", connector.name, connector.id);
        for (index, mode) in connector.modes.iter().enumerate() {
            println!(
                "  {index:>2}: {} {}x{}@{}{}",
                mode.name,
                mode.width,
                mode.height,
                mode.refresh,
                if mode.preferred { " *" } else { "" }
            );
        }
    }

    match output::resolve_output(&snapshot, config.mode.as_ref()) {
        Ok(selection) => println!(
            "would drive connector {} with {} on crtc {}",
            selection.binding.connector_id, selection.mode.name, selection.binding.crtc_id
        ),
        Err(err) => println!("no usable output: {err}"),
    }
    Ok(())
}

fn run_clock(config: &DisplayConfig, args: &[String]) -> anyhow::Result<()> {
    let fps = match args.first() {
        Some(raw) => raw
            .parse::<f64>()
            .with_context(|| format!("invalid frame rate {raw:?}"))?,
        None => config.fps,
    };
    let frames = match args.get(1) {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("invalid frame count {raw:?}"))?,
        None => DEFAULT_CLOCK_FRAMES,
    };
    if frames == 0 {
        bail!("frame count must be positive");
    }

    let mut clock = FrameClock::new(fps)?;
    let started = Instant::now();
    for _ in 0..frames {
        clock.tick();
    }
    let elapsed = started.elapsed();

    let average_ms = elapsed.as_secs_f64() * 1000.0 / frames as f64;
    let target_ms = clock.interval_ns() as f64 / 1_000_000.0;
    tracing::info!(fps, frames, average_ms, target_ms, "frame clock finished");
    println!("{frames} frames at {fps} fps: average {average_ms:.3} ms, target {target_ms:.3} ms");
    Ok(())
}

fn init_logging() -> anyhow::Result<()> {
    let log_dir = std::env::var_os("SCANOUT_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("log"));
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::never(&log_dir, "scanout.log");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(true)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_appender),
        )
        .init();

    let log_file = log_dir.join("scanout.log");
    tracing::debug!(path = %log_file.display(), "logging initialized");

    Ok(())
}

fn init_backtrace_defaults() {
    if std::env::var_os("RUST_BACKTRACE").is_none() {
        // Safety: called at startup before creating any threads.
        unsafe { std::env::set_var("RUST_BACKTRACE", "1") };
    }
    if std::env::var_os("RUST_LIB_BACKTRACE").is_none() {
        // Safety: called at startup before creating any threads.
        unsafe { std::env::set_var("RUST_LIB_BACKTRACE", "0") };
    }
}

const DEFAULT_LOG_FILTER: &str = concat!(
    "scanout=info,",
    "scanout::backend::kms::flip=debug,",
    "smithay::backend::drm=warn"
);
