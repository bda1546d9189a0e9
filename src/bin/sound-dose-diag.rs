use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{info, warn};

use sound_dose::clock::{Clock, ManualClock, SystemClock};
use sound_dose::listener::DEFAULT_LISTENER_CAPACITY;
use sound_dose::{
    AudioFormat, ChannelListener, DeviceId, DoseConfig, MelProcessor, SoundDoseManager,
    StreamHandle,
};

#[path = "sound_dose_diag/report.rs"]
mod report;
use report::SimulationReport;

#[path = "sound_dose_diag/signal.rs"]
mod signal;
use signal::{Synthesizer, WavClip, Waveform};

fn main() -> ExitCode {
    sound_dose::init_logging();
    let cli = Cli::parse();
    match cli.execute() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("sound-dose-diag error: {err:?}");
            ExitCode::from(1)
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "sound-dose-diag", about = "Sound dose simulation and control CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn execute(self) -> Result<()> {
        match self.command {
            Command::Simulate(args) => simulate_command(args),
            Command::Serve(args) => serve_command(args),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Feed synthetic or recorded audio through the dose tracker.
    Simulate(SimulateArgs),
    /// Start the HTTP control surface (requires the http feature).
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    /// JSON configuration file, else $SOUND_DOSE_CONFIG or config/sound_dose.json.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> DoseConfig {
        match &self.config {
            Some(path) => DoseConfig::load_from_file(path),
            None => DoseConfig::load(),
        }
    }
}

#[derive(Args, Debug, Clone)]
struct SimulateArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Number of concurrent streams, each on its own device.
    #[arg(long, default_value_t = 1)]
    streams: usize,
    /// Seconds of audio to feed per stream.
    #[arg(long, default_value_t = 10)]
    seconds: usize,
    /// Exposure level per second in dBA, cycled when shorter than --seconds.
    #[arg(long = "level", value_name = "DBA", default_values_t = [85.0])]
    levels: Vec<f32>,
    /// Synthetic signal shape.
    #[arg(long, value_enum, default_value_t = SignalArg::Sine)]
    signal: SignalArg,
    /// Play a WAV file instead of a synthetic signal.
    #[arg(long)]
    wav: Option<PathBuf>,
    /// Sample rate for synthetic streams.
    #[arg(long, default_value_t = 48_000)]
    sample_rate: u32,
    /// Channel count for synthetic streams.
    #[arg(long, default_value_t = 2)]
    channels: usize,
    /// Seed for the noise generator.
    #[arg(long, default_value_t = 7)]
    seed: u64,
    /// Override the RS2 threshold in dBA.
    #[arg(long)]
    rs2: Option<f32>,
    /// Count exposure on every device instead of the loudest one.
    #[arg(long, default_value_t = false)]
    all_devices: bool,
    /// Output format for the simulation report.
    #[arg(long, value_enum, default_value_t = ReportFormat::Table)]
    format: ReportFormat,
    /// Destination file for the report (JSON only).
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct ServeArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Host interface, overrides the configuration.
    #[arg(long)]
    host: Option<String>,
    /// Port, overrides the configuration.
    #[arg(long)]
    port: Option<u16>,
    /// Token required by HTTP consumers, overrides the configuration.
    #[arg(long)]
    token: Option<String>,
    /// Feed one synthetic stream at this level in real time.
    #[arg(long, value_name = "DBA")]
    feed_level: Option<f32>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum SignalArg {
    Sine,
    Noise,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Table,
}

impl SimulateArgs {
    fn validate(&self) -> Result<()> {
        if self.streams == 0 {
            bail!("At least one stream is required");
        }
        if self.levels.is_empty() {
            bail!("Provide at least one --level");
        }
        if self.sample_rate == 0 || self.channels == 0 {
            bail!("Sample rate and channel count must be greater than zero");
        }
        if let Some(path) = &self.wav {
            if !path.exists() {
                bail!("WAV file {} does not exist", path.display());
            }
        }
        Ok(())
    }
}

/// Audio fed into every simulated stream.
enum Source {
    Synthetic(Vec<Synthesizer>),
    Wav(WavClip),
}

fn simulate_command(args: SimulateArgs) -> Result<()> {
    args.validate()?;
    let _span = tracing::info_span!("simulate", streams = args.streams).entered();
    let config = args.config.load();

    let (mut source, sample_rate, channels, seconds) = match &args.wav {
        Some(path) => {
            let clip = WavClip::load(path)?;
            let (rate, channels) = (clip.sample_rate, clip.channels);
            let seconds = args.seconds.min(clip.seconds());
            (Source::Wav(clip), rate, channels, seconds)
        }
        None => {
            let waveform = match args.signal {
                SignalArg::Sine => Waveform::Sine,
                SignalArg::Noise => Waveform::Noise,
            };
            let synths = (0..args.streams)
                .map(|index| {
                    Synthesizer::new(
                        waveform,
                        args.sample_rate,
                        args.channels,
                        config.processor.dbfs_to_dba_offset,
                        args.seed.wrapping_add(index as u64),
                    )
                })
                .collect();
            (
                Source::Synthetic(synths),
                args.sample_rate,
                args.channels,
                args.seconds,
            )
        }
    };

    // Simulated time advances one second per block of audio
    let clock = Arc::new(ManualClock::new(SystemClock.now_secs()));
    let manager = SoundDoseManager::with_clock(&config, clock.clone());
    // Every stream reports at least one event per simulated second
    let (listener, mut rx) =
        ChannelListener::with_capacity((args.streams * 2).max(DEFAULT_LISTENER_CAPACITY));
    let surface = manager
        .get_sound_dose_interface(Arc::new(listener.clone()))
        .context("registering simulation listener")?;

    if let Some(rs2) = args.rs2 {
        surface.set_output_rs2(rs2).context("applying --rs2")?;
    }
    if args.all_devices {
        surface.force_compute_csd_on_all_devices(true)?;
    }

    let mut processors: Vec<Arc<MelProcessor>> = Vec::with_capacity(args.streams);
    for index in 0..args.streams {
        let id = index as i32 + 1;
        match manager.get_or_create_processor_for_device(
            DeviceId(id),
            StreamHandle(id),
            sample_rate,
            channels,
            AudioFormat::PcmFloat,
        )? {
            Some(processor) => processors.push(processor),
            None => {
                warn!("Framework MEL computation is disabled; no audio will be measured");
                break;
            }
        }
    }

    let mut report = SimulationReport {
        streams: args.streams,
        seconds,
        rs2: surface.get_output_rs2()?,
        compute_csd_on_all_devices: manager.compute_csd_on_all_devices(),
        ..SimulationReport::default()
    };

    for second in 0..seconds {
        let level = args.levels[second % args.levels.len()];
        for (index, processor) in processors.iter().enumerate() {
            let pcm = match &mut source {
                Source::Synthetic(synths) => synths[index].next_second(level),
                Source::Wav(clip) => clip.second(second),
            };
            processor.process(&pcm);
        }
        clock.advance(1);
        report.drain_events(&mut rx);
    }

    for processor in &processors {
        manager.remove_stream_processor(processor.stream());
    }
    report.dropped_events = listener.dropped_events();
    report.final_csd = surface.get_csd()?;
    report.records = surface.get_records()?;
    info!(
        "Simulation finished: {} momentary event(s), csd {:.6}",
        report.momentary_events.len(),
        report.final_csd
    );

    if let Some(path) = &args.output {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("creating report output directory")?;
        }
        let json =
            serde_json::to_string_pretty(&report).context("serializing simulation report")?;
        std::fs::write(path, json)
            .with_context(|| format!("writing report to {}", path.display()))?;
        println!("Report written to {}", path.display());
        return Ok(());
    }

    match args.format {
        ReportFormat::Json => report.print_json(),
        ReportFormat::Table => {
            report.print_table(&manager.dump());
            Ok(())
        }
    }
}

fn serve_command(args: ServeArgs) -> Result<()> {
    #[cfg(feature = "http")]
    {
        return serve_impl(args);
    }

    #[cfg(not(feature = "http"))]
    {
        let _ = args;
        bail!("sound-dose-diag serve requires the http feature");
    }
}

#[cfg(feature = "http")]
fn serve_impl(args: ServeArgs) -> Result<()> {
    use std::time::Duration;

    let mut config = args.config.load();
    if let Some(host) = args.host {
        config.http.host = host;
    }
    if let Some(port) = args.port {
        config.http.port = port;
    }
    if let Some(token) = args.token {
        config.http.token = token;
    }

    let _span = tracing::info_span!("serve", port = config.http.port).entered();
    let manager = SoundDoseManager::with_config(&config);
    let server = sound_dose::http::spawn(manager.clone(), &config.http)?;
    println!(
        "Sound dose HTTP server running on {}:{} (token prefix {}***)",
        config.http.host,
        config.http.port,
        config.http.token.chars().take(4).collect::<String>()
    );
    println!("Press Ctrl+C to stop.");

    let Some(level) = args.feed_level else {
        server
            .join()
            .map_err(|_| anyhow::anyhow!("HTTP server thread panicked"))?;
        return Ok(());
    };

    let (sample_rate, channels) = (48_000, 2);
    let processor = manager
        .get_or_create_processor_for_device(
            DeviceId(1),
            StreamHandle(1),
            sample_rate,
            channels,
            AudioFormat::PcmFloat,
        )?
        .context("framework MEL computation is disabled; nothing to feed")?;
    let mut synth = Synthesizer::new(
        Waveform::Sine,
        sample_rate,
        channels,
        config.processor.dbfs_to_dba_offset,
        0,
    );

    while !server.is_finished() {
        processor.process(&synth.next_second(level));
        std::thread::sleep(Duration::from_secs(1));
    }
    bail!("HTTP server stopped")
}
