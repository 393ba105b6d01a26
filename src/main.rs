//! Earbudtester - earbud left/right balance tester
//!
//! Entry point for the interactive command-line tool.

use anyhow::{Context, Result};
use earbudtester::audio::device::{CaptureSource, Confirmation, OperatorPrompt, PlaybackSink};
use earbudtester::audio::engine;
use earbudtester::audio::loopback::{LoopbackConfig, SimulatedLoopback};
use earbudtester::audio::mixer::ChannelMask;
use earbudtester::config::AppConfig;
use earbudtester::measure::session::{ChannelReport, MeasurementOutcome};
use earbudtester::{
    Channel, CpalCapture, CpalPlayback, Detector, MeasurementConfig, MeasurementSession,
};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{error, info};

/// Command-line overrides on top of the saved config
#[derive(Debug, Default)]
struct Options {
    input_device: Option<String>,
    output_device: Option<String>,
    repeats: Option<u32>,
    measure_ms: Option<u32>,
    frequency: Option<f64>,
    threshold_pct: Option<f64>,
    rms: bool,
    simulate: bool,
    export: Option<PathBuf>,
    save_config: bool,
}

enum Command {
    Run(Options),
    Exit,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("earbudtester=info".parse()?),
        )
        .init();

    println!("╔════════════════════════════════════════════════════════════╗");
    println!(
        "║          Earbudtester v{} - Earbud Balance Tester         ║",
        earbudtester::VERSION
    );
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();

    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args)? {
        Command::Run(options) => options,
        Command::Exit => return Ok(()),
    };

    let mut app_config = AppConfig::load();
    apply_options(&mut app_config, &options);
    if let Err(e) = app_config.measurement.validate() {
        eprintln!("Error: {}", e);
        return Ok(());
    }
    if options.save_config {
        app_config.save(&AppConfig::path())?;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("building async runtime")?;

    if options.simulate {
        println!("Simulation mode: using a virtual earbud and microphone.");
        println!();
        let loopback = SimulatedLoopback::new(LoopbackConfig {
            left_gain: 0.5,
            right_gain: 0.45,
            ..Default::default()
        });
        let session = MeasurementSession::new(
            loopback.playback(),
            loopback.capture(),
            app_config.measurement.clone(),
        )?;
        return interactive_mode(session, &runtime, options.export);
    }

    let playback = match CpalPlayback::open(app_config.output_device.as_deref()) {
        Ok(playback) => playback,
        Err(e) => {
            error!("Failed to open output device: {}", e);
            println!("Error: {}", e);
            println!();
            println!("Use --list to see available devices.");
            return Ok(());
        }
    };
    let capture = match CpalCapture::open(app_config.input_device.as_deref()) {
        Ok(capture) => capture,
        Err(e) => {
            error!("Failed to open input device: {}", e);
            println!("Error: {}", e);
            println!();
            println!("Use --list to see available devices.");
            return Ok(());
        }
    };
    println!("Output: {}", playback.device_name());
    println!("Input:  {}", capture.device_name());
    println!();

    let session = MeasurementSession::new(playback, capture, app_config.measurement)?;
    interactive_mode(session, &runtime, options.export)
}

fn next_value<'a>(args: &'a [String], i: usize, flag: &str, what: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .with_context(|| format!("{flag} requires {what}"))
}

fn parse_number<T: std::str::FromStr>(value: &str, flag: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {flag}: {value}"))
}

fn parse_args(args: &[String]) -> Result<Command> {
    let mut options = Options::default();
    let mut i = 1;

    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--list" | "-l" => {
                list_devices()?;
                return Ok(Command::Exit);
            }
            "--version" | "-v" => {
                println!("earbudtester {}", earbudtester::VERSION);
                return Ok(Command::Exit);
            }
            "--help" | "-h" => {
                print_help();
                return Ok(Command::Exit);
            }
            "--input" | "-i" => {
                let value = next_value(args, i, flag, "a device name")?;
                options.input_device = Some(value.to_string());
                i += 2;
            }
            "--output" | "-o" => {
                let value = next_value(args, i, flag, "a device name")?;
                options.output_device = Some(value.to_string());
                i += 2;
            }
            "--repeats" | "-n" => {
                let value = next_value(args, i, flag, "a count")?;
                options.repeats = Some(parse_number(value, flag)?);
                i += 2;
            }
            "--duration" | "-d" => {
                let value = next_value(args, i, flag, "milliseconds")?;
                options.measure_ms = Some(parse_number(value, flag)?);
                i += 2;
            }
            "--freq" | "-f" => {
                let value = next_value(args, i, flag, "a frequency")?;
                options.frequency = Some(parse_number(value, flag)?);
                i += 2;
            }
            "--threshold" | "-t" => {
                let value = next_value(args, i, flag, "a percentage")?;
                options.threshold_pct = Some(parse_number(value, flag)?);
                i += 2;
            }
            "--export" | "-e" => {
                let value = next_value(args, i, flag, "a file path")?;
                options.export = Some(PathBuf::from(value));
                i += 2;
            }
            "--rms" => {
                options.rms = true;
                i += 1;
            }
            "--simulate" => {
                options.simulate = true;
                i += 1;
            }
            "--save-config" => {
                options.save_config = true;
                i += 1;
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                return Ok(Command::Exit);
            }
        }
    }

    Ok(Command::Run(options))
}

fn apply_options(config: &mut AppConfig, options: &Options) {
    if options.input_device.is_some() {
        config.input_device = options.input_device.clone();
    }
    if options.output_device.is_some() {
        config.output_device = options.output_device.clone();
    }

    let m = &mut config.measurement;
    if options.rms {
        *m = MeasurementConfig {
            repeats: m.repeats,
            measure_ms: m.measure_ms,
            ..MeasurementConfig::broadband()
        };
    }
    if let Some(repeats) = options.repeats {
        m.repeats = repeats;
    }
    if let Some(ms) = options.measure_ms {
        m.measure_ms = ms;
    }
    if let Some(freq) = options.frequency {
        m.tone_frequency_hz = freq;
    }
    if let Some(pct) = options.threshold_pct {
        m.balance_threshold = pct / 100.0;
    }
}

fn print_help() {
    println!("Usage: earbudtester [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -l, --list              List available audio devices");
    println!("  -i, --input NAME        Microphone device (default: system default)");
    println!("  -o, --output NAME       Earbud output device (default: system default)");
    println!("  -n, --repeats N         Capture cycles per channel (1-20, default: 5)");
    println!("  -d, --duration MS       Tone capture length (200-5000 ms, default: 1200)");
    println!("  -f, --freq HZ           Test tone frequency (default: 1000)");
    println!("  -t, --threshold PCT     Balance threshold in percent (default: 3)");
    println!("      --rms               Broadband RMS measurement (150 Hz, 5% threshold)");
    println!("      --simulate          Use a simulated earbud and microphone");
    println!("  -e, --export PATH       Write results as CSV on exit");
    println!("      --save-config       Remember these settings");
    println!("  -v, --version           Show version");
    println!("  -h, --help              Show this help");
    println!();
    println!("Examples:");
    println!("  earbudtester -i \"USB Microphone\" -n 8");
    println!("  earbudtester --rms --threshold 4 --export results.csv");
    println!("  earbudtester --simulate");
}

fn list_devices() -> Result<()> {
    println!("Scanning for audio devices...");
    println!();

    match engine::list_devices() {
        Ok(devices) => {
            if devices.is_empty() {
                println!("No audio devices found.");
                return Ok(());
            }
            println!("Found {} device(s):", devices.len());
            println!();
            for (i, device) in devices.iter().enumerate() {
                let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
                println!("  {}. {}{}", i + 1, device.name, default_marker);
                println!(
                    "     Channels: {} in, {} out",
                    device.input_channels, device.output_channels
                );
                if let Some(rate) = device.default_rate {
                    println!("     Default rate: {} Hz", rate);
                }
                println!();
            }
        }
        Err(e) => {
            error!("Failed to list devices: {}", e);
            println!("Error: {}", e);
        }
    }

    Ok(())
}

/// Ready prompt answered on stdin
struct StdinPrompt;

impl OperatorPrompt for StdinPrompt {
    fn confirm(&mut self, message: &str) -> Confirmation {
        read_confirmation(&mut io::stdin().lock(), &mut io::stdout(), message)
    }
}

/// Ask `message` on `output` and read the answer from `input`
///
/// Enter proceeds, `c`/`n` cancel, and end of input cancels.
fn read_confirmation<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    message: &str,
) -> Confirmation {
    if let Err(e) = write!(output, "{} [Enter = OK, c = cancel] ", message) {
        tracing::debug!(error = %e, "Failed to write prompt");
    }
    if let Err(e) = output.flush() {
        tracing::debug!(error = %e, "Failed to flush prompt");
    }

    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) | Err(_) => Confirmation::Cancel,
        Ok(_) => match line.trim().to_lowercase().as_str() {
            "c" | "cancel" | "n" | "no" => Confirmation::Cancel,
            _ => Confirmation::Proceed,
        },
    }
}

fn print_commands() {
    println!("Commands:");
    println!("  l              Measure left earbud");
    println!("  r              Measure right earbud");
    println!("  a              Analyze last left/right pair");
    println!("  p [l|r|b]      Preview tone (left, right or both)");
    println!("  s              Show results");
    println!("  e [PATH]       Export results as CSV");
    println!("  q              Quit");
    println!();
}

fn print_report(report: &ChannelReport) {
    println!(
        "{} estimate: {:.4} (level {:.4} ± {:.4}, noise {:.5} ± {:.5}, {} runs, {} dropouts)",
        report.channel,
        report.estimate,
        report.level.mean,
        report.level.std_dev,
        report.noise_floor.mean,
        report.noise_floor.std_dev,
        report.runs.len(),
        report.dropouts()
    );
}

fn default_export_path() -> PathBuf {
    PathBuf::from(format!(
        "earbud_results_{}.csv",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ))
}

fn export<P, C>(session: &MeasurementSession<P, C>, path: &std::path::Path)
where
    P: PlaybackSink,
    C: CaptureSource,
{
    let detector: Detector = session.config().detector;
    match session.results().export_csv(path, detector) {
        Ok(()) => println!("Exported {} entries to {}", session.results().len(), path.display()),
        Err(e) => {
            error!("Export failed: {}", e);
            println!("Error: {}", e);
        }
    }
}

fn interactive_mode<P, C>(
    mut session: MeasurementSession<P, C>,
    runtime: &Runtime,
    export_on_exit: Option<PathBuf>,
) -> Result<()>
where
    P: PlaybackSink,
    C: CaptureSource,
{
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        if !r.swap(false, Ordering::SeqCst) {
            // Second Ctrl+C while waiting for input
            std::process::exit(130);
        }
        println!();
        println!("Stopping after the current step (press Enter, or Ctrl+C again to exit now)...");
    })
    .ok();

    let config = session.config();
    println!(
        "Detector: {:?}, tone {} Hz, {} repeats of {} ms, threshold {:.1}%",
        config.detector,
        config.tone_frequency_hz,
        config.repeats,
        config.measure_ms,
        config.balance_threshold * 100.0
    );
    println!();
    print_commands();

    let mut prompt = StdinPrompt;
    let stdin = io::stdin();

    while running.load(Ordering::SeqCst) {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        let arg = words.next();

        match command {
            "l" | "r" => {
                let channel = if command == "l" {
                    Channel::Left
                } else {
                    Channel::Right
                };
                match runtime.block_on(session.measure_channel(channel, &mut prompt)) {
                    Ok(MeasurementOutcome::Completed(report)) => print_report(&report),
                    Ok(MeasurementOutcome::Cancelled) => println!("Cancelled."),
                    Err(e) => println!("Measurement failed: {}", e),
                }
            }
            "a" => match session.analyzer().analyze_latest(session.results()) {
                Ok(verdict) => println!(
                    "L = {:.4}, R = {:.4}: {}",
                    verdict.left, verdict.right, verdict
                ),
                Err(e) => println!("{}.", e),
            },
            "p" => {
                let mask = match arg {
                    Some("l") | Some("left") => ChannelMask::LEFT,
                    Some("r") | Some("right") => ChannelMask::RIGHT,
                    None | Some("b") | Some("both") => ChannelMask::BOTH,
                    Some(other) => {
                        println!("Unknown channel: {}", other);
                        continue;
                    }
                };
                if let Err(e) = runtime.block_on(session.play_preview(mask)) {
                    println!("Preview failed: {}", e);
                }
            }
            "s" => {
                if session.results().is_empty() {
                    println!("No results yet.");
                }
                for (i, entry) in session.results().entries().iter().enumerate() {
                    let side = |v: Option<f64>| v.map_or("-".to_string(), |v| format!("{:.4}", v));
                    println!(
                        "  {}. {}  L = {}  R = {}",
                        i + 1,
                        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        side(entry.left),
                        side(entry.right)
                    );
                }
            }
            "e" => {
                let path = arg.map(PathBuf::from).unwrap_or_else(default_export_path);
                export(&session, &path);
            }
            "q" | "quit" | "exit" => break,
            "h" | "help" | "?" => print_commands(),
            other => println!("Unknown command: {} (h for help)", other),
        }
    }

    if let Some(path) = export_on_exit {
        export(&session, &path);
    }

    info!(entries = session.results().len(), "Exiting");
    println!("Done.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Writer whose flush always fails, like a closed terminal
    struct BrokenTerminal(Vec<u8>);

    impl Write for BrokenTerminal {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "terminal closed"))
        }
    }

    #[test]
    fn test_confirmation_answers() {
        let mut out = Vec::new();
        let answer = read_confirmation(&mut Cursor::new("\n"), &mut out, "Ready?");
        assert_eq!(answer, Confirmation::Proceed);
        assert!(String::from_utf8(out).unwrap().starts_with("Ready? "));

        for cancel in ["c\n", "No\n", ""] {
            let answer = read_confirmation(&mut Cursor::new(cancel), &mut Vec::new(), "Ready?");
            assert_eq!(answer, Confirmation::Cancel, "input {:?}", cancel);
        }
    }

    #[test]
    fn test_failed_flush_still_reads_answer() {
        let mut terminal = BrokenTerminal(Vec::new());
        let answer = read_confirmation(&mut Cursor::new("ok\n"), &mut terminal, "Ready?");
        assert_eq!(answer, Confirmation::Proceed);
        assert!(!terminal.0.is_empty());
    }
}
