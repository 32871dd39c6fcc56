use anyhow::{Context, Result};
use boostedcan_lib::{
    bus::{CanBus, ReplayBus},
    canlog, diagnostic,
    diagnostic::{DiagnosticConfig, Effect, Outcome, SessionReport, REBOOT_COMMAND, RESET_COMMAND},
    emulator::{self, EmulatorConfig},
    protocol::{decode_cli_echo, is_cli_echo, normalize, Address, AddressComponents},
    recorder::{self, Recorder},
    slcan::SlcanBus,
};
use clap::Parser;
use commandline::{CliArgs, CliCommands, Interface, OutputFormat};
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use serde::Serialize;
use std::{
    io::Write,
    ops::Deref,
    panic,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

mod commandline;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .with_context(|| "Cannot init logging")?
        .start()
        .with_context(|| "Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

/// Sets the returned flag on Ctrl-C. The receive loops poll it between frames.
fn cancel_on_ctrl_c() -> Result<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .with_context(|| "Cannot create signal runtime")?;
    let flag = cancel.clone();
    std::thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        println!();
                        println!("Program interrupted, exiting.");
                        flag.store(true, Ordering::Relaxed);
                    }
                    Err(err) => error!("Cannot listen for Ctrl-C: {err}"),
                }
            })
        })
        .with_context(|| "Cannot spawn signal thread")?;
    Ok(cancel)
}

fn open_bus(args: &CliArgs) -> Result<Box<dyn CanBus>> {
    println!("Boosted Board CAN utility, v{}", env!("CARGO_PKG_VERSION"));
    println!();
    let channel = args.channel();
    let bus: Box<dyn CanBus> = match args.interface {
        Interface::Slcan => Box::new(
            SlcanBus::open(channel, args.bitrate)
                .with_context(|| format!("Cannot open slcan adapter '{channel}'"))?,
        ),
        #[cfg(target_os = "linux")]
        Interface::Socketcan => {
            if args.bitrate != boostedcan_lib::bus::DEFAULT_BITRATE {
                warn!(
                    "The bitrate of a SocketCAN interface is set with 'ip link', ignoring --bitrate"
                );
            }
            Box::new(
                boostedcan_lib::socketcan::SocketCanBus::open(channel)
                    .with_context(|| format!("Cannot open SocketCAN interface '{channel}'"))?,
            )
        }
        #[cfg(not(target_os = "linux"))]
        Interface::Socketcan => anyhow::bail!("SocketCAN is only available on Linux"),
    };
    println!("CAN adapter initialized! {:?} at {channel}", args.interface);
    Ok(bus)
}

fn effect_message(effect: &Effect) -> Option<String> {
    match effect {
        Effect::FirstFrame => Some(
            "Got a message!\n\n\
             Waiting ~10 seconds for the battery to boot and start sending valid data."
                .to_string(),
        ),
        Effect::CellSample(sample) => Some(format!(
            "\nNOTE! The battery does not report extremely out of spec cell voltages via CAN.\n\
             Check the individual cell voltages below for more info.\n\n\
             == Cell Voltages ==\n\
             - Lowest: {}mV\n\
             - Highest: {}mV\n\
             - Total: {}mV\n\n\
             - Delta: {}mV\n",
            sample.lowest_mv,
            sample.highest_mv,
            sample.total_mv,
            sample.delta_mv()
        )),
        Effect::SendCommand(command) if *command == RESET_COMMAND => Some(
            "Delta looks good! Sending `PFAILRESET` and restarting the battery.".to_string(),
        ),
        Effect::SendCommand(command) if *command == REBOOT_COMMAND => Some("Done!".to_string()),
        Effect::Unrecoverable(sample) => Some(format!(
            "The cell delta is too high! - {}mV - \
             Resetting can't fix this, so not going to attempt.\nExiting.",
            sample.delta_mv()
        )),
        _ => None,
    }
}

fn print_effect(effect: &Effect) {
    if let Effect::CliOutput(text) = effect {
        print!("{text}");
        let _ = std::io::stdout().flush();
    } else if let Some(message) = effect_message(effect) {
        println!("{message}");
    }
}

fn print_report(report: &SessionReport) {
    match report.outcome {
        Outcome::Reset => println!("Battery reset after {} frames.", report.frames_seen),
        Outcome::Unrecoverable | Outcome::Cancelled => {}
        Outcome::Exhausted => println!(
            "Recording ended after {} frames before the procedure finished.",
            report.frames_seen
        ),
    }
}

#[derive(Serialize)]
struct NormalizedId {
    id: u32,
    #[serde(flatten)]
    components: AddressComponents,
}

fn print_normalized(ids: &[u32], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            for id in ids {
                let components = AddressComponents::split(*id);
                println!(
                    "{id:#010X} -> {:#010X} (long command {}, rolling code {})",
                    normalize(*id),
                    components.long_command,
                    components.rolling_code
                );
            }
        }
        OutputFormat::Json => {
            let ids: Vec<NormalizedId> = ids
                .iter()
                .map(|id| NormalizedId {
                    id: *id,
                    components: AddressComponents::split(*id),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&ids)?);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;

    match &args.command {
        CliCommands::Normalize { ids, format } => print_normalized(ids, *format)?,
        CliCommands::Replay { file, power_off } => {
            let cancel = cancel_on_ctrl_c()?;
            let entries = canlog::read_log_file(file)
                .with_context(|| format!("Cannot read log file {file:?}"))?;
            let mut bus = ReplayBus::new(entries.into_iter().map(|entry| entry.frame));
            let sent = bus.sent();
            let config = DiagnosticConfig {
                power_off: *power_off,
                ..Default::default()
            };
            let report = diagnostic::run(&mut bus, config, args.timeout, &cancel, print_effect)?;
            print_report(&report);
            for frame in sent.snapshot() {
                println!("sent {frame}");
            }
        }
        CliCommands::Log { directory } => {
            let mut bus = open_bus(&args)?;
            let cancel = cancel_on_ctrl_c()?;
            let recorder = Recorder::create(directory, args.channel(), &chrono::Utc::now())
                .with_context(|| format!("Cannot create log files in {directory:?}"))?;
            println!("Logging... Ctrl-C to exit");
            recorder::run(bus.as_mut(), recorder, args.timeout, &cancel, |_| {
                print!(".");
                let _ = std::io::stdout().flush();
            })?;
        }
        CliCommands::ResetRlod { power_off, config } => {
            let mut config = match config {
                Some(config_file) => DiagnosticConfig::load(config_file)
                    .with_context(|| format!("Cannot load config file '{config_file}'"))?,
                None => DiagnosticConfig::default(),
            };
            config.power_off |= *power_off;
            let mut bus = open_bus(&args)?;
            let cancel = cancel_on_ctrl_c()?;
            println!("Waiting on CAN msg...");
            let report =
                diagnostic::run(bus.as_mut(), config, args.timeout, &cancel, print_effect)?;
            print_report(&report);
        }
        CliCommands::Emulate {
            soc,
            serial,
            interval,
        } => {
            let config = EmulatorConfig {
                soc_percent: *soc,
                serial: *serial,
                interval_ms: interval.as_millis().try_into()?,
                ..Default::default()
            };
            let mut bus = open_bus(&args)?;
            let cancel = cancel_on_ctrl_c()?;
            println!("Waiting on a message from the ESC...");
            emulator::run(bus.as_mut(), &config, args.timeout, &cancel)?;
        }
        CliCommands::SendCommand { command, listen } => {
            let mut bus = open_bus(&args)?;
            let cancel = cancel_on_ctrl_c()?;
            diagnostic::send_command(bus.as_mut(), command, Address::CliCommand.into())
                .with_context(|| format!("Cannot send command '{command}'"))?;
            let deadline = Instant::now() + *listen;
            while !cancel.load(Ordering::Relaxed) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let Some(frame) = bus.recv(remaining.min(args.timeout))? else {
                    continue;
                };
                if is_cli_echo(frame.id()) {
                    match decode_cli_echo(frame.data()) {
                        Ok(text) => print!("{text}"),
                        Err(err) => trace!("Discarding CLI output {frame}: {err}"),
                    }
                }
            }
            println!();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use boostedcan_lib::protocol::VoltageSample;

    fn sample(lowest_mv: u16, highest_mv: u16) -> VoltageSample {
        VoltageSample {
            lowest_mv,
            highest_mv,
            total_mv: 39_867,
        }
    }

    #[test]
    fn done_follows_reboot_only() {
        assert_eq!(
            effect_message(&Effect::SendCommand(REBOOT_COMMAND)).as_deref(),
            Some("Done!")
        );
        assert_eq!(effect_message(&Effect::Exit), None);
    }

    #[test]
    fn unrecoverable_says_exiting() {
        let message = effect_message(&Effect::Unrecoverable(sample(2500, 3400))).unwrap();
        assert!(message.contains("900mV"));
        assert!(message.ends_with("Exiting."));
        assert!(!message.contains("Done!"));
    }

    #[test]
    fn cell_sample_lists_voltages() {
        let message = effect_message(&Effect::CellSample(sample(3312, 3323))).unwrap();
        assert!(message.contains("- Lowest: 3312mV\n"));
        assert!(message.contains("- Delta: 11mV\n"));
        assert_eq!(effect_message(&Effect::CliOutput("x".into())), None);
    }
}
