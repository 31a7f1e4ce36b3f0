//! Brymen BM857 CLI
//!
//! A command-line interface (CLI) application for reading the Brymen BM857
//! multimeter through its optical serial adapter.
//!
//! This tool allows users to:
//! - Read single measurements or stream them continuously.
//! - Dump raw frames for protocol diagnostics.
//! - Survey the measurement noise.
//! - Calibrate the offset and gain of a programmable power supply, using the
//!   meter as reference, and log every round to a CSV file.
//! - Sweep a power supply across its range to check linearity.
//! - List the serial ports of the system.
//!
//! The CLI leverages the `bm857_lib` crate for protocol decoding and calibration.

use anyhow::{Context, Result};
use bm857_lib::{
    calibration::{
        CalibrationConfig, CalibrationController, CalibrationOutcome, Decision, Operator,
        RoundReport,
    },
    calibration_log::{CsvCalibrationLog, DEFAULT_LOG_FILE},
    measurement::measure_batch,
    protocol::{DisplayState, BARGRAPH_SEGMENTS},
    reading::Reading,
    supply::{PowerSupply, SerialCommandChannel},
    sweep::{run_sweep, SweepPlan},
    sync_client::Bm857,
    transport::SerialTransport,
};
use clap::Parser;
use dialoguer::Select;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::path::{Path, PathBuf};
use std::{panic, time::Duration};

mod commandline;
mod config;

/// Consecutive failed frames tolerated while sampling.
const MAX_SAMPLE_FAILURES: u32 = 20;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Opens the optical adapter with the global connection options.
fn open_meter(args: &commandline::CliArgs) -> Result<Bm857<SerialTransport>> {
    info!(
        "Opening optical adapter {} (emitter on {}, pulse {:?}, timeout {:?})",
        args.device, args.line, args.pulse, args.timeout
    );
    let transport = SerialTransport::open(&args.device, args.line)
        .with_context(|| format!("Cannot open optical adapter on {}", args.device))?;
    let mut meter = Bm857::new(transport);
    meter.set_pulse(args.pulse);
    meter.set_timeout(args.timeout);
    Ok(meter)
}

fn open_supply(supply: &commandline::SupplyArgs) -> Result<PowerSupply<SerialCommandChannel>> {
    info!(
        "Opening power supply {} at {} baud",
        supply.supply_device, supply.supply_baud_rate
    );
    let channel = SerialCommandChannel::open(
        &supply.supply_device,
        supply.supply_baud_rate,
        supply.supply_timeout,
    )
    .with_context(|| format!("Cannot open power supply on {}", supply.supply_device))?;
    Ok(PowerSupply::new(channel))
}

fn handle_daemon(meter: &mut Bm857<SerialTransport>, poll_interval: Duration) -> Result<()> {
    info!("Starting daemon mode, interval={poll_interval:?}");
    loop {
        match meter.read() {
            Ok(reading) => println!("{reading}"),
            Err(error) if error.is_transient() => debug!("Daemon: skipping reading: {error}"),
            Err(error) => return Err(error).context("Cannot read measurement"),
        }
        std::thread::sleep(poll_interval);
    }
}

fn handle_raw(meter: &mut Bm857<SerialTransport>) -> Result<()> {
    let frame = meter.read_frame().context("Cannot read frame")?;
    println!("Frame:    {}", hex(frame.as_bytes()));
    match frame.to_record() {
        Ok(record) => {
            println!("Record:   {}", hex(record.as_bytes()));
            let state = DisplayState::from_record(&record);
            println!("{state:#?}");
            println!(
                "Bargraph: {} of {BARGRAPH_SEGMENTS} segments",
                state.bargraph_level()
            );
            println!("Reserved: {}", hex(&state.reserved_bits));
            println!("Reading:  {}", Reading::from_display_state(&state));
        }
        Err(error) => println!("Invalid frame: {error}"),
    }
    Ok(())
}

fn handle_survey(meter: &mut Bm857<SerialTransport>, samples: usize) -> Result<()> {
    info!("Executing: Noise survey over {samples} readings");
    let stats = measure_batch(meter, samples, MAX_SAMPLE_FAILURES)
        .context("Cannot complete noise survey")?;
    println!("Samples:       {}", stats.count);
    println!("Min:           {:.6}", stats.min);
    println!("Max:           {:.6}", stats.max);
    println!("Peak-to-peak:  {:.6}", stats.peak_to_peak());
    println!("Median:        {:.6}", stats.median);
    Ok(())
}

/// Lets the user decide on every calibration round.
struct ConsoleOperator;

impl Operator for ConsoleOperator {
    fn decide(&mut self, report: &RoundReport) -> Decision {
        println!("{report}");
        let choice = Select::new()
            .with_prompt("Apply this correction?")
            .items(&[
                "Adjust and continue",
                "Keep registers and continue",
                "Adjust and stop",
                "Keep registers and stop",
            ])
            .default(0)
            .interact();
        match choice {
            Ok(0) => Decision::Adjust,
            Ok(1) => Decision::Observe,
            Ok(2) => Decision::StopAndAdjust,
            Ok(_) => Decision::StopAndKeep,
            Err(error) => {
                warn!("Cannot read decision, keeping registers: {error}");
                Decision::StopAndKeep
            }
        }
    }
}

fn calibrate<O: Operator>(
    meter: Bm857<SerialTransport>,
    supply: PowerSupply<SerialCommandChannel>,
    log: CsvCalibrationLog,
    operator: O,
    config: CalibrationConfig,
) -> Result<CalibrationOutcome> {
    let mut controller = CalibrationController::new(meter, supply, log, operator, config)
        .context("Invalid calibration configuration")?;
    controller.run().context("Calibration failed")
}

fn handle_calibrate(
    meter: Bm857<SerialTransport>,
    supply: &commandline::SupplyArgs,
    config_file: Option<&Path>,
    reference_channel: Option<u8>,
    log_file: Option<&Path>,
    interactive: bool,
) -> Result<()> {
    let mut config = config::get_config(config_file)?;
    if let Some(reference_channel) = reference_channel {
        config.calibration.reference_channel = reference_channel;
    }
    let log_path = log_file
        .map(Path::to_path_buf)
        .or(config.log_file)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));
    info!(
        "Executing: Calibrate reference channel {}, log {log_path:?}",
        config.calibration.reference_channel
    );

    let supply = open_supply(supply)?;
    let log = CsvCalibrationLog::open(&log_path)
        .with_context(|| format!("Cannot open calibration log {log_path:?}"))?;

    let outcome = if interactive {
        calibrate(meter, supply, log, ConsoleOperator, config.calibration)?
    } else {
        let print_and_adjust = |report: &RoundReport| {
            println!("{report}");
            Decision::Adjust
        };
        calibrate(meter, supply, log, print_and_adjust, config.calibration)?
    };
    println!(
        "Board {}: offset {} uV, gain {} after {} rounds ({})",
        outcome.board, outcome.offset, outcome.gain, outcome.rounds, outcome.reason
    );
    Ok(())
}

fn handle_sweep(
    meter: &mut Bm857<SerialTransport>,
    supply: &commandline::SupplyArgs,
    plan: SweepPlan,
) -> Result<()> {
    info!(
        "Executing: Sweep {} V to {} V, settle {:?}",
        plan.start, plan.stop, plan.settle
    );
    let mut supply = open_supply(supply)?;
    supply.prepare().context("Cannot prepare power supply")?;
    println!("setpoint, error, reading");
    run_sweep(meter, &mut supply, &plan, MAX_SAMPLE_FAILURES, |point| {
        println!(
            "{:.3}, {:.5}, {:.5}",
            point.setpoint, point.error, point.reading
        );
    })
    .context("Sweep failed")?;
    Ok(())
}

fn handle_list_ports() -> Result<()> {
    let ports = tokio_serial::available_ports().context("Cannot enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        println!("{}: {:?}", port.port_name, port.port_type);
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "BM857 CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    if args.command == commandline::CliCommands::ListPorts {
        return handle_list_ports();
    }

    let mut meter = open_meter(&args)?;

    match &args.command {
        commandline::CliCommands::Read { attempts } => {
            info!("Executing: Read Measurement");
            let reading = meter
                .read_with_retry(*attempts)
                .with_context(|| "Cannot read measurement")?;
            println!("{reading}");
        }
        commandline::CliCommands::Daemon { poll_interval } => {
            handle_daemon(&mut meter, *poll_interval)?;
        }
        commandline::CliCommands::Raw => {
            info!("Executing: Raw Frame Dump");
            handle_raw(&mut meter)?;
        }
        commandline::CliCommands::Survey { samples } => {
            handle_survey(&mut meter, *samples)?;
        }
        commandline::CliCommands::Calibrate {
            supply,
            config_file,
            reference_channel,
            log_file,
            interactive,
        } => {
            handle_calibrate(
                meter,
                supply,
                config_file.as_deref(),
                *reference_channel,
                log_file.as_deref(),
                *interactive,
            )?;
        }
        commandline::CliCommands::Sweep {
            supply,
            from,
            to,
            min_step,
            settle,
        } => {
            let plan = SweepPlan {
                start: *from,
                stop: *to,
                min_step: *min_step,
                settle: *settle,
            };
            handle_sweep(&mut meter, supply, plan)?;
        }
        commandline::CliCommands::ListPorts => unreachable!("ListPorts is handled earlier."),
    }

    Ok(())
}
