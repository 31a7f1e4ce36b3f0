use bm857_lib::transport::TransmitLine;
use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::{path::PathBuf, time::Duration};

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn parse_reference_channel(s: &str) -> Result<u8, String> {
    clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid reference channel format: {e}"))
}

fn parse_transmit_line(s: &str) -> Result<TransmitLine, String> {
    s.parse::<TransmitLine>().map_err(|e| e.to_string())
}

/// Serial connection to the power supply.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct SupplyArgs {
    /// Serial port device name of the power supply.
    /// Examples: "/dev/ttyACM0" (Linux), "COM4" (Windows).
    #[arg(long, verbatim_doc_comment)]
    pub supply_device: String,

    /// Baud rate of the power supply's command port.
    #[arg(long, default_value_t = 115_200)]
    pub supply_baud_rate: u32,

    /// How long to wait for a response from the power supply.
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub supply_timeout: Duration,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Read and display one measurement.
    Read {
        /// Number of attempts before giving up on a missing or corrupted frame.
        #[arg(short, long, default_value_t = 10)]
        attempts: u32,
    },

    /// Continuously read measurements and print them to the console.
    /// Missing and corrupted frames are skipped.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// Interval between two measurements (e.g., "20ms", "1s").
        #[arg(value_parser = humantime::parse_duration, short, long, default_value = "20ms")]
        poll_interval: Duration,
    },

    /// Dump one frame as received: raw symbols, packed record and decoded
    /// display state including the bits of unknown meaning.
    #[clap(verbatim_doc_comment)]
    Raw,

    /// Take a batch of readings and report their spread and median.
    /// Useful to choose the noise threshold for calibration.
    #[clap(verbatim_doc_comment)]
    Survey {
        /// Number of readings to take.
        #[arg(short, long, default_value_t = 129)]
        samples: usize,
    },

    /// Calibrate offset and gain of a power supply, using the meter as reference.
    /// Every round is appended to the calibration log.
    /// The meter must be set to DC volts.
    #[clap(verbatim_doc_comment)]
    Calibrate {
        #[command(flatten)]
        supply: SupplyArgs,

        /// YAML file with calibration parameters.
        /// Defaults to "calibration.yml" if present, built-in values otherwise.
        #[arg(long, verbatim_doc_comment)]
        config_file: Option<PathBuf>,

        /// Reference channel to calibrate, overrides the configuration file.
        /// Can be specified in decimal or hexadecimal (e.g., "0x1").
        #[arg(long, value_parser = parse_reference_channel, verbatim_doc_comment)]
        reference_channel: Option<u8>,

        /// CSV file the calibration rounds are appended to.
        /// Overrides the configuration file, default is "calibt.csv".
        #[arg(long, verbatim_doc_comment)]
        log_file: Option<PathBuf>,

        /// Ask after every round whether to apply the correction and whether to continue.
        #[arg(short, long)]
        interactive: bool,
    },

    /// Step the power supply through its output range and print the deviation
    /// of each reading from the set-point.
    #[clap(verbatim_doc_comment)]
    Sweep {
        #[command(flatten)]
        supply: SupplyArgs,

        /// First set-point in volts.
        #[arg(long, default_value_t = 0.5)]
        from: f64,

        /// Last set-point in volts.
        #[arg(long, default_value_t = 36.0)]
        to: f64,

        /// Smallest step in volts; above 30 times this value the step is 1/30 of the set-point.
        #[arg(long, default_value_t = 0.02)]
        min_step: f64,

        /// Settle time after each set-point.
        #[arg(long, default_value = "3s", value_parser = humantime::parse_duration)]
        settle: Duration,
    },

    /// List the serial ports found on this system.
    ListPorts,
}

const fn about_text() -> &'static str {
    "Brymen BM857 CLI - Read the multimeter through its optical interface and calibrate power supplies against it."
}

#[derive(Parser, Debug)]
#[command(name="bm857", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warn.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Serial port device name of the optical adapter.
    /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
    #[arg(global = true, short, long, default_value_t = default_device_name(), verbatim_doc_comment)]
    pub device: String,

    /// How long to wait for a complete frame.
    /// Frequency and capacitance ranges need up to about 3 seconds.
    #[arg(global = true, long, default_value = "3265ms", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Duration,

    /// Duration of the infrared pulse that requests a frame.
    #[arg(global = true, long, default_value = "10ms", value_parser = humantime::parse_duration)]
    pub pulse: Duration,

    /// Serial line that drives the infrared emitter: break (TxD), rts or dtr.
    #[arg(global = true, long, default_value_t = TransmitLine::default(), value_parser = parse_transmit_line)]
    pub line: TransmitLine,
}
