//! A library for reading the Brymen BM857 multimeter over its optical
//! interface and for calibrating a programmable power supply against it.
//!
//! The crate has two parts:
//!
//! 1.  **Meter decoding**: [`sync_client::Bm857`] pulses the infrared adapter,
//!     receives the 35-byte frame and turns it into a [`reading::Reading`]
//!     via the [`protocol`] decoder. The decoder itself is pure and works on
//!     any [`protocol::RawFrame`].
//!
//! 2.  **Supply calibration**: [`calibration::CalibrationController`] uses the
//!     meter as a reference voltmeter to correct the offset and gain registers
//!     of a power supply reachable through a [`supply::CommandChannel`].
//!     [`sweep`] checks the result across the output range.
//!
//! ## Features
//!
//! - **Protocol Implementation**: Symbol framing, nibble packing and the
//!   seven-segment codebook of the BM857 display.
//! - **Hardware Seams**: [`transport::Transport`], [`supply::CommandChannel`]
//!   and [`measurement::ReadingSource`] let every algorithm run without hardware.
//! - **Serial Backends**: Enabled by the `serial` feature.
//! - **Serde Support**: The `serde` feature derives (de)serialization for
//!   readings and the calibration configuration.
//!
//! ## Quick Start
//!
//! ```no_run
//! # #[cfg(feature = "serial")]
//! # mod serial_example {
//! use bm857_lib::{
//!     sync_client::Bm857,
//!     transport::{SerialTransport, TransmitLine},
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = SerialTransport::open("/dev/ttyUSB0", TransmitLine::Break)?;
//!     let mut meter = Bm857::new(transport);
//!
//!     let reading = meter.read_with_retry(10)?;
//!     println!("{reading}");
//!
//!     Ok(())
//! }
//! # }
//! # fn main() {}
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod calibration;
pub mod calibration_log;
mod error;
pub mod measurement;
pub mod protocol;
pub mod reading;
pub mod supply;
pub mod sweep;
pub mod sync_client;
pub mod transport;

pub use error::{Error, Result};
