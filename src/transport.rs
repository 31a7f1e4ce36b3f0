//! Byte transport to the meter.
//!
//! The optical adapter is an ordinary serial port. One control line keys the
//! infrared emitter that asks the meter for a frame; the frame itself arrives
//! on RxD. [`Transport`] is the seam the frame reader works against, so that
//! the decoder can be driven by anything that produces bytes.

use crate::{Error, Result};
use std::{fmt, str::FromStr, time::Duration};

/// Link to the meter's optical interface.
pub trait Transport {
    /// Switches the adapter's infrared emitter on.
    fn assert_transmit_enable(&mut self) -> Result<()>;

    /// Switches the adapter's infrared emitter off.
    fn deassert_transmit_enable(&mut self) -> Result<()>;

    /// Fills `buf` completely or fails with [`Error::TransportTimeout`] once
    /// `timeout` has elapsed.
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()>;

    /// Drops bytes received but not yet read.
    fn discard_input(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn assert_transmit_enable(&mut self) -> Result<()> {
        (**self).assert_transmit_enable()
    }

    fn deassert_transmit_enable(&mut self) -> Result<()> {
        (**self).deassert_transmit_enable()
    }

    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        (**self).read_exact(buf, timeout)
    }

    fn discard_input(&mut self) -> Result<()> {
        (**self).discard_input()
    }
}

/// Serial control line that drives the infrared emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransmitLine {
    /// Hold TxD low with a break condition.
    #[default]
    Break,
    Rts,
    Dtr,
}

impl fmt::Display for TransmitLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransmitLine::Break => "break",
            TransmitLine::Rts => "rts",
            TransmitLine::Dtr => "dtr",
        })
    }
}

impl FromStr for TransmitLine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "break" | "txd" => Ok(TransmitLine::Break),
            "rts" => Ok(TransmitLine::Rts),
            "dtr" => Ok(TransmitLine::Dtr),
            other => Err(Error::InvalidConfig(format!(
                "unknown transmit line '{other}', expected break, rts or dtr"
            ))),
        }
    }
}

#[cfg(feature = "serial")]
#[cfg_attr(docsrs, doc(cfg(feature = "serial")))]
pub use self::serial::{serial_port_builder, SerialTransport, DATA_BITS, PARITY, STOP_BITS};

#[cfg(feature = "serial")]
mod serial {
    use super::{Transport, TransmitLine};
    use crate::{Error, Result};
    use std::io::{self, Read};
    use std::time::{Duration, Instant};
    use tokio_serial::{ClearBuffer, SerialPort};

    /// The parity used for serial communication.
    pub const PARITY: &tokio_serial::Parity = &tokio_serial::Parity::None;
    /// The number of stop bits used for serial communication.
    pub const STOP_BITS: &tokio_serial::StopBits = &tokio_serial::StopBits::One;
    /// The number of data bits used for serial communication.
    pub const DATA_BITS: &tokio_serial::DataBits = &tokio_serial::DataBits::Eight;

    /// Creates a `tokio_serial::SerialPortBuilder` with the specified settings.
    ///
    /// # Arguments
    ///
    /// * `device` - The path to the serial port device (e.g., `/dev/ttyUSB0`).
    /// * `baud_rate` - The baud rate for the serial communication.
    pub fn serial_port_builder(device: &str, baud_rate: u32) -> tokio_serial::SerialPortBuilder {
        tokio_serial::new(device, baud_rate)
            .parity(*PARITY)
            .stop_bits(*STOP_BITS)
            .data_bits(*DATA_BITS)
            .flow_control(tokio_serial::FlowControl::None)
    }

    /// [`Transport`] over a blocking serial port.
    pub struct SerialTransport {
        port: Box<dyn SerialPort>,
        line: TransmitLine,
    }

    impl SerialTransport {
        /// Opens `device` at the meter's fixed bit rate.
        pub fn open(device: &str, line: TransmitLine) -> Result<Self> {
            let port = serial_port_builder(device, crate::protocol::BAUD_RATE)
                .open()
                .map_err(io::Error::from)?;
            Ok(Self::new(port, line))
        }

        pub fn new(port: Box<dyn SerialPort>, line: TransmitLine) -> Self {
            Self { port, line }
        }

        pub fn line(&self) -> TransmitLine {
            self.line
        }

        fn set_line(&mut self, active: bool) -> Result<()> {
            let result = match (self.line, active) {
                (TransmitLine::Break, true) => self.port.set_break(),
                (TransmitLine::Break, false) => self.port.clear_break(),
                (TransmitLine::Rts, level) => self.port.write_request_to_send(level),
                (TransmitLine::Dtr, level) => self.port.write_data_terminal_ready(level),
            };
            Ok(result.map_err(io::Error::from)?)
        }
    }

    impl Transport for SerialTransport {
        fn assert_transmit_enable(&mut self) -> Result<()> {
            self.set_line(true)
        }

        fn deassert_transmit_enable(&mut self) -> Result<()> {
            self.set_line(false)
        }

        fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
            let deadline = Instant::now() + timeout;
            let mut received = 0;
            while received < buf.len() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Error::TransportTimeout {
                        received,
                        expected: buf.len(),
                    });
                }
                self.port.set_timeout(remaining).map_err(io::Error::from)?;
                match self.port.read(&mut buf[received..]) {
                    Ok(n) => received += n,
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::TimedOut
                                | io::ErrorKind::WouldBlock
                                | io::ErrorKind::Interrupted
                        ) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Ok(())
        }

        fn discard_input(&mut self) -> Result<()> {
            Ok(self
                .port
                .clear(ClearBuffer::Input)
                .map_err(io::Error::from)?)
        }
    }
}
