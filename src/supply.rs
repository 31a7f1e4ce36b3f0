//! Text command channel to the programmable power supply under calibration.
//!
//! Commands are short ASCII strings, usually a signed number followed by a
//! one-letter command code; queries are single letters answered with an
//! integer. The vocabulary belongs to the supply firmware:
//!
//! | Command | Meaning |
//! |---|---|
//! | `0I` | interactive echo off |
//! | `0T` | heater off |
//! | `i` | identify, the board number is the last word of the answer |
//! | `+{n} ` | select reference channel `n` |
//! | `o` | read offset (µV) |
//! | `b` | read gain: output in µV at full [`DAC_SCALE`] |
//! | `t` | read temperature (1/100 °C) |
//! | `+{code}D` | set DAC code |
//! | `{offset:+}O{gain:+}B` | write offset and gain |
//! | `{volts:.3}V` | set output voltage |

use crate::{Error, Result};

/// Number of DAC codes spanning the gain register's full scale.
pub const DAC_SCALE: i64 = 4096;

pub const CMD_INTERACTIVE_OFF: &str = "0I";
pub const CMD_HEATER_OFF: &str = "0T";
pub const CMD_IDENTIFY: &str = "i";
pub const CMD_READ_OFFSET: &str = "o";
pub const CMD_READ_GAIN: &str = "b";
pub const CMD_READ_TEMPERATURE: &str = "t";

pub fn select_reference_command(channel: u8) -> String {
    format!("+{channel} ")
}

pub fn set_dac_command(code: i64) -> String {
    format!("{code:+}D")
}

pub fn write_calibration_command(offset: i64, gain: i64) -> String {
    format!("{offset:+}O{gain:+}B")
}

pub fn set_voltage_command(volts: f64) -> String {
    format!("{volts:.3}V")
}

/// Byte stream of command/response pairs.
pub trait CommandChannel {
    fn send(&mut self, command: &str) -> Result<()>;

    /// Returns the next response with surrounding whitespace removed.
    fn receive(&mut self) -> Result<String>;

    fn query(&mut self, command: &str) -> Result<String> {
        self.send(command)?;
        self.receive()
    }
}

impl<C: CommandChannel + ?Sized> CommandChannel for &mut C {
    fn send(&mut self, command: &str) -> Result<()> {
        (**self).send(command)
    }

    fn receive(&mut self) -> Result<String> {
        (**self).receive()
    }
}

/// Parses a response like C's `atoi`: whitespace, optional sign, digits.
pub fn parse_integer(response: &str) -> Result<i64> {
    let trimmed = response.trim_start();
    let sign_len = usize::from(trimmed.starts_with(['+', '-']));
    let digits_len = trimmed[sign_len..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits_len == 0 {
        return Err(Error::InvalidResponse(response.to_string()));
    }
    trimmed[..sign_len + digits_len]
        .parse()
        .map_err(|_| Error::InvalidResponse(response.to_string()))
}

/// Answer to the identify query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub text: String,
    pub board: Option<u32>,
}

impl Identity {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let board = text
            .rsplit_once(' ')
            .and_then(|(_, last)| parse_integer(last).ok())
            .and_then(|board| u32::try_from(board).ok());
        Self {
            text: text.to_string(),
            board,
        }
    }
}

/// Power supply speaking the command vocabulary described in the module docs.
#[derive(Debug)]
pub struct PowerSupply<C> {
    channel: C,
}

impl<C: CommandChannel> PowerSupply<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    /// Turns off the interactive echo and the heater, which would disturb
    /// both the command channel and the measurement.
    pub fn prepare(&mut self) -> Result<()> {
        self.channel.send(CMD_INTERACTIVE_OFF)?;
        self.channel.send(CMD_HEATER_OFF)
    }

    pub fn identify(&mut self) -> Result<Identity> {
        Ok(Identity::parse(&self.channel.query(CMD_IDENTIFY)?))
    }

    pub fn select_reference(&mut self, channel: u8) -> Result<()> {
        self.channel.send(&select_reference_command(channel))
    }

    /// Offset register in µV.
    pub fn read_offset(&mut self) -> Result<i64> {
        parse_integer(&self.channel.query(CMD_READ_OFFSET)?)
    }

    /// Gain register: output in µV at full DAC scale.
    pub fn read_gain(&mut self) -> Result<i64> {
        parse_integer(&self.channel.query(CMD_READ_GAIN)?)
    }

    /// Board temperature in °C.
    pub fn read_temperature(&mut self) -> Result<f64> {
        Ok(parse_integer(&self.channel.query(CMD_READ_TEMPERATURE)?)? as f64 / 100.0)
    }

    pub fn set_dac(&mut self, code: i64) -> Result<()> {
        self.channel.send(&set_dac_command(code))
    }

    pub fn write_calibration(&mut self, offset: i64, gain: i64) -> Result<()> {
        self.channel.send(&write_calibration_command(offset, gain))
    }

    pub fn set_voltage(&mut self, volts: f64) -> Result<()> {
        self.channel.send(&set_voltage_command(volts))
    }

    pub fn into_inner(self) -> C {
        self.channel
    }
}

#[cfg(feature = "serial")]
#[cfg_attr(docsrs, doc(cfg(feature = "serial")))]
pub use self::serial::SerialCommandChannel;

#[cfg(feature = "serial")]
mod serial {
    use super::CommandChannel;
    use crate::{transport::serial_port_builder, Result};
    use std::io::{self, Read, Write};
    use std::time::{Duration, Instant};
    use tokio_serial::{ClearBuffer, SerialPort};

    /// Silence after which a started response is considered complete.
    pub const RESPONSE_IDLE_GAP: Duration = Duration::from_millis(64);

    /// [`CommandChannel`] over a blocking serial port.
    pub struct SerialCommandChannel {
        port: Box<dyn SerialPort>,
        timeout: Duration,
    }

    impl SerialCommandChannel {
        pub fn open(device: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
            let port = serial_port_builder(device, baud_rate)
                .open()
                .map_err(io::Error::from)?;
            Ok(Self::new(port, timeout))
        }

        pub fn new(port: Box<dyn SerialPort>, timeout: Duration) -> Self {
            Self { port, timeout }
        }
    }

    impl CommandChannel for SerialCommandChannel {
        fn send(&mut self, command: &str) -> Result<()> {
            log::trace!("Supply <- {command:?}");
            self.port
                .clear(ClearBuffer::Input)
                .map_err(io::Error::from)?;
            self.port.write_all(command.as_bytes())?;
            self.port.flush()?;
            Ok(())
        }

        fn receive(&mut self) -> Result<String> {
            let deadline = Instant::now() + self.timeout;
            let mut response = Vec::new();
            let mut chunk = [0u8; 64];
            loop {
                let wait = if response.is_empty() {
                    deadline.saturating_duration_since(Instant::now())
                } else {
                    RESPONSE_IDLE_GAP
                };
                if wait.is_zero() {
                    break;
                }
                self.port.set_timeout(wait).map_err(io::Error::from)?;
                match self.port.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        response.extend_from_slice(&chunk[..n]);
                        if response.ends_with(b"\n") {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                        ) =>
                    {
                        break
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            if response.is_empty() {
                return Err(
                    io::Error::new(io::ErrorKind::TimedOut, "no response from power supply").into(),
                );
            }
            let response = String::from_utf8_lossy(&response).trim().to_string();
            log::trace!("Supply -> {response:?}");
            Ok(response)
        }
    }
}
