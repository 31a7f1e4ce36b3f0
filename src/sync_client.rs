//! Blocking client for the BM857 optical interface.
//!
//! Each measurement is requested by pulsing the adapter's infrared emitter;
//! the meter answers with one [`RawFrame`]. A missing or corrupted answer is
//! common (meter switched off, adapter slipped off the meter) and is reported
//! as a transient error, see [`Error::is_transient`](crate::Error::is_transient).
//!
//! # Examples
//!
//! ```no_run
//! # #[cfg(feature = "serial")]
//! # mod serial_example {
//! use bm857_lib::{sync_client::Bm857, transport::{SerialTransport, TransmitLine}};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = SerialTransport::open("/dev/ttyUSB0", TransmitLine::Break)?;
//!     let mut meter = Bm857::new(transport);
//!     let reading = meter.read_with_retry(10)?;
//!     println!("{reading}");
//!     Ok(())
//! }
//! # }
//! # fn main() {}
//! ```

use crate::{
    protocol::{self as proto, DisplayState, RawFrame, FRAME_LEN},
    reading::Reading,
    transport::Transport,
    Error, Result,
};
use std::time::Duration;

/// Emitter pulse that reliably wakes the meter's interface.
pub const DEFAULT_PULSE: Duration = Duration::from_millis(10);
/// Long enough for frequency and large capacitance measurements to settle.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3265);

/// Pulses the emitter and reads one frame of [`FRAME_LEN`] bytes.
///
/// # Errors
///
/// [`Error::TransportTimeout`] if the frame is incomplete when `timeout`
/// expires. Callers are expected to retry.
pub fn acquire_frame<T: Transport + ?Sized>(
    transport: &mut T,
    pulse: Duration,
    timeout: Duration,
) -> Result<RawFrame> {
    transport.discard_input()?;
    transport.assert_transmit_enable()?;
    std::thread::sleep(pulse);
    transport.deassert_transmit_enable()?;

    let mut buf = [0u8; FRAME_LEN];
    transport.read_exact(&mut buf, timeout)?;
    let frame = RawFrame::new(buf);
    log::trace!("Received {frame:?}");
    Ok(frame)
}

/// Synchronous client for the BM857 multimeter.
///
/// All methods block the current thread until a frame arrives or the
/// configured timeout expires.
#[derive(Debug)]
pub struct Bm857<T> {
    transport: T,
    pulse: Duration,
    timeout: Duration,
}

impl<T: Transport> Bm857<T> {
    /// Creates a client using [`DEFAULT_PULSE`] and [`DEFAULT_TIMEOUT`].
    ///
    /// # Arguments
    ///
    /// * `transport` - Link to the optical adapter, usually a
    ///   `SerialTransport` from the `serial` feature.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            pulse: DEFAULT_PULSE,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets how long the emitter is keyed to request a frame.
    ///
    /// # Arguments
    ///
    /// * `pulse` - Emitter on-time; about 1 to 10 ms wakes the meter.
    ///
    /// # Examples
    ///
    /// ```
    /// # use bm857_lib::{sync_client::Bm857, transport::Transport};
    /// # use std::time::Duration;
    /// # fn configure<T: Transport>(meter: &mut Bm857<T>) {
    /// meter.set_pulse(Duration::from_millis(5));
    /// assert_eq!(meter.pulse(), Duration::from_millis(5));
    /// # }
    /// ```
    pub fn set_pulse(&mut self, pulse: Duration) {
        self.pulse = pulse;
    }

    /// Retrieves the emitter pulse duration.
    pub fn pulse(&self) -> Duration {
        self.pulse
    }

    /// Sets how long to wait for a complete frame.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Deadline for all [`FRAME_LEN`] bytes. Frequency and
    ///   capacitance ranges need up to about 3 seconds.
    ///
    /// # Examples
    ///
    /// ```
    /// # use bm857_lib::{sync_client::Bm857, transport::Transport};
    /// # use std::time::Duration;
    /// # fn configure<T: Transport>(meter: &mut Bm857<T>) {
    /// meter.set_timeout(Duration::from_secs(1));
    /// # }
    /// ```
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Retrieves the frame timeout.
    ///
    /// # Examples
    ///
    /// ```
    /// # use bm857_lib::{sync_client::{Bm857, DEFAULT_TIMEOUT}, transport::Transport};
    /// # fn check<T: Transport>(transport: T) {
    /// let meter = Bm857::new(transport);
    /// assert_eq!(meter.timeout(), DEFAULT_TIMEOUT);
    /// # }
    /// ```
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Reads one frame without validating it.
    pub fn read_frame(&mut self) -> Result<RawFrame> {
        acquire_frame(&mut self.transport, self.pulse, self.timeout)
    }

    /// Reads and decodes one frame.
    pub fn read_display_state(&mut self) -> Result<DisplayState> {
        let frame = self.read_frame()?;
        proto::decode(&frame).map_err(|err| {
            log::debug!("Discarding frame: {err}");
            Error::from(err)
        })
    }

    /// Reads one measurement.
    pub fn read(&mut self) -> Result<Reading> {
        Ok(Reading::from_display_state(&self.read_display_state()?))
    }

    /// Reads one measurement, repeating transient failures up to `attempts` times in total.
    ///
    /// # Errors
    ///
    /// The last error once `attempts` are used up, or the first error that is
    /// not [transient](crate::Error::is_transient).
    pub fn read_with_retry(&mut self, attempts: u32) -> Result<Reading> {
        let mut attempt = 1;
        loop {
            match self.read() {
                Err(err) if err.is_transient() && attempt < attempts => {
                    log::debug!("Attempt {attempt} of {attempts} failed: {err}");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Consumes the client and returns the transport, e.g. to reopen it with
    /// another emitter line.
    pub fn into_inner(self) -> T {
        self.transport
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::{DigitCell, Symbol};
    use crate::reading::ScalePrefix;
    use assert_matches::assert_matches;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Event {
        Discard,
        Assert,
        Deassert,
        Read(usize, Duration),
    }

    /// Plays back queued responses; a short response times out.
    #[derive(Debug, Default)]
    pub(crate) struct MockTransport {
        pub responses: VecDeque<Vec<u8>>,
        pub events: Vec<Event>,
    }

    impl MockTransport {
        pub fn with_responses(responses: impl IntoIterator<Item = Vec<u8>>) -> Self {
            Self {
                responses: responses.into_iter().collect(),
                events: Vec::new(),
            }
        }
    }

    impl Transport for MockTransport {
        fn assert_transmit_enable(&mut self) -> Result<()> {
            self.events.push(Event::Assert);
            Ok(())
        }

        fn deassert_transmit_enable(&mut self) -> Result<()> {
            self.events.push(Event::Deassert);
            Ok(())
        }

        fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
            self.events.push(Event::Read(buf.len(), timeout));
            let response = self.responses.pop_front().unwrap_or_default();
            let received = response.len().min(buf.len());
            buf[..received].copy_from_slice(&response[..received]);
            if received < buf.len() {
                return Err(Error::TransportTimeout {
                    received,
                    expected: buf.len(),
                });
            }
            Ok(())
        }

        fn discard_input(&mut self) -> Result<()> {
            self.events.push(Event::Discard);
            Ok(())
        }
    }

    /// Frame of a meter showing `text` volts DC.
    pub(crate) fn volts_frame(text: &str) -> Vec<u8> {
        let mut state = DisplayState {
            switch_position: 0b0000_0001,
            volts: true,
            dc: true,
            ..Default::default()
        };
        let mut cells = state.digits.iter_mut();
        let mut point = false;
        for (i, glyph) in text.chars().enumerate() {
            match glyph {
                '-' if i == 0 => point = true,
                '.' => point = true,
                glyph => {
                    if let Some(cell) = cells.next() {
                        *cell = DigitCell::from_glyph(glyph, point);
                    }
                    point = false;
                }
            }
        }
        RawFrame::from_record(&state.to_record()).as_bytes().to_vec()
    }

    #[test]
    fn acquire_frame_pulses_then_reads() {
        let mut transport = MockTransport::with_responses([volts_frame("1.000")]);
        let frame = acquire_frame(
            &mut transport,
            Duration::ZERO,
            Duration::from_millis(1265),
        )
        .unwrap();
        assert!(frame.validate().is_ok());
        assert_eq!(
            transport.events,
            vec![
                Event::Discard,
                Event::Assert,
                Event::Deassert,
                Event::Read(FRAME_LEN, Duration::from_millis(1265)),
            ]
        );
    }

    #[test]
    fn short_frame_times_out() {
        let mut transport = MockTransport::with_responses([vec![0x43; 20]]);
        assert_matches!(
            acquire_frame(&mut transport, Duration::ZERO, DEFAULT_TIMEOUT),
            Err(Error::TransportTimeout {
                received: 20,
                expected: FRAME_LEN
            })
        );
    }

    #[test]
    fn read_decodes_reading() {
        let mut meter = Bm857::new(MockTransport::with_responses([volts_frame("-12.345")]));
        meter.set_pulse(Duration::ZERO);
        let reading = meter.read().unwrap();
        assert_eq!(reading.value, -12.345);
        assert_eq!(reading.unit, "V");
        assert_eq!(reading.prefix, ScalePrefix::None);
        assert_eq!(reading.to_string(), "-12.345 V DC");
    }

    #[test]
    fn corrupted_frame_is_a_framing_error() {
        let mut frame = volts_frame("1");
        frame[12] = Symbol::new(0xFF).raw();
        let mut meter = Bm857::new(MockTransport::with_responses([frame]));
        meter.set_pulse(Duration::ZERO);
        let err = meter.read().unwrap_err();
        assert!(err.is_transient());
        assert_matches!(
            err,
            Error::Protocol(proto::Error::Framing { index: 12, .. })
        );
    }

    #[test]
    fn retry_skips_transient_failures() {
        let mut corrupted = volts_frame("2");
        corrupted[0] = 0;
        let mut meter = Bm857::new(MockTransport::with_responses([
            vec![],
            corrupted,
            volts_frame("4.2"),
        ]));
        meter.set_pulse(Duration::ZERO);
        assert_eq!(meter.read_with_retry(3).unwrap().value, 4.2);
    }

    #[test]
    fn retry_gives_up_after_attempts() {
        let mut meter = Bm857::new(MockTransport::with_responses([
            vec![],
            vec![],
            volts_frame("4.2"),
        ]));
        meter.set_pulse(Duration::ZERO);
        assert_matches!(
            meter.read_with_retry(2),
            Err(Error::TransportTimeout { received: 0, .. })
        );
        assert_eq!(meter.into_inner().responses.len(), 1);
    }
}
