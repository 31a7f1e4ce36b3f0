//! This module defines the error type shared by the meter client, the power
//! supply channel and the calibration controller.
use crate::protocol as proto;

/// Represents all possible errors of this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The meter did not deliver a complete frame in time.
    ///
    /// Expected whenever the meter is off or the optical link is blocked.
    #[error("timeout after receiving {received} of {expected} bytes")]
    TransportTimeout { received: usize, expected: usize },

    /// Wraps `proto::Error`.
    #[error(transparent)]
    Protocol(#[from] proto::Error),

    /// The power supply answered something that could not be parsed.
    #[error("invalid response from power supply: {0:?}")]
    InvalidResponse(String),

    /// Every measurement batch was noisier than the configured threshold.
    #[error("measurement unstable: {peak_to_peak:.6} V peak-to-peak after {retries} retries")]
    CalibrationUnstable { retries: u32, peak_to_peak: f64 },

    /// A computed correction is physically implausible and was not written.
    #[error("calibration diverged: {0}")]
    CalibrationDivergence(String),

    /// The convergence tolerance was not met within the round limit.
    #[error("calibration did not converge within {rounds} rounds")]
    CalibrationTimeout { rounds: u32 },

    /// Too many consecutive readings failed while sampling.
    #[error("{failures} consecutive reading failures, last: {last}")]
    SampleFailures { failures: u32, last: Box<Error> },

    /// A calibration phase ran without the state its predecessor produces.
    #[error("calibration step out of order: {0}")]
    OutOfOrder(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Wraps `csv::Error` from the calibration log.
    #[error(transparent)]
    Csv(#[from] csv::Error),

    /// Wraps `std::io::Error`.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failed operation may simply be repeated: a timeout or a
    /// corrupted frame.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransportTimeout { .. } | Error::Protocol(proto::Error::Framing { .. })
        )
    }
}

/// The result type of this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors() {
        assert!(Error::TransportTimeout {
            received: 3,
            expected: 35
        }
        .is_transient());
        assert!(Error::from(proto::Error::Framing {
            index: 2,
            symbol: 0
        })
        .is_transient());
        assert!(!Error::from(proto::Error::Length {
            expected: 35,
            actual: 2
        })
        .is_transient());
        assert!(!Error::InvalidResponse("?".into()).is_transient());
        assert!(!Error::CalibrationDivergence("gain".into()).is_transient());
    }

    #[test]
    fn error_display() {
        let e = Error::TransportTimeout {
            received: 0,
            expected: 35,
        };
        assert_eq!(e.to_string(), "timeout after receiving 0 of 35 bytes");
        let e = Error::CalibrationUnstable {
            retries: 4,
            peak_to_peak: 0.0031,
        };
        assert_eq!(
            e.to_string(),
            "measurement unstable: 0.003100 V peak-to-peak after 4 retries"
        );
    }
}
