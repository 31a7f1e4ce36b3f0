//! Linearity check: step the supply across its range and compare each
//! set-point with what the meter reads.

use crate::{
    measurement::{acquire_value, ReadingSource},
    supply::{CommandChannel, PowerSupply},
    Error, Result,
};
use std::time::Duration;

/// Each step is at least this fraction of the current set-point.
pub const RELATIVE_STEP: f64 = 1.0 / 30.0;

/// Voltage range and pacing of a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    pub start: f64,
    pub stop: f64,
    pub min_step: f64,
    pub settle: Duration,
}

impl Default for SweepPlan {
    fn default() -> Self {
        Self {
            start: 0.5,
            stop: 36.0,
            min_step: 0.02,
            settle: Duration::from_secs(3),
        }
    }
}

impl SweepPlan {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_step > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "sweep step {} must be positive",
                self.min_step
            )));
        }
        if !self.stop.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "sweep end {} V must be finite",
                self.stop
            )));
        }
        if !(self.start >= 0.0 && self.start <= self.stop) {
            return Err(Error::InvalidConfig(format!(
                "sweep range {}..{} V is empty",
                self.start, self.stop
            )));
        }
        Ok(())
    }

    /// Set-points from `start` up to `stop`, with step `max(min_step, v / 30)`.
    pub fn points(&self) -> impl Iterator<Item = f64> {
        let (min_step, stop) = (self.min_step, self.stop);
        std::iter::successors(Some(self.start), move |&v| {
            Some(v + (v * RELATIVE_STEP).max(min_step))
        })
        .take_while(move |&v| v <= stop)
    }
}

/// One measured set-point.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SweepPoint {
    pub setpoint: f64,
    pub reading: f64,
    /// `setpoint - reading`
    pub error: f64,
}

/// Walks `plan`, calling `on_point` as soon as each point is measured.
pub fn run_sweep<M, C>(
    meter: &mut M,
    supply: &mut PowerSupply<C>,
    plan: &SweepPlan,
    max_failures: u32,
    mut on_point: impl FnMut(&SweepPoint),
) -> Result<Vec<SweepPoint>>
where
    M: ReadingSource + ?Sized,
    C: CommandChannel,
{
    plan.validate()?;
    let mut points = Vec::new();
    for setpoint in plan.points() {
        supply.set_voltage(setpoint)?;
        std::thread::sleep(plan.settle);
        let reading = acquire_value(meter, max_failures)?;
        let point = SweepPoint {
            setpoint,
            reading,
            error: setpoint - reading,
        };
        log::debug!("Sweep {setpoint:.3} V: read {reading:.5} V");
        on_point(&point);
        points.push(point);
    }
    Ok(points)
}
