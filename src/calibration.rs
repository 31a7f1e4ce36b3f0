//! Closed-loop two-point calibration of a programmable power supply.
//!
//! The meter serves as the reference voltmeter. Each round reads the supply's
//! offset and gain registers, drives the output to a low and a high set-point,
//! measures both with median-of-N noise rejection and derives a linear
//! correction that maps the measured line onto the reference line:
//!
//! ```text
//! slope      = (measured_high - measured_low) / (reference_high - reference_low)
//! new gain   = old gain * slope                (or * sqrt(slope) when damped)
//! new offset = old offset - round(1e6 * (measured_low * reference_high
//!                                      - measured_high * reference_low)
//!                                     / (reference_high - reference_low))
//! ```
//!
//! Between rounds the settle time grows by a quarter. An [`Operator`] decides
//! after every round whether the correction is written and whether to go on.

use crate::{
    calibration_log::{CalibrationLog, LogRow},
    measurement::{measure_batch, ReadingSource},
    supply::{CommandChannel, PowerSupply, DAC_SCALE},
    Error, Result,
};
use std::{fmt, time::Duration};

/// Factor applied to the settle time after every round.
pub const SETTLE_GROWTH: f64 = 1.25;

/// DAC code that produces `volts` under the given registers.
pub fn dac_code(volts: f64, offset: i64, gain: i64) -> i64 {
    (DAC_SCALE as f64 * (volts * 1e6 + offset as f64) / gain as f64).round() as i64
}

/// Output voltage the registers claim for `code`.
pub fn dac_voltage(code: i64, offset: i64, gain: i64) -> f64 {
    (code as f64 * gain as f64 / DAC_SCALE as f64 - offset as f64) / 1e6
}

/// How much of the measured gain error is corrected per round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum GainDamping {
    /// Apply the full slope.
    #[default]
    None,
    /// Apply the square root of the slope, halving the step in ppm.
    SquareRoot,
}

/// Tunables of a calibration run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct CalibrationConfig {
    /// Supply reference channel to calibrate.
    pub reference_channel: u8,
    /// Low set-point in volts.
    pub reference_low: f64,
    /// High set-point in volts.
    pub reference_high: f64,
    /// Readings per batch; odd so the median is a real sample.
    pub samples: usize,
    /// Largest accepted peak-to-peak spread of a batch, in volts.
    pub noise_threshold: f64,
    pub max_noise_retries: u32,
    /// Consecutive transient meter failures tolerated per sample.
    pub max_sample_failures: u32,
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub initial_settle: Duration,
    /// The run ends once the growing settle time exceeds this.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub settle_ceiling: Duration,
    pub max_rounds: u32,
    /// Converged once the gain changes by no more than this.
    pub gain_tolerance_ppm: Option<f64>,
    /// Converged once the offset changes by no more than this many µV.
    pub offset_tolerance_uv: Option<i64>,
    pub gain_damping: GainDamping,
    /// Largest plausible `|slope - 1|`.
    pub max_gain_step: f64,
    /// Largest plausible offset change in µV.
    pub max_offset_step: i64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            reference_channel: 0,
            reference_low: 3.0,
            reference_high: 5.0,
            samples: 129,
            noise_threshold: 0.002,
            max_noise_retries: 8,
            max_sample_failures: 20,
            initial_settle: Duration::from_secs(1),
            settle_ceiling: Duration::from_secs(15),
            max_rounds: 20,
            gain_tolerance_ppm: None,
            offset_tolerance_uv: None,
            gain_damping: GainDamping::None,
            max_gain_step: 0.05,
            max_offset_step: 100_000,
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        if self.samples == 0 || self.samples % 2 == 0 {
            return invalid(format!("sample count {} must be odd", self.samples));
        }
        if !(self.reference_low < self.reference_high) {
            return invalid(format!(
                "low reference {} V must be below high reference {} V",
                self.reference_low, self.reference_high
            ));
        }
        if !(self.noise_threshold > 0.0) {
            return invalid(format!(
                "noise threshold {} must be positive",
                self.noise_threshold
            ));
        }
        if !(self.max_gain_step > 0.0) {
            return invalid(format!(
                "gain step bound {} must be positive",
                self.max_gain_step
            ));
        }
        if self.max_offset_step < 0 {
            return invalid(format!(
                "offset step bound {} uV must not be negative",
                self.max_offset_step
            ));
        }
        if self.max_rounds == 0 {
            return invalid("at least one round is required".into());
        }
        Ok(())
    }

    fn has_tolerance(&self) -> bool {
        self.gain_tolerance_ppm.is_some() || self.offset_tolerance_uv.is_some()
    }

    fn within_tolerance(&self, correction: &Correction) -> bool {
        self.has_tolerance()
            && self
                .gain_tolerance_ppm
                .map_or(true, |t| correction.gain_change_ppm.abs() <= t)
            && self
                .offset_tolerance_uv
                .map_or(true, |t| correction.offset_change.abs() <= t)
    }
}

/// Reference and measured voltages of one round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TwoPoint {
    pub reference_low: f64,
    pub reference_high: f64,
    pub measured_low: f64,
    pub measured_high: f64,
}

/// Register values derived from one round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    pub slope: f64,
    pub gain: i64,
    pub offset: i64,
    /// `new offset - old offset` in µV.
    pub offset_change: i64,
    /// `1e6 * (new gain - old gain) / new gain`.
    pub gain_change_ppm: f64,
}

/// Derives new registers from `points` measured under `offset` and `gain`.
///
/// # Errors
///
/// [`Error::CalibrationDivergence`] if the result is implausible under the
/// bounds of `config`; nothing should be written to the supply then.
pub fn compute_correction(
    points: &TwoPoint,
    offset: i64,
    gain: i64,
    config: &CalibrationConfig,
) -> Result<Correction> {
    let diverged = |msg: String| Err(Error::CalibrationDivergence(msg));
    let span = points.reference_high - points.reference_low;
    if span == 0.0 || !span.is_finite() {
        return diverged(format!("reference span {span} V is unusable"));
    }
    let slope = (points.measured_high - points.measured_low) / span;
    if !slope.is_finite() || (slope - 1.0).abs() > config.max_gain_step {
        return diverged(format!(
            "gain slope {slope:.6} is outside 1 \u{b1} {}",
            config.max_gain_step
        ));
    }
    let factor = match config.gain_damping {
        GainDamping::None => slope,
        GainDamping::SquareRoot => slope.sqrt(),
    };
    let new_gain = (gain as f64 * factor).round();
    let intercept = 1e6
        * (points.measured_low * points.reference_high
            - points.measured_high * points.reference_low)
        / span;
    if !new_gain.is_finite() || !intercept.is_finite() {
        return diverged("correction is not a finite number".into());
    }
    if new_gain <= 0.0 {
        return diverged(format!("gain {new_gain} is not positive"));
    }
    let offset_change = -(intercept.round() as i64);
    if offset_change.abs() > config.max_offset_step {
        return diverged(format!(
            "offset change {offset_change} uV exceeds {} uV",
            config.max_offset_step
        ));
    }
    let new_gain = new_gain as i64;
    Ok(Correction {
        slope,
        gain: new_gain,
        offset: offset + offset_change,
        offset_change,
        gain_change_ppm: 1e6 * (new_gain - gain) as f64 / new_gain as f64,
    })
}

/// Operator verdict after a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Write the correction and continue.
    Adjust,
    /// Keep the registers and continue measuring.
    Observe,
    /// Write the correction and end the run.
    StopAndAdjust,
    /// Keep the registers and end the run.
    StopAndKeep,
}

impl Decision {
    pub fn writes(self) -> bool {
        matches!(self, Decision::Adjust | Decision::StopAndAdjust)
    }

    pub fn stops(self) -> bool {
        matches!(self, Decision::StopAndAdjust | Decision::StopAndKeep)
    }
}

/// Decides what happens with each computed correction.
pub trait Operator {
    fn decide(&mut self, report: &RoundReport) -> Decision;
}

impl<F: FnMut(&RoundReport) -> Decision> Operator for F {
    fn decide(&mut self, report: &RoundReport) -> Decision {
        self(report)
    }
}

/// Writes every correction, leaving termination to the configured limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAdjust;

impl Operator for AlwaysAdjust {
    fn decide(&mut self, _report: &RoundReport) -> Decision {
        Decision::Adjust
    }
}

/// Outcome of one measured round, before the operator decides on it.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    /// Zero-based.
    pub round: u32,
    pub board: u32,
    pub reference_channel: u8,
    pub temperature: f64,
    /// Registers the round was measured with.
    pub offset: i64,
    pub gain: i64,
    pub points: TwoPoint,
    pub correction: Correction,
}

impl fmt::Display for RoundReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "round {}: {:.5} V -> {:.5} V, {:.5} V -> {:.5} V, offset {} -> {}, gain {} -> {} ({:+.1} ppm)",
            self.round + 1,
            self.points.reference_low,
            self.points.measured_low,
            self.points.reference_high,
            self.points.measured_high,
            self.offset,
            self.correction.offset,
            self.gain,
            self.correction.gain,
            self.correction.gain_change_ppm,
        )
    }
}

/// Why a run ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The correction fell within the configured tolerances.
    Converged,
    /// The settle time grew past its ceiling.
    SettleCeiling,
    /// `max_rounds` elapsed without any tolerance configured.
    RoundLimit,
    /// The operator asked to stop.
    Operator,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::Converged => "converged",
            StopReason::SettleCeiling => "settle time ceiling reached",
            StopReason::RoundLimit => "round limit reached",
            StopReason::Operator => "stopped by operator",
        })
    }
}

/// Position in the calibration state machine; the phase executed by the next
/// [`CalibrationController::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ReadCalibration,
    SetLowPoint,
    MeasureLow,
    SetHighPoint,
    MeasureHigh,
    ComputeCorrection,
    WriteCalibration,
    Converged(StopReason),
    /// The round limit ran out with a tolerance configured but unmet. The
    /// last correction was handled as decided; every further step fails.
    TimedOut,
}

/// Working state of one calibration run.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSession {
    pub board: u32,
    pub temperature: f64,
    pub offset: i64,
    pub gain: i64,
    pub dac_low: i64,
    pub dac_high: i64,
    pub measured_low: f64,
    pub measured_high: f64,
    pub settle: Duration,
    /// Completed rounds.
    pub round: u32,
    /// Noise-rejected batches over the whole run.
    pub noise_retries: u32,
    correction: Option<(Correction, Decision)>,
}

impl CalibrationSession {
    fn new(settle: Duration) -> Self {
        Self {
            board: 0,
            temperature: 0.0,
            offset: 0,
            gain: 0,
            dac_low: 0,
            dac_high: 0,
            measured_low: 0.0,
            measured_high: 0.0,
            settle,
            round: 0,
            noise_retries: 0,
            correction: None,
        }
    }
}

/// Result of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationOutcome {
    pub reason: StopReason,
    pub board: u32,
    /// Registers in effect at the end.
    pub offset: i64,
    pub gain: i64,
    pub rounds: u32,
    pub reports: Vec<RoundReport>,
}

/// Drives the calibration state machine against a meter, a supply, a log and
/// an operator.
pub struct CalibrationController<M, C, L, O> {
    meter: M,
    supply: PowerSupply<C>,
    log: L,
    operator: O,
    config: CalibrationConfig,
    session: CalibrationSession,
    phase: Phase,
    reports: Vec<RoundReport>,
}

impl<M, C, L, O> CalibrationController<M, C, L, O>
where
    M: ReadingSource,
    C: CommandChannel,
    L: CalibrationLog,
    O: Operator,
{
    /// Validates `config` and prepares an idle run.
    pub fn new(
        meter: M,
        supply: PowerSupply<C>,
        log: L,
        operator: O,
        config: CalibrationConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            meter,
            supply,
            log,
            operator,
            session: CalibrationSession::new(config.initial_settle),
            config,
            phase: Phase::Idle,
            reports: Vec::new(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> &CalibrationSession {
        &self.session
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Executes the current phase and returns the next one.
    ///
    /// On error the phase is left unchanged and the run should be abandoned.
    /// Running out of rounds is the exception: the phase moves to
    /// [`Phase::TimedOut`] and the step fails with
    /// [`Error::CalibrationTimeout`], as does every step after it.
    pub fn step(&mut self) -> Result<Phase> {
        let next = match self.phase {
            Phase::Idle => {
                self.start()?;
                Phase::ReadCalibration
            }
            Phase::ReadCalibration => {
                self.read_calibration()?;
                Phase::SetLowPoint
            }
            Phase::SetLowPoint => {
                self.session.dac_low = self.set_point(self.config.reference_low)?;
                Phase::MeasureLow
            }
            Phase::MeasureLow => {
                self.session.measured_low = self.measure(self.session.dac_low)?;
                Phase::SetHighPoint
            }
            Phase::SetHighPoint => {
                self.session.dac_high = self.set_point(self.config.reference_high)?;
                Phase::MeasureHigh
            }
            Phase::MeasureHigh => {
                self.session.measured_high = self.measure(self.session.dac_high)?;
                Phase::ComputeCorrection
            }
            Phase::ComputeCorrection => {
                self.compute()?;
                Phase::WriteCalibration
            }
            Phase::WriteCalibration => self.write()?,
            Phase::Converged(reason) => Phase::Converged(reason),
            Phase::TimedOut => return Err(self.timeout()),
        };
        log::trace!("Calibration phase {:?} -> {next:?}", self.phase);
        self.phase = next;
        if next == Phase::TimedOut {
            return Err(self.timeout());
        }
        Ok(next)
    }

    /// Steps until the run ends.
    pub fn run(&mut self) -> Result<CalibrationOutcome> {
        loop {
            if let Phase::Converged(reason) = self.step()? {
                return Ok(CalibrationOutcome {
                    reason,
                    board: self.session.board,
                    offset: self.session.offset,
                    gain: self.session.gain,
                    rounds: self.session.round,
                    reports: std::mem::take(&mut self.reports),
                });
            }
        }
    }

    pub fn into_parts(self) -> (M, PowerSupply<C>, L, O) {
        (self.meter, self.supply, self.log, self.operator)
    }

    fn timeout(&self) -> Error {
        Error::CalibrationTimeout {
            rounds: self.session.round,
        }
    }

    fn start(&mut self) -> Result<()> {
        self.supply.prepare()?;
        let identity = self.supply.identify()?;
        self.session.board = identity
            .board
            .ok_or_else(|| Error::InvalidResponse(identity.text.clone()))?;
        log::info!("Calibrating board {}: {}", self.session.board, identity.text);
        Ok(())
    }

    fn read_calibration(&mut self) -> Result<()> {
        self.supply.select_reference(self.config.reference_channel)?;
        self.session.offset = self.supply.read_offset()?;
        self.session.gain = self.supply.read_gain()?;
        self.session.temperature = self.supply.read_temperature()?;
        if self.session.gain <= 0 {
            return Err(Error::CalibrationDivergence(format!(
                "supply reports gain {}",
                self.session.gain
            )));
        }
        log::debug!(
            "Registers: offset {} uV, gain {}, {:.2} \u{b0}C",
            self.session.offset,
            self.session.gain,
            self.session.temperature
        );
        Ok(())
    }

    fn set_point(&mut self, volts: f64) -> Result<i64> {
        let code = dac_code(volts, self.session.offset, self.session.gain);
        self.supply.set_dac(code)?;
        std::thread::sleep(self.session.settle);
        Ok(code)
    }

    /// Median of a quiet batch; noisy batches re-send the set-point and retry.
    fn measure(&mut self, code: i64) -> Result<f64> {
        let mut retries = 0;
        loop {
            let stats = measure_batch(
                &mut self.meter,
                self.config.samples,
                self.config.max_sample_failures,
            )?;
            let peak_to_peak = stats.peak_to_peak();
            if peak_to_peak <= self.config.noise_threshold {
                log::debug!("DAC {code}: median {:.5} V", stats.median);
                return Ok(stats.median);
            }
            if retries >= self.config.max_noise_retries {
                return Err(Error::CalibrationUnstable {
                    retries,
                    peak_to_peak,
                });
            }
            retries += 1;
            self.session.noise_retries += 1;
            log::warn!(
                "DAC {code}: batch spread {:.5}..{:.5} V too noisy, retry {retries}",
                stats.min,
                stats.max
            );
            self.supply.set_dac(code)?;
            std::thread::sleep(self.session.settle);
        }
    }

    fn compute(&mut self) -> Result<()> {
        let s = &self.session;
        let points = TwoPoint {
            reference_low: dac_voltage(s.dac_low, s.offset, s.gain),
            reference_high: dac_voltage(s.dac_high, s.offset, s.gain),
            measured_low: s.measured_low,
            measured_high: s.measured_high,
        };
        let correction = compute_correction(&points, s.offset, s.gain, &self.config)?;
        let report = RoundReport {
            round: s.round,
            board: s.board,
            reference_channel: self.config.reference_channel,
            temperature: s.temperature,
            offset: s.offset,
            gain: s.gain,
            points,
            correction,
        };
        log::info!("{report}");
        let decision = self.operator.decide(&report);
        self.reports.push(report);
        self.session.correction = Some((correction, decision));
        Ok(())
    }

    fn write(&mut self) -> Result<Phase> {
        let Some((correction, decision)) = self.session.correction else {
            return Err(Error::OutOfOrder("no correction computed for this round"));
        };
        let mut ppm_change = 0;
        if decision.writes() {
            self.supply
                .write_calibration(correction.offset, correction.gain)?;
            self.session.offset = correction.offset;
            self.session.gain = correction.gain;
            ppm_change = correction.gain_change_ppm.round() as i64;
        }
        self.log.append(&LogRow {
            board: self.session.board,
            reference_channel: self.config.reference_channel,
            temperature: self.session.temperature,
            offset: self.session.offset,
            gain: self.session.gain,
            ppm_change,
        })?;

        self.session.correction = None;
        self.session.round += 1;
        self.session.settle = self.session.settle.mul_f64(SETTLE_GROWTH);

        let next = if decision.stops() {
            Phase::Converged(StopReason::Operator)
        } else if self.config.within_tolerance(&correction) {
            Phase::Converged(StopReason::Converged)
        } else if self.session.settle > self.config.settle_ceiling {
            Phase::Converged(StopReason::SettleCeiling)
        } else if self.session.round >= self.config.max_rounds {
            if self.config.has_tolerance() {
                Phase::TimedOut
            } else {
                Phase::Converged(StopReason::RoundLimit)
            }
        } else {
            Phase::ReadCalibration
        };
        Ok(next)
    }
}
