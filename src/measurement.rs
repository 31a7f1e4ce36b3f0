//! Repeated measurements and median-of-N noise rejection.

use crate::{reading::Reading, sync_client::Bm857, transport::Transport, Error, Result};

/// Anything that produces meter readings one at a time.
pub trait ReadingSource {
    fn acquire(&mut self) -> Result<Reading>;
}

impl<T: Transport> ReadingSource for Bm857<T> {
    fn acquire(&mut self) -> Result<Reading> {
        self.read()
    }
}

impl<S: ReadingSource + ?Sized> ReadingSource for &mut S {
    fn acquire(&mut self) -> Result<Reading> {
        (**self).acquire()
    }
}

/// Acquires one value, skipping up to `max_failures` consecutive transient failures.
pub fn acquire_value<S: ReadingSource + ?Sized>(source: &mut S, max_failures: u32) -> Result<f64> {
    let mut failures = 0;
    loop {
        match source.acquire() {
            Ok(reading) => return Ok(reading.value),
            Err(err) if err.is_transient() => {
                failures += 1;
                if failures > max_failures {
                    return Err(Error::SampleFailures {
                        failures,
                        last: Box::new(err),
                    });
                }
                log::debug!("Skipping failed reading ({failures}): {err}");
            }
            Err(err) => return Err(err),
        }
    }
}

/// Order statistics of one batch of samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub median: f64,
}

impl BatchStats {
    /// Sorts `samples` and summarizes them; `None` for an empty batch.
    ///
    /// For an even count the upper of the two middle samples is taken.
    pub fn from_samples(mut samples: Vec<f64>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_by(f64::total_cmp);
        Some(Self {
            count: samples.len(),
            min: samples[0],
            max: samples[samples.len() - 1],
            median: samples[samples.len() / 2],
        })
    }

    pub fn peak_to_peak(&self) -> f64 {
        self.max - self.min
    }
}

/// Takes `count` values from `source` and returns their statistics.
pub fn measure_batch<S: ReadingSource + ?Sized>(
    source: &mut S,
    count: usize,
    max_failures: u32,
) -> Result<BatchStats> {
    let samples = (0..count)
        .map(|_| acquire_value(&mut *source, max_failures))
        .collect::<Result<Vec<_>>>()?;
    BatchStats::from_samples(samples)
        .ok_or_else(|| Error::InvalidConfig("sample count must not be zero".into()))
}
