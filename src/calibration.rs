use crate::{Api, CreateContextError, Profiler, Queue as _};

/// Mapping between the device clock of a queue and the host clock.
///
/// Sampled once when a [`QueueContext`](crate::QueueContext) is created and never
/// corrected afterwards, so the relative drift of both clocks accumulates over
/// the lifetime of the context.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "trace", derive(serde::Serialize, serde::Deserialize))]
pub struct CalibrationRecord {
    /// Host time of the sample, in the profiler's time domain.
    pub host_time: i64,
    /// Device ticks at the same moment.
    pub device_time: i64,
    /// Nanoseconds per device tick.
    pub period: f32,
}

impl CalibrationRecord {
    /// Samples the clocks of `queue`.
    ///
    /// The host time reported by the device is replaced by the profiler's
    /// clock, read right after the device sample, so that every event of
    /// the context uses the same host time domain.
    pub(crate) unsafe fn sample<A: Api>(
        queue: &A::Queue,
        profiler: &dyn Profiler,
    ) -> Result<Self, CreateContextError> {
        let frequency = unsafe { queue.timestamp_frequency() }
            .map_err(CreateContextError::CalibrationFailed)?;
        if frequency == 0 {
            return Err(CreateContextError::InvalidFrequency(frequency));
        }
        let calibration = unsafe { queue.clock_calibration() }
            .map_err(CreateContextError::CalibrationFailed)?;
        let host_time = profiler.now();
        log::debug!(
            "Calibrated queue clock: {} Hz, device {} at host {} (raw host {})",
            frequency,
            calibration.gpu_timestamp,
            host_time,
            calibration.cpu_timestamp,
        );

        Ok(Self {
            host_time,
            device_time: calibration.gpu_timestamp as i64,
            period: period_from_frequency(frequency),
        })
    }

    /// Projects raw device ticks into host time.
    ///
    /// Ticks are a wrapping 64-bit counter, so a tick that wrapped past the
    /// calibration sample still projects after it.
    pub fn host_time_of(&self, device_time: i64) -> i64 {
        let ticks = device_time.wrapping_sub(self.device_time);
        let delta = ticks as f64 * f64::from(self.period);
        self.host_time.saturating_add(delta.round() as i64)
    }
}

/// Nanoseconds per tick of a clock running at `frequency` Hz.
pub(crate) fn period_from_frequency(frequency: u64) -> f32 {
    1e9 / frequency as f32
}
