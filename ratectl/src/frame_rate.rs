use serde::{Deserialize, Serialize};

/// Output frame rate as `num / den` pictures per second.
///
/// `num` is the time scale (ticks per second) and `den` the time unit (ticks per
/// picture). Time increments passed to the rate controller are counted in ticks, so
/// the ratio is kept as given rather than reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameRateError {
    #[error("frame rate numerator must be > 0")]
    ZeroNum,
    #[error("frame rate denominator must be > 0")]
    ZeroDen,
}

impl FrameRate {
    pub fn new(num: u32, den: u32) -> Result<Self, FrameRateError> {
        let rate = Self { num, den };
        rate.validate()?;
        Ok(rate)
    }

    pub fn from_int(fps: u32) -> Result<Self, FrameRateError> {
        Self::new(fps, 1)
    }

    pub fn validate(self) -> Result<(), FrameRateError> {
        if self.num == 0 {
            return Err(FrameRateError::ZeroNum);
        }
        if self.den == 0 {
            return Err(FrameRateError::ZeroDen);
        }
        Ok(())
    }

    pub fn time_scale(self) -> i64 {
        self.num as i64
    }

    pub fn time_unit(self) -> i64 {
        self.den as i64
    }

    /// Pictures per second, rounded up.
    pub fn pictures_per_second(self) -> i64 {
        (self.num as i64 + self.den as i64 - 1) / (self.den as i64).max(1)
    }

    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self { num: 30, den: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_accepts_valid_num_den() {
        let rate = FrameRate::new(30, 1).unwrap();
        assert_eq!(rate.time_scale(), 30);
        assert_eq!(rate.time_unit(), 1);
    }

    #[test]
    fn new_rejects_zero_num() {
        assert_eq!(FrameRate::new(0, 1).unwrap_err(), FrameRateError::ZeroNum);
    }

    #[test]
    fn new_rejects_zero_den() {
        assert_eq!(FrameRate::new(1, 0).unwrap_err(), FrameRateError::ZeroDen);
    }

    #[test]
    fn keeps_caller_time_base() {
        let rate = FrameRate::new(60, 2).unwrap();
        assert_eq!(rate, FrameRate { num: 60, den: 2 });
        assert_eq!(rate.pictures_per_second(), 30);
    }

    #[test]
    fn ntsc_rounds_up() {
        let rate = FrameRate::new(30_000, 1_001).unwrap();
        assert_eq!(rate.pictures_per_second(), 30);
        assert!((rate.as_f64() - 29.97).abs() < 0.01);
    }
}
