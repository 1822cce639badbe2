/// Proportional / integral / derivative bookkeeping of the difference between a
/// picture's target size and its coded size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorTracker {
    proportional: i32,
    integral: i32,
    derivative: i32,
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn proportional(&self) -> i32 {
        self.proportional
    }

    pub fn integral(&self) -> i32 {
        self.integral
    }

    pub fn derivative(&self) -> i32 {
        self.derivative
    }

    pub fn update(&mut self, error: i32) {
        self.derivative = error.saturating_sub(self.proportional);
        // An add that would overflow is dropped; the sum never flips sign.
        self.integral = self.integral.checked_add(error).unwrap_or(self.integral);
        self.proportional = error;
    }

    /// Correction in bits subtracted from the next target. The derivative is tracked
    /// but carries no weight.
    pub fn control_term(&self) -> i32 {
        let term = 4 * self.proportional as i64 + 2 * self.integral as i64;
        (term / 100) as i32
    }

    pub fn reset_for_new_window(&mut self, previous_window_len: u32) {
        self.proportional = 0;
        self.derivative = 0;
        self.integral /= previous_window_len.max(1) as i32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracker_has_no_correction() {
        assert_eq!(ErrorTracker::new().control_term(), 0);
    }

    #[test]
    fn update_tracks_all_three_terms() {
        let mut t = ErrorTracker::new();
        t.update(1_000);
        t.update(400);
        assert_eq!(t.proportional(), 400);
        assert_eq!(t.integral(), 1_400);
        assert_eq!(t.derivative(), -600);
    }

    #[test]
    fn control_term_blends_p_and_i() {
        let mut t = ErrorTracker::new();
        t.update(1_000);
        t.update(500);
        assert_eq!(t.control_term(), (4 * 500 + 2 * 1_500) / 100);
    }

    #[test]
    fn integral_keeps_previous_sum_when_add_would_overflow() {
        let mut t = ErrorTracker::new();
        for _ in 0..4 {
            t.update(i32::MAX / 2);
        }
        assert_eq!(t.integral(), i32::MAX - 1);
        assert_eq!(t.proportional(), i32::MAX / 2);

        t.update(i32::MIN);
        assert_eq!(t.integral(), -2);
        for _ in 0..4 {
            t.update(i32::MIN / 2);
        }
        assert_eq!(t.integral(), -2 + i32::MIN / 2);
    }

    #[test]
    fn new_window_carries_averaged_integral() {
        let mut t = ErrorTracker::new();
        for _ in 0..30 {
            t.update(300);
        }
        t.reset_for_new_window(30);
        assert_eq!(t.proportional(), 0);
        assert_eq!(t.derivative(), 0);
        assert_eq!(t.integral(), 300);
        assert_eq!(t.control_term(), 6);
    }
}
