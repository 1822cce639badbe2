//! Rate-quantizer model: a least-squares fit of `bits(q) = a1/q + a2/q²` over the
//! most recent pictures, inverted by a local search over the quantizer-step table.

use crate::qp::{QP_FRAC_BITS, QSTEP, QSTEP_LEN, Qp};

pub const MODEL_LEN: usize = 10;

const QP_DELTA: i32 = 2;
const QP_DELTA_WAY_OFF: i32 = 3;
const QP_WAY_OFF_LIMIT: i32 = 10;
const QP_LARGE_STEP: i32 = 10;

/// `x = 2^X_SHIFT / q` keeps the reciprocal step integral.
const X_SHIFT: u32 = 32;

fn div_round(n: i128, d: i128) -> i128 {
    if n >= 0 { n.saturating_add(d / 2) / d } else { n.saturating_sub(d / 2) / d }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Sample {
    step: i64,
    bits: i64,
}

impl Sample {
    fn x(self) -> i128 {
        (1i128 << X_SHIFT) / self.step as i128
    }

    fn y(self) -> i128 {
        self.bits as i128 * self.step as i128
    }
}

#[derive(Debug, Clone)]
pub struct RateQuantModel {
    samples: [Sample; MODEL_LEN],
    pos: usize,
    len: usize,
    a1: i128,
    a2: i128,
    qp_prev: Qp,
}

impl RateQuantModel {
    pub fn new(qp: Qp) -> Self {
        Self {
            samples: [Sample::default(); MODEL_LEN],
            pos: 0,
            len: 0,
            a1: 0,
            a2: 0,
            qp_prev: qp,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// QP of the most recent sample, or the seed QP before the first one.
    pub fn qp_prev(&self) -> Qp {
        self.qp_prev
    }

    pub fn coefficients(&self) -> (i128, i128) {
        (self.a1, self.a2)
    }

    fn held(&self) -> &[Sample] {
        &self.samples[..self.len]
    }

    pub fn record(&mut self, qp: Qp, bits: i64) {
        self.qp_prev = qp;
        self.samples[self.pos] = Sample { step: qp.step(), bits };
        self.pos = (self.pos + 1) % MODEL_LEN;
        if self.len < MODEL_LEN {
            self.len += 1;
        }

        let (a1, a2) = self.least_squares().unwrap_or_else(|| self.degenerate_fit());
        self.a1 = a1;
        self.a2 = a2;
    }

    /// Starts the next search from `qp` instead of the QP of the last sample. Used when
    /// the picture was coded with a deliberate offset from the model's choice.
    pub fn rebase(&mut self, qp: Qp) {
        self.qp_prev = qp;
    }

    /// Normal equations for `y = a1 + a2 * x / 2^X_SHIFT` with `y = bits * q`.
    /// `None` when the steps are all equal or an intermediate overflows.
    fn least_squares(&self) -> Option<(i128, i128)> {
        let n = self.len as i128;
        let (mut sx, mut sy, mut sxy, mut sxx) = (0i128, 0i128, 0i128, 0i128);
        for s in self.held() {
            let (x, y) = (s.x(), s.y());
            sx = sx.checked_add(x)?;
            sy = sy.checked_add(y)?;
            sxy = sxy.checked_add(x.checked_mul(y)?)?;
            sxx = sxx.checked_add(x.checked_mul(x)?)?;
        }

        let den = n.checked_mul(sxx)?.checked_sub(sx.checked_mul(sx)?)?;
        if den == 0 {
            return None;
        }
        let num = n.checked_mul(sxy)?.checked_sub(sx.checked_mul(sy)?)?;
        let a2 = num.checked_mul(1 << X_SHIFT)? / den;
        let a1 = sy
            .checked_mul(1 << X_SHIFT)?
            .checked_sub(a2.checked_mul(sx)?)?
            / (n << X_SHIFT);
        Some((a1, a2))
    }

    /// Decays `a1` and passes the curve through the sample centroid.
    fn degenerate_fit(&self) -> (i128, i128) {
        let a1 = self.a1 * 2 / 3;
        let n = self.len as i128;
        let (sx, sy) = self
            .held()
            .iter()
            .fold((0i128, 0i128), |(sx, sy), s| (sx.saturating_add(s.x()), sy.saturating_add(s.y())));
        if sx == 0 {
            return (a1, self.a2);
        }
        let a2 = sy
            .saturating_sub(n.saturating_mul(a1))
            .checked_mul(1 << X_SHIFT)
            .map_or(self.a2, |v| v / sx);
        (a1, a2)
    }

    fn predict_step(&self, step: i64) -> i64 {
        let s = Sample { step, bits: 0 };
        let y = self
            .a1
            .saturating_add(div_round(self.a2.saturating_mul(s.x()), 1 << X_SHIFT));
        div_round(y, step as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Predicted bits at `qp`; `None` while no sample has been recorded.
    pub fn predict(&self, qp: Qp) -> Option<i64> {
        (!self.is_empty()).then(|| self.predict_step(qp.step()))
    }

    /// QP whose predicted size is closest to `target_bits`, searched outward from the
    /// previous QP in tenth-of-a-QP steps.
    ///
    /// Unless `allow_large_step` is set the move is limited to 2 QP, or 3 QP when the
    /// search landed more than 10 QP away.
    pub fn invert(&self, target_bits: i64, allow_large_step: bool) -> Qp {
        if self.is_empty() {
            return self.qp_prev;
        }
        if target_bits <= 0 {
            let step = if allow_large_step { QP_LARGE_STEP } else { QP_DELTA };
            return self.qp_prev.offset(step).clamp_to(Qp::ZERO, Qp::MAX);
        }

        let error = |i: usize| self.predict_step(QSTEP[i]).abs_diff(target_bits);
        let mut idx = self.qp_prev.tenths();
        let mut best = error(idx);
        let upward = self.predict_step(QSTEP[idx]) > target_bits;

        loop {
            let next = if upward { idx + 1 } else { idx.wrapping_sub(1) };
            if next >= QSTEP_LEN {
                break;
            }
            let e = error(next);
            if e >= best {
                break;
            }
            best = e;
            idx = next;
        }

        let qp = Qp::from_tenths(idx);
        if allow_large_step { qp } else { self.limit_change(qp) }
    }

    fn limit_change(&self, qp: Qp) -> Qp {
        let one = 1 << QP_FRAC_BITS;
        let diff = qp.raw() - self.qp_prev.raw();
        let limit = if diff.abs() > QP_WAY_OFF_LIMIT * one {
            QP_DELTA_WAY_OFF * one
        } else {
            QP_DELTA * one
        };
        Qp::from_raw(self.qp_prev.raw() + diff.clamp(-limit, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BITS_AT_26: i64 = 40_000;

    fn curve_bits(qp: Qp) -> i64 {
        BITS_AT_26 * QSTEP[260] / qp.step()
    }

    fn trained() -> RateQuantModel {
        let mut m = RateQuantModel::new(Qp::from_int(26));
        for qp in [24, 26, 28, 30] {
            let qp = Qp::from_int(qp);
            m.record(qp, curve_bits(qp));
        }
        m
    }

    #[test]
    fn empty_model_returns_previous_qp() {
        let m = RateQuantModel::new(Qp::from_int(33));
        assert_eq!(m.invert(10_000, false), Qp::from_int(33));
        assert_eq!(m.invert(0, true), Qp::from_int(33));
        assert_eq!(m.predict(Qp::from_int(20)), None);
    }

    #[test]
    fn rebase_moves_search_origin_only() {
        let mut m = trained();
        let before = m.predict(Qp::from_int(32));
        m.rebase(Qp::from_int(40));
        assert_eq!(m.qp_prev(), Qp::from_int(40));
        assert_eq!(m.predict(Qp::from_int(32)), before);
        assert_eq!(m.invert(curve_bits(Qp::from_int(26)), false), Qp::from_int(37));
    }

    #[test]
    fn single_sample_predicts_itself() {
        let mut m = RateQuantModel::new(Qp::from_int(30));
        m.record(Qp::from_int(30), 25_000);
        let predicted = m.predict(Qp::from_int(30)).unwrap();
        assert!((predicted - 25_000).abs() <= 2, "predicted {}", predicted);
        assert!(m.predict(Qp::from_int(36)).unwrap() < predicted);
    }

    #[test]
    fn fit_tracks_inverse_step_curve() {
        let m = trained();
        for qp in [22, 25, 27, 32] {
            let qp = Qp::from_int(qp);
            let expected = curve_bits(qp);
            let predicted = m.predict(qp).unwrap();
            assert!(
                (predicted - expected).abs() * 100 <= expected,
                "qp {} expected {} predicted {}",
                qp,
                expected,
                predicted
            );
        }
    }

    #[test]
    fn invert_finds_target_without_limit() {
        let m = trained();
        let qp = m.invert(curve_bits(Qp::from_int(27)), true);
        assert!((qp.raw() - Qp::from_int(27).raw()).abs() <= 256 / 5, "got {}", qp);
    }

    #[test]
    fn invert_limits_change_to_two() {
        let m = trained();
        assert_eq!(m.qp_prev(), Qp::from_int(30));
        let qp = m.invert(curve_bits(Qp::from_int(22)), false);
        assert_eq!(qp, Qp::from_int(28));
    }

    #[test]
    fn invert_allows_three_when_way_off() {
        let m = trained();
        let qp = m.invert(curve_bits(Qp::from_int(14)), false);
        assert_eq!(qp, Qp::from_int(27));
    }

    #[test]
    fn non_positive_target_raises_qp() {
        let m = trained();
        assert_eq!(m.invert(0, false), Qp::from_int(32));
        assert_eq!(m.invert(-500, true), Qp::from_int(40));
    }

    #[test]
    fn search_stops_at_table_ends() {
        let m = trained();
        assert_eq!(m.invert(1, true), Qp::MAX);
        assert_eq!(m.invert(i64::MAX / 2, true), Qp::ZERO);
    }

    #[test]
    fn ring_buffer_keeps_last_ten() {
        let mut m = RateQuantModel::new(Qp::from_int(26));
        for i in 0..15 {
            let qp = Qp::from_int(20 + i);
            m.record(qp, curve_bits(qp));
        }
        assert_eq!(m.len(), MODEL_LEN);
        assert_eq!(m.qp_prev(), Qp::from_int(34));
    }

    #[test]
    fn repeated_step_decays_a1() {
        let mut m = trained();
        let qp = Qp::from_int(30);
        for _ in 0..MODEL_LEN {
            m.record(qp, curve_bits(qp));
        }
        let (a1_before, _) = m.coefficients();
        m.record(qp, curve_bits(qp));
        let (a1_after, _) = m.coefficients();
        assert_eq!(a1_after, a1_before * 2 / 3);
        let predicted = m.predict(qp).unwrap();
        assert!((predicted - curve_bits(qp)).abs() <= 2);
    }
}
