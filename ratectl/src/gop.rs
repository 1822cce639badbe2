//! Intra cadence and intra cost tracking.
//!
//! An intra picture is given `bits_per_pic * interval * ratio / 100` bits; the part
//! above one picture's share is taken evenly from the inter pictures that follow it.

use crate::qp::Qp;
use crate::rq_model::RateQuantModel;

/// Upper bound on the intra share of a GOP, in percent.
pub const INTRA_RATIO_CAP: i64 = 95;

#[derive(Debug, Clone)]
pub struct GopTracker {
    intra_interval: i64,
    intra_interval_ctr: i64,
    gop_qp_sum: i64,
    gop_qp_cnt: i64,
    gop_bit_cnt: i64,
    gop_intra_bits: i64,
    gop_avg_bit_cnt: i64,
    intra_bit_ratio: i64,
    model: RateQuantModel,
}

impl GopTracker {
    pub fn new(window_len: u32, qp: Qp) -> Self {
        Self {
            intra_interval: window_len.max(1) as i64,
            intra_interval_ctr: 0,
            gop_qp_sum: 0,
            gop_qp_cnt: 0,
            gop_bit_cnt: 0,
            gop_intra_bits: 0,
            gop_avg_bit_cnt: 0,
            intra_bit_ratio: 0,
            model: RateQuantModel::new(qp),
        }
    }

    pub fn intra_interval(&self) -> i64 {
        self.intra_interval
    }

    /// Pictures coded since the last intra picture, that picture included.
    pub fn intra_interval_ctr(&self) -> i64 {
        self.intra_interval_ctr
    }

    pub fn gop_avg_bit_cnt(&self) -> i64 {
        self.gop_avg_bit_cnt
    }

    /// Intra share expected at the given inter QP, falling back to the last
    /// measurement while no GOP has completed.
    pub fn intra_bit_ratio(&self, inter_qp: Qp) -> i64 {
        self.model
            .predict(inter_qp)
            .map_or(self.intra_bit_ratio, |r| r.clamp(0, INTRA_RATIO_CAP))
    }

    pub fn intra_bits_per_inter(&self, bits_per_pic: i64, inter_qp: Qp) -> i64 {
        let interval = self.intra_interval;
        if interval <= 1 {
            return 0;
        }
        let ratio = self.intra_bit_ratio(inter_qp) as i128;
        let intra_bits = bits_per_pic as i128 * interval as i128 * ratio / 100;
        ((intra_bits - bits_per_pic as i128).max(0) / (interval - 1) as i128) as i64
    }

    /// Bits the remaining inter pictures of this interval still owe for the intra picture.
    pub fn pending_intra_debt(&self, intra_bits_per_inter: i64) -> i64 {
        (self.intra_interval - self.intra_interval_ctr)
            .max(0)
            .saturating_mul(intra_bits_per_inter)
    }

    pub fn on_intra(&mut self, bits: i64, bits_per_pic: i64) {
        if self.intra_interval_ctr > 0 {
            self.intra_interval = self.intra_interval_ctr;
        }
        self.intra_interval_ctr = 1;

        self.gop_qp_sum = 0;
        self.gop_qp_cnt = 0;
        self.gop_bit_cnt = bits;
        self.gop_intra_bits = bits;

        if self.model.is_empty() {
            let expected = (bits + bits_per_pic * (self.intra_interval - 1)).max(1);
            self.intra_bit_ratio = (bits * 100 / expected).min(INTRA_RATIO_CAP);
        }
    }

    pub fn on_inter(&mut self, bits: i64, avg_qp: Qp) {
        self.intra_interval_ctr += 1;
        if self.intra_interval_ctr > self.intra_interval {
            self.intra_interval = self.intra_interval_ctr;
        }

        self.gop_bit_cnt += bits;
        self.gop_qp_sum += avg_qp.raw() as i64;
        self.gop_qp_cnt += 1;

        if self.intra_interval_ctr == self.intra_interval && self.gop_intra_bits > 0 {
            self.close_gop();
        }
    }

    fn close_gop(&mut self) {
        self.gop_avg_bit_cnt = self.gop_bit_cnt / (self.gop_qp_cnt + 1);
        let ratio = (self.gop_intra_bits * 100 / self.gop_bit_cnt.max(1)).min(INTRA_RATIO_CAP);
        let avg_qp = Qp::from_raw((self.gop_qp_sum / self.gop_qp_cnt.max(1)) as i32);
        self.model.record(avg_qp, ratio);
        self.intra_bit_ratio = ratio;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QP: Qp = Qp::from_int(30);

    #[test]
    fn interval_learned_from_intra_distance() {
        let mut g = GopTracker::new(30, QP);
        assert_eq!(g.intra_interval(), 30);
        g.on_intra(5_000, 1_000);
        for _ in 0..9 {
            g.on_inter(500, QP);
        }
        g.on_intra(5_000, 1_000);
        assert_eq!(g.intra_interval(), 10);
        assert_eq!(g.intra_interval_ctr(), 1);
    }

    #[test]
    fn interval_grows_when_intra_is_late() {
        let mut g = GopTracker::new(10, QP);
        g.on_intra(5_000, 1_000);
        for _ in 0..14 {
            g.on_inter(500, QP);
        }
        assert_eq!(g.intra_interval(), 15);
    }

    #[test]
    fn first_intra_estimates_ratio() {
        let mut g = GopTracker::new(10, QP);
        g.on_intra(5_000, 1_000);
        assert_eq!(g.intra_bit_ratio(QP), 35);
    }

    #[test]
    fn closed_gop_measures_ratio_and_average() {
        let mut g = GopTracker::new(10, QP);
        g.on_intra(5_000, 1_000);
        for _ in 0..9 {
            g.on_inter(500, QP);
        }
        assert_eq!(g.gop_avg_bit_cnt(), 950);
        let ratio = g.intra_bit_ratio(QP);
        assert!((51..=53).contains(&ratio), "ratio {}", ratio);
    }

    #[test]
    fn ratio_capped() {
        let mut g = GopTracker::new(4, QP);
        g.on_intra(100_000, 1_000);
        for _ in 0..3 {
            g.on_inter(1, QP);
        }
        assert_eq!(g.intra_bit_ratio(QP), INTRA_RATIO_CAP);
    }

    #[test]
    fn intra_cost_spread_over_inters() {
        let mut g = GopTracker::new(10, QP);
        g.on_intra(5_000, 1_000);
        assert_eq!(g.intra_bits_per_inter(1_000, QP), (1_000 * 10 * 35 / 100 - 1_000) / 9);
        assert_eq!(g.pending_intra_debt(100), 900);
        g.on_inter(500, QP);
        assert_eq!(g.pending_intra_debt(100), 800);
    }

    #[test]
    fn intra_only_stream_has_no_theft() {
        let mut g = GopTracker::new(10, QP);
        g.on_intra(5_000, 1_000);
        g.on_intra(5_000, 1_000);
        assert_eq!(g.intra_interval(), 1);
        assert_eq!(g.intra_bits_per_inter(1_000, QP), 0);
    }

    #[test]
    fn no_intra_means_no_ratio() {
        let mut g = GopTracker::new(10, QP);
        for _ in 0..20 {
            g.on_inter(500, QP);
        }
        assert_eq!(g.intra_bit_ratio(QP), 0);
        assert_eq!(g.intra_bits_per_inter(1_000, QP), 0);
    }
}
