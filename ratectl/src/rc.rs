//! Picture-level rate control.
//!
//! [`RateControl::before_picture`] and [`RateControl::after_picture`] must alternate,
//! one pair per source picture. A skipped picture still gets its `after_picture`
//! call (the coded statistics are ignored) or may be followed directly by the next
//! `before_picture`.

use tracing::{debug, info, warn};

use crate::config::{RateControlConfig, SliceType};
use crate::error::ConfigError;
use crate::error_tracker::ErrorTracker;
use crate::gop::GopTracker;
use crate::qp::{Qp, initial_qp};
use crate::rq_model::RateQuantModel;
use crate::virtual_buffer::{Commit, VirtualBuffer};

const HRD_CLOCK: i64 = 90_000;
const COEFFS_PER_MB: i64 = 384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureDecision {
    pub qp: Qp,
    /// The picture must not be coded.
    pub skip: bool,
    pub target_bits: i64,
}

/// What the encoder reports once a picture has been coded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodedPicture {
    pub bits: u32,
    /// Sum of the macroblock QPs; 0 when unknown.
    pub qp_sum: u32,
    pub non_zero_count: u32,
}

impl CodedPicture {
    pub fn new(bits: u32, qp_sum: u32) -> Self {
        Self {
            bits,
            qp_sum,
            non_zero_count: 0,
        }
    }

    pub fn with_non_zero_count(mut self, non_zero_count: u32) -> Self {
        self.non_zero_count = non_zero_count;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok { filler_bits: u32 },
    /// The picture did not fit the HRD buffer: drop its output and code the same
    /// source picture again.
    Overflow,
}

/// Buffering-period values for the bitstream writer, in 90 kHz ticks except
/// `cpb_removal_delay`, which counts frame-rate ticks since the last buffering period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HrdTiming {
    pub buffering_period: bool,
    pub initial_cpb_removal_delay: u32,
    pub initial_cpb_removal_delay_offset: u32,
    pub cpb_removal_delay: u32,
}

#[derive(Debug, Clone, Copy)]
struct Planned {
    slice: SliceType,
    /// QP chosen by the model, before the intra or long-term offset.
    model_qp: Qp,
    qp: Qp,
    target_bits: i64,
    skipped: bool,
}

#[derive(Debug, Clone)]
pub struct RateControl {
    config: RateControlConfig,
    qp_min: Qp,
    qp_max: Qp,
    base_qp: Qp,
    qp: Qp,
    vb: VirtualBuffer,
    inter: RateQuantModel,
    intra: RateQuantModel,
    gop: GopTracker,
    inter_error: ErrorTracker,
    intra_error: ErrorTracker,
    window_rem: u32,
    slice_prev: Option<SliceType>,
    frames_coded: u64,
    pictures_skipped: u64,
    allow_large_step: bool,
    planned: Option<Planned>,
    source_complexity: i64,
    hrd_timing: HrdTiming,
    ticks_since_bp: u32,
}

impl RateControl {
    pub fn new(config: RateControlConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let vb = VirtualBuffer::new(config.bitrate, config.cpb_size, config.frame_rate);
        let qp_min = Qp::from_int(config.qp_min);
        let qp_max = Qp::from_int(config.qp_max);
        let qp = match config.initial_qp {
            Some(qp) => Qp::from_int(qp),
            None => initial_qp(vb.bits_per_pic(), config.width as i64 * config.height as i64),
        };
        if qp < qp_min || qp > qp_max {
            return Err(ConfigError::InitialQpOutOfBounds {
                qp: qp.round(),
                min: config.qp_min,
                max: config.qp_max,
            });
        }

        info!(
            bitrate = config.bitrate,
            fps = config.frame_rate.as_f64(),
            window = config.window_len,
            hrd = config.hrd,
            initial_qp = %qp,
            "rate control initialized"
        );

        Ok(Self {
            qp_min,
            qp_max,
            base_qp: qp,
            qp,
            inter: RateQuantModel::new(qp),
            intra: RateQuantModel::new(qp),
            gop: GopTracker::new(config.window_len, qp),
            inter_error: ErrorTracker::new(),
            intra_error: ErrorTracker::new(),
            window_rem: config.window_len,
            slice_prev: None,
            frames_coded: 0,
            pictures_skipped: 0,
            allow_large_step: false,
            planned: None,
            source_complexity: 0,
            hrd_timing: HrdTiming::default(),
            ticks_since_bp: 0,
            vb,
            config,
        })
    }

    /// Restarts the session at a new bitrate. On error the current session is kept.
    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<(), ConfigError> {
        let config = RateControlConfig {
            bitrate,
            ..self.config.clone()
        };
        *self = Self::new(config)?;
        Ok(())
    }

    pub fn config(&self) -> &RateControlConfig {
        &self.config
    }

    /// QP of the last coded picture.
    pub fn qp(&self) -> Qp {
        self.qp
    }

    pub fn virtual_buffer(&self) -> &VirtualBuffer {
        &self.vb
    }

    pub fn hrd_timing(&self) -> HrdTiming {
        self.hrd_timing
    }

    /// Macroblock QP adjustment for the hardware; zero unless macroblock rate control is on.
    pub fn mb_qp_adjustment(&self) -> i32 {
        if self.config.mb_rc { self.config.mb_qp_adjustment } else { 0 }
    }

    /// Plans the next picture. `time_inc` is the distance to the previous picture in
    /// frame-rate ticks; pass 0 when re-coding a picture after an overflow.
    pub fn before_picture(&mut self, time_inc: u32, slice: SliceType) -> PictureDecision {
        if self.planned.take().is_some_and(|p| !p.skipped) {
            warn!("before_picture without after_picture, previous plan dropped");
        }

        let available = self.vb.advance(time_inc, self.config.hrd);
        self.ticks_since_bp = self.ticks_since_bp.saturating_add(time_inc);

        if self.window_rem == 0 {
            self.inter_error.reset_for_new_window(self.config.window_len);
            if self.slice_prev != Some(slice) {
                self.intra_error.reset_for_new_window(self.config.window_len);
            }
            self.window_rem = self.config.window_len;
        }

        let target_bits = self.target_bits(slice, available);
        self.window_rem -= 1;

        let skip = slice == SliceType::Predicted
            && self.config.frame_skip
            && self.config.pic_rc
            && self.vb.evaluate_skip(available);
        let (model_qp, qp) = if skip {
            self.pictures_skipped += 1;
            (self.qp, self.qp)
        } else {
            self.plan_qp(slice, target_bits)
        };

        debug!(
            ?slice,
            %qp,
            target_bits,
            available,
            skip,
            large_step = self.allow_large_step,
            "picture planned"
        );

        self.planned = Some(Planned {
            slice,
            model_qp,
            qp,
            target_bits,
            skipped: skip,
        });
        PictureDecision { qp, skip, target_bits }
    }

    fn target_bits(&self, slice: SliceType, available: i64) -> i64 {
        let bits_per_pic = self.vb.bits_per_pic();
        let intra_bits_per_inter = if self.frames_coded > 0 {
            self.gop.intra_bits_per_inter(bits_per_pic, self.inter.qp_prev())
        } else {
            0
        };

        let window = self.window_rem.max(1) as i64;
        let debt = self.gop.pending_intra_debt(intra_bits_per_inter);
        let compensation = available.saturating_add(debt) / window;

        let base = match slice {
            SliceType::Intra => {
                let theft = intra_bits_per_inter.saturating_mul(self.gop.intra_interval() - 1);
                bits_per_pic.saturating_add(theft)
            }
            SliceType::Predicted => bits_per_pic - intra_bits_per_inter,
        };
        base.saturating_add(compensation).max(self.config.min_picture_bits())
    }

    /// Returns the model's QP and the QP to code with, which differ by the intra or
    /// long-term offset.
    fn plan_qp(&self, slice: SliceType, target_bits: i64) -> (Qp, Qp) {
        let cfg = &self.config;
        let fixed = match slice {
            SliceType::Intra => cfg.fixed_intra_qp.or(cfg.fixed_qp),
            SliceType::Predicted => cfg.fixed_qp,
        };
        if let Some(fixed) = fixed {
            let qp = Qp::from_int(fixed).clamp_to(self.qp_min, self.qp_max);
            return (qp, qp);
        }

        let qp = if cfg.pic_rc {
            let (model, error) = match slice {
                SliceType::Intra => (&self.intra, &self.intra_error),
                SliceType::Predicted => (&self.inter, &self.inter_error),
            };
            model.invert(target_bits - error.control_term() as i64, self.allow_large_step)
        } else {
            self.base_qp
        };
        let qp = qp.clamp_to(self.qp_min, self.qp_max);

        let delta = match slice {
            SliceType::Intra if self.slice_prev != Some(SliceType::Intra) => cfg.intra_qp_delta,
            SliceType::Predicted if self.is_long_term_refresh() => cfg.long_term_qp_delta,
            _ => 0,
        };
        (qp, qp.offset(delta).clamp_to(self.qp_min, self.qp_max))
    }

    fn is_long_term_refresh(&self) -> bool {
        let period = self.config.long_term_period as u64;
        period > 0 && self.frames_coded > 0 && self.frames_coded.is_multiple_of(period)
    }

    /// Feeds back the coded size of the planned picture.
    pub fn after_picture(&mut self, coded: CodedPicture) -> Outcome {
        let Some(planned) = self.planned.take() else {
            warn!("after_picture without a planned picture, ignored");
            return Outcome::Ok { filler_bits: 0 };
        };
        if planned.skipped {
            return Outcome::Ok { filler_bits: 0 };
        }

        let bits = coded.bits as i64;
        let (model, error_tracker) = match planned.slice {
            SliceType::Intra => (&mut self.intra, &mut self.intra_error),
            SliceType::Predicted => (&mut self.inter, &mut self.inter_error),
        };
        model.record(planned.qp, bits);
        let nominal = if planned.model_qp != planned.qp {
            model.rebase(planned.model_qp);
            nominal_bits(model, bits, planned.qp, planned.model_qp)
        } else {
            bits
        };
        let error = (nominal - planned.target_bits).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        error_tracker.update(error);
        self.update_source_complexity(bits, coded.non_zero_count);

        let fullness_before = self.vb.bucket_fullness();
        if self.vb.commit(bits, self.config.hrd) == Commit::Overflow {
            warn!(
                bits,
                fullness = fullness_before,
                buffer = self.vb.buffer_size(),
                "coded picture overflows the hrd buffer"
            );
            self.allow_large_step = true;
            return Outcome::Overflow;
        }
        self.allow_large_step = false;

        match planned.slice {
            SliceType::Intra => {
                self.gop.on_intra(nominal, self.vb.bits_per_pic());
                if self.config.hrd {
                    self.start_buffering_period(fullness_before);
                }
            }
            SliceType::Predicted => {
                let avg_qp = self.average_qp(coded.qp_sum, planned.qp);
                self.gop.on_inter(nominal, avg_qp);
                self.hrd_timing.buffering_period = false;
                self.hrd_timing.cpb_removal_delay = self.ticks_since_bp;
            }
        }

        self.slice_prev = Some(planned.slice);
        self.qp = planned.qp;
        self.frames_coded += 1;

        let filler_bits = if self.config.hrd && self.config.cbr {
            let filler = self.vb.cbr_filler_bits();
            self.vb.fill(filler);
            filler
        } else {
            0
        };

        debug!(
            bits,
            target = planned.target_bits,
            fullness = self.vb.bucket_fullness(),
            filler_bits,
            "picture committed"
        );
        Outcome::Ok {
            filler_bits: filler_bits as u32,
        }
    }

    fn average_qp(&self, qp_sum: u32, planned: Qp) -> Qp {
        if qp_sum == 0 {
            return planned;
        }
        let raw = (qp_sum as i64) * (1 << crate::qp::QP_FRAC_BITS) / self.config.mbs_per_picture();
        Qp::from_raw(raw.min(Qp::MAX.raw() as i64) as i32)
    }

    fn update_source_complexity(&mut self, bits: i64, non_zero_count: u32) {
        let capacity = self.config.mbs_per_picture() * COEFFS_PER_MB;
        let non_zero = (non_zero_count as i64).clamp(1, capacity);
        self.source_complexity = bits * 256 / non_zero;
    }

    fn start_buffering_period(&mut self, fullness_before: i64) {
        let bit_rate = self.vb.bit_rate();
        let buffer = self.vb.buffer_size();
        let delay = HRD_CLOCK * (buffer - fullness_before).max(0) / bit_rate;
        let offset = HRD_CLOCK * buffer / bit_rate - delay;
        self.hrd_timing = HrdTiming {
            buffering_period: true,
            initial_cpb_removal_delay: delay.min(u32::MAX as i64) as u32,
            initial_cpb_removal_delay_offset: offset.clamp(0, u32::MAX as i64) as u32,
            cpb_removal_delay: 0,
        };
        self.ticks_since_bp = 0;
    }

    pub fn stats(&self) -> RateControlStats {
        RateControlStats {
            target_bitrate: self.config.bitrate as u64,
            frames_coded: self.frames_coded,
            pictures_skipped: self.pictures_skipped,
            bucket_fullness: self.vb.bucket_fullness(),
            buffer_fullness_pct: (self.vb.bucket_fullness() * 100 / self.vb.buffer_size().max(1)) as u32,
            qp: self.qp,
            average_bitrate: self.vb.average_bit_rate(),
            skip_target: self.vb.skip_target(),
            intra_interval: self.gop.intra_interval(),
            intra_bit_ratio: self.gop.intra_bit_ratio(self.inter.qp_prev()),
            gop_avg_bits: self.gop.gop_avg_bit_cnt(),
            source_complexity: self.source_complexity,
        }
    }
}

/// Size a picture coded at `coded` would have had at the model's own choice `model_qp`.
/// Keeps the intra and long-term offsets out of the error and intra-share feedback,
/// which would otherwise chase the offset's extra bits picture after picture.
fn nominal_bits(model: &RateQuantModel, bits: i64, coded: Qp, model_qp: Qp) -> i64 {
    match (model.predict(coded), model.predict(model_qp)) {
        (Some(at_coded), Some(at_model)) if at_coded > 0 && at_model > 0 => {
            (bits as i128 * at_model as i128 / at_coded as i128).min(i64::MAX as i128) as i64
        }
        _ => bits,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateControlStats {
    pub target_bitrate: u64,
    pub frames_coded: u64,
    pub pictures_skipped: u64,
    pub bucket_fullness: i64,
    pub buffer_fullness_pct: u32,
    pub qp: Qp,
    pub average_bitrate: i64,
    pub skip_target: i64,
    pub intra_interval: i64,
    pub intra_bit_ratio: i64,
    pub gop_avg_bits: i64,
    /// Coded bits per non-zero coefficient, scaled by 256.
    pub source_complexity: i64,
}
