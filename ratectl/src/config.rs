use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::frame_rate::FrameRate;
use crate::qp::QP_MAX;

pub const DEFAULT_BITRATE: u32 = 1_000_000;
pub const DEFAULT_WINDOW_LEN: u32 = 30;
pub const DEFAULT_CPB_SIZE: u32 = 1_000_000;

const MB_QP_ADJUSTMENT_RANGE: std::ops::RangeInclusive<i32> = -8..=7;
const MAX_DIMENSION: u32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceType {
    Intra,
    Predicted,
}

impl SliceType {
    pub fn is_intra(self) -> bool {
        self == SliceType::Intra
    }
}

/// Session parameters for [`RateControl`](crate::RateControl).
///
/// QP fields are integer QPs. Missing fields deserialize to [`Default`] values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateControlConfig {
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    pub frame_rate: FrameRate,
    /// Averaging window, also the initial guess of the intra interval.
    pub window_len: u32,
    pub qp_min: i32,
    pub qp_max: i32,
    /// Starting QP; `None` estimates it from the bit budget and resolution.
    pub initial_qp: Option<i32>,
    pub fixed_qp: Option<i32>,
    pub fixed_intra_qp: Option<i32>,
    pub intra_qp_delta: i32,
    pub hrd: bool,
    /// Coded picture buffer size in bits.
    pub cpb_size: u32,
    /// Strict constant bitrate: pad with filler so the HRD bucket never underflows.
    pub cbr: bool,
    pub pic_rc: bool,
    pub frame_skip: bool,
    pub mb_rc: bool,
    pub mb_qp_adjustment: i32,
    /// Inter pictures refreshing the long-term reference every this many pictures; 0 disables.
    pub long_term_period: u32,
    pub long_term_qp_delta: i32,
    pub width: u32,
    pub height: u32,
}

impl Default for RateControlConfig {
    fn default() -> Self {
        Self {
            bitrate: DEFAULT_BITRATE,
            frame_rate: FrameRate::default(),
            window_len: DEFAULT_WINDOW_LEN,
            qp_min: 10,
            qp_max: QP_MAX,
            initial_qp: None,
            fixed_qp: None,
            fixed_intra_qp: None,
            intra_qp_delta: 0,
            hrd: false,
            cpb_size: DEFAULT_CPB_SIZE,
            cbr: false,
            pic_rc: true,
            frame_skip: false,
            mb_rc: false,
            mb_qp_adjustment: 0,
            long_term_period: 0,
            long_term_qp_delta: 0,
            width: 1280,
            height: 720,
        }
    }
}

fn check_qp(name: &'static str, value: i32) -> Result<(), ConfigError> {
    if !(0..=QP_MAX).contains(&value) {
        return Err(ConfigError::QpOutOfRange { name, value, max: QP_MAX });
    }
    Ok(())
}

impl RateControlConfig {
    /// Checks everything that does not depend on the derived initial QP.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_DIMENSION).contains(&self.width) || !(1..=MAX_DIMENSION).contains(&self.height) {
            return Err(ConfigError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.bitrate == 0 {
            return Err(ConfigError::ZeroBitrate);
        }
        self.frame_rate.validate()?;
        if self.window_len == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.hrd && self.cpb_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }

        check_qp("qp_min", self.qp_min)?;
        check_qp("qp_max", self.qp_max)?;
        if self.qp_min > self.qp_max {
            return Err(ConfigError::QpBoundsInverted {
                min: self.qp_min,
                max: self.qp_max,
            });
        }
        if let Some(qp) = self.initial_qp {
            check_qp("initial_qp", qp)?;
        }
        if let Some(qp) = self.fixed_qp {
            check_qp("fixed_qp", qp)?;
        }
        if let Some(qp) = self.fixed_intra_qp {
            check_qp("fixed_intra_qp", qp)?;
        }
        if !MB_QP_ADJUSTMENT_RANGE.contains(&self.mb_qp_adjustment) {
            return Err(ConfigError::MbQpAdjustmentOutOfRange(self.mb_qp_adjustment));
        }
        Ok(())
    }

    pub fn mb_width(&self) -> i64 {
        self.width.div_ceil(16) as i64
    }

    pub fn mb_height(&self) -> i64 {
        self.height.div_ceil(16) as i64
    }

    pub fn mbs_per_picture(&self) -> i64 {
        self.mb_width() * self.mb_height()
    }

    /// Size of a picture whose macroblocks are all skipped; smaller targets cannot be met.
    pub fn min_picture_bits(&self) -> i64 {
        96 + 16 * self.mb_height()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(RateControlConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_qp_max_above_51() {
        let cfg = RateControlConfig { qp_max: 52, ..Default::default() };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::QpOutOfRange { name: "qp_max", value: 52, .. })
        ));
    }

    #[test]
    fn rejects_inverted_bounds() {
        let cfg = RateControlConfig { qp_min: 40, qp_max: 30, ..Default::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::QpBoundsInverted { min: 40, max: 30 }));
    }

    #[test]
    fn rejects_mb_qp_adjustment_out_of_range() {
        let cfg = RateControlConfig { mb_qp_adjustment: 8, ..Default::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::MbQpAdjustmentOutOfRange(8)));
        let cfg = RateControlConfig { mb_qp_adjustment: -8, ..Default::default() };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_bitrate_and_window() {
        let cfg = RateControlConfig { bitrate: 0, ..Default::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroBitrate));
        let cfg = RateControlConfig { window_len: 0, ..Default::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroWindow));
    }

    #[test]
    fn rejects_hrd_without_buffer() {
        let cfg = RateControlConfig { hrd: true, cpb_size: 0, ..Default::default() };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroBufferSize));
    }

    #[test]
    fn rejects_zero_frame_rate() {
        let cfg = RateControlConfig {
            frame_rate: FrameRate { num: 0, den: 1 },
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidFrameRate(_))));
    }

    #[test]
    fn macroblock_geometry_rounds_up() {
        let cfg = RateControlConfig { width: 1920, height: 1080, ..Default::default() };
        assert_eq!(cfg.mb_width(), 120);
        assert_eq!(cfg.mb_height(), 68);
        assert_eq!(cfg.mbs_per_picture(), 8160);
        assert_eq!(cfg.min_picture_bits(), 96 + 16 * 68);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: RateControlConfig =
            serde_json::from_str(r#"{"bitrate": 2000000, "frame_rate": {"num": 25, "den": 1}, "hrd": true}"#)
                .unwrap();
        assert_eq!(cfg.bitrate, 2_000_000);
        assert_eq!(cfg.frame_rate, FrameRate { num: 25, den: 1 });
        assert!(cfg.hrd);
        assert_eq!(cfg.window_len, DEFAULT_WINDOW_LEN);
        assert_eq!(cfg.initial_qp, None);
    }

    #[test]
    fn slice_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&SliceType::Intra).unwrap(), "\"intra\"");
    }
}
