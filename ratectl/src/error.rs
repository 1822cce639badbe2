use thiserror::Error;

use crate::frame_rate::FrameRateError;

/// Rejected rate control configuration.
///
/// Returned by [`RateControl::new`](crate::RateControl::new) and
/// [`RateControl::set_bitrate`](crate::RateControl::set_bitrate); no session state is
/// created or modified when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} {value} is outside 0..={max}")]
    QpOutOfRange { name: &'static str, value: i32, max: i32 },

    #[error("qp_min {min} is greater than qp_max {max}")]
    QpBoundsInverted { min: i32, max: i32 },

    #[error("initial qp {qp} is outside the configured bounds {min}..={max}")]
    InitialQpOutOfBounds { qp: i32, min: i32, max: i32 },

    #[error("mb_qp_adjustment {0} is outside -8..=7")]
    MbQpAdjustmentOutOfRange(i32),

    #[error("bitrate must be > 0")]
    ZeroBitrate,

    #[error("invalid frame rate: {0}")]
    InvalidFrameRate(#[from] FrameRateError),

    #[error("rate control window must be at least one picture")]
    ZeroWindow,

    #[error("hrd enabled with a zero cpb size")]
    ZeroBufferSize,

    #[error("invalid dimensions {width}x{height}: width must be 1..=8192, height must be 1..=8192")]
    InvalidDimensions { width: u32, height: u32 },
}
