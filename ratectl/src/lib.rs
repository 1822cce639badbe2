#![forbid(unsafe_code)]

//! Picture-level bitrate control for hardware video encoders.
//!
//! For every picture the encoder asks for a QP with
//! [`RateControl::before_picture`], codes the picture, and reports the result with
//! [`RateControl::after_picture`].

pub mod config;
pub mod error;
pub mod error_tracker;
pub mod frame_rate;
pub mod gop;
pub mod qp;
pub mod rc;
pub mod rq_model;
pub mod virtual_buffer;

pub use config::{RateControlConfig, SliceType};
pub use error::ConfigError;
pub use frame_rate::{FrameRate, FrameRateError};
pub use qp::Qp;
pub use rc::{CodedPicture, HrdTiming, Outcome, PictureDecision, RateControl, RateControlStats};

/// Starts a rate control session.
pub fn init(config: RateControlConfig) -> Result<RateControl, ConfigError> {
    RateControl::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_with_defaults() {
        let rc = init(RateControlConfig::default()).unwrap();
        assert_eq!(rc.stats().frames_coded, 0);
        assert_eq!(rc.stats().target_bitrate, 1_000_000);
    }

    #[test]
    fn init_rejects_bad_config() {
        let cfg = RateControlConfig { qp_max: 60, ..Default::default() };
        assert!(init(cfg).is_err());
    }
}
