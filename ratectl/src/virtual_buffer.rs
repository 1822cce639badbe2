//! Leaky-bucket model of the coded picture buffer.
//!
//! `virtual_bit_cnt` is what the channel delivered during the current second and
//! `real_bit_cnt` what the encoder produced; both are rebased every time the
//! sub-second tick counter wraps.

use crate::frame_rate::FrameRate;

/// Bound on the budget signal returned by [`VirtualBuffer::advance`].
pub const TARGET_SATURATION: i64 = 0x1FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    Ok,
    Overflow,
}

#[derive(Debug, Clone)]
pub struct VirtualBuffer {
    buffer_size: i64,
    bit_rate: i64,
    bits_per_pic: i64,
    pic_time_inc: i64,
    time_scale: i64,
    virtual_bit_cnt: i64,
    real_bit_cnt: i64,
    bucket_fullness: i64,
    bucket_level: i64,
    seconds: i64,
    committed_bits: i64,
    average_bit_rate: i64,
    skip_target: i64,
    skipped: i64,
    max_skip_target: i64,
}

impl VirtualBuffer {
    pub fn new(bit_rate: u32, buffer_size: u32, frame_rate: FrameRate) -> Self {
        let bit_rate = bit_rate as i64;
        let time_scale = frame_rate.time_scale().max(1);
        let time_unit = frame_rate.time_unit().max(1);
        // A coded picture is reported as a u32 bit count.
        let bits_per_pic =
            (bit_rate as i128 * time_unit as i128 / time_scale as i128).min(u32::MAX as i128);
        Self {
            buffer_size: buffer_size as i64,
            bit_rate,
            bits_per_pic: bits_per_pic as i64,
            pic_time_inc: 0,
            time_scale,
            virtual_bit_cnt: 0,
            real_bit_cnt: 0,
            bucket_fullness: 0,
            bucket_level: 0,
            seconds: 0,
            committed_bits: 0,
            average_bit_rate: bit_rate,
            skip_target: 0,
            skipped: 0,
            max_skip_target: frame_rate.pictures_per_second().max(1),
        }
    }

    pub fn bits_per_pic(&self) -> i64 {
        self.bits_per_pic
    }

    pub fn bit_rate(&self) -> i64 {
        self.bit_rate
    }

    pub fn buffer_size(&self) -> i64 {
        self.buffer_size
    }

    pub fn bucket_fullness(&self) -> i64 {
        self.bucket_fullness
    }

    pub fn virtual_bit_cnt(&self) -> i64 {
        self.virtual_bit_cnt
    }

    pub fn real_bit_cnt(&self) -> i64 {
        self.real_bit_cnt
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    pub fn average_bit_rate(&self) -> i64 {
        self.average_bit_rate
    }

    pub fn skip_target(&self) -> i64 {
        self.skip_target
    }

    /// Moves the channel clock forward by `time_inc` ticks and returns the bits
    /// available to the encoder (`virtual - real`), saturated to ±[`TARGET_SATURATION`].
    pub fn advance(&mut self, time_inc: u32, hrd: bool) -> i64 {
        self.pic_time_inc += time_inc as i64;
        if self.pic_time_inc >= self.time_scale {
            let wraps = self.pic_time_inc / self.time_scale;
            self.pic_time_inc %= self.time_scale;
            let drained = self.bit_rate.saturating_mul(wraps);
            self.real_bit_cnt = self.real_bit_cnt.saturating_sub(drained);
            self.bucket_level = self.bucket_level.saturating_sub(drained);
            self.seconds += wraps;
            self.average_bit_rate = self.committed_bits / self.seconds;
        }

        // pic_time_inc < time_scale, so the quotient stays below bit_rate.
        self.virtual_bit_cnt =
            (self.bit_rate as i128 * self.pic_time_inc as i128 / self.time_scale as i128) as i64;

        if hrd {
            self.bucket_fullness = self.bucket_level.saturating_sub(self.virtual_bit_cnt);
            if self.bucket_fullness < 0 {
                // Channel capacity that went unused is gone, not banked.
                self.real_bit_cnt = self.real_bit_cnt.saturating_sub(self.bucket_fullness);
                self.bucket_level = self.bucket_level.saturating_sub(self.bucket_fullness);
                self.bucket_fullness = 0;
            }
        }

        self.virtual_bit_cnt
            .saturating_sub(self.real_bit_cnt)
            .clamp(-TARGET_SATURATION, TARGET_SATURATION)
    }

    /// Adds a coded picture to the bucket. On overflow nothing changes.
    pub fn commit(&mut self, bits: i64, hrd: bool) -> Commit {
        if hrd && bits > self.buffer_size - self.bucket_fullness {
            return Commit::Overflow;
        }
        self.add(bits, hrd);
        Commit::Ok
    }

    fn add(&mut self, bits: i64, hrd: bool) {
        if hrd {
            self.bucket_level = self.bucket_level.saturating_add(bits);
            self.bucket_fullness = self.bucket_fullness.saturating_add(bits);
        }
        self.real_bit_cnt = self.real_bit_cnt.saturating_add(bits);
        self.committed_bits = self.committed_bits.saturating_add(bits);
    }

    /// Whole-byte filler that keeps the bucket from running dry over the next
    /// picture interval, capped to the free room.
    pub fn cbr_filler_bits(&self) -> i64 {
        let shortfall = self.bits_per_pic - self.bucket_fullness;
        if shortfall <= 0 {
            return 0;
        }
        let room = (self.buffer_size - self.bucket_fullness).max(0);
        ((shortfall + 7) / 8 * 8).min(room / 8 * 8)
    }

    pub fn fill(&mut self, bits: i64) {
        self.add(bits, true);
    }

    /// Skip policy: grows the skip target while the encoder is more than a third of a
    /// picture over budget, shrinks it while as far under. Returns whether this
    /// picture should be skipped.
    pub fn evaluate_skip(&mut self, available: i64) -> bool {
        let margin = self.bits_per_pic / 3;
        if available < -margin {
            self.skip_target = (self.skip_target + 1).min(self.max_skip_target);
        } else if available > margin && self.skip_target > 0 {
            self.skip_target -= 1;
        }

        if self.skipped < self.skip_target {
            self.skipped += 1;
            true
        } else {
            self.skipped = 0;
            false
        }
    }
}
