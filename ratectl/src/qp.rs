//! Fixed-point quantization parameter and the quantizer-step lookup.

use serde::{Deserialize, Serialize};

pub const QP_FRAC_BITS: u32 = 8;
pub const QP_MAX: i32 = 51;

/// Number of entries in [`QSTEP`]: every tenth of a QP from 0.0 to 51.0.
pub const QSTEP_LEN: usize = 511;

/// Quantizer step sizes, `0.625 * 2^(qp / 6)` scaled by 256, indexed by tenths of a QP.
pub const QSTEP: [i64; QSTEP_LEN] = [
    160, 162, 164, 166, 168, 170, 171, 173, 175, 178,
    180, 182, 184, 186, 188, 190, 192, 195, 197, 199,
    202, 204, 206, 209, 211, 214, 216, 219, 221, 224,
    226, 229, 232, 234, 237, 240, 243, 245, 248, 251,
    254, 257, 260, 263, 266, 269, 272, 275, 279, 282,
    285, 288, 292, 295, 299, 302, 306, 309, 313, 316,
    320, 324, 327, 331, 335, 339, 343, 347, 351, 355,
    359, 363, 368, 372, 376, 381, 385, 389, 394, 399,
    403, 408, 413, 417, 422, 427, 432, 437, 442, 447,
    453, 458, 463, 469, 474, 479, 485, 491, 496, 502,
    508, 514, 520, 526, 532, 538, 544, 551, 557, 564,
    570, 577, 584, 590, 597, 604, 611, 618, 625, 633,
    640, 647, 655, 663, 670, 678, 686, 694, 702, 710,
    718, 727, 735, 744, 752, 761, 770, 779, 788, 797,
    806, 816, 825, 835, 844, 854, 864, 874, 884, 895,
    905, 916, 926, 937, 948, 959, 970, 981, 993, 1004,
    1016, 1028, 1040, 1052, 1064, 1076, 1089, 1102, 1114, 1127,
    1140, 1154, 1167, 1181, 1194, 1208, 1222, 1236, 1251, 1265,
    1280, 1295, 1310, 1325, 1341, 1356, 1372, 1388, 1404, 1420,
    1437, 1453, 1470, 1487, 1505, 1522, 1540, 1558, 1576, 1594,
    1613, 1631, 1650, 1670, 1689, 1709, 1728, 1749, 1769, 1789,
    1810, 1831, 1853, 1874, 1896, 1918, 1940, 1963, 1985, 2009,
    2032, 2055, 2079, 2104, 2128, 2153, 2178, 2203, 2229, 2255,
    2281, 2307, 2334, 2361, 2389, 2416, 2444, 2473, 2502, 2531,
    2560, 2590, 2620, 2650, 2681, 2712, 2744, 2776, 2808, 2840,
    2874, 2907, 2941, 2975, 3009, 3044, 3080, 3116, 3152, 3188,
    3225, 3263, 3301, 3339, 3378, 3417, 3457, 3497, 3538, 3579,
    3620, 3662, 3705, 3748, 3792, 3836, 3880, 3925, 3971, 4017,
    4064, 4111, 4159, 4207, 4256, 4305, 4355, 4406, 4457, 4509,
    4561, 4614, 4668, 4722, 4777, 4833, 4889, 4946, 5003, 5061,
    5120, 5179, 5240, 5301, 5362, 5424, 5487, 5551, 5616, 5681,
    5747, 5814, 5881, 5950, 6019, 6089, 6159, 6231, 6303, 6377,
    6451, 6526, 6602, 6678, 6756, 6834, 6914, 6994, 7075, 7158,
    7241, 7325, 7410, 7496, 7583, 7671, 7760, 7851, 7942, 8034,
    8127, 8222, 8317, 8414, 8512, 8611, 8711, 8812, 8914, 9018,
    9123, 9229, 9336, 9445, 9554, 9665, 9778, 9891, 10006, 10122,
    10240, 10359, 10479, 10601, 10724, 10849, 10975, 11102, 11231, 11362,
    11494, 11628, 11763, 11899, 12038, 12177, 12319, 12462, 12607, 12753,
    12902, 13052, 13203, 13357, 13512, 13669, 13828, 13988, 14151, 14315,
    14482, 14650, 14820, 14992, 15166, 15343, 15521, 15701, 15884, 16068,
    16255, 16444, 16635, 16828, 17024, 17222, 17422, 17624, 17829, 18036,
    18246, 18458, 18672, 18889, 19109, 19331, 19555, 19782, 20012, 20245,
    20480, 20718, 20959, 21202, 21449, 21698, 21950, 22205, 22463, 22724,
    22988, 23255, 23525, 23799, 24075, 24355, 24638, 24924, 25214, 25507,
    25803, 26103, 26406, 26713, 27024, 27338, 27655, 27977, 28302, 28630,
    28963, 29300, 29640, 29984, 30333, 30685, 31042, 31403, 31767, 32137,
    32510, 32888, 33270, 33656, 34048, 34443, 34843, 35248, 35658, 36072,
    36491, 36915, 37344, 37778, 38217, 38661, 39110, 39565, 40024, 40490,
    40960, 41436, 41917, 42404, 42897, 43396, 43900, 44410, 44926, 45448,
    45976, 46510, 47051, 47597, 48150, 48710, 49276, 49848, 50428, 51014,
    51606, 52206, 52813, 53426, 54047, 54675, 55310, 55953, 56603, 57261,
    57926,
];

/// Quantization parameter with 8 fractional bits (Q24.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Qp(i32);

impl Qp {
    pub const ZERO: Qp = Qp(0);
    pub const MAX: Qp = Qp(QP_MAX << QP_FRAC_BITS);

    pub const fn from_int(qp: i32) -> Self {
        Qp(qp << QP_FRAC_BITS)
    }

    pub const fn from_raw(raw: i32) -> Self {
        Qp(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Nearest integer QP, the value a hardware slice header carries.
    pub const fn round(self) -> i32 {
        (self.0 + (1 << (QP_FRAC_BITS - 1))) >> QP_FRAC_BITS
    }

    /// Index into [`QSTEP`], rounded to the nearest tenth and clamped to the table.
    pub fn tenths(self) -> usize {
        let t = (self.0 as i64 * 10 + (1 << (QP_FRAC_BITS - 1))) >> QP_FRAC_BITS;
        t.clamp(0, QSTEP_LEN as i64 - 1) as usize
    }

    pub fn from_tenths(tenths: usize) -> Self {
        let t = tenths.min(QSTEP_LEN - 1) as i32;
        Qp(((t << QP_FRAC_BITS) + 5) / 10)
    }

    pub fn step(self) -> i64 {
        QSTEP[self.tenths()]
    }

    pub fn offset(self, delta: i32) -> Self {
        Qp(self.0.saturating_add(delta.saturating_mul(1 << QP_FRAC_BITS)))
    }

    pub fn clamp_to(self, min: Qp, max: Qp) -> Self {
        Qp(self.0.clamp(min.0, max.0))
    }
}

impl std::fmt::Display for Qp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let whole = self.0 >> QP_FRAC_BITS;
        let frac = ((self.0 & ((1 << QP_FRAC_BITS) - 1)) * 100) >> QP_FRAC_BITS;
        write!(f, "{}.{:02}", whole, frac)
    }
}

const BPP_THRESHOLDS: [i64; 9] = [27, 44, 72, 119, 192, 314, 453, 653, i64::MAX];
const BPP_QP: [i32; 9] = [49, 45, 41, 37, 33, 29, 25, 21, 17];

/// Starting QP for a session from the bit budget of one picture and its pixel count.
pub fn initial_qp(bits_per_picture: i64, pels: i64) -> Qp {
    if bits_per_picture > 1_000_000 {
        return Qp::from_int(17);
    }

    let pels = (pels >> 8).max(1);
    let mut bits = (bits_per_picture >> 5).max(1);
    bits *= pels + 250;
    bits /= 350 + 3 * pels / 4;
    bits = bits * 8000 / (pels << 6);

    let i = BPP_THRESHOLDS
        .iter()
        .position(|&t| t >= bits)
        .unwrap_or(BPP_THRESHOLDS.len() - 1);
    Qp::from_int(BPP_QP[i])
}
