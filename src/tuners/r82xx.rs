//! Rafael Micro R820T/R828D tuner driver.
//!
//! The chip is programmed through a 32-register window starting at address 5.
//! Every write goes through an in-memory shadow bank (the chip's data
//! registers cannot be read back) and an override bank that lets expert users
//! pin individual bits across all of the driver's own programming.

use super::{Tuner, TunerId, TunerInfo};
use crate::device::Device;
use crate::error::Result;
use crate::error::RtlsdrError::{self, RtlsdrErr};
use crate::TunerGain;
use log::{debug, info, warn};

pub const R820T_I2C_ADDR: u8 = 0x34;
pub const R828D_I2C_ADDR: u8 = 0x74;
pub const R828D_XTAL_FREQ: u32 = 16_000_000;
pub const R82XX_IF_FREQ: u32 = 3_570_000;

const R82XX_CHECK_ADDR: u8 = 0x00;
const R82XX_CHECK_VAL: u8 = 0x69;
const VER_NUM: u8 = 49;

const NUM_REGS: usize = 32;
const REG_SHADOW_START: usize = 5; // registers 0-4 are read-only status
const NUM_SHADOW_REGS: usize = NUM_REGS - REG_SHADOW_START;
const MAX_I2C_MSG_LEN: usize = 8;

/// Ceiling of fundamental-mode tuning; above it only harmonic mixing works.
const FUNDAMENTAL_MAX_FREQ: u64 = 1_770_000_000;

pub const TUNER_INFO: TunerInfo = TunerInfo {
    id: TunerId::R820t,
    name: "Rafael Micro R820T",
    i2c_addr: R820T_I2C_ADDR,
    check_addr: R82XX_CHECK_ADDR,
    check_val: R82XX_CHECK_VAL,
};

pub const TUNER_INFO_R828D: TunerInfo = TunerInfo {
    id: TunerId::R828d,
    name: "Rafael Micro R828D",
    i2c_addr: R828D_I2C_ADDR,
    check_addr: R82XX_CHECK_ADDR,
    check_val: R82XX_CHECK_VAL,
};

// Initial values for the shadow window (registers 5 to 31)
const REG_INIT: [u8; NUM_SHADOW_REGS] = [
    0x83, 0x32, 0x75, /* 05 to 07 */
    0xc0, 0x40, 0xd6, 0x6c, /* 08 to 0b */
    0xf5, 0x63, 0x75, 0x68, /* 0c to 0f */
    0x6c, 0x83, 0x80, 0x00, /* 10 to 13 */
    0x0f, 0x00, 0xc0, 0x30, /* 14 to 17 */
    0x48, 0xcc, 0x60, 0x00, /* 18 to 1b */
    0x54, 0xae, 0x4a, 0xc0, /* 1c to 1f */
];

/* measured with a Racal 6103E GSM test set at 928 MHz with -60 dBm
 * input power, for raw results see:
 * http://steve-m.de/projects/rtl-sdr/gain_measurement/r820t/
 */
const VGA_BASE_GAIN: i32 = -47;
pub const GAINS: [i32; 29] = [
    0, 9, 14, 27, 37, 77, 87, 125, 144, 157, 166, 197, 207, 229, 254, 280, 297, 328, 338, 364, 372,
    386, 402, 421, 434, 439, 445, 480, 496,
];

const R82XX_VGA_GAIN_STEPS: [i32; 16] = [
    0, 26, 26, 30, 42, 35, 24, 13, 14, 32, 36, 34, 35, 37, 35, 36,
];

const R82XX_LNA_GAIN_STEPS: [i32; 16] = [0, 9, 13, 40, 38, 13, 31, 22, 26, 31, 26, 14, 19, 5, 35, 13];

const R82XX_MIXER_GAIN_STEPS: [i32; 16] = [0, 5, 10, 10, 19, 9, 10, 25, 17, 10, 8, 16, 13, 6, 3, -8];

struct FreqRange {
    freq: u32,       // start freq, in MHz
    open_d: u8,      // low
    rf_mux_ploy: u8, // R26[7:6]=0 (LPF)  R26[1:0]=2 (low)
    tf_c: u8,        // R27[7:0]  band2,band0
    xtal_cap20p: u8, // R16[1:0]  20pF (10)
    xtal_cap10p: u8,
    xtal_cap0p: u8,
}

const FREQ_RANGES: [FreqRange; 21] = [
    FreqRange { freq: 0, open_d: 0x08, rf_mux_ploy: 0x02, tf_c: 0xdf, xtal_cap20p: 0x02, xtal_cap10p: 0x01, xtal_cap0p: 0x00 },
    FreqRange { freq: 50, open_d: 0x08, rf_mux_ploy: 0x02, tf_c: 0xbe, xtal_cap20p: 0x02, xtal_cap10p: 0x01, xtal_cap0p: 0x00 },
    FreqRange { freq: 55, open_d: 0x08, rf_mux_ploy: 0x02, tf_c: 0x8b, xtal_cap20p: 0x02, xtal_cap10p: 0x01, xtal_cap0p: 0x00 },
    FreqRange { freq: 60, open_d: 0x08, rf_mux_ploy: 0x02, tf_c: 0x7b, xtal_cap20p: 0x02, xtal_cap10p: 0x01, xtal_cap0p: 0x00 },
    FreqRange { freq: 65, open_d: 0x08, rf_mux_ploy: 0x02, tf_c: 0x69, xtal_cap20p: 0x02, xtal_cap10p: 0x01, xtal_cap0p: 0x00 },
    FreqRange { freq: 70, open_d: 0x08, rf_mux_ploy: 0x02, tf_c: 0x58, xtal_cap20p: 0x02, xtal_cap10p: 0x01, xtal_cap0p: 0x00 },
    FreqRange { freq: 75, open_d: 0x00, rf_mux_ploy: 0x02, tf_c: 0x44, xtal_cap20p: 0x02, xtal_cap10p: 0x01, xtal_cap0p: 0x00 },
    FreqRange { freq: 80, open_d: 0x00, rf_mux_ploy: 0x02, tf_c: 0x44, xtal_cap20p: 0x02, xtal_cap10p: 0x01, xtal_cap0p: 0x00 },
    FreqRange { freq: 90, open_d: 0x00, rf_mux_ploy: 0x02, tf_c: 0x34, xtal_cap20p: 0x01, xtal_cap10p: 0x01, xtal_cap0p: 0x00 },
    FreqRange { freq: 100, open_d: 0x00, rf_mux_ploy: 0x02, tf_c: 0x34, xtal_cap20p: 0x01, xtal_cap10p: 0x01, xtal_cap0p: 0x00 },
    FreqRange { freq: 110, open_d: 0x00, rf_mux_ploy: 0x02, tf_c: 0x24, xtal_cap20p: 0x01, xtal_cap10p: 0x01, xtal_cap0p: 0x00 },
    FreqRange { freq: 120, open_d: 0x00, rf_mux_ploy: 0x02, tf_c: 0x24, xtal_cap20p: 0x01, xtal_cap10p: 0x01, xtal_cap0p: 0x00 },
    FreqRange { freq: 140, open_d: 0x00, rf_mux_ploy: 0x02, tf_c: 0x14, xtal_cap20p: 0x01, xtal_cap10p: 0x01, xtal_cap0p: 0x00 },
    FreqRange { freq: 180, open_d: 0x00, rf_mux_ploy: 0x02, tf_c: 0x13, xtal_cap20p: 0x00, xtal_cap10p: 0x00, xtal_cap0p: 0x00 },
    FreqRange { freq: 220, open_d: 0x00, rf_mux_ploy: 0x02, tf_c: 0x13, xtal_cap20p: 0x00, xtal_cap10p: 0x00, xtal_cap0p: 0x00 },
    FreqRange { freq: 250, open_d: 0x00, rf_mux_ploy: 0x02, tf_c: 0x11, xtal_cap20p: 0x00, xtal_cap10p: 0x00, xtal_cap0p: 0x00 },
    FreqRange { freq: 280, open_d: 0x00, rf_mux_ploy: 0x02, tf_c: 0x00, xtal_cap20p: 0x00, xtal_cap10p: 0x00, xtal_cap0p: 0x00 },
    FreqRange { freq: 310, open_d: 0x00, rf_mux_ploy: 0x41, tf_c: 0x00, xtal_cap20p: 0x00, xtal_cap10p: 0x00, xtal_cap0p: 0x00 },
    FreqRange { freq: 450, open_d: 0x00, rf_mux_ploy: 0x41, tf_c: 0x00, xtal_cap20p: 0x00, xtal_cap10p: 0x00, xtal_cap0p: 0x00 },
    FreqRange { freq: 588, open_d: 0x00, rf_mux_ploy: 0x40, tf_c: 0x00, xtal_cap20p: 0x00, xtal_cap10p: 0x00, xtal_cap0p: 0x00 },
    FreqRange { freq: 650, open_d: 0x00, rf_mux_ploy: 0x40, tf_c: 0x00, xtal_cap20p: 0x00, xtal_cap10p: 0x00, xtal_cap0p: 0x00 },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum R82xxChip {
    R820T,
    R828D,
}

#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
enum XtalCapValue {
    XtalLowCap30p,
    XtalLowCap20p,
    XtalLowCap10p,
    XtalLowCap0p,
    XtalHighCap0p,
}

#[allow(dead_code)]
enum TunerType {
    TunerRadio,
    TunerAnalogTv,
    TunerDigitalTv,
}

#[allow(dead_code)]
enum DeliverySystem {
    SysUndefined,
    SysDvbt,
    SysDvbt2,
    SysIsdbt,
}

/// Which corner of the bandpass is steep; asymmetric rows let the IF be
/// positioned so the steep corner falls at the requested band edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SharpCorner {
    Lsb,
    Usb,
    Both,
}

struct IfInfo {
    sharp: SharpCorner,
    bw_khz: i32,     // 3-dB bandwidth; LSB/USB rows are keyed family+1 / family+2
    fif_khz: i32,    // IF frequency for the RTL2832
    fc_khz: i32,     // IF frequency correction
    reg10_lo: u8,    // low nibble of register 0x0a
    reg11: u8,       // register 0x0b
    reg30_hi: u8,    // register 0x1e: channel filter extension on weak signal
}

/* narrowest IF bandpass with reg10/reg11/reg30 = 0x0F, 0xEF, 0x60:
 *   539 .. 2002 kHz (mirrored from tuner)
 * asymmetric rows position the IF so the bandpass edge provides the
 * missing selectivity on one side */
const fn ifa(bw: i32) -> i32 {
    2002 - bw / 2
}
const fn ifb(bw: i32) -> i32 {
    539 + bw / 2
}

const IF_TABLE: [IfInfo; 33] = [
    IfInfo { sharp: SharpCorner::Lsb, bw_khz: 201, fif_khz: ifa(200), fc_khz: 33, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Usb, bw_khz: 202, fif_khz: ifb(200), fc_khz: 3, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Both, bw_khz: 290, fif_khz: 1950, fc_khz: -25, reg10_lo: 0x0f, reg11: 0xe7, reg30_hi: 0x00 },
    IfInfo { sharp: SharpCorner::Lsb, bw_khz: 291, fif_khz: ifa(290), fc_khz: 26, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Usb, bw_khz: 292, fif_khz: ifb(290), fc_khz: 2, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Both, bw_khz: 375, fif_khz: 1870, fc_khz: -13, reg10_lo: 0x0f, reg11: 0xe8, reg30_hi: 0x00 },
    IfInfo { sharp: SharpCorner::Lsb, bw_khz: 376, fif_khz: ifa(375), fc_khz: 23, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Usb, bw_khz: 377, fif_khz: ifb(375), fc_khz: 3, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Both, bw_khz: 420, fif_khz: 2100, fc_khz: 21, reg10_lo: 0x0f, reg11: 0xd7, reg30_hi: 0x00 },
    IfInfo { sharp: SharpCorner::Lsb, bw_khz: 421, fif_khz: ifa(420), fc_khz: 23, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Usb, bw_khz: 422, fif_khz: ifb(420), fc_khz: 3, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Both, bw_khz: 470, fif_khz: 1800, fc_khz: -12, reg10_lo: 0x0f, reg11: 0xe9, reg30_hi: 0x00 },
    IfInfo { sharp: SharpCorner::Lsb, bw_khz: 471, fif_khz: ifa(470), fc_khz: 18, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Usb, bw_khz: 472, fif_khz: ifb(470), fc_khz: 2, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Both, bw_khz: 600, fif_khz: 1700, fc_khz: 6, reg10_lo: 0x0f, reg11: 0xea, reg30_hi: 0x00 },
    IfInfo { sharp: SharpCorner::Lsb, bw_khz: 601, fif_khz: ifa(600), fc_khz: 16, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Usb, bw_khz: 602, fif_khz: ifb(600), fc_khz: 3, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Both, bw_khz: 860, fif_khz: 1550, fc_khz: 8, reg10_lo: 0x0f, reg11: 0xeb, reg30_hi: 0x00 },
    IfInfo { sharp: SharpCorner::Lsb, bw_khz: 861, fif_khz: ifa(860), fc_khz: 17, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Usb, bw_khz: 862, fif_khz: ifb(860), fc_khz: -12, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Both, bw_khz: 950, fif_khz: 2200, fc_khz: 5, reg10_lo: 0x0f, reg11: 0x88, reg30_hi: 0x00 },
    IfInfo { sharp: SharpCorner::Lsb, bw_khz: 951, fif_khz: ifa(950), fc_khz: 6, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Usb, bw_khz: 952, fif_khz: ifb(950), fc_khz: 0, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Both, bw_khz: 1100, fif_khz: 2100, fc_khz: 25, reg10_lo: 0x0f, reg11: 0x89, reg30_hi: 0x00 },
    IfInfo { sharp: SharpCorner::Lsb, bw_khz: 1101, fif_khz: ifa(1100), fc_khz: 24, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Usb, bw_khz: 1102, fif_khz: ifb(1100), fc_khz: 0, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Both, bw_khz: 1300, fif_khz: 2050, fc_khz: -7, reg10_lo: 0x0f, reg11: 0x8a, reg30_hi: 0x00 },
    IfInfo { sharp: SharpCorner::Lsb, bw_khz: 1301, fif_khz: ifa(1300), fc_khz: 26, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Usb, bw_khz: 1302, fif_khz: ifb(1300), fc_khz: 0, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Both, bw_khz: 1503, fif_khz: 1300, fc_khz: -24, reg10_lo: 0x0f, reg11: 0xef, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Both, bw_khz: 1600, fif_khz: 1900, fc_khz: 0, reg10_lo: 0x0f, reg11: 0x8b, reg30_hi: 0x00 },
    IfInfo { sharp: SharpCorner::Both, bw_khz: 1753, fif_khz: 1400, fc_khz: 12, reg10_lo: 0x0f, reg11: 0xcf, reg30_hi: 0x60 },
    IfInfo { sharp: SharpCorner::Both, bw_khz: 1953, fif_khz: 1500, fc_khz: 30, reg10_lo: 0x0f, reg11: 0x8f, reg30_hi: 0x60 },
];

/// Match a requested bandwidth (Hz) to a table row.
///
/// Requests keyed exactly onto an asymmetric row (family + 1 kHz for the
/// steep-LSB shape, family + 2 kHz for steep-USB) select that row. All other
/// requests walk the centered rows, deciding at the midpoint between
/// consecutive rows; a 400 Hz bias is added for rows whose steep corner sits
/// at the upper sideband.
fn pick_bw_row(bw: i32) -> usize {
    for (i, row) in IF_TABLE.iter().enumerate() {
        if row.sharp != SharpCorner::Both && bw == row.bw_khz * 1000 {
            return i;
        }
    }

    // the 200 kHz family has no centered row; its steep-LSB row stands in
    let walk: Vec<usize> = IF_TABLE
        .iter()
        .enumerate()
        .filter(|(i, row)| row.sharp == SharpCorner::Both || *i == 0)
        .map(|(i, _)| i)
        .collect();

    let eff = |i: usize| -> i32 {
        let row = &IF_TABLE[i];
        row.bw_khz * 1000 + if row.sharp == SharpCorner::Usb { 400 } else { 0 }
    };

    for w in 0..walk.len() - 1 {
        if bw < (eff(walk[w]) + eff(walk[w + 1])) / 2 {
            return walk[w];
        }
    }
    *walk.last().unwrap()
}

/// Fractional-N synthesis parameters for a LO target, per the datasheet
/// recipe: pick the mixer divider so the VCO lands in range, then split
/// `f_vco / (2 f_ref)` into integer and 16-bit sigma-delta fraction with
/// round-half-up.
fn pll_params(pll_ref: u32, freq: u32, vco_max_khz: u32) -> Option<(u8, u8, u64, u32)> {
    let freq_khz = (freq as u64 + 500) / 1000;
    let vco_min_khz: u64 = 1_770_000;

    let mut mix_div: u8 = 2;
    let mut div_num: u8 = 0;
    while mix_div <= 64 {
        if freq_khz * mix_div as u64 >= vco_min_khz
            && freq_khz * (mix_div as u64) < vco_max_khz as u64
        {
            let mut div_buf = mix_div;
            while div_buf > 2 {
                div_buf >>= 1;
                div_num += 1;
            }
            break;
        }
        mix_div <<= 1;
    }
    if mix_div > 64 {
        return None;
    }

    let vco_freq = freq as u64 * mix_div as u64;
    let vco_div = (pll_ref as u64 + 65536 * vco_freq) / (2 * pll_ref as u64);
    let nint = vco_div / 65536;
    let sdm = (vco_div % 65536) as u32;
    Some((mix_div, div_num, nint, sdm))
}

fn get_gain_index(gain: i32) -> (u8, u8) {
    let mut total_gain = 0;
    let mut lna_index: usize = 0;
    let mut mix_index: usize = 0;
    for _ in 0..15 {
        if total_gain >= gain {
            break;
        }
        lna_index += 1;
        total_gain += R82XX_LNA_GAIN_STEPS[lna_index];
        if total_gain >= gain {
            break;
        }
        mix_index += 1;
        total_gain += R82XX_MIXER_GAIN_STEPS[mix_index];
    }
    (lna_index as u8, mix_index as u8)
}

/// Cumulative VGA gain (tenth dB) at a given index.
fn vga_gain_at(idx: usize) -> i32 {
    let mut g = VGA_BASE_GAIN;
    for step in &R82XX_VGA_GAIN_STEPS[..=idx.min(15)] {
        g += step;
    }
    g
}

fn vga_index_for_gain(gain: i32) -> u8 {
    let mut idx = 0;
    for i in 0..16 {
        if vga_gain_at(i) <= gain {
            idx = i;
        }
    }
    idx as u8
}

#[derive(Debug, Clone)]
pub struct R82xxConfig {
    pub i2c_addr: u8,
    pub chip: R82xxChip,
    pub xtal: u32,
    /// VCO current bracket for reg 0x12 bits [7:5], stored inverted
    /// (programmed is 7-value); 0xff selects the chip defaults.
    pub vco_curr_min: u8,
    pub vco_curr_max: u8,
    pub vco_algo: u8,
    /// Nth-harmonic reception above the fundamental ceiling; < 2 disables.
    pub harmonic: u32,
    pub use_predetect: bool,
}

impl R82xxConfig {
    pub fn new(chip: R82xxChip) -> Self {
        R82xxConfig {
            i2c_addr: match chip {
                R82xxChip::R820T => R820T_I2C_ADDR,
                R82xxChip::R828D => R828D_I2C_ADDR,
            },
            chip,
            xtal: 0,
            vco_curr_min: 0xff,
            vco_curr_max: 0xff,
            vco_algo: 0,
            harmonic: 0,
            use_predetect: false,
        }
    }
}

#[derive(Debug)]
pub struct R82xx {
    cfg: R82xxConfig,
    regs: [u8; NUM_SHADOW_REGS],
    override_data: [u8; NUM_SHADOW_REGS],
    override_mask: [u8; NUM_SHADOW_REGS],
    xtal_cap_sel: XtalCapValue,
    pll_khz: u64,
    tuner_pll_set: bool,
    int_freq: u32,
    if_band_center_freq: i32,
    fil_cal_code: u8,
    input: u8,
    has_lock: bool,
    tuner_harmonic: u32,
    init_done: bool,
    sideband: bool,
    disable_dither: bool,
    last_lna_value: u8,
    last_mixer_value: u8,
    last_vga_value: u8,
    last_if_mode: i32,
}

impl R82xx {
    pub fn new(cfg: R82xxConfig) -> R82xx {
        R82xx {
            cfg,
            regs: REG_INIT,
            override_data: [0; NUM_SHADOW_REGS],
            override_mask: [0; NUM_SHADOW_REGS],
            xtal_cap_sel: XtalCapValue::XtalHighCap0p,
            pll_khz: 0,
            tuner_pll_set: false,
            int_freq: 0,
            if_band_center_freq: 0,
            fil_cal_code: 0,
            input: 0,
            has_lock: false,
            tuner_harmonic: 1,
            init_done: false,
            sideband: false,
            disable_dither: false,
            last_lna_value: 0,
            last_mixer_value: 0,
            last_vga_value: 0x08,
            last_if_mode: 0,
        }
    }

    /*
     * I2C shadow-register logic
     */

    /// Read register data from the local cache; registers below the shadow
    /// window are not cached.
    fn read_cache_reg(&self, reg: usize) -> Result<u8> {
        if !(REG_SHADOW_START..NUM_REGS).contains(&reg) {
            return Err(RtlsdrErr(format!("register {:#02x} outside shadow window", reg)));
        }
        Ok(self.regs[reg - REG_SHADOW_START])
    }

    fn reg_cache_store(&mut self, reg: usize, val: &[u8]) {
        let r = reg - REG_SHADOW_START;
        self.regs[r..r + val.len()].copy_from_slice(val);
    }

    /// Write a register run, caching in the shadow bank first so that a
    /// nested cache read observes the intended value, then applying the
    /// override bank to every transmitted byte.
    fn write_regs(&mut self, handle: &Device, reg: usize, val: &[u8]) -> Result<()> {
        if reg < REG_SHADOW_START || reg + val.len() > NUM_REGS {
            return Err(RtlsdrErr(format!(
                "register write {:#02x}+{} outside shadow window",
                reg,
                val.len()
            )));
        }
        self.reg_cache_store(reg, val);

        let mut len = val.len();
        let mut pos = 0;
        let mut reg_index = reg;
        loop {
            let size = len.min(MAX_I2C_MSG_LEN - 1);
            let mut buf: Vec<u8> = Vec::with_capacity(size + 1);
            buf.push(reg_index as u8);
            buf.extend_from_slice(&val[pos..pos + size]);

            for k in 0..size {
                let shadow_idx = reg_index - REG_SHADOW_START + k;
                let mask = self.override_mask[shadow_idx];
                if mask != 0 {
                    let old = buf[1 + k];
                    buf[1 + k] = (old & !mask) | (self.override_data[shadow_idx] & mask);
                    debug!(
                        "override on register {:#02x}: {:#02x} -> {:#02x} (mask {:#02x})",
                        shadow_idx + REG_SHADOW_START,
                        old,
                        buf[1 + k],
                        mask
                    );
                }
            }

            handle.i2c_write(self.cfg.i2c_addr as u16, &buf)?;
            pos += size;
            reg_index += size;
            len -= size;
            if len == 0 {
                break;
            }
        }
        Ok(())
    }

    fn write_reg(&mut self, handle: &Device, reg: usize, val: u8) -> Result<()> {
        self.write_regs(handle, reg, &[val])
    }

    /// Read-modify-write against the shadow cache.
    fn write_reg_mask(&mut self, handle: &Device, reg: usize, val: u8, bit_mask: u8) -> Result<()> {
        let rc = self.read_cache_reg(reg)?;
        let applied = (rc & !bit_mask) | (val & bit_mask);
        self.write_regs(handle, reg, &[applied])
    }

    // (r82xx_read) status registers come back bit-reversed
    fn read_reg(&self, handle: &Device, reg: u8, buf: &mut [u8], len: u8) -> Result<()> {
        handle.i2c_write(self.cfg.i2c_addr as u16, &[reg])?;
        handle.i2c_read(self.cfg.i2c_addr as u16, buf, len)?;
        for b in buf.iter_mut() {
            *b = bit_reverse(*b);
        }
        Ok(())
    }

    /*
     * Tuning logic
     */

    fn set_mux(&mut self, handle: &Device, freq: u32) -> Result<()> {
        // last record whose start freq is at or below the target
        let freq_mhz = freq / 1_000_000;
        let range = {
            let mut r: &FreqRange = &FREQ_RANGES[0];
            for range in FREQ_RANGES.iter() {
                if freq_mhz < range.freq {
                    break;
                }
                r = range;
            }
            r
        };

        // Open Drain
        self.write_reg_mask(handle, 0x17, range.open_d, 0x08)?;

        // RF_MUX, Polymux
        self.write_reg_mask(handle, 0x1a, range.rf_mux_ploy, 0xc3)?;

        // TF band
        self.write_reg(handle, 0x1b, range.tf_c)?;

        // XTAL CAP & Drive
        let val = match self.xtal_cap_sel {
            XtalCapValue::XtalLowCap30p | XtalCapValue::XtalLowCap20p => range.xtal_cap20p | 0x08,
            XtalCapValue::XtalLowCap10p => range.xtal_cap10p | 0x08,
            XtalCapValue::XtalHighCap0p => range.xtal_cap0p | 0x00,
            XtalCapValue::XtalLowCap0p => range.xtal_cap0p | 0x08,
        };
        self.write_reg_mask(handle, 0x10, val, 0x0b)?;
        self.write_reg_mask(handle, 0x08, 0x00, 0x3f)?;
        self.write_reg_mask(handle, 0x09, 0x00, 0x3f)?;
        Ok(())
    }

    fn vco_current_initial(&self) -> u8 {
        if self.cfg.vco_curr_min != 0xff {
            (self.cfg.vco_curr_min & 0x07) << 5
        } else {
            0x80
        }
    }

    fn vco_current_retry(&self) -> u8 {
        if self.cfg.vco_curr_max != 0xff {
            (self.cfg.vco_curr_max & 0x07) << 5
        } else {
            0x60
        }
    }

    fn set_pll(&mut self, handle: &Device, freq: u32) -> Result<()> {
        let freq_khz = (freq as u64 + 500) / 1000;
        let pll_ref = self.cfg.xtal;

        // unchanged LO with a locked PLL needs no reprogramming
        if self.tuner_pll_set && self.has_lock && self.pll_khz == freq_khz {
            return Ok(());
        }

        let refdiv2 = 0;
        self.write_reg_mask(handle, 0x10, refdiv2, 0x10)?;

        // set pll autotune = 128kHz
        self.write_reg_mask(handle, 0x1a, 0x00, 0x0c)?;

        // set VCO current to the bracket's starting value
        #[cfg(feature = "rtl_sdr_blog")]
        self.write_reg_mask(handle, 0x12, 0x06, 0xff)?;
        #[cfg(not(feature = "rtl_sdr_blog"))]
        self.write_reg_mask(handle, 0x12, self.vco_current_initial(), 0xe0)?;

        let vco_max_khz = if self.cfg.vco_algo == 1 {
            3_900_000
        } else {
            2 * 1_770_000
        };
        let (_mix_div, mut div_num, nint, sdm) = pll_params(pll_ref, freq, vco_max_khz)
            .ok_or_else(|| RtlsdrErr(format!("no mixer divider for {} Hz", freq)))?;

        let mut data: [u8; 5] = [0; 5];
        self.read_reg(handle, 0x00, &mut data, 5)?;
        let vco_power_ref: u8 = match self.cfg.chip {
            R82xxChip::R828D => 1,
            R82xxChip::R820T => 2,
        };
        let vco_fine_tune = (data[4] & 0x30) >> 4;
        if vco_fine_tune > vco_power_ref {
            div_num -= 1;
        } else if vco_fine_tune < vco_power_ref {
            div_num += 1;
        }
        self.write_reg_mask(handle, 0x10, div_num << 5, 0xe0)?;

        if nint > (128 / vco_power_ref as u64) - 1 {
            return Err(RtlsdrErr(format!("[R82xx] No valid PLL values for {} Hz!", freq)));
        }
        let nint = nint as u8;

        // Nint = 4 * Ni2c + Si2c + 13
        let ni = nint.wrapping_sub(13) / 4;
        let si = nint.wrapping_sub(4 * ni).wrapping_sub(13);
        self.write_reg(handle, 0x14, ni | (si << 6))?;

        // pw_sdm: power the sigma-delta down on integer-N, or when
        // dithering was disabled explicitly
        if sdm == 0 || self.disable_dither {
            self.write_reg_mask(handle, 0x12, 0x08, 0x08)?;
        } else {
            self.write_reg_mask(handle, 0x12, 0x00, 0x08)?;
        }

        self.write_reg(handle, 0x16, (sdm >> 8) as u8)?;
        self.write_reg(handle, 0x15, (sdm & 0xff) as u8)?;

        for i in 0..2 {
            // check if PLL has locked
            self.read_reg(handle, 0x00, &mut data[..3], 3)?;
            if data[2] & 0x40 != 0 {
                break;
            }
            if i == 0 {
                // didn't lock, increase VCO current
                #[cfg(feature = "rtl_sdr_blog")]
                self.write_reg_mask(handle, 0x12, 0x06, 0xff)?;
                #[cfg(not(feature = "rtl_sdr_blog"))]
                self.write_reg_mask(handle, 0x12, self.vco_current_retry(), 0xe0)?;
            }
        }

        if data[2] & 0x40 == 0 {
            warn!("[R82xx] PLL not locked at {} Hz!", freq);
            self.has_lock = false;
            self.tuner_pll_set = false;
            return Ok(());
        }
        self.has_lock = true;
        self.tuner_pll_set = true;
        self.pll_khz = freq_khz;

        // set pll autotune = 8kHz
        self.write_reg_mask(handle, 0x1a, 0x08, 0x08)
    }

    fn sysfreq_sel(
        &mut self,
        handle: &Device,
        freq: u32,
        tuner_type: TunerType,
        delivery_system: DeliverySystem,
    ) -> Result<()> {
        let mixer_top;
        let lna_top;
        let cp_cur;
        #[allow(unused_mut)]
        let mut div_buf_cur;
        let lna_vth_l;
        let mixer_vth_l;
        let air_cable1_in;
        let cable2_in;
        let pre_dect;
        let lna_discharge;
        let filter_cur;

        match delivery_system {
            DeliverySystem::SysDvbt => {
                if (freq == 506000000) || (freq == 666000000) || (freq == 818000000) {
                    mixer_top = 0x14; /* mixer top:14 , top-1, low-discharge */
                    lna_top = 0xe5; /* detect bw 3, lna top:4, predet top:2 */
                    cp_cur = 0x28; /* 101, 0.2 */
                    div_buf_cur = 0x20; /* 10, 200u */
                } else {
                    mixer_top = 0x24; /* mixer top:13 , top-1, low-discharge */
                    lna_top = 0xe5;
                    cp_cur = 0x38; /* 111, auto */
                    div_buf_cur = 0x30; /* 11, 150u */
                }
                lna_vth_l = 0x53; /* lna vth 0.84	,  vtl 0.64 */
                mixer_vth_l = 0x75; /* mixer vth 1.04, vtl 0.84 */
                air_cable1_in = 0x00;
                cable2_in = 0x00;
                pre_dect = 0x40;
                lna_discharge = 14;
                filter_cur = 0x40; /* 10, low */
            }
            DeliverySystem::SysDvbt2 | DeliverySystem::SysIsdbt | DeliverySystem::SysUndefined => {
                mixer_top = 0x24;
                lna_top = 0xe5;
                lna_vth_l = match delivery_system {
                    DeliverySystem::SysIsdbt => 0x75,
                    _ => 0x53,
                };
                mixer_vth_l = 0x75;
                air_cable1_in = 0x00;
                cable2_in = 0x00;
                pre_dect = 0x40;
                lna_discharge = 14;
                cp_cur = 0x38;
                div_buf_cur = 0x30;
                filter_cur = 0x40;
            }
        }
        if self.cfg.use_predetect {
            self.write_reg_mask(handle, 0x06, pre_dect, 0x40)?;
        }
        self.write_reg_mask(handle, 0x1d, lna_top, 0xc7)?;
        self.write_reg_mask(handle, 0x1c, mixer_top, 0xf8)?;
        self.write_reg(handle, 0x0d, lna_vth_l)?;
        self.write_reg(handle, 0x0e, mixer_vth_l)?;

        self.input = air_cable1_in;

        // Air-IN only for Astrometa
        self.write_reg_mask(handle, 0x05, air_cable1_in, 0x60)?;
        self.write_reg_mask(handle, 0x06, cable2_in, 0x08)?;
        self.write_reg_mask(handle, 0x11, cp_cur, 0x38)?;

        // RTLSDRBLOG: improve L-band performance with PLL dropout at 2.0v
        #[cfg(feature = "rtl_sdr_blog")]
        {
            div_buf_cur = 0xa0;
        }

        self.write_reg_mask(handle, 0x17, div_buf_cur, 0x30)?;
        self.write_reg_mask(handle, 0x0a, filter_cur, 0x60)?;

        if !matches!(tuner_type, TunerType::TunerAnalogTv) {
            // LNA TOP: lowest
            self.write_reg_mask(handle, 0x1d, 0, 0x38)?;
            // 0: normal mode
            self.write_reg_mask(handle, 0x1c, 0, 0x04)?;
            // 0: PRE_DECT off
            self.write_reg_mask(handle, 0x06, 0, 0x40)?;
            // agc clk 250hz
            self.write_reg_mask(handle, 0x1a, 0x30, 0x30)?;

            // write LNA TOP = 3
            self.write_reg_mask(handle, 0x1d, 0x18, 0x38)?;

            /*
             * write discharge mode
             * FIXME: IMHO, the mask here is wrong, but it matches
             * what's there at the original driver
             */
            self.write_reg_mask(handle, 0x1c, mixer_top, 0x04)?;
            // LNA discharge current
            self.write_reg_mask(handle, 0x1e, lna_discharge, 0x1f)?;
            // agc clk 60hz
            self.write_reg_mask(handle, 0x1a, 0x20, 0x30)?;
        } else {
            // PRE_DECT off
            self.write_reg_mask(handle, 0x06, 0, 0x40)?;
            // write LNA TOP
            self.write_reg_mask(handle, 0x1d, lna_top, 0x38)?;
            self.write_reg_mask(handle, 0x1c, mixer_top, 0x04)?;
            self.write_reg_mask(handle, 0x1e, lna_discharge, 0x1f)?;
            // agc clk 1Khz, external det1 cap 1u
            self.write_reg_mask(handle, 0x1a, 0x00, 0x30)?;
            self.write_reg_mask(handle, 0x10, 0x00, 0x04)?;
        }
        Ok(())
    }

    fn set_tv_standard(&mut self, handle: &Device, _bw: u32, tuner_type: TunerType) -> Result<()> {
        /* BW < 6 MHz */
        let filt_cal_lo: u32 = 56000; /* 52000->56000 */
        let if_khz: u32 = 3570;
        let filt_gain = 0x10; /* +3db, 6mhz on */
        let img_r = 0x00; /* image negative */
        let filt_q = 0x10; /* r10[4]:low q(1'b1) */
        let hp_cor = 0x6b; /* 1.7m disable, +2cap, 1.0mhz */
        let ext_enable = 0x60; /* r30[6]=1 ext enable; r30[5]:1 ext at lna max-1 */
        let loop_through = 0x01; /* r5[7], lt off */
        let lt_att = 0x00; /* r31[7], lt att enable */
        let flt_ext_widest = 0x00; /* r15[7]: flt_ext_wide off */
        let polyfil_cur = 0x60; /* r25[6:5]:min */

        // initialize the shadow registers
        self.regs.copy_from_slice(&REG_INIT);

        // Init Flag & Xtal_check Result (inits VGA gain, needed?)
        self.write_reg_mask(handle, 0x0c, 0x00, 0x0f)?;

        // version
        self.write_reg_mask(handle, 0x13, VER_NUM, 0x3f)?;

        // for LT Gain test
        if !matches!(tuner_type, TunerType::TunerAnalogTv) {
            self.write_reg_mask(handle, 0x1d, 0x00, 0x38)?;
        }
        self.if_band_center_freq = 0;
        self.int_freq = if_khz * 1000;

        /* two calibration attempts; a code of 0 or 0x0f means the
         * calibration failed and is retried, persistent 0x0f is coerced
         * to 0 (narrowest) */
        for _ in 0..2 {
            // set filt_cap
            self.write_reg_mask(handle, 0x0b, hp_cor, 0x60)?;
            // set cali clk = on
            self.write_reg_mask(handle, 0x0f, 0x04, 0x04)?;
            // X'tal cap 0pF for PLL
            self.write_reg_mask(handle, 0x10, 0x00, 0x03)?;

            self.set_pll(handle, filt_cal_lo * 1000)?;
            if !self.has_lock {
                return Ok(());
            }

            // start trigger
            self.write_reg_mask(handle, 0x0b, 0x10, 0x10)?;
            // stop trigger
            self.write_reg_mask(handle, 0x0b, 0x00, 0x10)?;
            // set cali clk = off
            self.write_reg_mask(handle, 0x0f, 0x00, 0x04)?;

            // check if calibration worked
            let mut data: [u8; 5] = [0; 5];
            self.read_reg(handle, 0x00, &mut data, 5)?;
            self.fil_cal_code = data[4] & 0x0f;
            if self.fil_cal_code != 0 && self.fil_cal_code != 0x0f {
                break;
            }
        }
        // narrowest
        if self.fil_cal_code == 0x0f {
            self.fil_cal_code = 0;
        }

        self.write_reg_mask(handle, 0x0a, filt_q | self.fil_cal_code, 0x1f)?;

        // set BW, filter gain and HP corner
        self.write_reg_mask(handle, 0x0b, hp_cor, 0xef)?;

        // set Img_R
        self.write_reg_mask(handle, 0x07, img_r, 0x80)?;

        // set filt_3dB, V6MHz
        self.write_reg_mask(handle, 0x06, filt_gain, 0x30)?;

        // channel filter extension
        self.write_reg_mask(handle, 0x1e, ext_enable, 0x60)?;

        // loop through
        self.write_reg_mask(handle, 0x05, loop_through, 0x80)?;

        // loop through attenuation
        self.write_reg_mask(handle, 0x1f, lt_att, 0x80)?;

        // filter extension widest
        self.write_reg_mask(handle, 0x0f, flt_ext_widest, 0x80)?;

        // RF poly filter current
        self.write_reg_mask(handle, 0x19, polyfil_cur, 0x60)?;

        Ok(())
    }

    fn apply_env_overrides(&mut self, handle: &Device) -> Result<()> {
        // nibble pins for specific registers, applied through the override
        // bank so they survive all subsequent driver programming
        let pins: [(&str, usize, u8, u8, u8); 11] = [
            ("RTL_R820_R9_76", 0x09, 6, 0x03, 0xc0),
            ("RTL_R820_R10_HI", 0x0a, 4, 0x0f, 0xf0),
            ("RTL_R820_R10_LO", 0x0a, 0, 0x0f, 0x0f),
            ("RTL_R820_R11_HI", 0x0b, 5, 0x07, 0xe0),
            ("RTL_R820_R11_LO", 0x0b, 0, 0x0f, 0x0f),
            ("RTL_R820_R13_HI", 0x0d, 4, 0x0f, 0xf0),
            ("RTL_R820_R13_LO", 0x0d, 0, 0x0f, 0x0f),
            ("RTL_R820_R14_HI", 0x0e, 4, 0x0f, 0xf0),
            ("RTL_R820_R14_LO", 0x0e, 0, 0x0f, 0x0f),
            ("RTL_R820_R30_HI", 0x1e, 4, 0x07, 0x60),
            ("RTL_R820_R30_LO", 0x1e, 0, 0x1f, 0x1f),
        ];
        for (name, reg, shift, limit, mask) in pins {
            let Ok(raw) = std::env::var(name) else {
                continue;
            };
            let Ok(val) = raw.trim().parse::<u8>() else {
                warn!("{}: cannot parse '{}'", name, raw);
                continue;
            };
            if val > limit {
                warn!("{}: value {} out of range 0..{}", name, val, limit);
                continue;
            }
            info!("{}: pinning register {:#02x} bits {:#02x}", name, reg, mask);
            self.apply_i2c_override(handle, reg as u8, (val << shift) as u32, mask)?;
        }
        Ok(())
    }

    fn apply_i2c_override(&mut self, handle: &Device, reg: u8, data: u32, mask: u8) -> Result<()> {
        let reg = reg as usize;
        if !(REG_SHADOW_START..NUM_REGS).contains(&reg) {
            return Err(RtlsdrErr(format!("register {:#02x} outside shadow window", reg)));
        }
        let idx = reg - REG_SHADOW_START;
        if data > 0xff {
            // out-of-range data clears the override for the masked bits
            self.override_mask[idx] &= !mask;
            self.override_data[idx] &= !mask;
        } else {
            self.override_mask[idx] |= mask;
            self.override_data[idx] &= !mask;
            self.override_data[idx] |= mask & data as u8;
        }
        // push the shadow value through the new override
        self.write_reg_mask(handle, reg, 0, 0)
    }
}

impl Tuner for R82xx {
    fn init(&mut self, handle: &Device) -> Result<()> {
        // TODO: R828D might need a xtal capacitor sweep
        self.xtal_cap_sel = XtalCapValue::XtalHighCap0p;
        self.if_band_center_freq = 0;
        self.override_data = [0; NUM_SHADOW_REGS];
        self.override_mask = [0; NUM_SHADOW_REGS];

        // initialize registers
        self.write_regs(handle, REG_SHADOW_START, &REG_INIT)?;

        self.set_tv_standard(handle, 3, TunerType::TunerDigitalTv)?;
        self.sysfreq_sel(handle, 0, TunerType::TunerDigitalTv, DeliverySystem::SysDvbt)?;

        self.apply_env_overrides(handle)?;
        self.init_done = true;
        Ok(())
    }

    fn exit(&mut self, handle: &Device) -> Result<()> {
        // standby script drops all biasing
        if !self.init_done {
            return Ok(());
        }
        self.write_reg(handle, 0x06, 0xb1)?;
        self.write_reg(handle, 0x05, 0xa0)?;
        self.write_reg(handle, 0x07, 0x3a)?;
        self.write_reg(handle, 0x08, 0x40)?;
        self.write_reg(handle, 0x09, 0xc0)?;
        self.write_reg(handle, 0x0a, 0x36)?;
        self.write_reg(handle, 0x0c, 0x35)?;
        self.write_reg(handle, 0x0f, 0x68)?;
        self.write_reg(handle, 0x11, 0x03)?;
        self.write_reg(handle, 0x17, 0xf4)?;
        self.write_reg(handle, 0x19, 0x0c)?;

        // force recalibration on next use
        self.tuner_pll_set = false;
        self.init_done = false;
        Ok(())
    }

    fn get_info(&self) -> TunerInfo {
        match self.cfg.chip {
            R82xxChip::R820T => TUNER_INFO,
            R82xxChip::R828D => TUNER_INFO_R828D,
        }
    }

    fn set_freq(&mut self, handle: &Device, freq: u64) -> Result<()> {
        let harm = if self.cfg.harmonic >= 2 && freq > FUNDAMENTAL_MAX_FREQ {
            self.cfg.harmonic
        } else {
            1
        };
        let lo_freq =
            ((freq as i64 + self.int_freq as i64 + self.if_band_center_freq as i64) as u64
                / harm as u64) as u32;
        debug!("set_freq {} Hz -> lo {} Hz (harmonic {})", freq, lo_freq, harm);

        self.set_mux(handle, lo_freq)?;
        self.set_pll(handle, lo_freq)?;
        self.tuner_harmonic = harm;

        /* switch between 'Cable1' and 'Air-In' inputs on sticks with
         * R828D tuner. We switch at 345 MHz, because that's where the
         * noise-floor has about the same level with identical LNA
         * settings. */
        let air_cable1_in: u8 = if freq > 345_000_000 { 0x00 } else { 0x60 };
        if self.cfg.chip == R82xxChip::R828D && air_cable1_in != self.input {
            self.input = air_cable1_in;
            self.write_reg_mask(handle, 0x05, air_cable1_in, 0x60)?;
        }
        Ok(())
    }

    fn set_bandwidth(&mut self, handle: &Device, bw_in: u32, _rate: u32, apply: bool) -> Result<u32> {
        let bw = bw_in as i32;
        let applied_bw: u32;
        let reg_0a: u8;
        let reg_0b: u8;
        let mut reg_1e: u8 = 0x60; /* default: filter extension under weak signal */

        if bw > 7_000_000 {
            // BW: 8 MHz
            applied_bw = 8_000_000;
            reg_0a = 0x10;
            reg_0b = 0x0b;
            if apply {
                self.int_freq = 4_570_000;
            }
        } else if bw > 6_000_000 {
            // BW: 7 MHz
            applied_bw = 7_000_000;
            reg_0a = 0x10;
            reg_0b = 0x2a;
            if apply {
                self.int_freq = 4_570_000;
            }
        } else if bw > 4_500_000 {
            // BW: 6 MHz
            applied_bw = 6_000_000;
            reg_0a = 0x10;
            reg_0b = 0x6b;
            if apply {
                self.int_freq = 3_570_000;
            }
        } else {
            let row = &IF_TABLE[pick_bw_row(bw)];
            reg_0a = row.reg10_lo;
            reg_0b = row.reg11;
            reg_1e = row.reg30_hi;
            applied_bw = (row.bw_khz * 1000) as u32;
            if apply {
                self.int_freq = ((row.fif_khz + row.fc_khz) * 1000) as u32;
            }
        }

        if !apply {
            return Ok(applied_bw);
        }

        self.write_reg_mask(handle, 0x0a, reg_0a, 0x0f)?;
        /* undocumented bit 7 of register 0x0b selects the hi-part filter
         * bandwidth, so keep it out of the mask */
        self.write_reg_mask(handle, 0x0b, reg_0b, 0xef)?;
        self.write_reg_mask(handle, 0x1e, reg_1e, 0x60)?;
        Ok(applied_bw)
    }

    fn set_bandwidth_center(&mut self, _handle: &Device, if_band_center: i32) -> Result<()> {
        self.if_band_center_freq = if_band_center;
        Ok(())
    }

    fn set_gain(&mut self, handle: &Device, gain: TunerGain) -> Result<bool> {
        match gain {
            TunerGain::Auto => {
                // LNA auto on = AGC
                self.write_reg_mask(handle, 0x05, 0, 0x10)?;
                // Mixer auto on = AGC
                self.write_reg_mask(handle, 0x07, 0x10, 0x10)?;
                // VGA auto: the demod's IF-AGC feedback loop takes over
                self.write_reg_mask(handle, 0x0c, 0x1b, 0x9f)?;
                Ok(true)
            }
            TunerGain::Manual(gain) => {
                let (lna_index, mix_index) = get_gain_index(gain);
                let mut data: [u8; 4] = [0; 4];

                // LNA auto off == manual
                self.write_reg_mask(handle, 0x05, 0x10, 0x10)?;
                // Mixer auto off == manual
                self.write_reg_mask(handle, 0x07, 0, 0x10)?;

                self.read_reg(handle, 0x00, &mut data, 4)?;

                // set LNA gain
                self.write_reg_mask(handle, 0x05, lna_index, 0x0f)?;
                self.last_lna_value = lna_index;

                // set mixer gain
                self.write_reg_mask(handle, 0x07, mix_index, 0x0f)?;
                self.last_mixer_value = mix_index;

                // fixed VGA: 16.3 dB == -12 dB + 8 * 3.5 dB
                self.write_reg_mask(handle, 0x0c, 0x08, 0x9f)?;
                self.last_vga_value = 0x08;
                Ok(false)
            }
        }
    }

    fn set_gain_ext(&mut self, handle: &Device, lna: u8, mixer: u8, vga: u8) -> Result<bool> {
        // LNA manual
        self.write_reg_mask(handle, 0x05, 0x10, 0x10)?;
        // Mixer manual
        self.write_reg_mask(handle, 0x07, 0, 0x10)?;

        self.write_reg_mask(handle, 0x05, lna & 0x0f, 0x0f)?;
        self.last_lna_value = lna & 0x0f;
        self.write_reg_mask(handle, 0x07, mixer & 0x0f, 0x0f)?;
        self.last_mixer_value = mixer & 0x0f;

        // index 16 (bit 4) hands the VGA to the demod's feedback loop
        self.write_reg_mask(handle, 0x0c, vga & 0x1f, 0x9f)?;
        self.last_vga_value = vga & 0x0f;
        Ok(vga & 0x10 != 0)
    }

    fn set_if_mode(&mut self, handle: &Device, if_mode: i32) -> Result<bool> {
        let (vga, rtl_vga_control) = match if_mode {
            0 => ((self.last_vga_value | 0x10), true),
            10000..=10015 => ((if_mode - 10000) as u8, false),
            10016..=10031 => (((if_mode - 10016) as u8) | 0x10, true),
            _ => {
                let gain = if (2500..=7500).contains(&if_mode) {
                    if_mode - 5000
                } else {
                    if_mode
                };
                if !(-2500..=2500).contains(&gain) {
                    return Err(RtlsdrError::InvalidArgument(format!(
                        "tuner IF mode {} out of range",
                        if_mode
                    )));
                }
                (vga_index_for_gain(gain), false)
            }
        };
        self.write_reg_mask(handle, 0x0c, vga, 0x9f)?;
        self.last_vga_value = vga & 0x0f;
        self.last_if_mode = if_mode;
        Ok(rtl_vga_control)
    }

    fn set_i2c_register(&mut self, handle: &Device, reg: u8, data: u8, mask: u8) -> Result<()> {
        self.write_reg_mask(handle, reg as usize, data, mask)
    }

    fn set_i2c_override(&mut self, handle: &Device, reg: u8, data: u32, mask: u8) -> Result<()> {
        info!(
            "override register {:#02x}: data {:#03x} mask {:#02x}",
            reg, data, mask
        );
        self.apply_i2c_override(handle, reg, data, mask)
    }

    fn get_i2c_register(&self, reg: usize) -> Result<u8> {
        self.read_cache_reg(reg)
    }

    fn get_i2c_register_dump(&self, handle: &Device, buf: &mut [u8]) -> Result<()> {
        let len = buf.len().min(NUM_REGS) as u8;
        self.read_reg(handle, 0x00, buf, len)
    }

    fn set_sideband(&mut self, handle: &Device, sideband: bool) -> Result<()> {
        self.sideband = sideband;
        // mixer image selection
        self.write_reg_mask(handle, 0x07, if sideband { 0x80 } else { 0x00 }, 0x80)
    }

    fn get_sideband(&self) -> bool {
        self.sideband
    }

    fn flip_rtl_sideband(&self) -> bool {
        // mixing at the Nth LO harmonic reverses the quadrature sequence
        // when N = 4k+3, which mirrors the spectrum at the demod
        (self.tuner_harmonic & 3) == 3
    }

    fn set_dithering(&mut self, handle: &Device, dither: bool) -> Result<()> {
        self.disable_dither = !dither;
        let val = if self.disable_dither { 0x08 } else { 0x00 };
        self.write_reg_mask(handle, 0x12, val, 0x08)
    }

    fn set_harmonic(&mut self, harmonic: u32) -> Result<()> {
        if harmonic > 16 {
            return Err(RtlsdrError::InvalidArgument(format!(
                "harmonic {} out of range 0..16",
                harmonic
            )));
        }
        self.cfg.harmonic = harmonic;
        Ok(())
    }

    fn set_vco_settings(
        &mut self,
        curr_min: Option<u8>,
        curr_max: Option<u8>,
        algo: Option<u8>,
    ) -> Result<()> {
        if let Some(min) = curr_min {
            self.cfg.vco_curr_min = min;
        }
        if let Some(max) = curr_max {
            self.cfg.vco_curr_max = max;
        }
        if let Some(algo) = algo {
            if algo > 2 {
                return Err(RtlsdrError::InvalidArgument(format!(
                    "VCO algorithm {} out of range 0..2",
                    algo
                )));
            }
            if algo == 2 {
                warn!("VCO algorithm 2 falls back to the default current stepping");
            }
            self.cfg.vco_algo = algo;
        }
        Ok(())
    }

    fn is_pll_locked(&mut self, handle: &Device) -> Result<bool> {
        let mut data: [u8; 3] = [0; 3];
        self.read_reg(handle, 0x00, &mut data, 3)?;
        self.has_lock = data[2] & 0x40 != 0;
        Ok(self.has_lock)
    }

    fn pll_locked(&self) -> bool {
        self.has_lock
    }

    fn get_if_freq(&self) -> u32 {
        self.int_freq
    }

    fn get_gains(&self) -> &'static [i32] {
        &GAINS
    }

    fn get_gain(&self, handle: &Device) -> Result<i32> {
        let mut data: [u8; 4] = [0; 4];
        self.read_reg(handle, 0x00, &mut data, 4)?;
        let gain = ((data[3] & 0x0f) << 1) + ((data[3] & 0xf0) >> 4);
        Ok(gain as i32)
    }

    fn get_xtal_freq(&self) -> u32 {
        self.cfg.xtal
    }

    fn set_xtal_freq(&mut self, freq: u32) -> Result<()> {
        self.cfg.xtal = freq;
        Ok(())
    }
}

fn bit_reverse(byte: u8) -> u8 {
    const LUT: [u8; 16] = [
        0x0, 0x8, 0x4, 0xc, 0x2, 0xa, 0x6, 0xe, 0x1, 0x9, 0x5, 0xd, 0x3, 0xb, 0x7, 0xf,
    ];
    (LUT[(byte & 0xf) as usize] << 4) | LUT[(byte >> 4) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bw_request_between_families_selects_centered_row() {
        // 300 kHz sits between the 290 and 375 kHz families
        let row = &IF_TABLE[pick_bw_row(300_000)];
        assert_eq!(row.sharp, SharpCorner::Both);
        assert_eq!(row.bw_khz, 290);
        assert_eq!(row.reg10_lo, 0x0f);
        assert_eq!(row.reg11, 0xe7);
        assert_eq!(row.reg30_hi, 0x00);
        assert_eq!((row.fif_khz + row.fc_khz) * 1000, 1_925_000);
    }

    #[test]
    fn bw_asym_keys_select_sharp_corner_rows() {
        let lsb = &IF_TABLE[pick_bw_row(291_000)];
        assert_eq!(lsb.sharp, SharpCorner::Lsb);
        assert_eq!(lsb.fif_khz, ifa(290));

        let usb = &IF_TABLE[pick_bw_row(292_000)];
        assert_eq!(usb.sharp, SharpCorner::Usb);
        assert_eq!(usb.fif_khz, ifb(290));
    }

    #[test]
    fn bw_narrow_request_selects_first_row() {
        assert_eq!(pick_bw_row(150_000), 0);
    }

    #[test]
    fn bw_widest_request_selects_last_row() {
        let row = &IF_TABLE[pick_bw_row(4_400_000)];
        assert_eq!(row.bw_khz, 1953);
    }

    #[test]
    fn pll_params_integer_n() {
        // 115.2 MHz x 16 = 1.8432 GHz lands exactly on 32 reference cycles
        let (mix_div, div_num, nint, sdm) =
            pll_params(28_800_000, 115_200_000, 3_540_000).unwrap();
        assert_eq!(mix_div, 16);
        assert_eq!(div_num, 3);
        assert_eq!(nint, 32);
        assert_eq!(sdm, 0);
    }

    #[test]
    fn pll_params_fractional_rounds_half_up() {
        // 100 MHz + 3.57 MHz IF: fractional remainder must round half-up
        let (mix_div, _, nint, sdm) = pll_params(28_800_000, 103_570_000, 3_540_000).unwrap();
        assert_eq!(mix_div, 32);
        let vco = 103_570_000u64 * 32;
        let expect = (28_800_000u64 + 65536 * vco) / (2 * 28_800_000u64);
        assert_eq!(nint, expect / 65536);
        assert_eq!(sdm as u64, expect % 65536);
    }

    #[test]
    fn pll_params_out_of_range() {
        assert!(pll_params(28_800_000, 4_000_000_000, 3_540_000).is_none());
    }

    #[test]
    fn gain_index_walk_alternates_lna_and_mixer() {
        assert_eq!(get_gain_index(0), (0, 0));
        // 29.7 dB: eight LNA and eight mixer steps
        assert_eq!(get_gain_index(297), (8, 8));
        // past the table end both indexes saturate
        let (lna, mix) = get_gain_index(1000);
        assert!(lna == 15 && mix >= 14);
    }

    #[test]
    fn vga_gain_monotonic_bracket() {
        assert_eq!(vga_gain_at(0), VGA_BASE_GAIN);
        assert!(vga_gain_at(15) > 400);
        assert_eq!(vga_index_for_gain(-2500), 0);
        assert_eq!(vga_index_for_gain(2500), 15);
        // a mid value picks the largest index not exceeding the request
        let idx = vga_index_for_gain(163) as usize;
        assert!(vga_gain_at(idx) <= 163);
        assert!(idx == 15 || vga_gain_at(idx + 1) > 163);
    }

    #[test]
    fn bit_reverse_nibbles() {
        assert_eq!(bit_reverse(0x01), 0x80);
        assert_eq!(bit_reverse(0xf0), 0x0f);
        assert_eq!(bit_reverse(0xa5), 0xa5);
    }

    mod wire {
        use super::super::*;
        use crate::device::{Device, MockDeviceHandle};
        use std::sync::{Arc, Mutex};

        fn recording_device() -> (Device, Arc<Mutex<Vec<Vec<u8>>>>) {
            let writes: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
            let mut mock = MockDeviceHandle::new();
            let sink = Arc::clone(&writes);
            mock.expect_write_control()
                .returning(move |_, _, _, _, data, _| {
                    sink.lock().unwrap().push(data.to_vec());
                    Ok(data.len())
                });
            (Device::with_mock(mock), writes)
        }

        #[test]
        fn override_applies_to_transmitted_bytes_only() {
            let (device, writes) = recording_device();
            let mut tuner = R82xx::new(R82xxConfig::new(R82xxChip::R820T));

            // pin the top nibble of register 0x0a to 0x3
            tuner.set_i2c_override(&device, 0x0a, 0x30, 0xf0).unwrap();
            // shadow value 0xd6 goes out with the pinned nibble
            assert_eq!(writes.lock().unwrap()[0], vec![0x0a, 0x36]);

            tuner.set_i2c_register(&device, 0x0a, 0xaa, 0xff).unwrap();
            assert_eq!(writes.lock().unwrap()[1], vec![0x0a, 0x3a]);
            // the shadow keeps the pre-override value
            assert_eq!(tuner.get_i2c_register(0x0a).unwrap(), 0xaa);

            // data > 0xff clears the override; writes pass unmodified again
            tuner.set_i2c_override(&device, 0x0a, 0x100, 0xf0).unwrap();
            assert_eq!(writes.lock().unwrap()[2], vec![0x0a, 0xaa]);
        }

        #[test]
        fn shadow_tracks_masked_writes() {
            let (device, writes) = recording_device();
            let mut tuner = R82xx::new(R82xxConfig::new(R82xxChip::R820T));

            // initial shadow of register 0x05 is 0x83
            tuner.write_reg_mask(&device, 0x05, 0x0f, 0x0f).unwrap();
            assert_eq!(tuner.read_cache_reg(0x05).unwrap(), 0x8f);
            tuner.write_reg_mask(&device, 0x05, 0x10, 0x10).unwrap();
            assert_eq!(tuner.read_cache_reg(0x05).unwrap(), 0x9f);

            let writes = writes.lock().unwrap();
            assert_eq!(writes[0], vec![0x05, 0x8f]);
            assert_eq!(writes[1], vec![0x05, 0x9f]);
        }

        #[test]
        fn long_register_runs_are_chunked_for_i2c() {
            let (device, writes) = recording_device();
            let mut tuner = R82xx::new(R82xxConfig::new(R82xxChip::R820T));

            tuner.write_regs(&device, 0x05, &REG_INIT).unwrap();

            let writes = writes.lock().unwrap();
            // 27 bytes in chunks of at most 7 payload bytes, each chunk
            // prefixed with its starting register
            assert_eq!(writes.len(), 4);
            assert_eq!(writes[0][0], 0x05);
            assert_eq!(writes[0].len(), 8);
            assert_eq!(writes[1][0], 0x0c);
            assert_eq!(writes[2][0], 0x13);
            assert_eq!(writes[3][0], 0x1a);
            assert_eq!(writes[3].len(), 7);
            assert_eq!(&writes[0][1..], &REG_INIT[0..7]);
        }

        #[test]
        fn bandwidth_apply_programs_filter_registers() {
            let (device, writes) = recording_device();
            let mut tuner = R82xx::new(R82xxConfig::new(R82xxChip::R820T));

            let applied = tuner.set_bandwidth(&device, 300_000, 2_048_000, true).unwrap();
            assert_eq!(applied, 290_000);
            assert_eq!(tuner.get_if_freq(), 1_925_000);

            let writes = writes.lock().unwrap();
            // low nibble of 0x0a, 0x0b without bit 4, 0x1e extension bits
            assert_eq!(writes[0], vec![0x0a, 0xdf]);
            assert_eq!(writes[1], vec![0x0b, 0xe7]);
            assert_eq!(writes[2], vec![0x1e, 0x0a]);
        }

        #[test]
        fn wide_bandwidth_rows_move_the_if() {
            let (device, _) = recording_device();
            let mut tuner = R82xx::new(R82xxConfig::new(R82xxChip::R820T));

            assert_eq!(
                tuner.set_bandwidth(&device, 8_000_000, 2_048_000, true).unwrap(),
                8_000_000
            );
            assert_eq!(tuner.get_if_freq(), 4_570_000);

            assert_eq!(
                tuner.set_bandwidth(&device, 5_000_000, 2_048_000, true).unwrap(),
                6_000_000
            );
            assert_eq!(tuner.get_if_freq(), 3_570_000);

            // query mode reports without changing the programmed IF
            assert_eq!(
                tuner.set_bandwidth(&device, 300_000, 2_048_000, false).unwrap(),
                290_000
            );
            assert_eq!(tuner.get_if_freq(), 3_570_000);
        }

        #[test]
        fn register_below_shadow_window_is_rejected() {
            let (device, _) = recording_device();
            let mut tuner = R82xx::new(R82xxConfig::new(R82xxChip::R820T));
            assert!(tuner.write_reg(&device, 0x03, 0x00).is_err());
            assert!(tuner.read_cache_reg(0x03).is_err());
        }
    }
}
