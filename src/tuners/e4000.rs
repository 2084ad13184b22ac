//! Elonics E4000 tuner driver.
//!
//! Zero-IF CMOS tuner with a fractional-N PLL: the LO is synthesized from a
//! per-range multiplier and a 16-bit sigma-delta fraction of the reference.

use super::{Tuner, TunerId, TunerInfo};
use crate::device::Device;
use crate::error::Result;
use crate::error::RtlsdrError::RtlsdrErr;
use crate::TunerGain;
use log::debug;

pub const E4K_I2C_ADDR: u8 = 0xc8;
const E4K_CHECK_ADDR: u8 = 0x02;
const E4K_CHECK_VAL: u8 = 0x40;

pub const E4K_FLO_MIN_MHZ: u32 = 50;

pub const TUNER_INFO: TunerInfo = TunerInfo {
    id: TunerId::E4000,
    name: "Elonics E4000",
    i2c_addr: E4K_I2C_ADDR,
    check_addr: E4K_CHECK_ADDR,
    check_val: E4K_CHECK_VAL,
};

// registers
const REG_MASTER1: u8 = 0x00;
const REG_SYNTH1: u8 = 0x07;
const REG_SYNTH3: u8 = 0x09;
const REG_SYNTH4: u8 = 0x0a;
const REG_SYNTH5: u8 = 0x0b;
const REG_FILT1: u8 = 0x10;
const REG_FILT2: u8 = 0x11;
const REG_FILT3: u8 = 0x12;
const REG_GAIN1: u8 = 0x14;
const REG_GAIN2: u8 = 0x15;
const REG_AGC1: u8 = 0x1a;
const REG_AGC7: u8 = 0x20;
const REG_DC1: u8 = 0x29;
const REG_DC5: u8 = 0x2d;
const REG_BIAS: u8 = 0x78;
const REG_CLKOUT_PWDN: u8 = 0x7a;

pub const GAINS: [i32; 14] = [
    -10, 15, 40, 65, 90, 115, 140, 165, 190, 215, 240, 290, 340, 420,
];

/// PLL ranges: below the listed frequency use this 3-bit divider code and
/// LO multiplier.
struct PllRange {
    freq: u32, // Hz, exclusive upper bound
    reg_synth7: u8,
    mult: u32,
}

const PLL_RANGES: [PllRange; 11] = [
    PllRange { freq: 72_400_000, reg_synth7: 0x0f, mult: 48 },
    PllRange { freq: 81_200_000, reg_synth7: 0x0e, mult: 40 },
    PllRange { freq: 108_300_000, reg_synth7: 0x0d, mult: 32 },
    PllRange { freq: 162_500_000, reg_synth7: 0x0c, mult: 24 },
    PllRange { freq: 216_600_000, reg_synth7: 0x0b, mult: 16 },
    PllRange { freq: 325_000_000, reg_synth7: 0x0a, mult: 12 },
    PllRange { freq: 350_000_000, reg_synth7: 0x09, mult: 8 },
    PllRange { freq: 432_000_000, reg_synth7: 0x03, mult: 8 },
    PllRange { freq: 667_000_000, reg_synth7: 0x02, mult: 6 },
    PllRange { freq: 1_200_000_000, reg_synth7: 0x01, mult: 4 },
    PllRange { freq: u32::MAX, reg_synth7: 0x00, mult: 2 },
];

/// IF channel-filter corner table, kHz, indexed by the 5-bit filter code.
const IF_CHAN_FILTER_KHZ: [u32; 32] = [
    5500, 5300, 5000, 4800, 4600, 4400, 4300, 4100, 3900, 3800, 3700, 3600, 3400, 3300, 3200, 3100,
    3000, 2950, 2900, 2800, 2750, 2700, 2600, 2550, 2500, 2450, 2400, 2300, 2280, 2240, 2200, 2150,
];

/// LNA gain codes: (tenth dB, register value).
const LNA_GAIN_TABLE: [(i32, u8); 13] = [
    (-50, 0x00),
    (-25, 0x01),
    (0, 0x02),
    (25, 0x03),
    (50, 0x04),
    (75, 0x05),
    (100, 0x06),
    (125, 0x07),
    (150, 0x08),
    (175, 0x09),
    (200, 0x0a),
    (250, 0x0c),
    (300, 0x0e),
];

#[derive(Debug)]
pub struct E4000 {
    xtal: u32,
}

impl E4000 {
    pub fn new() -> Self {
        E4000 { xtal: 0 }
    }

    fn write_reg(&self, handle: &Device, reg: u8, val: u8) -> Result<()> {
        handle.i2c_write_reg(E4K_I2C_ADDR, reg, val)?;
        Ok(())
    }

    fn write_reg_mask(&self, handle: &Device, reg: u8, val: u8, mask: u8) -> Result<()> {
        let old = handle.i2c_read_reg(E4K_I2C_ADDR, reg)?;
        self.write_reg(handle, reg, (old & !mask) | (val & mask))
    }

    fn set_band(&self, handle: &Device, freq: u32) -> Result<()> {
        // band select in SYNTH1[2:1]: VHF2 / VHF3 / UHF / L
        let (band, bias) = if freq < 140_000_000 {
            (0, 3)
        } else if freq < 350_000_000 {
            (1, 3)
        } else if freq < 1_135_000_000 {
            (2, 3)
        } else {
            (3, 0)
        };
        self.write_reg(handle, REG_BIAS, bias)?;
        self.write_reg_mask(handle, REG_SYNTH1, band << 1, 0x06)
    }

    fn set_pll(&mut self, handle: &Device, freq: u32) -> Result<()> {
        let fosc = self.xtal;
        let range = PLL_RANGES
            .iter()
            .find(|r| freq < r.freq)
            .ok_or_else(|| RtlsdrErr(format!("no PLL range for {} Hz", freq)))?;

        let fvco = freq as u64 * range.mult as u64;
        let z = (fvco / fosc as u64) as u8;
        let x = ((fvco % fosc as u64) * 65536 / fosc as u64) as u16;
        debug!("E4000 PLL: fvco {} z {} x {}", fvco, z, x);

        self.write_reg(handle, REG_SYNTH3, z)?;
        self.write_reg(handle, REG_SYNTH4, (x & 0xff) as u8)?;
        self.write_reg(handle, REG_SYNTH5, (x >> 8) as u8)?;
        // 3-bit R divider code
        self.write_reg_mask(handle, REG_SYNTH1, range.reg_synth7 << 4, 0xf0)
    }

    fn if_filter_bw_set(&self, handle: &Device, bw: u32) -> Result<()> {
        // pick the narrowest channel filter still wider than bw
        let bw_khz = bw / 1000;
        let mut code = 0u8;
        for (i, corner) in IF_CHAN_FILTER_KHZ.iter().enumerate() {
            if *corner >= bw_khz {
                code = i as u8;
            } else {
                break;
            }
        }
        self.write_reg_mask(handle, REG_FILT3, code, 0x1f)?;
        // RC and mixer filters track the channel filter corner
        self.write_reg_mask(handle, REG_FILT1, code >> 1, 0x0f)?;
        self.write_reg_mask(handle, REG_FILT2, (code >> 2) << 4, 0xf0)
    }
}

impl Tuner for E4000 {
    fn init(&mut self, handle: &Device) -> Result<()> {
        // master reset, then normal operation with the detector powered
        self.write_reg(handle, REG_MASTER1, 0x01)?;
        self.write_reg(handle, REG_MASTER1, 0x07)?;

        // disable the clock output early, it pollutes the spectrum
        self.write_reg(handle, REG_CLKOUT_PWDN, 0x96)?;

        // DC offset control: on, LUT update on gain change
        self.write_reg(handle, REG_DC1, 0x01)?;
        self.write_reg(handle, REG_DC5, 0x1f)?;

        // manual gain defaults, mixer gain 4 dB
        self.write_reg(handle, REG_GAIN1, 0x10)?;
        self.write_reg(handle, REG_GAIN2, 0x00)?;

        // AGC defaults: everything manual, detector enabled
        self.write_reg(handle, REG_AGC1, 0x00)?;
        self.write_reg(handle, REG_AGC7, 0x0a)?;
        Ok(())
    }

    fn exit(&mut self, handle: &Device) -> Result<()> {
        // standby keeps the register file alive
        self.write_reg(handle, REG_MASTER1, 0x00)
    }

    fn get_info(&self) -> TunerInfo {
        TUNER_INFO
    }

    fn set_freq(&mut self, handle: &Device, freq: u64) -> Result<()> {
        let freq = freq as u32;
        self.set_band(handle, freq)?;
        self.set_pll(handle, freq)
    }

    fn set_bandwidth(&mut self, handle: &Device, bw: u32, _rate: u32, apply: bool) -> Result<u32> {
        if apply {
            self.if_filter_bw_set(handle, bw)?;
        }
        Ok(bw)
    }

    fn set_gain(&mut self, handle: &Device, gain: TunerGain) -> Result<bool> {
        match gain {
            TunerGain::Auto => {
                // LNA and mixer AGC on
                self.write_reg_mask(handle, REG_AGC1, 0x0f, 0x0f)?;
                self.write_reg_mask(handle, REG_AGC7, 0x01, 0x01)?;
                Ok(false)
            }
            TunerGain::Manual(gain) => {
                self.write_reg_mask(handle, REG_AGC1, 0x00, 0x0f)?;
                self.write_reg_mask(handle, REG_AGC7, 0x00, 0x01)?;

                // the mixer contributes 12 dB on strong requests, 4 dB else
                let mixgain = if gain > 340 { 12 } else { 4 };
                self.write_reg_mask(handle, REG_GAIN2, if mixgain == 12 { 0x01 } else { 0x00 }, 0x01)?;

                let lna_target = (gain - mixgain * 10).min(300);
                let mut code = LNA_GAIN_TABLE[0].1;
                for (g, c) in LNA_GAIN_TABLE.iter() {
                    if *g <= lna_target {
                        code = *c;
                    }
                }
                self.write_reg_mask(handle, REG_GAIN1, code, 0x0f)?;
                Ok(false)
            }
        }
    }

    fn set_if_gain(&mut self, handle: &Device, stage: i32, gain: i32) -> Result<()> {
        // six IF stages packed two registers after GAIN2; each field is
        // 2 or 3 bits wide in steps of roughly 3 dB
        if !(1..=6).contains(&stage) {
            return Err(RtlsdrErr(format!("E4000 IF stage {} out of range", stage)));
        }
        let steps = (gain / 30).clamp(0, 7) as u8;
        let (reg, shift, mask): (u8, u8, u8) = match stage {
            1 => (0x16, 0, 0x01),
            2 => (0x16, 1, 0x06),
            3 => (0x16, 3, 0x18),
            4 => (0x16, 5, 0x20),
            5 => (0x17, 0, 0x07),
            _ => (0x17, 3, 0x38),
        };
        self.write_reg_mask(handle, reg, steps << shift, mask)
    }

    fn get_gains(&self) -> &'static [i32] {
        &GAINS
    }

    fn get_xtal_freq(&self) -> u32 {
        self.xtal
    }

    fn set_xtal_freq(&mut self, freq: u32) -> Result<()> {
        self.xtal = freq;
        Ok(())
    }
}
