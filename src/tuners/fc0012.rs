//! Fitipower FC0012 tuner driver.

use super::{Tuner, TunerId, TunerInfo};
use crate::device::Device;
use crate::error::Result;
use crate::error::RtlsdrError::RtlsdrErr;
use crate::TunerGain;
use log::debug;

pub const FC0012_I2C_ADDR: u8 = 0xc6;
const FC0012_CHECK_ADDR: u8 = 0x00;
const FC0012_CHECK_VAL: u8 = 0xa1;

pub const TUNER_INFO: TunerInfo = TunerInfo {
    id: TunerId::Fc0012,
    name: "Fitipower FC0012",
    i2c_addr: FC0012_I2C_ADDR,
    check_addr: FC0012_CHECK_ADDR,
    check_val: FC0012_CHECK_VAL,
};

pub const GAINS: [i32; 5] = [-99, -40, 71, 179, 192];
const GAIN_CODES: [u8; 5] = [0x02, 0x00, 0x08, 0x17, 0x10];

const INIT_REGS: [u8; 22] = [
    0x00, /* dummy reg. 0 */
    0x05, /* reg. 0x01 */
    0x10, /* reg. 0x02 */
    0x00, /* reg. 0x03 */
    0x00, /* reg. 0x04 */
    0x0f, /* reg. 0x05: may also be 0x0a */
    0x00, /* reg. 0x06: divider 2, VCO slow */
    0x00, /* reg. 0x07: may also be 0x0f */
    0xff, /* reg. 0x08: AGC clock divide by 256, AGC gain 1/256, loop bw 1/8 */
    0x6e, /* reg. 0x09: disable loop through */
    0xb8, /* reg. 0x0a: disable LO test buffer */
    0x82, /* reg. 0x0b: output clock is same as clock frequency */
    0xfc, /* reg. 0x0c: depending on AGC up-down mode, may need 0xf8 */
    0x02, /* reg. 0x0d: AGC not forcing & LNA forcing, 0x02 for DVB-T */
    0x00, /* reg. 0x0e */
    0x00, /* reg. 0x0f */
    0x00, /* reg. 0x10: may also be 0x0d */
    0x00, /* reg. 0x11 */
    0x1f, /* reg. 0x12: set to maximum gain */
    0x08, /* reg. 0x13: middle gain: 0x08, low gain: 0x00, high gain: 0x10 */
    0x00, /* reg. 0x14 */
    0x04, /* reg. 0x15: enable LNA COMPS */
];

/// VCO divider selection: below the listed RF frequency, multiply the LO by
/// `mult` and program the listed divider codes into regs 0x05/0x06.
struct VcoRange {
    freq: u32,
    mult: u32,
    reg5: u8,
    reg6: u8,
}

const VCO_RANGES: [VcoRange; 10] = [
    VcoRange { freq: 37_084_000, mult: 96, reg5: 0x82, reg6: 0x00 },
    VcoRange { freq: 55_625_000, mult: 64, reg5: 0x82, reg6: 0x02 },
    VcoRange { freq: 74_167_000, mult: 48, reg5: 0x42, reg6: 0x00 },
    VcoRange { freq: 111_250_000, mult: 32, reg5: 0x42, reg6: 0x02 },
    VcoRange { freq: 148_334_000, mult: 24, reg5: 0x22, reg6: 0x00 },
    VcoRange { freq: 222_500_000, mult: 16, reg5: 0x22, reg6: 0x02 },
    VcoRange { freq: 296_667_000, mult: 12, reg5: 0x12, reg6: 0x00 },
    VcoRange { freq: 445_000_000, mult: 8, reg5: 0x12, reg6: 0x02 },
    VcoRange { freq: 593_334_000, mult: 6, reg5: 0x0a, reg6: 0x00 },
    VcoRange { freq: u32::MAX, mult: 4, reg5: 0x0a, reg6: 0x02 },
];

#[derive(Debug)]
pub struct Fc0012 {
    xtal: u32,
}

impl Fc0012 {
    pub fn new() -> Self {
        Fc0012 { xtal: 0 }
    }

    fn write_reg(&self, handle: &Device, reg: u8, val: u8) -> Result<()> {
        handle.i2c_write_reg(FC0012_I2C_ADDR, reg, val)?;
        Ok(())
    }

    fn read_reg(&self, handle: &Device, reg: u8) -> Result<u8> {
        handle.i2c_read_reg(FC0012_I2C_ADDR, reg)
    }

    fn set_params(&mut self, handle: &Device, freq: u32, bandwidth: u32) -> Result<()> {
        let xtal_khz_2 = self.xtal / 2000; // half reference, in kHz

        let range = VCO_RANGES.iter().find(|r| freq < r.freq).unwrap();
        let reg5 = range.reg5;
        let mut reg6 = range.reg6;

        let f_vco = (freq as u64) * range.mult as u64 / 1000; // kHz
        let vco_select = f_vco >= 3_060_000;
        if vco_select {
            reg6 |= 0x08;
        }

        // integer part: whole and remainder against half the reference
        let mut xdiv = (f_vco / xtal_khz_2 as u64) as u16;
        if f_vco - xdiv as u64 * xtal_khz_2 as u64 >= (xtal_khz_2 / 2) as u64 {
            xdiv += 1;
        }
        let mut pm = (xdiv / 8) as u8;
        let mut am = (xdiv - pm as u16 * 8) as u8;
        if am < 2 {
            am += 8;
            pm -= 1;
        }
        if pm > 31 {
            return Err(RtlsdrErr(format!("FC0012: PLL out of range for {} Hz", freq)));
        }

        // 16-bit sigma-delta fraction of the half reference
        let fraction = f_vco % xtal_khz_2 as u64;
        let xin = ((fraction * 65536) / xtal_khz_2 as u64) as u16;

        debug!(
            "FC0012 tune {} Hz: mult {} pm {} am {} xin {}",
            freq, range.mult, pm, am, xin
        );

        self.write_reg(handle, 0x01, am)?;
        self.write_reg(handle, 0x02, pm)?;
        self.write_reg(handle, 0x03, (xin >> 8) as u8)?;
        self.write_reg(handle, 0x04, (xin & 0xff) as u8)?;

        // bandwidth in reg 0x06 bits [7:6]: 6/7/8 MHz
        reg6 |= match bandwidth {
            0..=6_000_000 => 0x80,
            6_000_001..=7_000_000 => 0x40,
            _ => 0x00,
        };
        self.write_reg(handle, 0x05, reg5)?;
        self.write_reg(handle, 0x06, reg6)?;

        // VCO calibration pulse
        self.write_reg(handle, 0x0e, 0x80)?;
        self.write_reg(handle, 0x0e, 0x00)?;

        // read out the VCO band and retry on the other VCO if marginal
        self.write_reg(handle, 0x0e, 0x00)?;
        let vco_cal = self.read_reg(handle, 0x0e)? & 0x3f;
        if vco_select && vco_cal > 0x3c {
            reg6 &= !0x08;
            self.write_reg(handle, 0x06, reg6)?;
            self.write_reg(handle, 0x0e, 0x80)?;
            self.write_reg(handle, 0x0e, 0x00)?;
        } else if !vco_select && vco_cal < 0x02 {
            reg6 |= 0x08;
            self.write_reg(handle, 0x06, reg6)?;
            self.write_reg(handle, 0x0e, 0x80)?;
            self.write_reg(handle, 0x0e, 0x00)?;
        }
        Ok(())
    }
}

impl Tuner for Fc0012 {
    fn init(&mut self, handle: &Device) -> Result<()> {
        for (reg, val) in INIT_REGS.iter().enumerate().skip(1) {
            self.write_reg(handle, reg as u8, *val)?;
        }
        Ok(())
    }

    fn exit(&mut self, _handle: &Device) -> Result<()> {
        Ok(())
    }

    fn get_info(&self) -> TunerInfo {
        TUNER_INFO
    }

    fn set_freq(&mut self, handle: &Device, freq: u64) -> Result<()> {
        self.set_params(handle, freq as u32, 6_000_000)
    }

    fn set_bandwidth(&mut self, _handle: &Device, bw: u32, _rate: u32, _apply: bool) -> Result<u32> {
        Ok(bw)
    }

    fn set_gain(&mut self, handle: &Device, gain: TunerGain) -> Result<bool> {
        match gain {
            TunerGain::Auto => Ok(false),
            TunerGain::Manual(gain) => {
                let mut code = GAIN_CODES[0];
                for (g, c) in GAINS.iter().zip(GAIN_CODES.iter()) {
                    if *g <= gain {
                        code = *c;
                    }
                }
                let old = self.read_reg(handle, 0x13)?;
                self.write_reg(handle, 0x13, (old & 0xe0) | code)?;
                Ok(false)
            }
        }
    }

    fn set_i2c_register(&mut self, handle: &Device, reg: u8, data: u8, _mask: u8) -> Result<()> {
        self.write_reg(handle, reg, data)
    }

    fn get_i2c_register(&self, _reg: usize) -> Result<u8> {
        Err(RtlsdrErr("FC0012 registers are write-only over this path".to_string()))
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
