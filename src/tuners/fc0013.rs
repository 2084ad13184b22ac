//! Fitipower FC0013 tuner driver.
//!
//! Close sibling of the FC0012 with an integrated VHF tracking filter and a
//! finer LNA gain ladder.

use super::{Tuner, TunerId, TunerInfo};
use crate::device::Device;
use crate::error::Result;
use crate::error::RtlsdrError::RtlsdrErr;
use crate::TunerGain;
use log::debug;

pub const FC0013_I2C_ADDR: u8 = 0xc6;
const FC0013_CHECK_ADDR: u8 = 0x00;
const FC0013_CHECK_VAL: u8 = 0xa3;

pub const TUNER_INFO: TunerInfo = TunerInfo {
    id: TunerId::Fc0013,
    name: "Fitipower FC0013",
    i2c_addr: FC0013_I2C_ADDR,
    check_addr: FC0013_CHECK_ADDR,
    check_val: FC0013_CHECK_VAL,
};

pub const GAINS: [i32; 23] = [
    -99, -73, -65, -63, -60, -58, -54, 58, 61, 63, 65, 67, 68, 70, 71, 179, 181, 182, 184, 186,
    188, 191, 197,
];

// reg 0x14 LNA codes matching GAINS, low 5 bits
const GAIN_CODES: [u8; 23] = [
    0x02, 0x03, 0x05, 0x04, 0x00, 0x01, 0x07, 0x06, 0x0f, 0x0e, 0x0d, 0x0c, 0x0b, 0x0a, 0x09,
    0x08, 0x17, 0x16, 0x15, 0x14, 0x13, 0x12, 0x10,
];

const INIT_REGS: [u8; 22] = [
    0x00, /* dummy reg. 0 */
    0x09, /* reg. 0x01 */
    0x16, /* reg. 0x02 */
    0x00, /* reg. 0x03 */
    0x00, /* reg. 0x04 */
    0x17, /* reg. 0x05 */
    0x02, /* reg. 0x06: LPF bandwidth */
    0x0a, /* reg. 0x07 */
    0xff, /* reg. 0x08: AGC clock divide by 256, AGC gain 1/256, loop bw 1/8 */
    0x6f, /* reg. 0x09: enable loop through */
    0xb8, /* reg. 0x0a: disable LO test buffer */
    0x82, /* reg. 0x0b */
    0xfc, /* reg. 0x0c: depending on AGC up-down mode, may need 0xf8 */
    0x01, /* reg. 0x0d: AGC not forcing & LNA forcing, 0x01 for DVB-T */
    0x00, /* reg. 0x0e */
    0x00, /* reg. 0x0f */
    0x00, /* reg. 0x10 */
    0x00, /* reg. 0x11 */
    0x00, /* reg. 0x12 */
    0x00, /* reg. 0x13 */
    0x50, /* reg. 0x14: DVB-T high gain, UHF; middle gain: 0x48, low: 0x40 */
    0x01, /* reg. 0x15 */
];

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
pub struct Fc0013 {
    xtal: u32,
}

impl Fc0013 {
    pub fn new() -> Self {
        Fc0013 { xtal: 0 }
    }

    fn write_reg(&self, handle: &Device, reg: u8, val: u8) -> Result<()> {
        handle.i2c_write_reg(FC0013_I2C_ADDR, reg, val)?;
        Ok(())
    }

    fn read_reg(&self, handle: &Device, reg: u8) -> Result<u8> {
        handle.i2c_read_reg(FC0013_I2C_ADDR, reg)
    }

    fn set_vhf_track(&self, handle: &Device, freq: u32) -> Result<()> {
        let tmp = self.read_reg(handle, 0x1d)?;
        let track = if freq <= 177_500_000 {
            0x1c // VHF track 7
        } else if freq <= 184_500_000 {
            0x18
        } else if freq <= 191_500_000 {
            0x14
        } else if freq <= 198_500_000 {
            0x10
        } else if freq <= 205_500_000 {
            0x0c
        } else if freq <= 219_500_000 {
            0x08
        } else if freq < 300_000_000 {
            0x04
        } else {
            0x1c // UHF and GPS
        };
        self.write_reg(handle, 0x1d, (tmp & !0x1c) | track)
    }

    fn set_params(&mut self, handle: &Device, freq: u32, bandwidth: u32) -> Result<()> {
        self.set_vhf_track(handle, freq)?;

        if freq < 300_000_000 {
            // enable VHF filter, disable UHF/GPS
            let tmp = self.read_reg(handle, 0x07)?;
            self.write_reg(handle, 0x07, tmp | 0x10)?;
            let tmp = self.read_reg(handle, 0x14)?;
            self.write_reg(handle, 0x14, tmp & !0x60)?;
        } else {
            let tmp = self.read_reg(handle, 0x07)?;
            self.write_reg(handle, 0x07, tmp & !0x10)?;
            let tmp = self.read_reg(handle, 0x14)?;
            self.write_reg(handle, 0x14, (tmp & !0x60) | 0x40)?;
        }

        let xtal_khz_2 = self.xtal / 2000;
        let range = VCO_RANGES.iter().find(|r| freq < r.freq).unwrap();
        let mut reg6 = range.reg6;

        let f_vco = (freq as u64) * range.mult as u64 / 1000; // kHz
        if f_vco >= 3_060_000 {
            reg6 |= 0x08;
        }

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
            return Err(RtlsdrErr(format!("FC0013: PLL out of range for {} Hz", freq)));
        }
        let fraction = f_vco % xtal_khz_2 as u64;
        let xin = ((fraction * 65536) / xtal_khz_2 as u64) as u16;

        debug!("FC0013 tune {} Hz: mult {} pm {} am {} xin {}", freq, range.mult, pm, am, xin);

        self.write_reg(handle, 0x01, am)?;
        self.write_reg(handle, 0x02, pm)?;
        self.write_reg(handle, 0x03, (xin >> 8) as u8)?;
        self.write_reg(handle, 0x04, (xin & 0xff) as u8)?;

        reg6 |= match bandwidth {
            0..=6_000_000 => 0x80,
            6_000_001..=7_000_000 => 0x40,
            _ => 0x00,
        };
        self.write_reg(handle, 0x05, range.reg5)?;
        self.write_reg(handle, 0x06, reg6)?;

        // VCO calibration pulse and band check
        self.write_reg(handle, 0x0e, 0x80)?;
        self.write_reg(handle, 0x0e, 0x00)?;
        self.write_reg(handle, 0x0e, 0x00)?;
        let vco_cal = self.read_reg(handle, 0x0e)? & 0x3f;
        if vco_cal < 0x02 {
            reg6 |= 0x08;
            self.write_reg(handle, 0x06, reg6)?;
            self.write_reg(handle, 0x0e, 0x80)?;
            self.write_reg(handle, 0x0e, 0x00)?;
        }
        Ok(())
    }
}

impl Tuner for Fc0013 {
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
            TunerGain::Auto => {
                // hand gain decisions back to the AGC loop
                let tmp = self.read_reg(handle, 0x0d)?;
                self.write_reg(handle, 0x0d, tmp & !0x08)?;
                Ok(false)
            }
            TunerGain::Manual(gain) => {
                let tmp = self.read_reg(handle, 0x0d)?;
                self.write_reg(handle, 0x0d, tmp | 0x08)?;

                let mut code = GAIN_CODES[0];
                for (g, c) in GAINS.iter().zip(GAIN_CODES.iter()) {
                    if *g <= gain {
                        code = *c;
                    }
                }
                let old = self.read_reg(handle, 0x14)?;
                self.write_reg(handle, 0x14, (old & 0xe0) | code)?;
                Ok(false)
            }
        }
    }

    fn get_i2c_register(&self, _reg: usize) -> Result<u8> {
        Err(RtlsdrErr("FC0013 registers are write-only over this path".to_string()))
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
