//! FCI FC2580 tuner driver.
//!
//! Wideband tuner with per-band VCO multipliers; it runs from its own
//! 16.384 MHz crystal instead of the RTL2832's reference.

use super::{Tuner, TunerId, TunerInfo};
use crate::device::Device;
use crate::error::Result;
use crate::error::RtlsdrError::RtlsdrErr;
use crate::TunerGain;
use log::debug;

pub const FC2580_I2C_ADDR: u8 = 0xac;
const FC2580_CHECK_ADDR: u8 = 0x01;
const FC2580_CHECK_VAL: u8 = 0x56;

pub const FC2580_XTAL_FREQ: u32 = 16_384_000;

pub const TUNER_INFO: TunerInfo = TunerInfo {
    id: TunerId::Fc2580,
    name: "FCI FC2580",
    i2c_addr: FC2580_I2C_ADDR,
    check_addr: FC2580_CHECK_ADDR,
    check_val: FC2580_CHECK_VAL,
};

// no gain control exposed
pub const GAINS: [i32; 1] = [0];

const INIT_REGS: [(u8, u8); 17] = [
    (0x00, 0x00), // soft reset
    (0x12, 0x86),
    (0x14, 0x5c),
    (0x16, 0x3c),
    (0x1f, 0xd2),
    (0x09, 0xd7),
    (0x0b, 0xd5),
    (0x0c, 0x32),
    (0x0e, 0x43),
    (0x21, 0x0a),
    (0x22, 0x82),
    (0x45, 0x10), // UHF band clock
    (0x4c, 0x00),
    (0x3f, 0x88),
    (0x02, 0x0e),
    (0x58, 0x14),
    (0x6b, 0x11), // IF filter defaults
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Band {
    Vhf,
    Uhf,
    L,
}

#[derive(Debug)]
pub struct Fc2580 {
    xtal: u32,
    band: Option<Band>,
}

impl Fc2580 {
    pub fn new() -> Self {
        Fc2580 {
            xtal: FC2580_XTAL_FREQ,
            band: None,
        }
    }

    fn write_reg(&self, handle: &Device, reg: u8, val: u8) -> Result<()> {
        handle.i2c_write_reg(FC2580_I2C_ADDR, reg, val)?;
        Ok(())
    }

    fn write_reg_mask(&self, handle: &Device, reg: u8, val: u8, mask: u8) -> Result<()> {
        let old = handle.i2c_read_reg(FC2580_I2C_ADDR, reg)?;
        self.write_reg(handle, reg, (old & !mask) | (val & mask))
    }

    fn select_band(&mut self, handle: &Device, freq: u32) -> Result<Band> {
        let band = if freq < 400_000_000 {
            Band::Vhf
        } else if freq < 1_000_000_000 {
            Band::Uhf
        } else {
            Band::L
        };
        if self.band == Some(band) {
            return Ok(band);
        }
        // RF front-end routing per band
        let (r25, r27, r2b) = match band {
            Band::Vhf => (0x70, 0x77, 0x88),
            Band::Uhf => (0xf0, 0x77, 0x88),
            Band::L => (0xf0, 0x17, 0x08),
        };
        self.write_reg_mask(handle, 0x25, r25, 0xf0)?;
        self.write_reg(handle, 0x27, r27)?;
        self.write_reg(handle, 0x2b, r2b)?;
        self.band = Some(band);
        Ok(band)
    }
}

impl Tuner for Fc2580 {
    fn init(&mut self, handle: &Device) -> Result<()> {
        for (reg, val) in INIT_REGS.iter() {
            self.write_reg(handle, *reg, *val)?;
        }
        Ok(())
    }

    fn exit(&mut self, handle: &Device) -> Result<()> {
        // power everything down
        self.write_reg(handle, 0x02, 0x0a)
    }

    fn get_info(&self) -> TunerInfo {
        TUNER_INFO
    }

    fn set_freq(&mut self, handle: &Device, freq: u64) -> Result<()> {
        let freq = freq as u32;
        let band = self.select_band(handle, freq)?;

        // per-band VCO multiplier; the VCO runs at 2.3 .. 4.6 GHz
        let mult: u64 = match band {
            Band::Vhf => 8,
            Band::Uhf => 4,
            Band::L => 2,
        };
        let f_vco = freq as u64 * mult;
        if !(2_300_000_000..=4_600_000_000u64).contains(&f_vco) {
            return Err(RtlsdrErr(format!("FC2580: VCO out of range for {} Hz", freq)));
        }
        // divider select in reg 0x02 bits [2:1]
        let div_code: u8 = match mult {
            8 => 0x04,
            4 => 0x02,
            _ => 0x00,
        };
        self.write_reg_mask(handle, 0x02, div_code, 0x06)?;

        // 20-bit fractional-N against the tuner crystal
        let xtal = self.xtal as u64;
        let nint = f_vco / xtal;
        let frac = ((f_vco % xtal) * (1 << 20)) / xtal;
        debug!("FC2580 tune {} Hz: mult {} nint {} frac {}", freq, mult, nint, frac);

        self.write_reg(handle, 0x18, nint as u8)?;
        self.write_reg(handle, 0x1a, ((frac >> 12) & 0xff) as u8)?;
        self.write_reg(handle, 0x1b, ((frac >> 4) & 0xff) as u8)?;
        self.write_reg_mask(handle, 0x1c, ((frac & 0x0f) << 4) as u8, 0xf0)?;

        // retrigger VCO calibration
        self.write_reg(handle, 0x2e, 0x09)?;
        Ok(())
    }

    fn set_bandwidth(&mut self, handle: &Device, bw: u32, _rate: u32, apply: bool) -> Result<u32> {
        // the IF filter corner is programmed as a divider of the 64 MHz
        // filter clock; clamp to the chip's 1.53 .. 9.03 MHz span
        let bw = bw.clamp(1_530_000, 9_030_000);
        if apply {
            let div = (64_000_000 / (bw / 1000)) as u16; // kHz units
            self.write_reg(handle, 0x36, (div >> 8) as u8)?;
            self.write_reg(handle, 0x37, (div & 0xff) as u8)?;
            self.write_reg(handle, 0x39, 0x00)?;
        }
        Ok(bw)
    }

    fn set_gain(&mut self, _handle: &Device, _gain: TunerGain) -> Result<bool> {
        // gain is fully AGC-controlled on this chip
        Ok(false)
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
