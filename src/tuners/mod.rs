pub mod e4000;
pub mod fc0012;
pub mod fc0013;
pub mod fc2580;
pub mod r82xx;

use crate::device::Device;
use crate::error::Result;
use crate::error::RtlsdrError;
use crate::TunerGain;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerId {
    Unknown,
    E4000,
    Fc0012,
    Fc0013,
    Fc2580,
    R820t,
    R828d,
}

#[derive(Debug, Clone, Copy)]
pub struct TunerInfo {
    pub id: TunerId,
    pub name: &'static str,
    pub i2c_addr: u8,
    pub check_addr: u8,
    pub check_val: u8,
}

/// Uniform operation set dispatched to the chip-specific driver selected at
/// open time. Operations a chip cannot perform default to `NotSupported`.
pub trait Tuner: std::fmt::Debug + Send {
    fn init(&mut self, handle: &Device) -> Result<()>;
    fn exit(&mut self, handle: &Device) -> Result<()>;
    fn get_info(&self) -> TunerInfo;

    fn set_freq(&mut self, handle: &Device, freq: u64) -> Result<()>;

    /// Match `bw` against the chip's filter bank. Returns the applied
    /// bandwidth in Hz; with `apply == false` nothing is programmed.
    fn set_bandwidth(&mut self, handle: &Device, bw: u32, rate: u32, apply: bool) -> Result<u32>;

    fn set_bandwidth_center(&mut self, _handle: &Device, _if_band_center: i32) -> Result<()> {
        Err(RtlsdrError::NotSupported("set_bandwidth_center"))
    }

    /// Program the gain. The returned flag asks the caller to hand VGA
    /// control to the demodulator's IF-AGC feedback loop.
    fn set_gain(&mut self, handle: &Device, gain: TunerGain) -> Result<bool>;

    fn set_gain_ext(
        &mut self,
        _handle: &Device,
        _lna: u8,
        _mixer: u8,
        _vga: u8,
    ) -> Result<bool> {
        Err(RtlsdrError::NotSupported("set_gain_ext"))
    }

    fn set_if_gain(&mut self, _handle: &Device, _stage: i32, _gain: i32) -> Result<()> {
        Err(RtlsdrError::NotSupported("set_if_gain"))
    }

    fn set_if_mode(&mut self, _handle: &Device, _if_mode: i32) -> Result<bool> {
        Err(RtlsdrError::NotSupported("set_if_mode"))
    }

    fn set_i2c_register(&mut self, _handle: &Device, _reg: u8, _data: u8, _mask: u8) -> Result<()> {
        Err(RtlsdrError::NotSupported("set_i2c_register"))
    }

    /// Pin bits of a register across all of the driver's own programming.
    /// `data > 0xff` clears the override for the masked bits.
    fn set_i2c_override(
        &mut self,
        _handle: &Device,
        _reg: u8,
        _data: u32,
        _mask: u8,
    ) -> Result<()> {
        Err(RtlsdrError::NotSupported("set_i2c_override"))
    }

    fn get_i2c_register(&self, _reg: usize) -> Result<u8> {
        Err(RtlsdrError::NotSupported("get_i2c_register"))
    }

    /// Dump the tuner's register window into `buf`.
    fn get_i2c_register_dump(&self, _handle: &Device, _buf: &mut [u8]) -> Result<()> {
        Err(RtlsdrError::NotSupported("get_i2c_register_dump"))
    }

    /// Mixer sideband: false = lower, true = upper.
    fn set_sideband(&mut self, _handle: &Device, _sideband: bool) -> Result<()> {
        Err(RtlsdrError::NotSupported("set_sideband"))
    }

    fn get_sideband(&self) -> bool {
        false
    }

    /// Should the demodulator flip the spectrum in addition to the sideband?
    fn flip_rtl_sideband(&self) -> bool {
        false
    }

    fn set_dithering(&mut self, _handle: &Device, _dither: bool) -> Result<()> {
        Err(RtlsdrError::NotSupported("set_dithering"))
    }

    fn set_harmonic(&mut self, _harmonic: u32) -> Result<()> {
        Err(RtlsdrError::NotSupported("set_harmonic"))
    }

    fn set_vco_settings(
        &mut self,
        _curr_min: Option<u8>,
        _curr_max: Option<u8>,
        _algo: Option<u8>,
    ) -> Result<()> {
        Err(RtlsdrError::NotSupported("set_vco_settings"))
    }

    fn is_pll_locked(&mut self, _handle: &Device) -> Result<bool> {
        Err(RtlsdrError::NotSupported("is_pll_locked"))
    }

    /// Last lock outcome recorded by `set_freq`; chips without a lock
    /// indicator report true.
    fn pll_locked(&self) -> bool {
        true
    }

    /// IF frequency at which the tuner delivers its output to the demod.
    fn get_if_freq(&self) -> u32 {
        0
    }

    /// Discrete gain table in tenths of a dB.
    fn get_gains(&self) -> &'static [i32];

    fn get_gain(&self, _handle: &Device) -> Result<i32> {
        Ok(0)
    }

    fn get_xtal_freq(&self) -> u32;
    fn set_xtal_freq(&mut self, freq: u32) -> Result<()>;
}

/// Placeholder until probing picks the real chip, and the fallback when no
/// supported tuner answers (direct-sampling-only operation).
#[derive(Debug)]
pub struct NoTuner {
    xtal: u32,
}

impl NoTuner {
    pub fn new() -> Self {
        NoTuner { xtal: 0 }
    }
}

const NO_GAINS: [i32; 1] = [0];

impl Tuner for NoTuner {
    fn init(&mut self, _handle: &Device) -> Result<()> {
        Ok(())
    }
    fn exit(&mut self, _handle: &Device) -> Result<()> {
        Ok(())
    }
    fn get_info(&self) -> TunerInfo {
        TunerInfo {
            id: TunerId::Unknown,
            name: "unknown",
            i2c_addr: 0,
            check_addr: 0,
            check_val: 0,
        }
    }
    fn set_freq(&mut self, _handle: &Device, _freq: u64) -> Result<()> {
        Ok(())
    }
    fn set_bandwidth(
        &mut self,
        _handle: &Device,
        bw: u32,
        _rate: u32,
        _apply: bool,
    ) -> Result<u32> {
        Ok(bw)
    }
    fn set_gain(&mut self, _handle: &Device, _gain: TunerGain) -> Result<bool> {
        Ok(false)
    }
    fn get_gains(&self) -> &'static [i32] {
        &NO_GAINS
    }
    fn get_xtal_freq(&self) -> u32 {
        self.xtal
    }
    fn set_xtal_freq(&mut self, freq: u32) -> Result<()> {
        self.xtal = freq;
        Ok(())
    }
}
