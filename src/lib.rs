// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver library for RTL2832U-based USB SDR dongles.
//!
//! The demodulator's digital front end and the analog tuner chip (selected
//! by probing at open time) are programmed over USB vendor control
//! transfers; raw 8-bit I/Q samples arrive over the bulk endpoint, either
//! one blocking read at a time ([`RtlSdr::read_sync`]) or through the
//! callback-driven streaming engine ([`RtlSdr::read_async`]).

mod device;
mod error;
mod options;
mod rtlsdr;
mod softagc;
mod stream;
mod tuners;
mod udp_server;

use std::sync::Arc;

use device::Device;
use rtlsdr::DevInner;

pub use error::{EepromError, Result, RtlsdrError};
pub use options::get_opt_help;
pub use softagc::SoftAgcMode;
pub use stream::{AsyncStatus, DEFAULT_BUF_LENGTH, DEFAULT_BUF_NUMBER};
pub use tuners::{TunerId, TunerInfo};

/// Tuner gain selection, in tenths of a dB for the manual case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerGain {
    Auto,
    Manual(i32),
}

/// Direct sampling state: feed one ADC input directly, bypassing the tuner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectSampleMode {
    Off,
    /// I-branch input.
    On,
    /// Q-branch input (I and Q ADC swapped).
    OnSwap,
}

/// Direct-sampling policy applied on every retune.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DsMode {
    /// Quadrature reception through the tuner.
    Iq,
    /// Always direct-sample the I input.
    I,
    /// Always direct-sample the Q input.
    Q,
    /// Direct-sample the I input below the threshold frequency.
    IBelow,
    /// Direct-sample the Q input below the threshold frequency.
    QBelow,
}

impl DsMode {
    pub fn from_u32(v: u32) -> DsMode {
        match v {
            1 => DsMode::I,
            2 => DsMode::Q,
            3 => DsMode::IBelow,
            4 => DsMode::QBelow,
            _ => DsMode::Iq,
        }
    }
}

/// What to do with externally visible state when the handle closes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseFlags {
    /// Power down the bias tee. The default leaves it alone so a powered
    /// antenna keeps running across process restarts.
    pub deactivate_bias_tee: bool,
}

/// List all supported dongles currently attached, as
/// `(vendor_id, product_id, name)`.
pub fn list_devices() -> Result<Vec<(u16, u16, &'static str)>> {
    Device::list_devices()
}

/// USB string descriptors `(manufacturer, product, serial)` of the
/// `index`-th supported dongle, without opening it for streaming.
pub fn get_device_usb_strings(
    index: usize,
) -> Result<(Option<String>, Option<String>, Option<String>)> {
    device::device_handle::DeviceHandle::device_usb_strings(index)
}

/// Find the device index whose serial string matches `serial`.
pub fn get_index_by_serial(serial: &str) -> Result<usize> {
    let count = list_devices()?.len();
    for i in 0..count {
        if let Ok((_, _, Some(s))) = get_device_usb_strings(i) {
            if s == serial {
                return Ok(i);
            }
        }
    }
    Err(RtlsdrError::NoDevice)
}

/// An open RTL2832U dongle.
#[derive(Debug)]
pub struct RtlSdr {
    inner: Arc<DevInner>,
}

impl RtlSdr {
    /// Open the `index`-th supported dongle and initialize demodulator and
    /// tuner.
    pub fn open(index: usize) -> Result<RtlSdr> {
        let inner = DevInner::open(index)?;
        Ok(RtlSdr { inner })
    }

    pub fn close(self) {
        // Drop performs the shutdown
    }

    pub fn close_with(self, flags: CloseFlags) {
        self.inner.shutdown(flags);
    }

    pub fn get_tuner_type(&self) -> TunerId {
        self.inner.ctl().tuner_type
    }

    pub fn get_usb_strings(&self) -> Result<(Option<String>, Option<String>, Option<String>)> {
        self.inner.device.usb_strings()
    }

    /*
     * Frequency control
     */

    pub fn set_center_freq(&self, freq: u32) -> Result<()> {
        self.set_center_freq64(freq as u64)
    }

    pub fn set_center_freq64(&self, freq: u64) -> Result<()> {
        self.inner.ctl().set_center_freq64(freq)
    }

    pub fn get_center_freq(&self) -> u32 {
        self.inner.ctl().get_center_freq64() as u32
    }

    pub fn get_center_freq64(&self) -> u64 {
        self.inner.ctl().get_center_freq64()
    }

    /// Frequency correction in parts per million.
    pub fn set_freq_correction(&self, ppm: i32) -> Result<()> {
        self.inner.ctl().set_freq_correction(ppm)
    }

    pub fn get_freq_correction(&self) -> i32 {
        self.inner.ctl().get_freq_correction()
    }

    pub fn set_xtal_freq(&self, rtl_freq: u32, tuner_freq: u32) -> Result<()> {
        self.inner.ctl().set_xtal_freq(rtl_freq, tuner_freq)
    }

    /// Returns the ppm-corrected `(rtl, tuner)` crystal frequencies.
    pub fn get_xtal_freq(&self) -> (u32, u32) {
        self.inner.ctl().get_xtal_freq()
    }

    /// True while the R82xx PLL reports lock; `set_center_freq` stays
    /// usable after an unlock, so a later retune may succeed.
    pub fn is_tuner_pll_locked(&self) -> Result<bool> {
        self.inner.ctl().is_tuner_pll_locked()
    }

    /*
     * Sample rate and sampling paths
     */

    /// Program the resampler. The achieved rate differs slightly from the
    /// request and is what [`RtlSdr::get_sample_rate`] reports afterwards.
    pub fn set_sample_rate(&self, rate: u32) -> Result<()> {
        self.inner.set_sample_rate(rate)
    }

    pub fn get_sample_rate(&self) -> u32 {
        self.inner.ctl().get_sample_rate()
    }

    /// ADC test mode: an 8-bit counter replaces the samples.
    pub fn set_testmode(&self, on: bool) -> Result<()> {
        self.inner.ctl().set_testmode(on)
    }

    /// The RTL2832's digital AGC, applied after the ADC.
    pub fn set_agc_mode(&self, on: bool) -> Result<()> {
        self.inner.ctl().set_agc_mode(on)
    }

    pub fn set_direct_sampling(&self, mode: DirectSampleMode) -> Result<()> {
        let on = match mode {
            DirectSampleMode::Off => 0,
            DirectSampleMode::On => 1,
            DirectSampleMode::OnSwap => 2,
        };
        self.inner.ctl().set_direct_sampling(on)
    }

    pub fn get_direct_sampling(&self) -> DirectSampleMode {
        match self.inner.ctl().get_direct_sampling() {
            1 => DirectSampleMode::On,
            2 => DirectSampleMode::OnSwap,
            _ => DirectSampleMode::Off,
        }
    }

    /// Select a direct-sampling policy; with the threshold modes the driver
    /// switches in and out of direct sampling on every retune. A threshold
    /// of 0 picks the tuner-specific default.
    pub fn set_ds_mode(&self, mode: DsMode, freq_threshold: u32) -> Result<()> {
        self.inner.ctl().set_ds_mode(mode, freq_threshold)
    }

    /// Shift the zero-IF away from DC on tuners that idle there (not for
    /// R82xx, which runs a low IF already).
    pub fn set_offset_tuning(&self, on: bool) -> Result<()> {
        self.inner.ctl().set_offset_tuning(on)
    }

    pub fn get_offset_tuning(&self) -> bool {
        self.inner.ctl().get_offset_tuning()
    }

    /*
     * Gain control
     */

    /// Discrete gain values supported by the tuner, in tenths of a dB.
    pub fn get_tuner_gains(&self) -> Vec<i32> {
        self.inner.ctl().tuner.get_gains().to_vec()
    }

    pub fn set_tuner_gain(&self, gain: TunerGain) -> Result<()> {
        self.inner.ctl().set_tuner_gain(gain)
    }

    pub fn get_tuner_gain(&self) -> Result<i32> {
        self.inner.ctl().get_tuner_gain()
    }

    /// Manual (true) or tuner-AGC (false) gain mode. While soft AGC is
    /// configured the mode is forced to manual.
    pub fn set_tuner_gain_mode(&self, manual: bool) -> Result<()> {
        self.inner.set_tuner_gain_mode(manual)
    }

    /// Per-stage IF gain for tuners with an IF gain ladder (E4000).
    pub fn set_tuner_if_gain(&self, stage: i32, gain: i32) -> Result<()> {
        self.inner.set_tuner_if_gain(stage, gain)
    }

    /// R82xx only: LNA, mixer and VGA indexes 0..15; VGA index 16 hands the
    /// VGA to the demodulator's feedback loop.
    pub fn set_tuner_gain_ext(&self, lna: u8, mixer: u8, vga: u8) -> Result<()> {
        self.inner.ctl().set_tuner_gain_ext(lna, mixer, vga)
    }

    /// R82xx VGA policy, see the `ifm=` option for the encoding.
    pub fn set_tuner_if_mode(&self, if_mode: i32) -> Result<()> {
        self.inner.ctl().set_tuner_if_mode(if_mode)
    }

    /*
     * Bandpass control
     */

    /// Select the tuner bandpass; 0 derives the bandwidth from the sample
    /// rate.
    pub fn set_tuner_bandwidth(&self, bw: u32) -> Result<()> {
        self.inner.set_tuner_bandwidth(bw).map(|_| ())
    }

    /// Like [`RtlSdr::set_tuner_bandwidth`] but reports the realized
    /// bandwidth; with `apply == false` only queries the table.
    pub fn set_and_get_tuner_bandwidth(&self, bw: u32, apply: bool) -> Result<u32> {
        if apply {
            self.inner.set_tuner_bandwidth(bw)
        } else {
            self.inner.ctl().set_and_get_tuner_bandwidth(bw, false)
        }
    }

    /// Position the band center relative to the complex-baseband zero
    /// frequency.
    pub fn set_tuner_band_center(&self, if_band_center: i32) -> Result<()> {
        self.inner.ctl().set_tuner_band_center(if_band_center)
    }

    /// Mixer sideband: false = lower, true = upper.
    pub fn set_tuner_sideband(&self, sideband: bool) -> Result<()> {
        self.inner.ctl().set_tuner_sideband(sideband)
    }

    /*
     * Expert register access
     */

    pub fn set_tuner_i2c_register(&self, reg: u8, mask: u8, data: u8) -> Result<()> {
        self.inner.ctl().set_tuner_i2c_register(reg, mask, data)
    }

    /// Pin bits of a tuner register across all driver programming;
    /// `data > 0xff` clears the override.
    pub fn set_tuner_i2c_override(&self, reg: u8, mask: u8, data: u32) -> Result<()> {
        self.inner.ctl().set_tuner_i2c_override(reg, mask, data)
    }

    /// Read a tuner register from the shadow cache (no bus round-trip).
    pub fn get_tuner_i2c_register(&self, reg: u8) -> Result<u8> {
        self.inner.ctl().get_tuner_i2c_register(reg as usize)
    }

    /// Dump the tuner's register window from the chip itself.
    pub fn get_tuner_i2c_register_dump(&self, buf: &mut [u8]) -> Result<()> {
        self.inner.ctl().get_tuner_i2c_register_dump(buf)
    }

    /// R820T sigma-delta dithering; disable for coherent receivers.
    pub fn set_dithering(&self, dither: bool) -> Result<()> {
        self.inner.ctl().set_dithering(dither)
    }

    /// R820T Nth-harmonic reception for frequencies above the fundamental
    /// tuning ceiling.
    pub fn set_harmonic_rx(&self, harmonic: u32) -> Result<()> {
        self.inner.ctl().set_harmonic_rx(harmonic)
    }

    /*
     * GPIO and bias tee
     */

    pub fn set_bias_tee(&self, on: bool) -> Result<()> {
        self.inner.set_bias_tee(on)
    }

    pub fn set_bias_tee_gpio(&self, gpio: u8, on: bool) -> Result<()> {
        self.inner.set_bias_tee_gpio(gpio, on)
    }

    pub fn set_gpio_output(&self, gpio: u8) -> Result<()> {
        check_gpio(gpio)?;
        self.inner.ctl().set_gpio_output(gpio)
    }

    pub fn set_gpio_input(&self, gpio: u8) -> Result<()> {
        check_gpio(gpio)?;
        self.inner.ctl().set_gpio_input(gpio)
    }

    pub fn set_gpio_bit(&self, gpio: u8, val: bool) -> Result<()> {
        check_gpio(gpio)?;
        self.inner.ctl().set_gpio_bit(gpio, val)
    }

    pub fn get_gpio_bit(&self, gpio: u8) -> Result<bool> {
        check_gpio(gpio)?;
        self.inner.ctl().get_gpio_bit(gpio)
    }

    pub fn get_gpio_byte(&self) -> Result<u8> {
        self.inner.ctl().get_gpio_byte()
    }

    pub fn set_gpio_byte(&self, val: u8) -> Result<()> {
        self.inner.ctl().set_gpio_byte(val)
    }

    pub fn get_gpio_status(&self) -> Result<u8> {
        self.inner.ctl().get_gpio_status()
    }

    /*
     * EEPROM
     */

    pub fn read_eeprom(&self, data: &mut [u8], offset: u8, len: usize) -> Result<usize> {
        self.inner.device.read_eeprom(data, offset, len)
    }

    pub fn write_eeprom(&self, data: &[u8], offset: u8, len: usize) -> Result<usize> {
        self.inner.device.write_eeprom(data, offset, len)
    }

    /*
     * Streaming
     */

    /// Reset the bulk endpoint; mandatory once before the first read.
    pub fn reset_buffer(&self) -> Result<()> {
        self.inner.ctl().reset_buffer()
    }

    /// One blocking bulk transfer; returns the number of bytes read.
    pub fn read_sync(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read_sync(buf)
    }

    /// Stream samples into `cb` until [`RtlSdr::cancel_async`] is called.
    /// `buf_num`/`buf_len` of 0 select the defaults (15 buffers of 256 KiB;
    /// the length must be a multiple of 512). The callback runs on the
    /// calling thread and may itself call `cancel_async`.
    pub fn read_async<F>(&self, buf_num: u32, buf_len: u32, mut cb: F) -> Result<()>
    where
        F: FnMut(&[u8]),
    {
        self.inner.read_async(&mut cb, buf_num, buf_len)
    }

    /// Stream with default buffering.
    pub fn wait_async<F>(&self, cb: F) -> Result<()>
    where
        F: FnMut(&[u8]),
    {
        self.read_async(0, 0, cb)
    }

    /// Request cooperative cancellation of an active [`RtlSdr::read_async`].
    pub fn cancel_async(&self) -> Result<()> {
        self.inner.cancel_async()
    }

    pub fn async_status(&self) -> AsyncStatus {
        self.inner.async_status()
    }

    /*
     * Options
     */

    /// Apply a colon-separated option string, e.g. `"bc=30000:agc=0"`.
    pub fn set_opt_string(&self, opts: &str, verbose: bool) -> Result<()> {
        options::set_opt_string(&self.inner, opts, verbose)
    }
}

impl Drop for RtlSdr {
    fn drop(&mut self) {
        self.inner.shutdown(CloseFlags::default());
    }
}

fn check_gpio(gpio: u8) -> Result<()> {
    if gpio > 7 {
        return Err(RtlsdrError::InvalidArgument(format!(
            "GPIO pin {} out of range 0..7",
            gpio
        )));
    }
    Ok(())
}
