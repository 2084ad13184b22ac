use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::device::{
    Device, BLOCK_SYS, BLOCK_USB, DEMOD_CTL, DEMOD_CTL_1, GPD, GPI, GPO, GPOE, USB_EPA_CTL,
    USB_EPA_MAXPKT, USB_SYSCTL,
};
use crate::error::Result;
use crate::error::RtlsdrError::{self, RtlsdrErr};
use crate::softagc::{SoftAgc, SoftAgcMode};
use crate::stream::{self, AsyncStatus, StreamState};
use crate::tuners::e4000::E4000;
use crate::tuners::fc0012::Fc0012;
use crate::tuners::fc0013::Fc0013;
use crate::tuners::fc2580::{Fc2580, FC2580_XTAL_FREQ};
use crate::tuners::r82xx::{R82xx, R82xxChip, R82xxConfig, R828D_XTAL_FREQ, R82XX_IF_FREQ};
use crate::tuners::{e4000, fc0012, fc0013, fc2580, r82xx};
use crate::tuners::{NoTuner, Tuner, TunerId};
use crate::{CloseFlags, DsMode, TunerGain};

const INTERFACE_ID: u8 = 0;

pub(crate) const DEF_RTL_XTAL_FREQ: u32 = 28_800_000;
const MIN_RTL_XTAL_FREQ: u32 = DEF_RTL_XTAL_FREQ - 1000;
const MAX_RTL_XTAL_FREQ: u32 = DEF_RTL_XTAL_FREQ + 1000;

pub(crate) const FIR_LEN: usize = 16;
/*
 * The filter runs at XTal frequency: a symmetric filter with 32 taps of
 * which only the first 16 are specified. Taps 0..7 are 8-bit signed,
 * taps 8..15 are 12-bit signed.
 */
const DEFAULT_FIR: [i32; FIR_LEN] = [
    -54, -36, -41, -40, -32, -14, 14, 53, // i8
    101, 156, 215, 273, 327, 372, 404, 421, // i12
];

/// Per-tuner demodulator profile applied at open: IF-AGC loop constants
/// derived from the DVB-T driver, entries are (page, addr, value, len).
const DEMOD_PROFILE_E4000: [(u16, u16, u16, usize); 26] = [
    (1, 0x12, 0x5a, 1),
    (1, 0x02, 0x40, 1),
    (1, 0x03, 0x5a, 1),
    (1, 0xc7, 0x30, 1),
    (1, 0x04, 0xd0, 1),
    (1, 0x05, 0xbe, 1),
    (1, 0xc8, 0x18, 1),
    (1, 0x06, 0x35, 1),
    (1, 0xc9, 0x21, 1),
    (1, 0xca, 0x21, 1),
    (1, 0xcb, 0x00, 1),
    (1, 0x07, 0x40, 1),
    (1, 0xcd, 0x10, 1),
    (1, 0xce, 0x10, 1),
    (0, 0x11, 0xe9d4, 2),
    (1, 0xe5, 0xf0, 1),
    (1, 0xd9, 0x00, 1),
    (1, 0xdb, 0x00, 1),
    (1, 0xdd, 0x14, 1),
    (1, 0xde, 0xec, 1),
    (1, 0xd8, 0x0c, 1),
    (1, 0xe6, 0x02, 1),
    (1, 0xd7, 0x09, 1),
    (0, 0x10, 0x49, 1),
    (0, 0x0d, 0x85, 1),
    (0, 0x13, 0x02, 1),
];

const DEMOD_PROFILE_FC001X: [(u16, u16, u16, usize); 23] = [
    (1, 0x12, 0x5a, 1),
    (1, 0x02, 0x40, 1),
    (1, 0x03, 0x5a, 1),
    (1, 0xc7, 0x2c, 1),
    (1, 0x04, 0xcc, 1),
    (1, 0x05, 0xbe, 1),
    (1, 0xc8, 0x16, 1),
    (1, 0x06, 0x35, 1),
    (1, 0xc9, 0x21, 1),
    (1, 0xca, 0x21, 1),
    (1, 0xcb, 0x00, 1),
    (1, 0x07, 0x40, 1),
    (1, 0xcd, 0x10, 1),
    (1, 0xce, 0x10, 1),
    (0, 0x11, 0xe9bf, 2),
    (1, 0xe5, 0xf0, 1),
    (1, 0xd9, 0x00, 1),
    (1, 0xdb, 0x00, 1),
    (1, 0xdd, 0x11, 1),
    (1, 0xde, 0xef, 1),
    (1, 0xd8, 0x0c, 1),
    (1, 0xe6, 0x02, 1),
    (1, 0xd7, 0x09, 1),
];

const DEMOD_PROFILE_R82XX: [(u16, u16, u16, usize); 15] = [
    (1, 0x12, 0x5a, 1),
    (1, 0x02, 0x40, 1),
    (1, 0x03, 0x80, 1),
    (1, 0xc7, 0x24, 1),
    (1, 0x04, 0xcc, 1),
    (1, 0x05, 0xbe, 1),
    (1, 0xc8, 0x14, 1),
    (1, 0x06, 0x35, 1),
    (1, 0xc9, 0x21, 1),
    (1, 0xca, 0x21, 1),
    (1, 0xcb, 0x00, 1),
    (1, 0x07, 0x40, 1),
    (1, 0xcd, 0x10, 1),
    (1, 0xce, 0x10, 1),
    (0, 0x11, 0xe9f4, 2),
];

#[derive(Debug)]
pub(crate) struct Controller {
    pub(crate) device: Arc<Device>,
    pub(crate) tuner: Box<dyn Tuner>,
    pub(crate) tuner_type: TunerId,
    pub(crate) rate: u32,
    pub(crate) verbose: bool,
    rtl_xtal: u32,
    tun_xtal: u32,
    corr: i32,
    fir: [i32; FIR_LEN],
    freq: u64,
    bw: u32,
    offs_freq: u32,
    if_band_center_freq: i32,
    tuner_if_freq: u32,
    tuner_sideband: bool,
    /// Cached demod inversion: 0 = unknown, else programmed sideband + 1.
    rtl_spectrum_sideband: u8,
    direct_sampling: u8,
    pub(crate) ds_mode: DsMode,
    pub(crate) ds_threshold: u32,
    rtl_vga_control: bool,
    i2c_repeater_on: bool,
    gpio_state_known: u8,
    /// Direction of configured pins, 1 == input.
    gpio_direction: u8,
    pub(crate) biast_gpio_pin: u8,
    // one-shot/persistent IF override installed via the UDP server
    override_if_freq: i32,
    override_if_flag: u8,
    last_if_freq: i64,
}

impl Controller {
    fn new(device: Arc<Device>) -> Controller {
        Controller {
            device,
            tuner: Box::new(NoTuner::new()),
            tuner_type: TunerId::Unknown,
            rate: 0,
            verbose: false,
            rtl_xtal: DEF_RTL_XTAL_FREQ,
            tun_xtal: DEF_RTL_XTAL_FREQ,
            corr: 0,
            fir: DEFAULT_FIR,
            freq: 0,
            bw: 0,
            offs_freq: 0,
            if_band_center_freq: 0,
            tuner_if_freq: 0,
            tuner_sideband: false,
            rtl_spectrum_sideband: 0,
            direct_sampling: 0,
            ds_mode: DsMode::Iq,
            ds_threshold: 0,
            rtl_vga_control: false,
            i2c_repeater_on: false,
            gpio_state_known: 0,
            gpio_direction: 0,
            biast_gpio_pin: 0,
            override_if_freq: 0,
            override_if_flag: 0,
            last_if_freq: 0,
        }
    }

    fn is_r82xx(&self) -> bool {
        matches!(self.tuner_type, TunerId::R820t | TunerId::R828d)
    }

    pub(crate) fn set_i2c_repeater(&mut self, enable: bool) -> Result<()> {
        if enable != self.i2c_repeater_on {
            self.i2c_repeater_on = enable;
            let val = if enable { 0x18 } else { 0x10 };
            self.device.demod_write_reg(1, 0x01, val, 1)?;
        }
        Ok(())
    }

    fn set_fir(&self) -> Result<()> {
        const TMP_LEN: usize = 20;
        let mut tmp: [u8; TMP_LEN] = [0; TMP_LEN];
        // first 8 taps are plain i8
        for i in 0..8 {
            let val = self.fir[i];
            if !(-128..=127).contains(&val) {
                return Err(RtlsdrErr(format!("i8 FIR coefficient out of bounds: {}", val)));
            }
            tmp[i] = val as u8;
        }
        // the i12 taps pack three bytes per two taps
        for i in (0..8).step_by(2) {
            let val0 = self.fir[8 + i];
            let val1 = self.fir[8 + i + 1];
            if !(-2048..=2047).contains(&val0) || !(-2048..=2047).contains(&val1) {
                return Err(RtlsdrErr(format!(
                    "i12 FIR coefficient out of bounds: {} {}",
                    val0, val1
                )));
            }
            tmp[8 + i * 3 / 2] = (val0 >> 4) as u8;
            tmp[8 + i * 3 / 2 + 1] = ((val0 << 4) | ((val1 >> 8) & 0x0f)) as u8;
            tmp[8 + i * 3 / 2 + 2] = val1 as u8;
        }

        for (i, b) in tmp.iter().enumerate() {
            self.device
                .demod_write_reg(1, 0x1c + i as u16, *b as u16, 1)?;
        }
        Ok(())
    }

    fn init_baseband(&mut self) -> Result<()> {
        // initialize USB
        self.device.write_reg(BLOCK_USB, USB_SYSCTL, 0x09, 1)?;
        self.device.write_reg(BLOCK_USB, USB_EPA_MAXPKT, 0x0002, 2)?;
        self.device.write_reg(BLOCK_USB, USB_EPA_CTL, 0x1002, 2)?;

        // power on demod
        self.device.write_reg(BLOCK_SYS, DEMOD_CTL_1, 0x22, 1)?;
        self.device.write_reg(BLOCK_SYS, DEMOD_CTL, 0xe8, 1)?;

        // reset demod (bit 3, soft_rst)
        self.device.reset_demod()?;

        // disable spectrum inversion and adjacent channel rejection
        self.device.demod_write_reg(1, 0x15, 0x00, 1)?;
        self.device.demod_write_reg(1, 0x16, 0x0000, 2)?;
        self.rtl_spectrum_sideband = 0;

        // clear both DDC shift and IF frequency registers
        for i in 0..6 {
            self.device.demod_write_reg(1, 0x16 + i, 0x00, 1)?;
        }

        self.set_fir()?;

        // enable SDR mode, disable DAGC (bit 5)
        self.device.demod_write_reg(0, 0x19, 0x05, 1)?;

        // init FSM state-holding register
        self.device.demod_write_reg(1, 0x93, 0xf0, 1)?;
        self.device.demod_write_reg(1, 0x94, 0x0f, 1)?;

        // disable AGC (en_dagc, bit 0; seems to have no effect)
        self.device.demod_write_reg(1, 0x11, 0x00, 1)?;

        /* the RF/IF AGC loop register (page 1, 0x04) is left to the
         * per-tuner profile applied during the probe */
        self.rtl_vga_control = false;

        // disable PID filter (enable_PID = 0)
        self.device.demod_write_reg(0, 0x61, 0x60, 1)?;

        // opt_adc_iq = 0, default ADC_I/ADC_Q datapath
        self.device.demod_write_reg(0, 0x06, 0x80, 1)?;

        /* enable Zero-IF mode (en_bbin bit), DC cancellation (en_dc_est),
         * IQ estimation/compensation (en_iq_comp, en_iq_est) */
        self.device.demod_write_reg(1, 0xb1, 0x1b, 1)?;

        // disable 4.096 MHz clock output on pin TP_CK0
        self.device.demod_write_reg(0, 0x0d, 0x83, 1)?;

        Ok(())
    }

    fn deinit_baseband(&mut self) -> Result<()> {
        self.set_i2c_repeater(true)?;
        let r = {
            let Controller { tuner, device, .. } = self;
            tuner.exit(device)
        };
        self.set_i2c_repeater(false)?;
        r?;

        // power off demodulator and ADCs
        self.device.write_reg(BLOCK_SYS, DEMOD_CTL, 0x20, 1)?;
        Ok(())
    }

    fn probe_tuner(&mut self) -> Result<()> {
        self.set_i2c_repeater(true)?;

        let probes: [&crate::tuners::TunerInfo; 4] = [
            &e4000::TUNER_INFO,
            &fc0013::TUNER_INFO,
            &r82xx::TUNER_INFO,
            &r82xx::TUNER_INFO_R828D,
        ];
        let mut found: Option<TunerId> = None;
        for info in probes.iter() {
            match self.device.i2c_read_reg(info.i2c_addr, info.check_addr) {
                Ok(val) if val == info.check_val => {
                    info!("Found {} tuner", info.name);
                    found = Some(info.id);
                    break;
                }
                _ => {}
            }
        }

        if found.is_none() {
            // reset tuner through GPIO 4 before probing the remaining chips
            self.set_gpio_output(4)?;
            self.set_gpio_bit(4, true)?;
            self.set_gpio_bit(4, false)?;

            let info = &fc2580::TUNER_INFO;
            if let Ok(val) = self.device.i2c_read_reg(info.i2c_addr, info.check_addr) {
                if val & 0x7f == info.check_val {
                    info!("Found {} tuner", info.name);
                    found = Some(TunerId::Fc2580);
                }
            }
        }
        if found.is_none() {
            let info = &fc0012::TUNER_INFO;
            if let Ok(val) = self.device.i2c_read_reg(info.i2c_addr, info.check_addr) {
                if val == info.check_val {
                    info!("Found {} tuner", info.name);
                    // the V/U-band filter switch lives on GPIO 6
                    self.set_gpio_output(6)?;
                    found = Some(TunerId::Fc0012);
                }
            }
        }

        let tuner_type = found.unwrap_or(TunerId::Unknown);
        self.tuner_type = tuner_type;
        // use the rtl clock value by default
        self.tun_xtal = self.rtl_xtal;

        let profile: &[(u16, u16, u16, usize)] = match tuner_type {
            TunerId::E4000 => {
                self.tuner = Box::new(E4000::new());
                &DEMOD_PROFILE_E4000
            }
            TunerId::Fc0012 => {
                self.tuner = Box::new(Fc0012::new());
                &DEMOD_PROFILE_FC001X
            }
            TunerId::Fc0013 => {
                self.tuner = Box::new(Fc0013::new());
                &DEMOD_PROFILE_FC001X
            }
            TunerId::Fc2580 => {
                self.tuner = Box::new(Fc2580::new());
                self.tun_xtal = FC2580_XTAL_FREQ;
                &[]
            }
            TunerId::R820t => {
                let cfg = R82xxConfig::new(R82xxChip::R820T);
                self.tuner = Box::new(R82xx::new(cfg));
                &DEMOD_PROFILE_R82XX
            }
            TunerId::R828d => {
                let cfg = R82xxConfig::new(R82xxChip::R828D);
                self.tuner = Box::new(R82xx::new(cfg));
                self.tun_xtal = R828D_XTAL_FREQ;
                &DEMOD_PROFILE_R82XX
            }
            TunerId::Unknown => {
                warn!("No supported tuner found");
                &[]
            }
        };
        for (page, addr, val, len) in profile.iter() {
            self.device.demod_write_reg(*page, *addr, *val, *len)?;
        }

        if self.is_r82xx() {
            // disable Zero-IF mode
            self.device.demod_write_reg(1, 0xb1, 0x1a, 1)?;
            // only enable In-phase ADC input
            self.device.demod_write_reg(0, 0x08, 0x4d, 1)?;
            /* the R82xx uses 3.57 MHz IF for the DVB-T 6 MHz mode, and
             * 4.57 MHz for the 8 MHz mode */
            self.set_if_freq(R82XX_IF_FREQ as i64)?;
            // enable spectrum inversion
            self.device.demod_write_reg(1, 0x15, 0x01, 1)?;
            self.rtl_spectrum_sideband = 1;
        }

        // read corrected clock value into the tuner
        let tun_xtal = self.tuner_xtal_corrected();
        self.tuner.set_xtal_freq(tun_xtal)?;

        let r = {
            let Controller { tuner, device, .. } = self;
            tuner.init(device)
        };
        self.set_i2c_repeater(false)?;
        r?;

        if tuner_type == TunerId::Unknown {
            warn!("Enabling direct sampling mode (I-branch)");
            self.set_direct_sampling(1)?;
        }
        Ok(())
    }

    pub(crate) fn init(&mut self) -> Result<()> {
        self.init_baseband()?;
        self.probe_tuner()?;
        info!("init complete");
        Ok(())
    }

    fn rtl_xtal_corrected(&self) -> u32 {
        (self.rtl_xtal as f64 * (1.0 + self.corr as f64 / 1e6)) as u32
    }

    fn tuner_xtal_corrected(&self) -> u32 {
        (self.tun_xtal as f64 * (1.0 + self.corr as f64 / 1e6)) as u32
    }

    pub(crate) fn get_xtal_freq(&self) -> (u32, u32) {
        (self.rtl_xtal_corrected(), self.tuner_xtal_corrected())
    }

    pub(crate) fn set_xtal_freq(&mut self, rtl_freq: u32, tuner_freq: u32) -> Result<()> {
        if rtl_freq > 0 && !(MIN_RTL_XTAL_FREQ..=MAX_RTL_XTAL_FREQ).contains(&rtl_freq) {
            return Err(RtlsdrError::InvalidArgument(format!(
                "rtl xtal frequency {} out of bounds",
                rtl_freq
            )));
        }

        if rtl_freq > 0 && self.rtl_xtal != rtl_freq {
            self.rtl_xtal = rtl_freq;
            // update xtal-dependent settings
            if self.rate != 0 {
                self.set_sample_rate(self.rate)?;
            }
        }

        if self.tuner.get_xtal_freq() != tuner_freq {
            if tuner_freq == 0 {
                self.tun_xtal = self.rtl_xtal;
            } else {
                self.tun_xtal = tuner_freq;
            }
            let corrected = self.tuner_xtal_corrected();
            self.tuner.set_xtal_freq(corrected)?;

            if self.freq != 0 {
                self.set_center_freq64(self.freq)?;
            }
        }
        Ok(())
    }

    /// Program the demod DDC. The 22-bit signed value is
    /// `-f_if * 2^22 / f_xtal` against the ppm-corrected crystal.
    pub(crate) fn set_if_freq(&mut self, freq: i64) -> Result<()> {
        let mut freq = freq;
        self.last_if_freq = freq;
        if self.override_if_flag != 0 {
            if self.verbose {
                info!(
                    "overriding IF frequency: {} instead of {} Hz",
                    self.override_if_freq, freq
                );
            }
            freq = self.override_if_freq as i64;
            if self.override_if_flag == 1 {
                self.override_if_flag = 0;
            }
        }

        let rtl_xtal = self.rtl_xtal_corrected() as i64;
        let if_freq = (-(freq << 22) / rtl_xtal) as i32;

        self.device
            .demod_write_reg(1, 0x19, ((if_freq >> 16) & 0x3f) as u16, 1)?;
        self.device
            .demod_write_reg(1, 0x1a, ((if_freq >> 8) & 0xff) as u16, 1)?;
        self.device
            .demod_write_reg(1, 0x1b, (if_freq & 0xff) as u16, 1)?;
        Ok(())
    }

    /// `sideband == true` disables inversion; only written when it changes.
    fn set_spectrum_inversion(&mut self, sideband: bool) -> Result<()> {
        let encoded = sideband as u8 + 1;
        if self.rtl_spectrum_sideband == encoded {
            return Ok(());
        }
        let val = if sideband { 0x00 } else { 0x01 };
        self.device.demod_write_reg(1, 0x15, val, 1)?;
        self.rtl_spectrum_sideband = encoded;
        Ok(())
    }

    /// Demod inversion = tuner sideband XOR the tuner's own flip state.
    fn update_tuner_inversion(&mut self) -> Result<()> {
        if !self.is_r82xx() {
            return Ok(());
        }
        let sideband = self.tuner.get_sideband();
        let flip = self.tuner.flip_rtl_sideband();
        self.set_spectrum_inversion(sideband ^ flip)
    }

    fn set_sample_freq_correction(&mut self, ppm: i32) -> Result<()> {
        let offs = ((-(ppm as i64) << 24) / 1_000_000) as i16;
        self.device
            .demod_write_reg(1, 0x3f, (offs & 0xff) as u16, 1)?;
        self.device
            .demod_write_reg(1, 0x3e, ((offs >> 8) & 0x3f) as u16, 1)?;
        Ok(())
    }

    pub(crate) fn get_freq_correction(&self) -> i32 {
        self.corr
    }

    pub(crate) fn set_freq_correction(&mut self, ppm: i32) -> Result<()> {
        if self.corr == ppm {
            return Ok(());
        }
        self.corr = ppm;
        self.set_sample_freq_correction(ppm)?;

        // read corrected clock value into the tuner
        let corrected = self.tuner_xtal_corrected();
        self.tuner.set_xtal_freq(corrected)?;

        // retune to apply the new correction value
        if self.freq != 0 {
            self.set_center_freq64(self.freq)?;
        }
        Ok(())
    }

    pub(crate) fn get_center_freq64(&self) -> u64 {
        self.freq
    }

    pub(crate) fn set_center_freq64(&mut self, freq: u64) -> Result<()> {
        if self.ds_mode > DsMode::Q {
            self.update_ds(freq)?;
        }

        if self.direct_sampling != 0 {
            self.set_if_freq(freq as i64)?;
            self.freq = freq;
            return Ok(());
        }

        self.set_i2c_repeater(true)?;
        let offs = self.offs_freq as u64;
        let r = {
            let Controller { tuner, device, .. } = self;
            tuner.set_freq(device, freq.saturating_sub(offs))
        };
        let r = r.and_then(|_| self.update_tuner_inversion());
        self.set_i2c_repeater(false)?;
        r?;

        // frequency is reported back only while the PLL holds lock
        self.freq = if self.tuner.pll_locked() { freq } else { 0 };
        Ok(())
    }

    pub(crate) fn is_tuner_pll_locked(&mut self) -> Result<bool> {
        if !self.is_r82xx() {
            return Err(RtlsdrError::NotSupported("is_tuner_pll_locked"));
        }
        self.set_i2c_repeater(true)?;
        let r = {
            let Controller { tuner, device, .. } = self;
            tuner.is_pll_locked(device)
        };
        self.set_i2c_repeater(false)?;
        r
    }

    pub(crate) fn get_sample_rate(&self) -> u32 {
        self.rate
    }

    pub(crate) fn set_sample_rate(&mut self, samp_rate: u32) -> Result<()> {
        // check if the rate is supported by the resampler
        if samp_rate <= 225_000
            || samp_rate > 3_200_000
            || (samp_rate > 300_000 && samp_rate <= 900_000)
        {
            return Err(RtlsdrError::InvalidArgument(format!(
                "invalid sample rate: {} Hz",
                samp_rate
            )));
        }

        let rsamp_ratio =
            ((self.rtl_xtal as u64 * (1 << 22) / samp_rate as u64) & 0x0fff_fffc) as u32;
        // the hardware expects bit 27 carried into bit 28
        let real_rsamp_ratio = rsamp_ratio | ((rsamp_ratio & 0x0800_0000) << 1);
        let real_rate = (self.rtl_xtal as f64 * (1u64 << 22) as f64) / real_rsamp_ratio as f64;
        if samp_rate as f64 != real_rate {
            info!("exact sample rate is: {:.6} Hz", real_rate);
        }
        self.rate = real_rate as u32;

        self.set_i2c_repeater(true)?;
        let bw = if self.bw > 0 { self.bw } else { self.rate };
        let r = {
            let rate = self.rate;
            let Controller { tuner, device, .. } = self;
            tuner.set_bandwidth(device, bw, rate, true)
        };
        self.set_i2c_repeater(false)?;
        r?;
        self.update_if_chain()?;

        self.device
            .demod_write_reg(1, 0x9f, (rsamp_ratio >> 16) as u16, 2)?;
        self.device
            .demod_write_reg(1, 0xa1, (rsamp_ratio & 0xffff) as u16, 2)?;

        self.set_sample_freq_correction(self.corr)?;

        // reset demod (bit 3, soft_rst)
        self.device.reset_demod()?;

        // recalculate offset frequency if offset tuning is enabled
        if self.offs_freq != 0 {
            self.set_offset_tuning(true)?;
        }
        Ok(())
    }

    /// Reprogram the demod IF and retune after anything that moved the
    /// tuner's IF (bandwidth, band center, sideband, sample rate). The
    /// band-center sign follows the sideband so the filtered band stays
    /// centered at the output.
    fn update_if_chain(&mut self) -> Result<()> {
        if !self.is_r82xx() {
            return Ok(());
        }
        self.tuner_if_freq = self.tuner.get_if_freq();
        let iffreq = if self.tuner_sideband {
            self.tuner_if_freq as i64 - self.if_band_center_freq as i64
        } else {
            self.tuner_if_freq as i64 + self.if_band_center_freq as i64
        };
        self.set_if_freq(iffreq)?;
        if self.freq != 0 {
            self.set_center_freq64(self.freq)?;
        }
        Ok(())
    }

    pub(crate) fn set_and_get_tuner_bandwidth(&mut self, bw: u32, apply: bool) -> Result<u32> {
        let bw_req = if bw > 0 { bw } else { self.rate };
        if !apply {
            // query path: report the realizable bandwidth without touching
            // the tuner state
            debug!("bandwidth query for {} Hz, tuner untouched", bw_req);
            let rate = self.rate;
            let Controller { tuner, device, .. } = self;
            return tuner.set_bandwidth(device, bw_req, rate, false);
        }

        self.set_i2c_repeater(true)?;
        let r = {
            let rate = self.rate;
            let Controller { tuner, device, .. } = self;
            tuner.set_bandwidth(device, bw_req, rate, true)
        };
        self.set_i2c_repeater(false)?;
        let applied = r?;
        self.bw = bw;
        self.update_if_chain()?;
        Ok(applied)
    }

    pub(crate) fn set_tuner_band_center(&mut self, if_band_center: i32) -> Result<()> {
        self.set_i2c_repeater(true)?;
        let r = {
            let Controller { tuner, device, .. } = self;
            tuner.set_bandwidth_center(device, if_band_center)
        };
        self.set_i2c_repeater(false)?;
        r?;
        self.if_band_center_freq = if_band_center;
        self.update_if_chain()
    }

    pub(crate) fn set_tuner_sideband(&mut self, sideband: bool) -> Result<()> {
        self.set_i2c_repeater(true)?;
        let r = {
            let Controller { tuner, device, .. } = self;
            tuner.set_sideband(device, sideband)
        };
        let r = r.and_then(|_| self.update_tuner_inversion());
        self.set_i2c_repeater(false)?;
        r?;
        self.tuner_sideband = sideband;
        self.update_if_chain()
    }

    fn vga_control(&mut self, rtl_vga_control: bool) {
        /* with the per-tuner IF-AGC profiles the demod loop register stays
         * under profile control; only the bookkeeping changes */
        if rtl_vga_control != self.rtl_vga_control {
            self.rtl_vga_control = rtl_vga_control;
        }
    }

    pub(crate) fn set_tuner_gain(&mut self, gain: TunerGain) -> Result<()> {
        self.set_i2c_repeater(true)?;
        let r = {
            let Controller { tuner, device, .. } = self;
            tuner.set_gain(device, gain)
        };
        self.set_i2c_repeater(false)?;
        let rtl_vga = r?;
        self.vga_control(rtl_vga);
        Ok(())
    }

    pub(crate) fn get_tuner_gain(&mut self) -> Result<i32> {
        self.set_i2c_repeater(true)?;
        let r = {
            let Controller { tuner, device, .. } = self;
            tuner.get_gain(device)
        };
        self.set_i2c_repeater(false)?;
        r
    }

    pub(crate) fn set_tuner_gain_ext(&mut self, lna: u8, mixer: u8, vga: u8) -> Result<()> {
        if !self.is_r82xx() {
            return Err(RtlsdrError::NotSupported("set_tuner_gain_ext"));
        }
        self.set_i2c_repeater(true)?;
        let r = {
            let Controller { tuner, device, .. } = self;
            tuner.set_gain_ext(device, lna, mixer, vga)
        };
        self.set_i2c_repeater(false)?;
        let rtl_vga = r?;
        self.vga_control(rtl_vga);
        Ok(())
    }

    pub(crate) fn set_tuner_if_mode(&mut self, if_mode: i32) -> Result<()> {
        if !self.is_r82xx() {
            return Err(RtlsdrError::NotSupported("set_tuner_if_mode"));
        }
        self.set_i2c_repeater(true)?;
        let r = {
            let Controller { tuner, device, .. } = self;
            tuner.set_if_mode(device, if_mode)
        };
        self.set_i2c_repeater(false)?;
        let rtl_vga = r?;
        self.vga_control(rtl_vga);
        Ok(())
    }

    pub(crate) fn set_tuner_if_gain(&mut self, stage: i32, gain: i32) -> Result<()> {
        self.set_i2c_repeater(true)?;
        let r = {
            let Controller { tuner, device, .. } = self;
            tuner.set_if_gain(device, stage, gain)
        };
        self.set_i2c_repeater(false)?;
        r
    }

    pub(crate) fn set_tuner_gain_mode(&mut self, manual: bool) -> Result<()> {
        let gain = if manual {
            TunerGain::Manual(0)
        } else {
            TunerGain::Auto
        };
        self.set_tuner_gain(gain)
    }

    pub(crate) fn set_tuner_i2c_register(&mut self, reg: u8, mask: u8, data: u8) -> Result<()> {
        self.set_i2c_repeater(true)?;
        let r = {
            let Controller { tuner, device, .. } = self;
            tuner.set_i2c_register(device, reg, data, mask)
        };
        self.set_i2c_repeater(false)?;
        r
    }

    pub(crate) fn set_tuner_i2c_override(&mut self, reg: u8, mask: u8, data: u32) -> Result<()> {
        self.set_i2c_repeater(true)?;
        let r = {
            let Controller { tuner, device, .. } = self;
            tuner.set_i2c_override(device, reg, data, mask)
        };
        self.set_i2c_repeater(false)?;
        r
    }

    pub(crate) fn get_tuner_i2c_register(&self, reg: usize) -> Result<u8> {
        self.tuner.get_i2c_register(reg)
    }

    pub(crate) fn get_tuner_i2c_register_dump(&mut self, buf: &mut [u8]) -> Result<()> {
        self.set_i2c_repeater(true)?;
        let r = {
            let Controller { tuner, device, .. } = self;
            tuner.get_i2c_register_dump(device, buf)
        };
        self.set_i2c_repeater(false)?;
        r
    }

    pub(crate) fn set_testmode(&mut self, on: bool) -> Result<()> {
        let val = if on { 0x03 } else { 0x05 };
        self.device.demod_write_reg(0, 0x19, val, 1)?;
        Ok(())
    }

    /// RTL2832 digital AGC, after the ADC.
    pub(crate) fn set_agc_mode(&mut self, on: bool) -> Result<()> {
        let val = if on { 0x25 } else { 0x05 };
        self.device.demod_write_reg(0, 0x19, val, 1)?;
        Ok(())
    }

    pub(crate) fn get_direct_sampling(&self) -> u8 {
        self.direct_sampling
    }

    pub(crate) fn set_direct_sampling(&mut self, on: u8) -> Result<()> {
        if on != 0 {
            self.set_i2c_repeater(true)?;
            let r = {
                let Controller { tuner, device, .. } = self;
                tuner.exit(device)
            };
            self.set_i2c_repeater(false)?;
            r?;

            // disable Zero-IF mode
            self.device.demod_write_reg(1, 0xb1, 0x1a, 1)?;
            // disable spectrum inversion
            self.device.demod_write_reg(1, 0x15, 0x00, 1)?;
            self.rtl_spectrum_sideband = 2;
            // only enable In-phase ADC input
            self.device.demod_write_reg(0, 0x08, 0x4d, 1)?;
            /* swap I and Q ADC, this allows to select between the two
             * inputs */
            self.device
                .demod_write_reg(0, 0x06, if on > 1 { 0x90 } else { 0x80 }, 1)?;

            info!("enabled direct sampling mode, input {}", on);
            self.direct_sampling = on;
        } else {
            self.set_i2c_repeater(true)?;
            let r = {
                let Controller { tuner, device, .. } = self;
                tuner.init(device)
            };
            self.set_i2c_repeater(false)?;
            r?;

            if self.is_r82xx() {
                self.set_if_freq(R82XX_IF_FREQ as i64)?;
                // enable spectrum inversion
                self.device.demod_write_reg(1, 0x15, 0x01, 1)?;
                self.rtl_spectrum_sideband = 1;
            } else {
                self.set_if_freq(0)?;
                // enable In-phase + Quadrature ADC input
                self.device.demod_write_reg(0, 0x08, 0xcd, 1)?;
                // enable Zero-IF mode
                self.device.demod_write_reg(1, 0xb1, 0x1b, 1)?;
            }
            // opt_adc_iq = 0, default ADC_I/ADC_Q datapath
            self.device.demod_write_reg(0, 0x06, 0x80, 1)?;

            info!("disabled direct sampling mode");
            self.direct_sampling = 0;
        }

        let freq = self.freq;
        self.set_center_freq64(freq)
    }

    pub(crate) fn set_ds_mode(&mut self, mode: DsMode, freq_threshold: u32) -> Result<()> {
        let center_freq = self.freq;
        if center_freq == 0 {
            return Err(RtlsdrError::InvalidArgument(
                "set a center frequency before selecting a DS mode".to_string(),
            ));
        }

        let threshold = if freq_threshold != 0 {
            freq_threshold
        } else {
            match self.tuner_type {
                TunerId::E4000 => e4000::E4K_FLO_MIN_MHZ * 1_000_000,
                TunerId::R820t => 24_000_000,
                _ => 28_800_000,
            }
        };

        self.ds_mode = mode;
        self.ds_threshold = threshold;

        match mode {
            DsMode::Iq => self.set_direct_sampling(0)?,
            DsMode::I => self.set_direct_sampling(1)?,
            DsMode::Q => self.set_direct_sampling(2)?,
            _ => {}
        }

        self.set_center_freq64(center_freq)
    }

    fn update_ds(&mut self, freq: u64) -> Result<()> {
        let new_ds: u8 = match self.ds_mode {
            DsMode::Iq => 0,
            DsMode::I => 1,
            DsMode::Q => 2,
            DsMode::IBelow => {
                if freq < self.ds_threshold as u64 {
                    1
                } else {
                    0
                }
            }
            DsMode::QBelow => {
                if freq < self.ds_threshold as u64 {
                    2
                } else {
                    0
                }
            }
        };
        if self.direct_sampling != new_ds {
            self.set_direct_sampling(new_ds)?;
        }
        Ok(())
    }

    pub(crate) fn get_offset_tuning(&self) -> bool {
        self.offs_freq != 0
    }

    pub(crate) fn set_offset_tuning(&mut self, on: bool) -> Result<()> {
        if self.is_r82xx() {
            return Err(RtlsdrError::NotSupported("set_offset_tuning"));
        }
        if self.direct_sampling != 0 {
            return Err(RtlsdrError::InvalidArgument(
                "offset tuning not available in direct sampling mode".to_string(),
            ));
        }

        // based on keenerds 1/f noise measurements
        self.offs_freq = if on { (self.rate / 2) * 170 / 100 } else { 0 };
        let offs = self.offs_freq as i64;
        self.set_if_freq(offs)?;

        let bw = if on {
            2 * self.offs_freq
        } else if self.bw > 0 {
            self.bw
        } else {
            self.rate
        };
        self.set_i2c_repeater(true)?;
        let r = {
            let rate = self.rate;
            let Controller { tuner, device, .. } = self;
            tuner.set_bandwidth(device, bw, rate, true)
        };
        self.set_i2c_repeater(false)?;
        r?;

        if self.freq > self.offs_freq as u64 {
            let freq = self.freq;
            self.set_center_freq64(freq)?;
        }
        Ok(())
    }

    pub(crate) fn set_dithering(&mut self, dither: bool) -> Result<()> {
        if self.tuner_type != TunerId::R820t {
            return Err(RtlsdrError::NotSupported("set_dithering"));
        }
        self.set_i2c_repeater(true)?;
        let r = {
            let Controller { tuner, device, .. } = self;
            tuner.set_dithering(device, dither)
        };
        self.set_i2c_repeater(false)?;
        r
    }

    pub(crate) fn set_harmonic_rx(&mut self, harmonic: u32) -> Result<()> {
        if self.tuner_type != TunerId::R820t {
            return Err(RtlsdrError::NotSupported("set_harmonic_rx"));
        }
        self.tuner.set_harmonic(harmonic)
    }

    pub(crate) fn set_vco_settings(
        &mut self,
        curr_min: Option<u8>,
        curr_max: Option<u8>,
        algo: Option<u8>,
    ) -> Result<()> {
        if !self.is_r82xx() {
            return Err(RtlsdrError::NotSupported("set_vco_settings"));
        }
        self.tuner.set_vco_settings(curr_min, curr_max, algo)
    }

    /*
     * GPIO plumbing; `gpio_state_known`/`gpio_direction` avoid needless
     * control transfers and keep already-configured pins (bias-T!)
     * undisturbed.
     */

    pub(crate) fn set_gpio_bit(&mut self, gpio: u8, val: bool) -> Result<()> {
        let gpio = 1u16 << gpio;
        let mut r = self.device.read_reg(BLOCK_SYS, GPO, 1)?;
        r = if val { r | gpio } else { r & !gpio };
        self.device.write_reg(BLOCK_SYS, GPO, r, 1)?;
        Ok(())
    }

    pub(crate) fn get_gpio_bit(&self, gpio: u8) -> Result<bool> {
        let r = self.device.read_reg(BLOCK_SYS, GPI, 1)?;
        Ok(r & (1 << gpio) != 0)
    }

    pub(crate) fn set_gpio_output(&mut self, gpio: u8) -> Result<()> {
        let mask = 1u8 << gpio;
        if self.gpio_state_known & mask != 0 && self.gpio_direction & mask == 0 {
            return Ok(());
        }
        let r = self.device.read_reg(BLOCK_SYS, GPD, 1)?;
        self.device
            .write_reg(BLOCK_SYS, GPD, r & !(mask as u16), 1)?;
        let r = self.device.read_reg(BLOCK_SYS, GPOE, 1)?;
        self.device
            .write_reg(BLOCK_SYS, GPOE, r | mask as u16, 1)?;
        self.gpio_state_known |= mask;
        self.gpio_direction &= !mask;
        Ok(())
    }

    pub(crate) fn set_gpio_input(&mut self, gpio: u8) -> Result<()> {
        let mask = 1u8 << gpio;
        if self.gpio_state_known & mask != 0 && self.gpio_direction & mask != 0 {
            return Ok(());
        }
        let r = self.device.read_reg(BLOCK_SYS, GPD, 1)?;
        self.device.write_reg(BLOCK_SYS, GPD, r | mask as u16, 1)?;
        let r = self.device.read_reg(BLOCK_SYS, GPOE, 1)?;
        self.device
            .write_reg(BLOCK_SYS, GPOE, r & !(mask as u16), 1)?;
        self.gpio_state_known |= mask;
        self.gpio_direction |= mask;
        Ok(())
    }

    pub(crate) fn get_gpio_byte(&self) -> Result<u8> {
        Ok(self.device.read_reg(BLOCK_SYS, GPI, 1)? as u8)
    }

    pub(crate) fn set_gpio_byte(&mut self, val: u8) -> Result<()> {
        self.device.write_reg(BLOCK_SYS, GPO, val as u16, 1)?;
        Ok(())
    }

    pub(crate) fn get_gpio_status(&self) -> Result<u8> {
        Ok(self.device.read_reg(BLOCK_SYS, GPD, 1)? as u8)
    }

    pub(crate) fn set_bias_tee_gpio(&mut self, gpio: u8, on: bool) -> Result<()> {
        self.set_gpio_output(gpio)?;
        self.set_gpio_bit(gpio, on)
    }

    pub(crate) fn reset_buffer(&self) -> Result<()> {
        self.device.write_reg(BLOCK_USB, USB_EPA_CTL, 0x1002, 2)?;
        self.device.write_reg(BLOCK_USB, USB_EPA_CTL, 0x0000, 2)?;
        Ok(())
    }

    // one-shot (flag 1) or persistent (flag 2) IF override; negative
    // frequency clears it
    pub(crate) fn set_if_override(&mut self, freq: i64, persistent: bool) -> Result<()> {
        if freq < 0 {
            self.override_if_freq = 0;
            self.override_if_flag = 0;
        } else {
            self.override_if_freq = freq as i32;
            self.override_if_flag = if persistent { 2 } else { 1 };
        }
        let bw = self.bw;
        self.set_and_get_tuner_bandwidth(bw, true)?;
        if self.freq != 0 {
            let freq = self.freq;
            self.set_center_freq64(freq)?;
        }
        Ok(())
    }
}

/// Shared core of an open dongle: register-access context, tuner, streaming
/// and soft-AGC state. The public [`RtlSdr`] handle and the background
/// workers all hold this through an `Arc`.
#[derive(Debug)]
pub(crate) struct DevInner {
    pub(crate) device: Arc<Device>,
    pub(crate) ctl: Mutex<Controller>,
    pub(crate) stream: StreamState,
    pub(crate) softagc: Arc<SoftAgc>,
    pub(crate) dev_lost: AtomicBool,
    called_set_opt: AtomicBool,
    pub(crate) udp_started: AtomicBool,
    closed: AtomicBool,
}

impl DevInner {
    pub(crate) fn open(index: usize) -> Result<Arc<DevInner>> {
        let mut device = Device::new(index)?;
        device.claim_interface(INTERFACE_ID)?;
        device.test_write()?;
        let device = Arc::new(device);

        let inner = Arc::new(DevInner {
            device: Arc::clone(&device),
            ctl: Mutex::new(Controller::new(device)),
            stream: StreamState::new(),
            softagc: Arc::new(SoftAgc::new()),
            dev_lost: AtomicBool::new(false),
            called_set_opt: AtomicBool::new(false),
            udp_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        inner.ctl.lock().unwrap().init()?;
        Ok(inner)
    }

    pub(crate) fn ctl(&self) -> std::sync::MutexGuard<'_, Controller> {
        self.ctl.lock().unwrap()
    }

    /// Apply `LIBRTLSDR_OPT` once, before the first stream starts, unless
    /// an explicit option string was applied already.
    pub(crate) fn process_env_opts(self: &Arc<Self>) {
        if self.called_set_opt.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(opts) = std::env::var("LIBRTLSDR_OPT") {
            info!("applying options '{}' from LIBRTLSDR_OPT", opts);
            if let Err(e) = crate::options::set_opt_string(self, &opts, true) {
                warn!("LIBRTLSDR_OPT: {}", e);
            }
        }
    }

    pub(crate) fn mark_set_opt_called(&self) {
        self.called_set_opt.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_tuner_gain_mode(&self, mut manual: bool) -> Result<()> {
        if self.softagc.mode() != SoftAgcMode::Off {
            // soft AGC drives the gain itself and needs manual mode
            if !manual {
                info!("tuner gain mode overridden to manual for soft AGC");
            }
            manual = true;
        }
        self.ctl().set_tuner_gain_mode(manual)
    }

    pub(crate) fn set_sample_rate(&self, rate: u32) -> Result<()> {
        self.ctl().set_sample_rate(rate)?;
        if self.softagc.reactivate() {
            // sample-based timings are stale at the new rate
            self.softagc.invalidate_timing();
        }
        Ok(())
    }

    pub(crate) fn set_tuner_bandwidth(&self, bw: u32) -> Result<u32> {
        let applied = self.ctl().set_and_get_tuner_bandwidth(bw, true)?;
        self.softagc.reactivate();
        Ok(applied)
    }

    pub(crate) fn set_tuner_if_gain(&self, stage: i32, gain: i32) -> Result<()> {
        self.ctl().set_tuner_if_gain(stage, gain)?;
        self.softagc.reactivate();
        Ok(())
    }

    pub(crate) fn set_bias_tee_gpio(&self, gpio: u8, on: bool) -> Result<()> {
        if gpio > 7 {
            return Err(RtlsdrError::InvalidArgument(format!(
                "GPIO pin {} out of range 0..7",
                gpio
            )));
        }
        self.ctl().set_bias_tee_gpio(gpio, on)?;
        self.softagc.reactivate();
        Ok(())
    }

    pub(crate) fn set_bias_tee(&self, on: bool) -> Result<()> {
        let pin = self.ctl().biast_gpio_pin;
        self.set_bias_tee_gpio(pin, on)
    }

    pub(crate) fn softagc_apply_worker(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        SoftAgc::ensure_worker(&self.softagc, move |gain| {
            if let Some(inner) = weak.upgrade() {
                if let Err(e) = inner.ctl().set_tuner_gain(TunerGain::Manual(gain)) {
                    warn!("soft AGC gain change failed: {}", e);
                }
            }
        });
    }

    pub(crate) fn read_sync(self: &Arc<Self>, buf: &mut [u8]) -> Result<usize> {
        self.process_env_opts();
        self.device.bulk_transfer(buf)
    }

    pub(crate) fn read_async(
        self: &Arc<Self>,
        cb: &mut dyn FnMut(&[u8]),
        buf_num: u32,
        buf_len: u32,
    ) -> Result<()> {
        self.process_env_opts();
        stream::read_async(self, cb, buf_num, buf_len)
    }

    pub(crate) fn cancel_async(&self) -> Result<()> {
        stream::cancel_async(self)
    }

    pub(crate) fn async_status(&self) -> AsyncStatus {
        self.stream.status()
    }

    pub(crate) fn shutdown(&self, flags: CloseFlags) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.dev_lost.load(Ordering::SeqCst) {
            // block until any async operation has wound down
            while self.stream.status() != AsyncStatus::Inactive {
                self.stream.request_cancel();
                std::thread::sleep(Duration::from_millis(1));
            }

            let mut ctl = self.ctl();
            if flags.deactivate_bias_tee {
                let pin = ctl.biast_gpio_pin;
                if let Err(e) = ctl.set_bias_tee_gpio(pin, false) {
                    warn!("failed to deactivate bias tee: {}", e);
                }
            }
            if let Err(e) = ctl.deinit_baseband() {
                warn!("failed to power down baseband: {}", e);
            }
        }
        self.softagc.uninit();
    }
}

impl Drop for DevInner {
    fn drop(&mut self) {
        self.softagc.uninit();
    }
}
