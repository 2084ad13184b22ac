//! Histogram-based software AGC running in the sample-delivery path.
//!
//! The measurement runs on the streaming thread; the actual tuner gain
//! write happens on a dedicated worker so the delivery callback never
//! blocks on a (possibly slow) I2C transaction.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SoftAgcMode {
    /// Disabled.
    Off = 0,
    /// Run on start and on relevant retunes, then get out of the way.
    OnChange = 1,
    /// Stay active but only ever attenuate after the initial control.
    AutoAtten = 2,
    /// Stay active, attenuate and (eventually) re-gain.
    Auto = 3,
}

impl SoftAgcMode {
    pub fn from_u8(v: u8) -> SoftAgcMode {
        match v {
            1 => SoftAgcMode::OnChange,
            2 => SoftAgcMode::AutoAtten,
            3 => SoftAgcMode::Auto,
            _ => SoftAgcMode::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SoftAgcState {
    Off = 0,
    On = 1,
    ResetCont = 2,
    Reset = 3,
    Init = 4,
}

impl SoftAgcState {
    fn from_u8(v: u8) -> SoftAgcState {
        match v {
            1 => SoftAgcState::On,
            2 => SoftAgcState::ResetCont,
            3 => SoftAgcState::Reset,
            4 => SoftAgcState::Init,
            _ => SoftAgcState::Off,
        }
    }
}

#[derive(Debug, Default)]
struct Measure {
    remaining_scan_sps: i64,
    num_in_histo: i64,
    histo: [i64; 16],
    gain_idx: usize,
    gains: Vec<i32>,
}

#[derive(Debug)]
struct Params {
    scan_time_ms: f32,
    dead_time_ms: f32,
    scan_time_sps: i64,
    dead_time_sps: i64,
}

#[derive(Debug, Default)]
struct Command {
    exit: bool,
    change_gain: bool,
    new_gain: i32,
}

#[derive(Debug)]
pub(crate) struct SoftAgc {
    mode: AtomicU8,
    state: AtomicU8,
    params: Mutex<Params>,
    measure: Mutex<Measure>,
    /// Samples still to drop after a gain change; `i64::MAX` means "until
    /// the worker reports the gain applied".
    remaining_dead_sps: AtomicI64,
    dead_time_sps: AtomicI64,
    command: Mutex<Command>,
    cond: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SoftAgc {
    pub fn new() -> SoftAgc {
        SoftAgc {
            mode: AtomicU8::new(SoftAgcMode::Off as u8),
            state: AtomicU8::new(SoftAgcState::Off as u8),
            params: Mutex::new(Params {
                scan_time_ms: 100.0,
                dead_time_ms: 1.0,
                scan_time_sps: 0,
                dead_time_sps: 0,
            }),
            measure: Mutex::new(Measure::default()),
            remaining_dead_sps: AtomicI64::new(0),
            dead_time_sps: AtomicI64::new(0),
            command: Mutex::new(Command::default()),
            cond: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> SoftAgcMode {
        SoftAgcMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    pub fn set_mode(&self, mode: SoftAgcMode) {
        self.mode.store(mode as u8, Ordering::SeqCst);
        self.set_state(if mode == SoftAgcMode::Off {
            SoftAgcState::Off
        } else {
            SoftAgcState::Init
        });
    }

    pub(crate) fn state(&self) -> SoftAgcState {
        SoftAgcState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SoftAgcState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.state() != SoftAgcState::Off
    }

    pub fn set_scan_time_ms(&self, ms: f32) {
        self.params.lock().unwrap().scan_time_ms = ms;
    }

    pub fn set_dead_time_ms(&self, ms: f32) {
        self.params.lock().unwrap().dead_time_ms = ms;
    }

    /// Option-string application resets both timings before per-key parsing.
    pub fn reset_timing_defaults(&self) {
        let mut p = self.params.lock().unwrap();
        p.scan_time_ms = 100.0;
        p.dead_time_ms = 100.0;
    }

    /// Forget the sample-based timings so they are recomputed for a new rate.
    pub fn invalidate_timing(&self) {
        let mut p = self.params.lock().unwrap();
        p.scan_time_sps = 0;
        p.dead_time_sps = 0;
    }

    /// Re-arm the measurement after a relevant control change.
    /// Returns true if soft AGC is configured at all.
    pub fn reactivate(&self) -> bool {
        let mode = self.mode();
        if mode == SoftAgcMode::Off {
            return false;
        }
        if self.state() != SoftAgcState::Off && mode >= SoftAgcMode::Auto {
            // already running full time, nothing to do
            debug!("soft AGC already active in state {:?}", self.state());
        } else {
            self.set_state(SoftAgcState::Reset);
            debug!("soft AGC re-armed");
        }
        true
    }

    /// Spawn the gain worker if it is not running. `apply` performs the
    /// actual tuner gain write (and may block on the control plane).
    pub fn ensure_worker<F>(agc: &std::sync::Arc<SoftAgc>, apply: F)
    where
        F: Fn(i32) + Send + 'static,
    {
        let mut slot = agc.worker.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let me = std::sync::Arc::clone(agc);
        *slot = Some(std::thread::spawn(move || me.worker_loop(apply)));
    }

    fn worker_loop<F: Fn(i32)>(&self, apply: F) {
        loop {
            let gain = {
                let mut cmd = self.command.lock().unwrap();
                while !cmd.exit && !cmd.change_gain {
                    cmd = self.cond.wait(cmd).unwrap();
                }
                if cmd.exit {
                    return;
                }
                cmd.change_gain = false;
                cmd.new_gain
            };
            apply(gain);
            self.remaining_dead_sps
                .store(self.dead_time_sps.load(Ordering::SeqCst), Ordering::SeqCst);
            debug!("soft AGC worker applied gain {} /10 dB", gain);
        }
    }

    fn signal_gain(&self, gain: i32) {
        let mut cmd = self.command.lock().unwrap();
        cmd.new_gain = gain;
        cmd.change_gain = true;
        self.cond.notify_one();
    }

    pub fn uninit(&self) {
        let handle = {
            let mut slot = self.worker.lock().unwrap();
            slot.take()
        };
        if let Some(handle) = handle {
            {
                let mut cmd = self.command.lock().unwrap();
                cmd.exit = true;
                self.cond.notify_one();
            }
            let _ = handle.join();
        }
    }

    /// Filter one delivered block. Returns whether to forward it to the
    /// user callback. `query` supplies the tuner gain table and the
    /// configured sample rate when a measurement (re)starts.
    pub fn process<Q>(&self, buf: &[u8], mut query: Q) -> bool
    where
        Q: FnMut() -> (Vec<i32>, u32),
    {
        match self.state() {
            SoftAgcState::Off => return true,
            SoftAgcState::Init => {
                // swallow the first block entirely
                self.set_state(SoftAgcState::Reset);
                return false;
            }
            SoftAgcState::Reset => {
                let (gains, rate) = query();
                if gains.is_empty() || rate == 0 {
                    // device is not fully configured yet
                    return true;
                }
                if gains.len() == 1 {
                    info!("soft AGC: tuner has a single gain value, deactivating");
                    self.mode.store(SoftAgcMode::Off as u8, Ordering::SeqCst);
                    self.set_state(SoftAgcState::Off);
                    return true;
                }

                {
                    let mut p = self.params.lock().unwrap();
                    if p.scan_time_sps == 0 {
                        p.scan_time_sps = (p.scan_time_ms * rate as f32 / 1000.0) as i64;
                    }
                    if p.dead_time_sps == 0 {
                        p.dead_time_sps = (p.dead_time_ms * rate as f32 / 1000.0) as i64;
                    }
                    self.dead_time_sps.store(p.dead_time_sps, Ordering::SeqCst);

                    let mut m = self.measure.lock().unwrap();
                    m.remaining_scan_sps = p.scan_time_sps;
                    m.num_in_histo = 0;
                    m.histo = [0; 16];
                    m.gain_idx = gains.len() - 1;
                    let max_gain = gains[m.gain_idx];
                    m.gains = gains;

                    // hold everything back until the worker reports in
                    self.remaining_dead_sps.store(i64::MAX, Ordering::SeqCst);
                    self.signal_gain(max_gain);
                    debug!("soft AGC: starting scan at maximum gain {} /10 dB", max_gain);
                }

                self.set_state(SoftAgcState::ResetCont);
                return false;
            }
            // measurement continues below in both states
            SoftAgcState::ResetCont | SoftAgcState::On => {}
        }

        let scanning = self.state() == SoftAgcState::ResetCont;
        let keep_while_measuring = !scanning;

        let mut buf = buf;
        let dead = self.remaining_dead_sps.load(Ordering::SeqCst);
        if dead == i64::MAX {
            return false;
        }
        if dead > 0 {
            let samples = (buf.len() / 2) as i64;
            if dead >= samples {
                self.remaining_dead_sps.fetch_sub(samples, Ordering::SeqCst);
                return keep_while_measuring;
            }
            buf = &buf[(2 * dead) as usize..];
            self.remaining_dead_sps.store(0, Ordering::SeqCst);
        }

        let mut m = self.measure.lock().unwrap();

        // arrived at the lowest gain: the initial control is as good as done
        if m.gain_idx == 0 && scanning {
            self.set_state(SoftAgcState::Off);
            info!("soft AGC: reached lowest gain, finishing");
            return true;
        }

        for &b in buf {
            let bin = if b >= 128 {
                (b - 128) >> 3
            } else {
                (127 - b) >> 3
            };
            m.histo[bin as usize] += 1;
        }
        m.num_in_histo += buf.len() as i64;
        m.remaining_scan_sps -= (buf.len() / 2) as i64;

        // tail-cumulative distribution over the top bins
        let mut distrib = [0i64; 16];
        distrib[15] = m.histo[15];
        for k in (8..15).rev() {
            distrib[k] = distrib[k + 1] + m.histo[k];
        }

        let n = m.num_in_histo;
        let oversteered = 64 * distrib[15] >= n  /* > 1.56 % near clipping */
            || 16 * distrib[12] >= n             /* > 6.25 % above 0.75 */
            || 4 * distrib[8] >= n; /* > 25 % above 0.5 */

        if oversteered {
            if m.gain_idx > 0 {
                self.remaining_dead_sps.store(i64::MAX, Ordering::SeqCst);
                let scan = self.params.lock().unwrap().scan_time_sps;
                m.remaining_scan_sps = scan;
                m.num_in_histo = 0;
                m.histo = [0; 16];
                m.gain_idx -= 1;
                let gain = m.gains[m.gain_idx];
                self.signal_gain(gain);
                debug!("soft AGC: oversteer, stepping down to {} /10 dB", gain);
            }
            return keep_while_measuring;
        }

        if m.remaining_scan_sps < 0 {
            m.remaining_scan_sps = 0;
            match self.mode() {
                SoftAgcMode::Off | SoftAgcMode::OnChange => {
                    if matches!(self.state(), SoftAgcState::Off | SoftAgcState::ResetCont) {
                        self.set_state(SoftAgcState::Off);
                        info!("soft AGC: initial control finished");
                    }
                    return true;
                }
                SoftAgcMode::AutoAtten | SoftAgcMode::Auto => {
                    self.set_state(SoftAgcState::On);
                    return true;
                }
            }
        }

        keep_while_measuring
    }
}

impl Drop for SoftAgc {
    fn drop(&mut self) {
        self.uninit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gains() -> Vec<i32> {
        vec![0, 90, 190, 290, 400, 496]
    }

    #[test]
    fn init_swallows_first_block_then_requests_max_gain() {
        let agc = SoftAgc::new();
        agc.set_mode(SoftAgcMode::OnChange);
        assert_eq!(agc.state(), SoftAgcState::Init);

        let block = vec![128u8; 512];
        assert!(!agc.process(&block, || (gains(), 2_048_000)));
        assert_eq!(agc.state(), SoftAgcState::Reset);

        assert!(!agc.process(&block, || (gains(), 2_048_000)));
        assert_eq!(agc.state(), SoftAgcState::ResetCont);
        let cmd = agc.command.lock().unwrap();
        assert!(cmd.change_gain);
        assert_eq!(cmd.new_gain, 496);
    }

    #[test]
    fn single_gain_tuner_disables_soft_agc() {
        let agc = SoftAgc::new();
        agc.set_mode(SoftAgcMode::Auto);
        let block = vec![128u8; 512];
        assert!(!agc.process(&block, || (vec![42], 2_048_000))); // Init
        assert!(agc.process(&block, || (vec![42], 2_048_000))); // Reset -> off
        assert_eq!(agc.mode(), SoftAgcMode::Off);
        assert_eq!(agc.state(), SoftAgcState::Off);
    }

    #[test]
    fn all_loud_block_triggers_gain_step_down() {
        let agc = SoftAgc::new();
        agc.set_mode(SoftAgcMode::OnChange);
        let quiet = vec![128u8; 512];
        let loud = vec![0xffu8; 4096];

        assert!(!agc.process(&quiet, || (gains(), 2_048_000))); // Init
        assert!(!agc.process(&quiet, || (gains(), 2_048_000))); // Reset
                                                                // pretend the worker applied the gain
        agc.remaining_dead_sps.store(0, Ordering::SeqCst);

        assert!(!agc.process(&loud, || (gains(), 2_048_000)));
        let m = agc.measure.lock().unwrap();
        assert_eq!(m.gain_idx, gains().len() - 2);
        assert_eq!(agc.remaining_dead_sps.load(Ordering::SeqCst), i64::MAX);
        let cmd = agc.command.lock().unwrap();
        assert_eq!(cmd.new_gain, 400);
    }

    #[test]
    fn quiet_scan_completes_and_passes_samples() {
        let agc = SoftAgc::new();
        agc.set_mode(SoftAgcMode::OnChange);
        agc.set_scan_time_ms(1.0);
        let quiet = vec![128u8; 8192];

        assert!(!agc.process(&quiet, || (gains(), 2_048_000))); // Init
        assert!(!agc.process(&quiet, || (gains(), 2_048_000))); // Reset
        agc.remaining_dead_sps.store(0, Ordering::SeqCst);

        // 1 ms at 2.048 MS/s = 2048 samples; one 4096-sample block
        // overshoots the scan window and is forwarded
        assert!(agc.process(&quiet, || (gains(), 2_048_000)));
        assert_eq!(agc.state(), SoftAgcState::Off);
        // subsequent blocks flow through untouched
        assert!(agc.process(&quiet, || (gains(), 2_048_000)));
    }

    #[test]
    fn auto_mode_keeps_measuring_after_scan() {
        let agc = SoftAgc::new();
        agc.set_mode(SoftAgcMode::Auto);
        agc.set_scan_time_ms(1.0);
        let quiet = vec![128u8; 8192];

        assert!(!agc.process(&quiet, || (gains(), 2_048_000)));
        assert!(!agc.process(&quiet, || (gains(), 2_048_000)));
        agc.remaining_dead_sps.store(0, Ordering::SeqCst);
        assert!(agc.process(&quiet, || (gains(), 2_048_000)));
        assert_eq!(agc.state(), SoftAgcState::On);
        // still watching for oversteer
        let loud = vec![0xffu8; 4096];
        assert!(agc.process(&loud, || (gains(), 2_048_000)));
        let m = agc.measure.lock().unwrap();
        assert_eq!(m.gain_idx, gains().len() - 2);
    }

    #[test]
    fn histogram_bins_use_magnitude_of_biased_samples() {
        let agc = SoftAgc::new();
        agc.set_mode(SoftAgcMode::OnChange);
        let quiet = vec![128u8; 16];
        assert!(!agc.process(&quiet, || (gains(), 2_048_000)));
        assert!(!agc.process(&quiet, || (gains(), 2_048_000)));
        agc.remaining_dead_sps.store(0, Ordering::SeqCst);

        // 0x00 and 0xff both land in the top magnitude bin; keep the block
        // large enough that two outliers do not count as oversteer
        let mut block = vec![128u8; 256];
        block[0] = 0x00;
        block[1] = 0xff;
        agc.process(&block, || (gains(), 2_048_000));
        let m = agc.measure.lock().unwrap();
        assert_eq!(m.histo[15], 2);
        assert_eq!(m.histo[0], 254);
    }
}
