//! Colon-separated option string, applied at the first stream start or
//! explicitly, plus the environment override that feeds it.

use std::sync::Arc;

use log::{info, warn};

use crate::error::Result;
use crate::error::RtlsdrError;
use crate::rtlsdr::DevInner;
use crate::softagc::SoftAgcMode;
use crate::tuners::TunerId;
use crate::{DsMode, TunerGain};

/// Parse a number with an optional base prefix (`d` decimal, `x` hex,
/// `b` binary) and `'`/`.`/`_` accepted as digit separators.
pub(crate) fn parse_num(s: &str) -> i64 {
    let s = s.trim();
    let mut chars = s.chars().peekable();
    let base: i64 = match chars.peek() {
        Some('d') => {
            chars.next();
            10
        }
        Some('x') => {
            chars.next();
            16
        }
        Some('b') => {
            chars.next();
            2
        }
        _ => 10,
    };
    let sign = if chars.peek() == Some(&'-') {
        chars.next();
        -1
    } else {
        1
    };

    let mut val: i64 = 0;
    for c in chars {
        let digit = match c {
            '0'..='9' => c as i64 - '0' as i64,
            'A'..='F' => c as i64 - 'A' as i64 + 10,
            'a'..='f' => c as i64 - 'a' as i64 + 10,
            '\'' | '.' | '_' => continue,
            _ => break,
        };
        if digit >= base {
            break;
        }
        val = val * base + digit;
    }
    val * sign
}

/// Parse a frequency with the standard `k`/`M`/`G` suffixes.
pub(crate) fn parse_freq(s: &str) -> f64 {
    let s = s.trim();
    if s.is_empty() {
        return 0.0;
    }
    let last = s.chars().last().unwrap_or('\0');
    let mult = match last {
        'k' | 'K' => 1e3,
        'm' | 'M' => 1e6,
        'g' | 'G' => 1e9,
        _ => return s.parse::<f64>().unwrap_or(0.0),
    };
    s[..s.len() - 1].trim().parse::<f64>().unwrap_or(0.0) * mult
}

pub fn get_opt_help(long_info: bool) -> &'static str {
    if long_info {
        "\t[-O\tset RTL driver options separated with ':', e.g. -O 'bc=30000:agc=0' ]\n\
         \t\tf=<freqHz>            set tuner frequency\n\
         \t\tbw=<bw_in_kHz>        set tuner bandwidth\n\
         \t\tbc=<if_in_Hz>         set band center relative to the complex-base-band '0' frequency\n\
         \t\tsb=<sideband>         set tuner sideband/mirror: 'L' or '0' for lower side band,\n\
         \t\t                        'U' or '1' for upper side band. default for R820T/2: 'L'\n\
         \t\tagc=<tuner_gain_mode> activates tuner agc with '1'. deactivates with '0'\n\
         \t\tgain=<tenth_dB>       set tuner gain. 400 for 40.0 dB\n\
         \t\tifm=<tuner_if_mode>   set R820T/2 tuner's variable-gain-amplifier (VGA):\n\
         \t\t                        0: activate agc controlled from RTL2832's feedback\n\
         \t\t                        around 0: set gain in 10th dB. 408 for +40.8 dB\n\
         \t\t                        5000+val: set gain to val in 10th dB. 5408 for +40.8 dB\n\
         \t\t                        10000+idx: set gain idx 0 .. 15: 10015 for maximum gain\n\
         \t\tdagc=<rtl_agc>        set RTL2832's digital agc (after ADC). 1 to activate. 0 to deactivate\n\
         \t\tds=<direct_sampling>  deactivate/bypass tuner with 1\n\
         \t\tdm=<ds_mode_thresh>   set dynamic direct sampling mode or threshold frequency:\n\
         \t\t                        0: use I & Q; 1: use I; 2: use Q; 3: use I below threshold frequency;\n\
         \t\t                        4: use Q below threshold frequency\n\
         \t\t                        other values set the threshold frequency\n\
         \t\tharm=<Nth_harmonic>   R820T/2: use Nth harmonic for frequencies above 1.76 GHz\n\
         \t\tvcocmin=<current>     set R820T/2 VCO current min: 0..7: higher value is more current\n\
         \t\tvcocmax=<current>     set R820T/2 VCO current max: 0..7\n\
         \t\tvcoalgo=<algo>        set R820T/2 VCO algorithm. 0: default. 1: with vcomax=3.9G\n\
         \t\tTp=<gpio_pin>         set GPIO pin for Bias T, default =0 for rtl-sdr.com compatible V3\n\
         \t\tT=<bias_tee>          1 activates power at antenna on some dongles, e.g. rtl-sdr.com's V3\n\
         \t\tsoftagc=<mode>        0: off; 1: on-change; 2: auto-attenuate; 3: auto\n\
         \t\tsoftscantime=<ms>     soft AGC scan duration per gain level\n\
         \t\tsoftdeadtime=<ms>     soft AGC dead time after a gain change\n\
         \t\tport=<udp_port>       1 or port number activates the UDP control server. default port: 32323\n"
    } else {
        "\t[-O\tset RTL options string separated with ':', e.g. -O 'bc=30000:agc=0' ]\n\
         \t\tverbose:f=<freqHz>:bw=<bw_in_kHz>:bc=<if_in_Hz>:sb=<sideband>\n\
         \t\tagc=<tuner_gain_mode>:gain=<tenth_dB>:ifm=<tuner_if_mode>:dagc=<rtl_agc>\n\
         \t\tharm=<harmonic>:ds=<direct_sampling>:dm=<ds_mode_thresh>\n\
         \t\tvcocmin=<c>:vcocmax=<c>:vcoalgo=<a>\n\
         \t\tTp=<gpio_pin>:T=<bias_tee>:softagc=<mode>:port=<udp_port>\n"
    }
}

/// Apply a colon- (or comma-) separated, case-sensitive `key=value` string.
/// Unknown keys are reported but do not stop the remaining options.
pub(crate) fn set_opt_string(inner: &Arc<DevInner>, opts: &str, mut verbose: bool) -> Result<()> {
    inner.mark_set_opt_called();

    // option application resets the soft AGC timings
    inner.softagc.reset_timing_defaults();

    let mut ret_all: Result<()> = Ok(());
    let mut udp_port: Option<u16> = None;

    for part in opts.split(|c| c == ':' || c == ',') {
        let ret: Result<()> = if part == "verbose" || part == "v" {
            verbose = true;
            inner.ctl().verbose = true;
            Ok(())
        } else if let Some(v) = part.strip_prefix("f=") {
            let freq = (parse_freq(v) + 0.5) as u64;
            if verbose {
                info!("option frequency {} Hz", freq);
            }
            inner.ctl().set_center_freq64(freq)
        } else if let Some(v) = part.strip_prefix("bw=") {
            let bw = v.trim().parse::<u32>().unwrap_or(0) * 1000;
            if verbose {
                info!("option bandwidth {} Hz", bw);
            }
            inner.set_tuner_bandwidth(bw).map(|_| ())
        } else if let Some(v) = part.strip_prefix("bc=") {
            let bc = (parse_freq(v) + 0.5) as i32;
            if verbose {
                info!("option band center {} Hz", bc);
            }
            inner.ctl().set_tuner_band_center(bc)
        } else if let Some(v) = part.strip_prefix("sb=") {
            let sideband = match v {
                "L" | "l" | "0" => false,
                "U" | "u" | "1" => true,
                other => other.parse::<i32>().unwrap_or(0) != 0,
            };
            if verbose {
                info!("option sideband {}", if sideband { "upper" } else { "lower" });
            }
            inner.ctl().set_tuner_sideband(sideband)
        } else if let Some(v) = part.strip_prefix("agc=") {
            // agc=1 activates the tuner AGC, i.e. manual off
            let manual = v.trim().parse::<i32>().unwrap_or(0) == 0;
            if verbose {
                info!("option tuner gain mode, manual={}", manual);
            }
            inner.set_tuner_gain_mode(manual)
        } else if let Some(v) = part.strip_prefix("gain=") {
            let gain = v.trim().parse::<i32>().unwrap_or(0);
            if verbose {
                info!("option tuner gain {} /10 dB", gain);
            }
            inner.ctl().set_tuner_gain(TunerGain::Manual(gain))
        } else if let Some(v) = part.strip_prefix("agcv=") {
            // previous name of the ifm= option
            let if_mode = v.trim().parse::<i32>().unwrap_or(0).max(0);
            inner.ctl().set_tuner_if_mode(if_mode)
        } else if let Some(v) = part.strip_prefix("ifm=") {
            let if_mode = v.trim().parse::<i32>().unwrap_or(0);
            if verbose {
                info!("option tuner IF mode {}", if_mode);
            }
            inner.ctl().set_tuner_if_mode(if_mode)
        } else if let Some(v) = part.strip_prefix("dagc=") {
            let on = v.trim().parse::<i32>().unwrap_or(0) != 0;
            if verbose {
                info!("option digital AGC {}", on);
            }
            inner.ctl().set_agc_mode(on)
        } else if let Some(v) = part.strip_prefix("ds=") {
            let on = v.trim().parse::<u8>().unwrap_or(0);
            if verbose {
                info!("option direct sampling {}", on);
            }
            inner.ctl().set_direct_sampling(on)
        } else if let Some(v) = part.strip_prefix("dm=") {
            let dm = parse_freq(v) as u32;
            let mut ctl = inner.ctl();
            let (mode, threshold) = if dm <= 4 {
                (DsMode::from_u32(dm), ctl.ds_threshold)
            } else {
                (ctl.ds_mode, dm)
            };
            if verbose {
                info!("option DS mode {:?} threshold {} Hz", mode, threshold);
            }
            ctl.set_ds_mode(mode, threshold)
        } else if let Some(v) = part.strip_prefix("harm=") {
            let harmonic = v.trim().parse::<u32>().unwrap_or(0);
            if verbose {
                info!("option harmonic reception {}", harmonic);
            }
            inner.ctl().set_harmonic_rx(harmonic)
        } else if let Some(v) = part.strip_prefix("vcocmin=") {
            match v.trim().parse::<u8>() {
                // stored inverted: programmed value is 7 - current
                Ok(c) if c <= 7 => inner.ctl().set_vco_settings(Some(7 - c), None, None),
                _ => Err(RtlsdrError::InvalidArgument(
                    "vcocmin: valid range 0..7".to_string(),
                )),
            }
        } else if let Some(v) = part.strip_prefix("vcocmax=") {
            match v.trim().parse::<u8>() {
                Ok(c) if c <= 7 => inner.ctl().set_vco_settings(None, Some(7 - c), None),
                _ => Err(RtlsdrError::InvalidArgument(
                    "vcocmax: valid range 0..7".to_string(),
                )),
            }
        } else if let Some(v) = part.strip_prefix("vcoalgo=") {
            match v.trim().parse::<u8>() {
                Ok(algo) if algo <= 2 => {
                    // earlier drivers clobbered the VCO current maximum
                    // here; only the algorithm is changed now
                    warn!(
                        "vcoalgo={}: selecting VCO algorithm only, current bracket kept",
                        algo
                    );
                    inner.ctl().set_vco_settings(None, None, Some(algo))
                }
                _ => Err(RtlsdrError::InvalidArgument(
                    "vcoalgo: valid range 0..2".to_string(),
                )),
            }
        } else if let Some(v) = part
            .strip_prefix("Tp=")
            .or_else(|| part.strip_prefix("tp="))
            .or_else(|| part.strip_prefix("TP="))
        {
            match v.trim().parse::<u8>() {
                Ok(pin) if pin < 8 => {
                    if verbose {
                        info!("option bias tee GPIO pin {}", pin);
                    }
                    inner.ctl().biast_gpio_pin = pin;
                    Ok(())
                }
                _ => Err(RtlsdrError::InvalidArgument(
                    "Tp: GPIO pin must be 0..7".to_string(),
                )),
            }
        } else if let Some(v) = part.strip_prefix("T=").or_else(|| part.strip_prefix("t=")) {
            let on = v.trim().parse::<i32>().unwrap_or(0) != 0;
            if verbose {
                info!("option bias tee {}", on);
            }
            inner.set_bias_tee(on)
        } else if let Some(v) = part.strip_prefix("softagc=") {
            let mode = SoftAgcMode::from_u8(v.trim().parse::<u8>().unwrap_or(0));
            if verbose {
                info!("option soft AGC mode {:?}", mode);
            }
            inner.softagc.set_mode(mode);
            Ok(())
        } else if let Some(v) = part.strip_prefix("softscantime=") {
            let ms = v.trim().parse::<f32>().unwrap_or(100.0);
            inner.softagc.set_scan_time_ms(ms);
            Ok(())
        } else if let Some(v) = part.strip_prefix("softdeadtime=") {
            let ms = v.trim().parse::<f32>().unwrap_or(100.0);
            inner.softagc.set_dead_time_ms(ms);
            Ok(())
        } else if part == "softverbose" {
            // soft AGC chatter rides on the normal log levels
            Ok(())
        } else if let Some(v) = part.strip_prefix("port=") {
            let mut port = v.trim().parse::<u32>().unwrap_or(0);
            if port == 1 {
                port = 32323;
            }
            udp_port = Some((port & 0xffff) as u16);
            Ok(())
        } else if part.is_empty() {
            Ok(())
        } else {
            Err(RtlsdrError::InvalidArgument(format!(
                "unknown option '{}'",
                part
            )))
        };

        if let Err(e) = ret {
            warn!("option '{}': {}", part, e);
            ret_all = Err(e);
        }
    }

    if inner.softagc.is_active() {
        inner.softagc_apply_worker();
        // soft AGC needs manual gain mode
        let _ = inner.set_tuner_gain_mode(true);
    }

    if let Some(port) = udp_port {
        let is_r820t = inner.ctl().tuner_type == TunerId::R820t;
        if port != 0 && is_r820t {
            crate::udp_server::start(inner, port);
        }
    }

    ret_all
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_num_bases_and_separators() {
        assert_eq!(parse_num("123"), 123);
        assert_eq!(parse_num("d123"), 123);
        assert_eq!(parse_num("x1F"), 0x1f);
        assert_eq!(parse_num("xff"), 255);
        assert_eq!(parse_num("b1010"), 10);
        assert_eq!(parse_num("-42"), -42);
        assert_eq!(parse_num("1'000'000"), 1_000_000);
        assert_eq!(parse_num("1_000"), 1000);
        assert_eq!(parse_num(""), 0);
    }

    #[test]
    fn parse_num_stops_at_invalid_digit() {
        assert_eq!(parse_num("12z9"), 12);
        // '9' is not a binary digit
        assert_eq!(parse_num("b1019"), 5);
    }

    #[test]
    fn parse_freq_suffixes() {
        assert_eq!(parse_freq("100"), 100.0);
        assert_eq!(parse_freq("1k"), 1_000.0);
        assert_eq!(parse_freq("1.5M"), 1_500_000.0);
        assert_eq!(parse_freq("2G"), 2_000_000_000.0);
        assert_eq!(parse_freq("97.3m"), 97_300_000.0);
        assert_eq!(parse_freq(""), 0.0);
    }
}
