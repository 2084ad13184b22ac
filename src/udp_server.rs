//! UDP control server: a line-based text protocol for poking the tuner
//! while a stream is running. Started on demand by the `port=` option.

use std::net::UdpSocket;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{info, warn};

use crate::options::{parse_freq, parse_num};
use crate::rtlsdr::DevInner;
use crate::TunerGain;

const RX_BUFLEN: usize = 1024;

/// Spawn the server thread; it lives until the device goes away.
pub(crate) fn start(inner: &Arc<DevInner>, port: u16) {
    if inner.udp_started.swap(true, Ordering::SeqCst) {
        return;
    }
    let weak = Arc::downgrade(inner);
    std::thread::spawn(move || serve(weak, port));
    info!("UDP control server started on port {}", port);
}

fn serve(weak: Weak<DevInner>, port: u16) {
    let socket = match UdpSocket::bind(("0.0.0.0", port)) {
        Ok(s) => s,
        Err(e) => {
            warn!("could not bind UDP control server on port {}: {}", port, e);
            return;
        }
    };
    // wake up periodically so the thread notices a closed device
    if socket
        .set_read_timeout(Some(Duration::from_secs(1)))
        .is_err()
    {
        return;
    }

    let mut buf = [0u8; RX_BUFLEN];
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match socket.recv_from(&mut buf) {
            Ok((len, peer)) => {
                let message = String::from_utf8_lossy(&buf[..len]).to_string();
                let reply = handle_command(&inner, message.trim());
                let _ = socket.send_to(reply.as_bytes(), peer);
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("UDP control server shutting down: {}", e);
                return;
            }
        }
    }
}

const HELP_TEXT: &str = "g <register>                  # get content of I2C register\n\
s <register> <value> [<mask>] # set content\n\
S <register> <value> [<mask>] # set content - keeping value in future\n\
i <IFfrequency>  # set IF frequency once [0 .. 28'800'000], < 0 to reset\n\
I <IFfrequency>  # set IF frequency permanent\n\
f <RFfrequency>  # set center frequency\n\
b <bandwidth>    # set tuner bandwidth\n\
c <frequency>    # set tuner bw center in output [-1'600'000 .. 1'600'000]\n\
v <sideband>     # set tuner sideband: 0 for LSB, 1 for USB\n\
a <tunerIFmode>  # set VGA: 0 for auto; in tenth dB or 10000+idx\n\
m <tuner gain>   # set tuner gain\n\
M <gainMode>     # 0 .. 3: digital rtl agc (0..1) * 2 + tuner agc (0..1)\n";

/// Execute one command line. Replies are `! <data>` on success and `?` on
/// parse failure.
fn handle_command(inner: &Arc<DevInner>, line: &str) -> String {
    let mut tokens = line.split_whitespace();
    let Some(cmd) = tokens.next() else {
        return "?\n".to_string();
    };

    match cmd {
        "g" | "s" | "S" => {
            let Some(reg) = tokens.next().map(parse_num) else {
                return "?\n".to_string();
            };
            if !(0..=32).contains(&reg) || (cmd != "g" && reg < 5) {
                return "?\n".to_string();
            }
            let reg = reg as u8;

            if cmd == "g" {
                match inner.ctl().get_tuner_i2c_register(reg as usize) {
                    Ok(val) => format!("! {} = x{:02X} = b{:08b}\n", val, val, val),
                    Err(_) => "?\n".to_string(),
                }
            } else {
                let Some(val) = tokens.next().map(parse_num) else {
                    return "?\n".to_string();
                };
                let mask = tokens.next().map(parse_num).unwrap_or(0xff) as u8;
                let r = if cmd == "s" {
                    inner
                        .ctl()
                        .set_tuner_i2c_register(reg, mask, (val & 0xff) as u8)
                } else {
                    // values above 0xff clear the override
                    inner.ctl().set_tuner_i2c_override(reg, mask, val as u32)
                };
                match r {
                    Ok(()) => "! 0\n".to_string(),
                    Err(_) => "?\n".to_string(),
                }
            }
        }
        "i" | "I" => {
            let Some(freq) = tokens.next() else {
                return "?\n".to_string();
            };
            let freq = parse_freq(freq) as i64;
            match inner.ctl().set_if_override(freq, cmd == "I") {
                Ok(()) => "! 0\n".to_string(),
                Err(_) => "?\n".to_string(),
            }
        }
        "f" => {
            let Some(v) = tokens.next() else {
                return "?\n".to_string();
            };
            let freq = (parse_freq(v) + 0.5) as u64;
            match inner.ctl().set_center_freq64(freq) {
                Ok(()) => "! 0\n".to_string(),
                Err(_) => "?\n".to_string(),
            }
        }
        "b" => {
            let Some(v) = tokens.next() else {
                return "?\n".to_string();
            };
            let bw = parse_freq(v) as u32;
            match inner.set_tuner_bandwidth(bw) {
                Ok(applied) => format!("! {}\n", applied),
                Err(_) => "?\n".to_string(),
            }
        }
        "c" => {
            let Some(v) = tokens.next() else {
                return "?\n".to_string();
            };
            let bc = parse_freq(v) as i32;
            match inner.ctl().set_tuner_band_center(bc) {
                Ok(()) => "! 0\n".to_string(),
                Err(_) => "?\n".to_string(),
            }
        }
        "v" => {
            let Some(v) = tokens.next().map(parse_num) else {
                return "?\n".to_string();
            };
            match inner.ctl().set_tuner_sideband(v != 0) {
                Ok(()) => "! 0\n".to_string(),
                Err(_) => "?\n".to_string(),
            }
        }
        "a" => {
            let Some(v) = tokens.next().map(parse_num) else {
                return "?\n".to_string();
            };
            match inner.ctl().set_tuner_if_mode(v as i32) {
                Ok(()) => "! 0\n".to_string(),
                Err(_) => "?\n".to_string(),
            }
        }
        "m" => {
            let Some(v) = tokens.next().map(parse_num) else {
                return "?\n".to_string();
            };
            match inner.ctl().set_tuner_gain(TunerGain::Manual(v as i32)) {
                Ok(()) => "! 0\n".to_string(),
                Err(_) => "?\n".to_string(),
            }
        }
        "M" => {
            let Some(v) = tokens.next().map(parse_num) else {
                return "?\n".to_string();
            };
            let tuner_agc = v & 1 != 0;
            let rtl_agc = v & 2 != 0;
            let r1 = inner.set_tuner_gain_mode(!tuner_agc);
            let r2 = inner.ctl().set_agc_mode(rtl_agc);
            match (r1, r2) {
                (Ok(()), Ok(())) => "! 0\n".to_string(),
                _ => "?\n".to_string(),
            }
        }
        "h" => HELP_TEXT.to_string(),
        _ => "?\n".to_string(),
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn help_text_lists_every_command() {
        for cmd in ["g ", "s ", "S ", "i ", "f ", "b ", "c ", "v ", "a ", "m ", "M "] {
            assert!(
                super::HELP_TEXT.lines().any(|l| l.starts_with(cmd)),
                "missing help for '{}'",
                cmd
            );
        }
    }
}
