// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{error, fmt, result};

/// A result of a function that may return a `RtlsdrError`.
pub type Result<T> = result::Result<T, RtlsdrError>;

/// EEPROM access failures, kept apart so callers can tell the
/// "no EEPROM" case from a plain transfer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EepromError {
    NoEeprom,
    SizeExceeded,
    InvalidHandle,
}

impl fmt::Display for EepromError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EepromError::NoEeprom => write!(f, "no EEPROM found"),
            EepromError::SizeExceeded => write!(f, "EEPROM size exceeded"),
            EepromError::InvalidHandle => write!(f, "invalid EEPROM handle"),
        }
    }
}

#[derive(Debug)]
pub enum RtlsdrError {
    /// Propagated from the USB transport.
    Usb(rusb::Error),
    /// No matching device at the requested index.
    NoDevice,
    /// The device disappeared while streaming.
    DeviceLost,
    /// Caller lacks device-access rights; the remedy (udev rules) is external.
    AccessDenied,
    /// Out-of-range argument (sample rate, GPIO pin, option string, ...).
    InvalidArgument(String),
    Eeprom(EepromError),
    /// Tuner-specific operation on an incompatible tuner.
    NotSupported(&'static str),
    RtlsdrErr(String),
}

impl fmt::Display for RtlsdrError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RtlsdrError::Usb(e) => e.fmt(f),
            RtlsdrError::NoDevice => write!(f, "no device found"),
            RtlsdrError::DeviceLost => write!(f, "device lost"),
            RtlsdrError::AccessDenied => write!(
                f,
                "access denied; please fix the device permissions, e.g. \
                 by installing the udev rules file rtl-sdr.rules"
            ),
            RtlsdrError::InvalidArgument(s) => write!(f, "invalid argument: {}", s),
            RtlsdrError::Eeprom(e) => e.fmt(f),
            RtlsdrError::NotSupported(op) => {
                write!(f, "operation not supported by this tuner: {}", op)
            }
            RtlsdrError::RtlsdrErr(s) => s.fmt(f),
        }
    }
}

impl error::Error for RtlsdrError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            RtlsdrError::Usb(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusb::Error> for RtlsdrError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::NoDevice => RtlsdrError::NoDevice,
            rusb::Error::Access => RtlsdrError::AccessDenied,
            other => RtlsdrError::Usb(other),
        }
    }
}

impl From<EepromError> for RtlsdrError {
    fn from(e: EepromError) -> Self {
        RtlsdrError::Eeprom(e)
    }
}
