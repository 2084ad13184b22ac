//! Asynchronous streaming engine.
//!
//! A pool of bulk-transfer buffers is cycled against the sample endpoint on
//! the caller's thread; the user callback runs between transfers, so
//! `cancel_async` is always safe from inside the callback. Cancellation is
//! cooperative through the {INACTIVE, RUNNING, CANCELING} state machine.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Result, RtlsdrError};
use crate::rtlsdr::DevInner;

pub const DEFAULT_BUF_NUMBER: u32 = 15;
/* buf_len must be a multiple of 512; 16*32*512 = 81.92 ms at 3.2 MS/s */
pub const DEFAULT_BUF_LENGTH: u32 = 16 * 32 * 512;

/// One event-loop tick; a bulk timeout at this period is not an error.
const BULK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AsyncStatus {
    Inactive = 0,
    Canceling = 1,
    Running = 2,
}

#[derive(Debug)]
pub(crate) struct StreamState {
    status: AtomicU8,
    cancel: AtomicBool,
    xfer_errors: AtomicU32,
}

impl StreamState {
    pub fn new() -> StreamState {
        StreamState {
            status: AtomicU8::new(AsyncStatus::Inactive as u8),
            cancel: AtomicBool::new(false),
            xfer_errors: AtomicU32::new(0),
        }
    }

    pub fn status(&self) -> AsyncStatus {
        match self.status.load(Ordering::SeqCst) {
            1 => AsyncStatus::Canceling,
            2 => AsyncStatus::Running,
            _ => AsyncStatus::Inactive,
        }
    }

    /// INACTIVE -> RUNNING; fails when a stream is already active.
    pub fn try_start(&self) -> bool {
        self.cancel.store(false, Ordering::SeqCst);
        self.xfer_errors.store(0, Ordering::SeqCst);
        self.status
            .compare_exchange(
                AsyncStatus::Inactive as u8,
                AsyncStatus::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// RUNNING -> CANCELING, picked up by the event loop.
    pub fn request_cancel(&self) -> bool {
        if self
            .status
            .compare_exchange(
                AsyncStatus::Running as u8,
                AsyncStatus::Canceling as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.cancel.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn finish(&self) {
        self.status
            .store(AsyncStatus::Inactive as u8, Ordering::SeqCst);
    }
}

/// Run the streaming loop until cancelled or the device is lost.
///
/// Returns only once the engine is back in the INACTIVE state.
pub(crate) fn read_async(
    inner: &Arc<DevInner>,
    cb: &mut dyn FnMut(&[u8]),
    buf_num: u32,
    buf_len: u32,
) -> Result<()> {
    if !inner.stream.try_start() {
        return Err(RtlsdrError::InvalidArgument(
            "async read already active".to_string(),
        ));
    }

    let buf_num = if buf_num > 0 { buf_num } else { DEFAULT_BUF_NUMBER };
    // len must be a multiple of 512, else it is replaced by the default
    let buf_len = if buf_len > 0 && buf_len % 512 == 0 {
        buf_len
    } else {
        DEFAULT_BUF_LENGTH
    };
    debug!("streaming with {} buffers of {} bytes", buf_num, buf_len);

    // Zero-copy kernel-mapped buffers are not exposed by the transport
    // wrapper, so the whole pool comes from the heap.
    let mut pool: Vec<Vec<u8>> = (0..buf_num).map(|_| vec![0u8; buf_len as usize]).collect();

    let pool_len = pool.len();
    let mut next = 0usize;
    loop {
        if inner.stream.cancel_requested() {
            break;
        }

        let buf = &mut pool[next];
        next = (next + 1) % pool_len;

        match inner.device.bulk_transfer_timeout(buf, BULK_TIMEOUT) {
            Ok(n) => {
                inner.stream.xfer_errors.store(0, Ordering::SeqCst);
                let data = &buf[..n];
                let keep = if inner.softagc.is_active() {
                    inner.softagc.process(data, || {
                        let ctl = inner.ctl.lock().unwrap();
                        (ctl.tuner.get_gains().to_vec(), ctl.rate)
                    })
                } else {
                    true
                };
                if keep && n > 0 {
                    cb(data);
                }
            }
            Err(RtlsdrError::Usb(rusb::Error::Timeout)) => {
                // event-loop tick without data
                continue;
            }
            Err(RtlsdrError::NoDevice) | Err(RtlsdrError::DeviceLost) => {
                warn!("device lost, canceling...");
                inner.dev_lost.store(true, Ordering::SeqCst);
                inner.stream.request_cancel();
            }
            Err(e) => {
                let errors = inner.stream.xfer_errors.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("transfer error {}: {}", errors, e);
                if errors >= buf_num {
                    warn!("too many transfer errors, canceling...");
                    inner.dev_lost.store(true, Ordering::SeqCst);
                    inner.stream.request_cancel();
                }
            }
        }

        if inner.stream.cancel_requested() {
            break;
        }
    }

    drop(pool);
    inner.stream.finish();
    info!("async read finished");

    if inner.dev_lost.load(Ordering::SeqCst) {
        Err(RtlsdrError::DeviceLost)
    } else {
        Ok(())
    }
}

pub(crate) fn cancel_async(inner: &DevInner) -> Result<()> {
    if inner.stream.request_cancel() {
        Ok(())
    } else {
        Err(RtlsdrError::InvalidArgument(
            "no async read to cancel".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_transitions() {
        let s = StreamState::new();
        assert_eq!(s.status(), AsyncStatus::Inactive);

        assert!(s.try_start());
        assert_eq!(s.status(), AsyncStatus::Running);
        // a second stream on the same device must be refused
        assert!(!s.try_start());

        assert!(s.request_cancel());
        assert_eq!(s.status(), AsyncStatus::Canceling);
        assert!(s.cancel_requested());
        // canceling twice is a no-op
        assert!(!s.request_cancel());

        s.finish();
        assert_eq!(s.status(), AsyncStatus::Inactive);
        assert!(s.try_start());
        assert!(!s.cancel_requested());
    }

    #[test]
    fn cancel_without_stream_fails() {
        let s = StreamState::new();
        assert!(!s.request_cancel());
    }
}
