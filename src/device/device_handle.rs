// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use crate::error::Result;
use crate::error::RtlsdrError;
use log::{debug, info};
use rusb::{Context, UsbContext};

use super::KNOWN_DEVICES;

/// Thin wrapper around the rusb device handle so the register layer can be
/// tested against a mock with the same surface.
#[derive(Debug)]
pub struct DeviceHandle {
    handle: rusb::DeviceHandle<Context>,
}

impl DeviceHandle {
    pub fn open(index: usize) -> Result<Self> {
        let mut context = Context::new()?;
        let handle = DeviceHandle::open_device(&mut context, index)?;
        Ok(DeviceHandle { handle })
    }

    fn open_device<T: UsbContext>(context: &mut T, index: usize) -> Result<rusb::DeviceHandle<T>> {
        let devices = context.devices()?;
        let mut device_count = 0;

        for found in devices.iter() {
            let device_desc = match found.device_descriptor() {
                Ok(desc) => desc,
                Err(e) => {
                    debug!("failed to get device descriptor: {:?}", e);
                    continue;
                }
            };

            for dev in KNOWN_DEVICES.iter() {
                if device_desc.vendor_id() == dev.vid && device_desc.product_id() == dev.pid {
                    if device_count == index {
                        info!(
                            "opening device {} at index {} ({:04x}:{:04x})",
                            dev.description,
                            index,
                            device_desc.vendor_id(),
                            device_desc.product_id()
                        );
                        return Ok(found.open()?);
                    }
                    device_count += 1;
                }
            }
        }

        Err(RtlsdrError::NoDevice)
    }

    /// List all supported dongles currently attached.
    pub fn list_devices() -> Result<Vec<(u16, u16, &'static str)>> {
        let context = Context::new()?;
        let devices = context.devices()?;
        let mut found = Vec::new();
        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            for dev in KNOWN_DEVICES.iter() {
                if desc.vendor_id() == dev.vid && desc.product_id() == dev.pid {
                    found.push((dev.vid, dev.pid, dev.description));
                }
            }
        }
        Ok(found)
    }

    /// Read the USB string descriptors of the `index`-th supported dongle
    /// without fully initializing it.
    pub fn device_usb_strings(
        index: usize,
    ) -> Result<(Option<String>, Option<String>, Option<String>)> {
        let mut context = Context::new()?;
        let handle = DeviceHandle::open_device(&mut context, index)?;
        let wrapped = DeviceHandle { handle };
        wrapped.get_usb_strings()
    }

    pub fn claim_interface(&mut self, iface: u8) -> Result<()> {
        if self.handle.kernel_driver_active(iface).unwrap_or(false) {
            info!("detaching active kernel driver (dvb_usb_rtl28xxu)");
            self.handle.detach_kernel_driver(iface)?;
        }
        Ok(self.handle.claim_interface(iface)?)
    }

    pub fn reset(&mut self) -> Result<()> {
        Ok(self.handle.reset()?)
    }

    pub fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        Ok(self
            .handle
            .read_control(request_type, request, value, index, buf, timeout)?)
    }

    pub fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        Ok(self
            .handle
            .write_control(request_type, request, value, index, buf, timeout)?)
    }

    pub fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        Ok(self.handle.read_bulk(endpoint, buf, timeout)?)
    }

    pub fn get_usb_strings(&self) -> Result<(Option<String>, Option<String>, Option<String>)> {
        let device = self.handle.device();
        let desc = device.device_descriptor()?;
        let manufact = self.handle.read_manufacturer_string_ascii(&desc).ok();
        let product = self.handle.read_product_string_ascii(&desc).ok();
        let serial = self.handle.read_serial_number_string_ascii(&desc).ok();
        Ok((manufact, product, serial))
    }
}
