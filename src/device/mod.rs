pub mod constants;
pub use constants::*;
pub mod device_handle;
#[cfg(test)]
mod mock_device_handle;

#[cfg(not(test))]
use device_handle::DeviceHandle;
#[cfg(test)]
use mock_device_handle::MockDeviceHandle as DeviceHandle;

use crate::error::EepromError;
use crate::error::Result;
use crate::error::RtlsdrError::RtlsdrErr;
/// Low-level io functions for interfacing with rusb(libusb)
use byteorder::{ByteOrder, LittleEndian};
use log::{error, info};
use std::time::Duration;

#[cfg(test)]
mod device_test;

#[cfg(test)]
pub(crate) use mock_device_handle::MockDeviceHandle;

#[derive(Debug)]
pub struct Device {
    handle: DeviceHandle,
}

#[cfg(test)]
impl Device {
    pub(crate) fn with_mock(handle: MockDeviceHandle) -> Device {
        Device { handle }
    }
}

impl Device {
    pub fn new(index: usize) -> Result<Device> {
        Ok(Device {
            handle: DeviceHandle::open(index)?,
        })
    }

    pub fn list_devices() -> Result<Vec<(u16, u16, &'static str)>> {
        DeviceHandle::list_devices()
    }

    pub fn claim_interface(&mut self, iface: u8) -> Result<()> {
        Ok(self.handle.claim_interface(iface)?)
    }

    pub fn test_write(&mut self) -> Result<()> {
        // try a dummy write and reset device if it fails
        let len: usize = self.write_reg(BLOCK_USB, USB_SYSCTL, 0x09, 1)?;
        if len == 0 {
            info!("Resetting device...");
            self.handle.reset()?;
        }
        Ok(())
    }

    pub fn usb_strings(&self) -> Result<(Option<String>, Option<String>, Option<String>)> {
        self.handle.get_usb_strings()
    }

    pub fn reset_demod(&self) -> Result<()> {
        self.demod_write_reg(1, 0x01, 0x14, 1)?;
        self.demod_write_reg(1, 0x01, 0x10, 1)?;
        Ok(())
    }

    /// Register reads are little-endian on the wire; writes go out big-endian.
    pub fn read_reg(&self, block: u16, addr: u16, len: usize) -> Result<u16> {
        assert!(len == 1 || len == 2);
        let mut data: [u8; 2] = [0, 0];
        let index: u16 = block << 8;
        self.handle
            .read_control(CTRL_IN, 0, addr, index, &mut data[..len], CTRL_TIMEOUT)?;
        Ok(LittleEndian::read_u16(&data))
    }

    pub fn write_reg(&self, block: u16, addr: u16, val: u16, len: usize) -> Result<usize> {
        assert!(len == 1 || len == 2);
        let data: [u8; 2] = val.to_be_bytes();
        let data_slice = if len == 1 { &data[1..2] } else { &data[..] };
        let index = (block << 8) | 0x10;
        Ok(self
            .handle
            .write_control(CTRL_OUT, 0, addr, index, data_slice, CTRL_TIMEOUT)?)
    }

    pub fn demod_read_reg(&self, page: u16, addr: u16) -> Result<u16> {
        let mut data = [0_u8];
        let index = page;
        match self.handle.read_control(
            CTRL_IN,
            0,
            (addr << 8) | 0x20,
            index,
            &mut data,
            CTRL_TIMEOUT,
        ) {
            Ok(n) => n,
            Err(e) => {
                error!(
                    "demod_read_reg failed: {} page: {:#02x} addr: {:#02x}",
                    e, page, addr
                );
                return Err(e);
            }
        };
        Ok(data[0] as u16)
    }

    pub fn demod_write_reg(&self, page: u16, mut addr: u16, val: u16, len: usize) -> Result<usize> {
        assert!(len == 1 || len == 2);
        let index = 0x10 | page;
        addr = (addr << 8) | 0x20;
        let data: [u8; 2] = val.to_be_bytes();
        let data_slice = if len == 1 { &data[1..2] } else { &data[..] };

        let bytes = match self
            .handle
            .write_control(CTRL_OUT, 0, addr, index, data_slice, CTRL_TIMEOUT)
        {
            Ok(n) => n,
            Err(e) => {
                error!(
                    "demod_write_reg failed: {} page: {:#02x} addr: {:#02x} val: {:#02x}",
                    e, page, addr, val
                );
                return Err(e);
            }
        };

        // dummy read forces the demod to latch the value
        self.demod_read_reg(0x0a, 0x01)?;

        Ok(bytes)
    }

    pub fn bulk_transfer(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.handle.read_bulk(BULK_ENDPOINT, buf, Duration::ZERO)?)
    }

    pub fn bulk_transfer_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        Ok(self.handle.read_bulk(BULK_ENDPOINT, buf, timeout)?)
    }

    pub fn read_eeprom(&self, data: &mut [u8], offset: u8, len: usize) -> Result<usize> {
        if (len + offset as usize) > EEPROM_SIZE {
            return Err(EepromError::SizeExceeded.into());
        }
        self.write_array(BLOCK_IIC, EEPROM_ADDR, &[offset], 1)
            .map_err(|_| EepromError::NoEeprom)?;
        for i in 0..len {
            self.read_array(BLOCK_IIC, EEPROM_ADDR, &mut data[i..i + 1], 1)?;
        }
        Ok(len)
    }

    pub fn write_eeprom(&self, data: &[u8], offset: u8, len: usize) -> Result<usize> {
        if (len + offset as usize) > EEPROM_SIZE {
            return Err(EepromError::SizeExceeded.into());
        }
        let mut cmd: [u8; 2] = [0, 0];
        for i in 0..len {
            cmd[0] = i as u8 + offset;
            self.write_array(BLOCK_IIC, EEPROM_ADDR, &cmd[..1], 1)
                .map_err(|_| EepromError::NoEeprom)?;
            self.read_array(BLOCK_IIC, EEPROM_ADDR, &mut cmd[1..2], 1)?;

            // only write the byte if it differs
            if cmd[1] == data[i] {
                continue;
            }
            cmd[1] = data[i];
            let n = self.write_array(BLOCK_IIC, EEPROM_ADDR, &cmd, 2)?;
            if n != 2 {
                return Err(RtlsdrErr(format!("EEPROM write failed at byte {}", i)));
            }
            // some EEPROMs (e.g. ATC 240LC02) need a delay between writes
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(len)
    }

    pub fn i2c_read_reg(&self, i2c_addr: u8, reg: u8) -> Result<u8> {
        let addr: u16 = i2c_addr.into();
        let reg: [u8; 1] = [reg];
        let mut data: [u8; 1] = [0];

        self.write_array(BLOCK_IIC, addr, &reg, 1)?;
        self.read_array(BLOCK_IIC, addr, &mut data, 1)?;
        Ok(data[0])
    }

    pub fn i2c_write_reg(&self, i2c_addr: u8, reg: u8, val: u8) -> Result<usize> {
        let addr: u16 = i2c_addr.into();
        self.write_array(BLOCK_IIC, addr, &[reg, val], 2)
    }

    pub fn i2c_write(&self, i2c_addr: u16, buffer: &[u8]) -> Result<usize> {
        self.write_array(BLOCK_IIC, i2c_addr, buffer, buffer.len())
    }

    pub fn i2c_read(&self, i2c_addr: u16, buffer: &mut [u8], len: u8) -> Result<usize> {
        self.read_array(BLOCK_IIC, i2c_addr, buffer, len)
    }

    pub fn read_array(&self, block: u16, addr: u16, arr: &mut [u8], _len: u8) -> Result<usize> {
        // the IR block rides on the SYS block with its own low byte
        let index: u16 = if block == BLOCK_IRB {
            (BLOCK_SYS << 8) | 0x01
        } else {
            block << 8
        };
        Ok(self
            .handle
            .read_control(CTRL_IN, 0, addr, index, arr, CTRL_TIMEOUT)?)
    }

    pub fn write_array(&self, block: u16, addr: u16, arr: &[u8], len: usize) -> Result<usize> {
        let index: u16 = if block == BLOCK_IRB {
            (BLOCK_SYS << 8) | 0x11
        } else {
            (block << 8) | 0x10
        };
        Ok(self
            .handle
            .write_control(CTRL_OUT, 0, addr, index, &arr[..len], CTRL_TIMEOUT)?)
    }
}
