// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use mockall::predicate::{self, eq};

use crate::device::mock_device_handle::MockDeviceHandle;
use crate::device::Device;
use crate::error::{EepromError, RtlsdrError};

use super::{
    BLOCK_IIC, BLOCK_IRB, BLOCK_SYS, CTRL_IN, CTRL_OUT, CTRL_TIMEOUT, EEPROM_ADDR, EEPROM_SIZE,
    GPO,
};

#[test]
fn test_read_reg_u8() {
    let block = BLOCK_SYS;
    let index_expected = BLOCK_SYS << 8;
    let addr = GPO;
    let data_expected = 0x12_u16;

    let mut mock_handle = MockDeviceHandle::new();
    mock_handle
        .expect_read_control()
        .times(1)
        .with(
            eq(CTRL_IN),
            eq(0),
            eq(addr),
            eq(index_expected),
            predicate::always(),
            eq(CTRL_TIMEOUT),
        )
        .returning(move |_, _, _, _, data, _| {
            assert!(data.len() == 1);
            data[0] = data_expected as u8;
            Ok(1)
        });
    let device = Device::with_mock(mock_handle);
    let result = device.read_reg(block, addr, 1).unwrap();
    assert_eq!(data_expected, result);
}

#[test]
fn test_read_reg_u16() {
    let block = BLOCK_SYS;
    let index_expected = BLOCK_SYS << 8;
    let addr = GPO;
    // bytes are read as little-endian
    let data_expected = u16::to_le_bytes(0x123);

    let mut mock_handle = MockDeviceHandle::new();
    mock_handle
        .expect_read_control()
        .times(1)
        .with(
            eq(CTRL_IN),
            eq(0),
            eq(addr),
            eq(index_expected),
            predicate::always(),
            eq(CTRL_TIMEOUT),
        )
        .returning(move |_, _, _, _, data, _| {
            data[0] = data_expected[0];
            data[1] = data_expected[1];
            Ok(2)
        });
    let device = Device::with_mock(mock_handle);
    let result = device.read_reg(block, addr, 2).unwrap();
    assert_eq!(u16::from_le_bytes(data_expected), result);
}

#[test]
fn test_write_reg_u8() {
    let block = BLOCK_SYS;
    let index_expected = (BLOCK_SYS << 8) | 0x10;
    let addr = GPO;
    let data_expected = 0xef_u16;

    let mut mock_handle = MockDeviceHandle::new();
    mock_handle
        .expect_write_control()
        .times(1)
        .with(
            eq(CTRL_OUT),
            eq(0),
            eq(addr),
            eq(index_expected),
            predicate::always(),
            eq(CTRL_TIMEOUT),
        )
        .returning(move |_, _, _, _, data, _| {
            assert!(data.len() == 1);
            assert_eq!(data[0], data_expected as u8);
            Ok(1)
        });
    let device = Device::with_mock(mock_handle);
    let result = device.write_reg(block, addr, data_expected, 1).unwrap();
    assert_eq!(1, result);
}

#[test]
fn test_write_reg_u16() {
    let block = BLOCK_SYS;
    let index_expected = (BLOCK_SYS << 8) | 0x10;
    let addr = GPO;
    let data_expected = 0xefab_u16;

    let mut mock_handle = MockDeviceHandle::new();
    mock_handle
        .expect_write_control()
        .times(1)
        .with(
            eq(CTRL_OUT),
            eq(0),
            eq(addr),
            eq(index_expected),
            predicate::always(),
            eq(CTRL_TIMEOUT),
        )
        .returning(move |_, _, _, _, data, _| {
            assert!(data.len() == 2);
            // registers are written big-endian
            assert_eq!(data, data_expected.to_be_bytes());
            Ok(1)
        });
    let device = Device::with_mock(mock_handle);
    let result = device.write_reg(block, addr, data_expected, 2).unwrap();
    assert_eq!(1, result);
}

#[test]
fn test_demod_read_reg() {
    let page = 0xa_u16;
    let addr = 0x1_u16;
    let value = 0x12;

    let mut mock_handle = MockDeviceHandle::new();
    mock_handle
        .expect_read_control()
        .times(1)
        .with(
            eq(CTRL_IN),
            eq(0),
            eq((addr << 8) | 0x20),
            eq(page),
            predicate::always(),
            eq(CTRL_TIMEOUT),
        )
        .returning(move |_, _, _, _, data, _| {
            data[0] = value;
            Ok(1)
        });
    let device = Device::with_mock(mock_handle);
    let result = device.demod_read_reg(page, addr).unwrap();
    assert_eq!(value as u16, result);
}

#[test]
fn test_demod_write_reg_issues_latch_read() {
    let page = 1_u16;
    let addr = 0x15_u16;
    let val = 0x01_u16;

    let mut mock_handle = MockDeviceHandle::new();
    mock_handle
        .expect_write_control()
        .times(1)
        .with(
            eq(CTRL_OUT),
            eq(0),
            eq((addr << 8) | 0x20),
            eq(0x10 | page),
            eq([val as u8]),
            eq(CTRL_TIMEOUT),
        )
        .returning(|_, _, _, _, data, _| Ok(data.len()));
    // the dummy read of page 0x0a register 0x01 forces the latch
    mock_handle
        .expect_read_control()
        .times(1)
        .with(
            eq(CTRL_IN),
            eq(0),
            eq((0x01_u16 << 8) | 0x20),
            eq(0x0a_u16),
            predicate::always(),
            eq(CTRL_TIMEOUT),
        )
        .returning(|_, _, _, _, data, _| {
            data[0] = 0;
            Ok(1)
        });
    let device = Device::with_mock(mock_handle);
    device.demod_write_reg(page, addr, val, 1).unwrap();
}

#[test]
fn test_ir_block_rides_on_sys_block() {
    let mut mock_handle = MockDeviceHandle::new();
    mock_handle
        .expect_read_control()
        .times(1)
        .with(
            eq(CTRL_IN),
            eq(0),
            eq(0x0004_u16),
            eq((BLOCK_SYS << 8) | 0x01),
            predicate::always(),
            eq(CTRL_TIMEOUT),
        )
        .returning(|_, _, _, _, _, _| Ok(1));
    mock_handle
        .expect_write_control()
        .times(1)
        .with(
            eq(CTRL_OUT),
            eq(0),
            eq(0x0004_u16),
            eq((BLOCK_SYS << 8) | 0x11),
            eq([0x42]),
            eq(CTRL_TIMEOUT),
        )
        .returning(|_, _, _, _, data, _| Ok(data.len()));

    let device = Device::with_mock(mock_handle);
    let mut buf = [0u8; 1];
    device.read_array(BLOCK_IRB, 0x0004, &mut buf, 1).unwrap();
    device.write_array(BLOCK_IRB, 0x0004, &[0x42], 1).unwrap();
}

#[test]
fn test_read_eeprom_out_of_range() {
    let mock_handle = MockDeviceHandle::new();
    let device = Device::with_mock(mock_handle);
    let mut data = [0; 5];
    let err = device.read_eeprom(&mut data, 0, EEPROM_SIZE + 1).unwrap_err();
    assert!(matches!(err, RtlsdrError::Eeprom(EepromError::SizeExceeded)));
}

#[test]
fn test_read_eeprom_invalid_offset() {
    let mock_handle = MockDeviceHandle::new();
    let device = Device::with_mock(mock_handle);
    let mut data = [0; 5];
    let data_len = data.len();
    let err = device
        .read_eeprom(&mut data, (EEPROM_SIZE - 1) as u8, data_len)
        .unwrap_err();
    assert!(matches!(err, RtlsdrError::Eeprom(EepromError::SizeExceeded)));
}

#[test]
fn test_read_eeprom_reads_expected_data() {
    let mut mock_handle = MockDeviceHandle::new();

    // the offset is written first
    mock_handle
        .expect_write_control()
        .times(1)
        .with(
            eq(CTRL_OUT),
            eq(0),
            eq(EEPROM_ADDR),
            eq((BLOCK_IIC << 8) | 0x10),
            eq([0]),
            eq(CTRL_TIMEOUT),
        )
        .returning(|_, _, _, _, _, _| Ok(1));

    // then one read per byte
    let expected_data = [0x12, 0x34, 0x56, 0x78, 0x9a];
    let mut call = 0usize;
    mock_handle
        .expect_read_control()
        .times(expected_data.len())
        .returning(move |_, _, _, _, buf, _| {
            buf[0] = expected_data[call];
            call += 1;
            Ok(1)
        });

    let device = Device::with_mock(mock_handle);
    let mut data = [0; 5];
    let data_len = data.len();
    device.read_eeprom(&mut data, 0, data_len).unwrap();
    assert_eq!(data, expected_data);
}

#[test]
fn test_read_eeprom_missing_eeprom() {
    let mut mock_handle = MockDeviceHandle::new();
    mock_handle
        .expect_write_control()
        .times(1)
        .returning(|_, _, _, _, _, _| Err(RtlsdrError::Usb(rusb::Error::Io)));
    let device = Device::with_mock(mock_handle);
    let mut data = [0; 2];
    let err = device.read_eeprom(&mut data, 0, 2).unwrap_err();
    assert!(matches!(err, RtlsdrError::Eeprom(EepromError::NoEeprom)));
}

#[test]
fn test_usb_strings_delegates_to_handle() {
    let mut mock_handle = MockDeviceHandle::new();
    mock_handle
        .expect_get_usb_strings()
        .returning(|| Ok((Some("Make".to_string()), Some("Model".to_string()), None)));

    let device = Device::with_mock(mock_handle);
    let (manufact, product, serial) = device.usb_strings().unwrap();
    assert_eq!(manufact.as_deref(), Some("Make"));
    assert_eq!(product.as_deref(), Some("Model"));
    assert!(serial.is_none());
}
