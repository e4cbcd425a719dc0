// SPDX-License-Identifier: Apache-2.0 OR MIT
// SPDX-FileCopyrightText: © 2024 Google

//! LPM drivers implemented in C

use std::ffi::c_int;
use std::ffi::c_void;

use crate::ucsi::Control;
use crate::ucsi::UCSI_CONTROL_SIZE;
use crate::Error;
use crate::LpmDriver;
use crate::Result;
use crate::ToBytes;

/// An LPM driver implemented in C.
///
/// Both callbacks receive `context` as their first argument and return a
/// negative errno on failure.
#[repr(C)]
pub struct UcsiPpmRsDriver {
    /// Opaque driver data.
    pub context: *mut c_void,
    /// Executes the 8 byte CONTROL structure at `control`, writing at most
    /// `message_in_len` bytes of response to `message_in`. Returns the number
    /// of bytes written.
    pub execute_cmd: extern "C" fn(
        context: *mut c_void,
        control: *const u8,
        message_in: *mut u8,
        message_in_len: usize,
    ) -> c_int,
    /// Returns the number of connectors the LPM drives.
    pub get_active_port_count: extern "C" fn(context: *mut c_void) -> c_int,
}

pub(crate) struct CDriver(UcsiPpmRsDriver);

// The C driver is only ever called from one thread at a time, which is all
// the PPM needs.
unsafe impl Send for CDriver {}

impl From<UcsiPpmRsDriver> for CDriver {
    fn from(driver: UcsiPpmRsDriver) -> Self {
        Self(driver)
    }
}

/// Maps a C return value to a `Result`.
fn from_c_ret(ret: c_int) -> Result<usize> {
    if ret < 0 {
        Err(std::io::Error::from_raw_os_error(-ret).into())
    } else {
        Ok(ret as usize)
    }
}

impl LpmDriver for CDriver {
    fn execute_cmd(&mut self, control: &Control, message_in: &mut [u8]) -> Result<usize> {
        let mut raw = [0u8; UCSI_CONTROL_SIZE];
        control.to_bytes(&mut crate::BitWriter::new(std::io::Cursor::new(&mut raw[..])))?;

        let ret = (self.0.execute_cmd)(
            self.0.context,
            raw.as_ptr(),
            message_in.as_mut_ptr(),
            message_in.len(),
        );
        let len = from_c_ret(ret)?;
        if len > message_in.len() {
            tracing::warn!(len, "C driver overran MESSAGE_IN");
        }
        Ok(len)
    }

    fn active_port_count(&mut self) -> Result<u8> {
        let ret = from_c_ret((self.0.get_active_port_count)(self.0.context))?;
        u8::try_from(ret).map_err(|_| Error::InvalidPortCount {
            count: u32::try_from(ret).unwrap_or(u32::MAX),
            #[cfg(feature = "backtrace")]
            backtrace: std::backtrace::Backtrace::capture(),
        })
    }
}
