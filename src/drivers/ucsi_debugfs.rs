// SPDX-License-Identifier: Apache-2.0 OR MIT
// SPDX-FileCopyrightText: © 2024 Google

//! An LPM driver on top of the Linux UCSI debugfs interface

use std::io::Cursor;
use std::path::Path;

use bitstream_io::BitRead;

use crate::ucsi::Command;
use crate::ucsi::Control;
use crate::BitReader;
use crate::Error;
use crate::LpmDriver;
use crate::Result;
use crate::ToBytes;

/// The debugfs directory of the first UCSI device.
pub const UCSI_DEBUGFS_DEFAULT_DEVICE: &str = "/sys/kernel/debug/usb/ucsi/USBC000:00";

mod driver {
    use std::fs::File;
    use std::io::Read;
    use std::io::Seek;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::path::Path;

    use crate::Error;
    use crate::Result;

    pub struct Driver {
        /// The file descriptor used to send commands.
        command_fd: File,
        /// The file descriptor used to receive responses.
        response_fd: File,
    }

    impl Driver {
        pub fn new(device: &Path) -> Result<Self> {
            let command_fd = std::fs::OpenOptions::new()
                .write(true)
                .open(device.join("command"))?;

            let mut response_fd = std::fs::OpenOptions::new()
                .read(true)
                .open(device.join("response"))?;

            response_fd.seek(std::io::SeekFrom::Start(0))?;

            Ok(Self {
                command_fd,
                response_fd,
            })
        }

        pub fn submit_command(&mut self, command: &[u8]) -> Result<usize> {
            Ok(self.command_fd.write(command)?)
        }

        pub fn wait_response(&mut self) -> Result<Vec<u8>> {
            const TIMEOUT_10SEC: u16 = 10000;
            let poll_fd =
                nix::poll::PollFd::new(self.response_fd.as_fd(), nix::poll::PollFlags::POLLIN);
            let timeout = nix::poll::PollTimeout::from(TIMEOUT_10SEC);

            match nix::poll::poll(&mut [poll_fd], timeout) {
                Ok(0) => Err(Error::TimeoutError {
                    #[cfg(feature = "backtrace")]
                    backtrace: std::backtrace::Backtrace::capture(),
                }),
                Ok(_) => {
                    let mut response = Vec::new();
                    self.response_fd.read_to_end(&mut response)?;
                    self.response_fd.seek(std::io::SeekFrom::Start(0))?;
                    Ok(response)
                }
                Err(errno) => Err(errno.into()),
            }
        }
    }
}

use driver::Driver;

/// Forwards UCSI commands to the kernel's UCSI driver.
///
/// The kernel only exposes the 16 byte MESSAGE_IN of UCSI 1.2 here, and
/// reports no connector changes, so a PPM on top of this driver never gets
/// alerts on its own.
pub struct UcsiDebugfsDriver {
    /// The driver abstraction.
    driver: Driver,
}

impl UcsiDebugfsDriver {
    /// Opens the first UCSI device.
    pub fn new() -> Result<Self> {
        Self::with_device(UCSI_DEBUGFS_DEFAULT_DEVICE)
    }

    /// Opens the UCSI device whose debugfs directory is `device`.
    pub fn with_device<P: AsRef<Path>>(device: P) -> Result<Self> {
        let device = device.as_ref();
        tracing::debug!(?device, "Opening UCSI debugfs device");
        let driver = Driver::new(device)?;
        Ok(Self { driver })
    }

    /// Parses the response from the Linux UCSI driver, a 128 bit hex number
    /// holding MESSAGE_IN.
    fn parse_response(response: &[u8]) -> Result<[u8; 16]> {
        let response = std::str::from_utf8(response)?;
        let parse_error = || Error::ParseStringError {
            field: "response".into(),
            value: response.into(),
            #[cfg(feature = "backtrace")]
            backtrace: std::backtrace::Backtrace::capture(),
        };

        let hex_string = response.trim().strip_prefix("0x").ok_or_else(parse_error)?;
        if hex_string.len() != 32 {
            return Err(parse_error());
        }

        let value = u128::from_str_radix(hex_string, 16).map_err(|_| parse_error())?;
        Ok(value.to_le_bytes())
    }

    /// Builds a u64 value from a UCSI CONTROL structure.
    fn build_command_value(control: &Control) -> Result<u64> {
        let mut buf = [0; 8];
        let mut bw = crate::BitWriter::new(Cursor::new(&mut buf[..]));
        control.to_bytes(&mut bw)?;

        Ok(u64::from_le_bytes(buf))
    }

    /// Converts a u64 value to a C string.
    fn stringify_command_val(val: u64) -> Result<Vec<u8>> {
        let c_string = std::ffi::CString::new(val.to_string())?;
        Ok(c_string.into_bytes_with_nul())
    }

    /// Execute the command, returning MESSAGE_IN.
    fn execute(&mut self, control: &Control) -> Result<[u8; 16]> {
        let cmd_val = Self::build_command_value(control)?;
        let cmd_str = Self::stringify_command_val(cmd_val)?;
        tracing::trace!(command = control.command, cmd_val, "Submitting UCSI command");

        self.driver.submit_command(&cmd_str)?;

        let response = self.driver.wait_response()?;
        Self::parse_response(&response)
    }
}

impl LpmDriver for UcsiDebugfsDriver {
    fn execute_cmd(&mut self, control: &Control, message_in: &mut [u8]) -> Result<usize> {
        let response = self.execute(control)?;
        let len = response.len().min(message_in.len());
        message_in[..len].copy_from_slice(&response[..len]);
        Ok(len)
    }

    fn active_port_count(&mut self) -> Result<u8> {
        let control = Control::from_command(&Command::GetCapability)?;
        let response = self.execute(&control)?;

        // bmAttributes, then bNumConnectors.
        let mut bitreader = BitReader::new(Cursor::new(&response[..]));
        bitreader.skip(32)?;
        Ok(bitreader.read::<u8>(7)?)
    }
}
