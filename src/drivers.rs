// SPDX-License-Identifier: Apache-2.0 OR MIT
// SPDX-FileCopyrightText: © 2024 Google

//! The LPM drivers shipped with the library

use std::str::FromStr;

use crate::Error;
use crate::LpmDriver;
use crate::Result;

#[cfg(feature = "c_api")]
pub mod c_driver;
#[cfg(target_os = "linux")]
pub mod ucsi_debugfs;

/// The LPM drivers that can be selected by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LpmDrivers {
    /// The Linux UCSI debugfs interface.
    UcsiDebugfs,
}

impl FromStr for LpmDrivers {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ucsi_debugfs" | "debugfs" => Ok(Self::UcsiDebugfs),
            _ => Err(Error::NotSupported {
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            }),
        }
    }
}

impl LpmDrivers {
    /// Opens the driver with its default settings.
    pub fn open(self) -> Result<Box<dyn LpmDriver>> {
        match self {
            #[cfg(target_os = "linux")]
            Self::UcsiDebugfs => Ok(Box::new(ucsi_debugfs::UcsiDebugfsDriver::new()?)),
            #[cfg(not(target_os = "linux"))]
            Self::UcsiDebugfs => Err(Error::NotSupported {
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            }),
        }
    }
}
