// SPDX-License-Identifier: Apache-2.0 OR MIT
// SPDX-FileCopyrightText: © 2024 Google

//! Runs a single UCSI command through the PPM, acting as a minimal OPM

use std::io::Cursor;
use std::str::FromStr;
use std::sync::mpsc;
use std::time::Duration;

use argh::FromArgs;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use ucsi_ppm_rs::drivers::LpmDrivers;
use ucsi_ppm_rs::ucsi::AckCcCi;
use ucsi_ppm_rs::ucsi::Cci;
use ucsi_ppm_rs::ucsi::Command;
use ucsi_ppm_rs::ucsi::ConnectorStatus;
use ucsi_ppm_rs::ucsi::Control;
use ucsi_ppm_rs::ucsi::ErrorStatus;
use ucsi_ppm_rs::ucsi::NotificationEnable;
use ucsi_ppm_rs::ucsi::UCSI_CCI_OFFSET;
use ucsi_ppm_rs::ucsi::UCSI_CONTROL_OFFSET;
use ucsi_ppm_rs::ucsi::UCSI_CONTROL_SIZE;
use ucsi_ppm_rs::ucsi::UCSI_MESSAGE_IN_OFFSET;
use ucsi_ppm_rs::BitReader;
use ucsi_ppm_rs::BitWriter;
use ucsi_ppm_rs::Error;
use ucsi_ppm_rs::FromBytes;
use ucsi_ppm_rs::Ppm;
use ucsi_ppm_rs::PpmConfig;
use ucsi_ppm_rs::PpmHandle;
use ucsi_ppm_rs::Result;
use ucsi_ppm_rs::ToBytes;

/// The commands that can be run from the command line.
#[derive(Debug, Clone, Copy)]
enum CliCommand {
    GetCapability,
    GetConnectorCapability,
    GetConnectorStatus,
    GetCableProperty,
    GetErrorStatus,
    GetCurrentCam,
    GetCamSupported,
    PpmReset,
}

impl FromStr for CliCommand {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "get-capability" => Ok(Self::GetCapability),
            "get-connector-capability" => Ok(Self::GetConnectorCapability),
            "get-connector-status" => Ok(Self::GetConnectorStatus),
            "get-cable-property" => Ok(Self::GetCableProperty),
            "get-error-status" => Ok(Self::GetErrorStatus),
            "get-current-cam" => Ok(Self::GetCurrentCam),
            "get-cam-supported" => Ok(Self::GetCamSupported),
            "ppm-reset" => Ok(Self::PpmReset),
            _ => Err(format!("unknown command {s}")),
        }
    }
}

impl CliCommand {
    fn to_command(self, connector_nr: u8) -> Command {
        match self {
            Self::GetCapability => Command::GetCapability,
            Self::GetConnectorCapability => Command::GetConnectorCapability { connector_nr },
            Self::GetConnectorStatus => Command::GetConnectorStatus { connector_nr },
            Self::GetCableProperty => Command::GetCableProperty { connector_nr },
            Self::GetErrorStatus => Command::GetErrorStatus { connector_nr },
            Self::GetCurrentCam => Command::GetCurrentCam { connector_nr },
            Self::GetCamSupported => Command::GetCamSupported { connector_nr },
            Self::PpmReset => Command::PpmReset,
        }
    }
}

#[derive(FromArgs)]
/// Run a UCSI command through the Platform Policy Manager
struct Args {
    /// enable verbose mode
    #[argh(switch, short = 'v')]
    verbose: bool,
    /// the LPM driver to use
    #[argh(option)]
    driver: Option<LpmDrivers>,
    /// the command to run, e.g. get-capability or get-connector-status
    #[argh(option)]
    command: CliCommand,
    /// the connector to address, starting at 1
    #[argh(option, default = "1")]
    connector: u8,
    /// how long to wait for each PPM notification, in milliseconds
    #[argh(option, default = "5000")]
    timeout_ms: u64,
}

/// A minimal OPM: drives the PPM through its memory region and doorbell.
struct Opm {
    ppm: PpmHandle,
    doorbell: mpsc::Receiver<()>,
    timeout: Duration,
}

impl Opm {
    fn write_command(&self, command: &Command) -> Result<()> {
        let control = Control::from_command(command)?;
        let mut raw = [0u8; UCSI_CONTROL_SIZE];
        control.to_bytes(&mut BitWriter::new(Cursor::new(&mut raw[..])))?;
        self.ppm.write(UCSI_CONTROL_OFFSET, &raw)
    }

    fn read_cci(&self) -> Result<Cci> {
        let mut raw = [0u8; 4];
        self.ppm.read(UCSI_CCI_OFFSET, &mut raw)?;
        Cci::from_bytes(&mut BitReader::new(Cursor::new(&raw[..])))
    }

    /// Waits for the doorbell and returns the CCI it announced.
    fn wait_cci(&self) -> Result<Cci> {
        self.doorbell
            .recv_timeout(self.timeout)
            .map_err(|_| Error::TimeoutError {
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            })?;

        let cci = self.read_cci()?;
        tracing::debug!(?cci, "PPM notification");
        Ok(cci)
    }

    /// Runs `command` through the busy, complete and ack cycle. Returns the
    /// completion CCI and MESSAGE_IN.
    fn run(&self, command: &Command) -> Result<(Cci, Vec<u8>)> {
        tracing::info!(?command, "Running command");
        self.write_command(command)?;

        let cci = loop {
            let cci = self.wait_cci()?;
            if cci.cmd_complete || cci.reset_completed {
                break cci;
            }
        };

        if cci.reset_completed {
            return Ok((cci, vec![]));
        }

        let mut message_in = vec![0u8; usize::from(cci.data_length)];
        self.ppm.read(UCSI_MESSAGE_IN_OFFSET, &mut message_in)?;

        self.write_command(&Command::AckCcCi(AckCcCi {
            connector_change_ack: false,
            command_complete_ack: true,
        }))?;
        loop {
            if self.wait_cci()?.ack_command {
                break;
            }
        }

        Ok((cci, message_in))
    }
}

fn main() {
    let args: Args = argh::from_env();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let driver = args
        .driver
        .unwrap_or(LpmDrivers::UcsiDebugfs)
        .open()
        .expect("Failed to open the LPM driver");

    let mut ppm = Ppm::new(driver, PpmConfig::default()).expect("Failed to create the PPM");

    let (tx, doorbell) = mpsc::channel();
    let tx = Mutex::new(tx);
    ppm.register_notify(move || {
        let _ = tx.lock().send(());
    });
    ppm.init_and_wait().expect("PPM did not become ready");

    let opm = Opm {
        ppm: ppm.handle(),
        doorbell,
        timeout: Duration::from_millis(args.timeout_ms),
    };

    opm.run(&Command::SetNotificationEnable {
        mask: NotificationEnable::all(),
    })
    .expect("Failed to enable notifications");

    let command = args.command.to_command(args.connector);
    let (cci, message_in) = opm.run(&command).expect("Failed to run the command");

    println!("CCI");
    println!("{:#?}", cci);
    println!();

    if cci.error {
        let (_, status) = opm
            .run(&Command::GetErrorStatus {
                connector_nr: args.connector,
            })
            .expect("Failed to get the error status");
        let mut raw = [0u8; 4];
        let len = status.len().min(raw.len());
        raw[..len].copy_from_slice(&status[..len]);
        println!("Error status");
        println!("{:#?}", ErrorStatus::from_bits_retain(u32::from_le_bytes(raw)));
        return;
    }

    println!("MESSAGE_IN ({} bytes)", message_in.len());
    println!("{:02x?}", message_in);

    if let CliCommand::GetConnectorStatus = args.command {
        let mut raw = message_in.clone();
        raw.resize(ucsi_ppm_rs::ucsi::UCSI_CONNECTOR_STATUS_SIZE, 0);
        match ConnectorStatus::from_bytes(&mut BitReader::new(Cursor::new(&raw[..]))) {
            Ok(status) => {
                println!();
                println!("Connector {} Status", args.connector);
                println!("{:#?}", status);
            }
            Err(e) => eprintln!("Failed to parse the connector status: {:?}", e),
        }
    }
}
