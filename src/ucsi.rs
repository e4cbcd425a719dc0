// SPDX-License-Identifier: Apache-2.0 OR MIT
// SPDX-FileCopyrightText: © 2024 Google

//! UCSI data structures and commands.
//!
//! Everything in here is serialized LSB first, exactly as laid out on the wire
//! by the UCSI 3.0 specification.

use std::io::Cursor;

use bitstream_io::BitRead;
use bitstream_io::BitWrite;
use enumn::N;

use crate::BcdWrapper;
use crate::BitReader;
use crate::BitWriter;
use crate::Error;
use crate::FromBytes;
use crate::Result;
use crate::ToBytes;

/// The UCSI version implemented by the PPM, in BCD.
pub const UCSI_VERSION: u16 = 0x0300;

/// Offsets into the UCSI memory region. See UCSI 3.0 - Table 3-1.
pub const UCSI_VERSION_OFFSET: usize = 0;
pub const UCSI_CCI_OFFSET: usize = 4;
pub const UCSI_CONTROL_OFFSET: usize = 8;
pub const UCSI_MESSAGE_IN_OFFSET: usize = 16;
pub const UCSI_MESSAGE_OUT_OFFSET: usize = 272;

pub const UCSI_CONTROL_SIZE: usize = 8;
pub const UCSI_MESSAGE_IN_SIZE: usize = 256;
pub const UCSI_MESSAGE_OUT_SIZE: usize = 256;
pub const UCSI_MEMORY_REGION_SIZE: usize = UCSI_MESSAGE_OUT_OFFSET + UCSI_MESSAGE_OUT_SIZE;

/// Size of the GET_CONNECTOR_STATUS data.
pub const UCSI_CONNECTOR_STATUS_SIZE: usize = 19;
/// Size of the GET_ERROR_STATUS data when answered by the PPM itself.
pub const UCSI_ERROR_STATUS_SIZE: usize = 4;
/// Connector numbers are 7 bits wide in CCI and in the commands.
pub const UCSI_MAX_PORTS: u8 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u8)]
/// The UCSI command opcodes. See UCSI 3.0 - Table A.1
pub enum CommandCode {
    PpmReset = 0x01,
    Cancel = 0x02,
    ConnectorReset = 0x03,
    AckCcCi = 0x04,
    SetNotificationEnable = 0x05,
    GetCapability = 0x06,
    GetConnectorCapability = 0x07,
    SetCcom = 0x08,
    SetUor = 0x09,
    /// Obsolete since UCSI 2.0.
    SetPdm = 0x0a,
    SetPdr = 0x0b,
    GetAlternateModes = 0x0c,
    GetCamSupported = 0x0d,
    GetCurrentCam = 0x0e,
    SetNewCam = 0x0f,
    GetPdos = 0x10,
    GetCableProperty = 0x11,
    GetConnectorStatus = 0x12,
    GetErrorStatus = 0x13,
    SetPowerLevel = 0x14,
    GetPdMessage = 0x15,
    GetAttentionVdo = 0x16,
    GetCamCs = 0x18,
    LpmFwUpdateRequest = 0x19,
    SecurityRequest = 0x1a,
    SetRetimerMode = 0x1b,
    SetSinkPath = 0x1c,
    SetPdos = 0x1d,
    ReadPowerLevel = 0x1e,
    ChunkingSupport = 0x1f,
    VendorCmd = 0x20,
}

impl CommandCode {
    /// The highest opcode defined by UCSI 3.0.
    pub const MAX: u8 = CommandCode::VendorCmd as u8;

    /// Whether `opcode` falls within the known command range. Reserved
    /// opcodes inside the range are left for the LPM to reject.
    pub fn in_range(opcode: u8) -> bool {
        (1..=Self::MAX).contains(&opcode)
    }
}

#[derive(Debug, Clone, PartialEq, Default, N, Copy)]
/// See Table 6-24: GET_ALTERNATE_MODES Command.
pub enum GetAlternateModesRecipient {
    #[default]
    Connector = 0,
    // SOP
    Sop = 1,
    // SOP'
    SopPrime = 2,
    // SOP''
    SopDoublePrime = 3,
}

/// A typed UCSI command, as an OPM would issue it.
///
/// Connector numbers are 1-based, as on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Resets the PPM and disables all notifications.
    PpmReset,
    /// Cancels the command in progress, if the LPM supports it.
    Cancel,
    /// Resets the connector identified by `connector_nr`.
    ConnectorReset { connector_nr: u8, hard_reset: bool },
    /// Acknowledges a command completion and/or a connector change.
    AckCcCi(AckCcCi),
    /// Selects which events the PPM reports to the OPM.
    SetNotificationEnable { mask: NotificationEnable },
    /// This command is used to get the PPM capabilities.
    GetCapability,
    /// This command is used to get the capabilities of a connector.
    GetConnectorCapability { connector_nr: u8 },
    /// This command is used to get the Alternate Modes that the
    /// Connector/Cable/Attached Device is capable of supporting.
    GetAlternateModes {
        recipient: GetAlternateModesRecipient,
        connector_nr: u8,
        /// The offset to query.
        offset: u8,
    },
    /// This command is used to get the list of Alternate Modes that are
    /// currently supported on the connector identified by this command.
    GetCamSupported { connector_nr: u8 },
    GetCurrentCam { connector_nr: u8 },
    /// This command is used to get the Cable properties on the connector
    /// identified by this command.
    GetCableProperty { connector_nr: u8 },
    /// This command is used to get the current status of the connector
    /// identified by this command.
    GetConnectorStatus { connector_nr: u8 },
    /// This command is used to get details about the last error.
    GetErrorStatus { connector_nr: u8 },
    /// Enables or disables the sink path of a connector.
    SetSinkPath { connector_nr: u8, enable: bool },
}

impl Command {
    pub fn code(&self) -> CommandCode {
        match &self {
            Command::PpmReset => CommandCode::PpmReset,
            Command::Cancel => CommandCode::Cancel,
            Command::ConnectorReset { .. } => CommandCode::ConnectorReset,
            Command::AckCcCi(_) => CommandCode::AckCcCi,
            Command::SetNotificationEnable { .. } => CommandCode::SetNotificationEnable,
            Command::GetCapability => CommandCode::GetCapability,
            Command::GetConnectorCapability { .. } => CommandCode::GetConnectorCapability,
            Command::GetAlternateModes { .. } => CommandCode::GetAlternateModes,
            Command::GetCamSupported { .. } => CommandCode::GetCamSupported,
            Command::GetCurrentCam { .. } => CommandCode::GetCurrentCam,
            Command::GetCableProperty { .. } => CommandCode::GetCableProperty,
            Command::GetConnectorStatus { .. } => CommandCode::GetConnectorStatus,
            Command::GetErrorStatus { .. } => CommandCode::GetErrorStatus,
            Command::SetSinkPath { .. } => CommandCode::SetSinkPath,
        }
    }
}

impl ToBytes for Command {
    fn to_bytes(&self, bw: &mut BitWriter) -> Result<()> {
        bw.write(8, self.code() as u32)?;
        // Data length. None of these commands carry a MESSAGE_OUT payload.
        bw.write(8, 0)?;
        match self {
            Command::PpmReset | Command::Cancel | Command::GetCapability => {}
            Command::ConnectorReset {
                connector_nr,
                hard_reset,
            } => {
                bw.write(7, u32::from(*connector_nr))?;
                bw.write_bit(*hard_reset)?;
            }
            Command::AckCcCi(ack) => {
                bw.write_bit(ack.connector_change_ack)?;
                bw.write_bit(ack.command_complete_ack)?;
            }
            Command::SetNotificationEnable { mask } => {
                bw.write(32, mask.bits())?;
            }
            Command::GetAlternateModes {
                recipient,
                connector_nr,
                offset,
            } => {
                bw.write(3, *recipient as u32)?;
                // Reserved
                bw.write(5, 0)?;
                bw.write(7, u32::from(*connector_nr))?;
                // Reserved
                bw.write(1, 0)?;
                bw.write(8, u32::from(*offset))?;
            }
            Command::GetConnectorCapability { connector_nr }
            | Command::GetCamSupported { connector_nr }
            | Command::GetCurrentCam { connector_nr }
            | Command::GetCableProperty { connector_nr }
            | Command::GetConnectorStatus { connector_nr }
            | Command::GetErrorStatus { connector_nr } => {
                bw.write(7, u32::from(*connector_nr))?;
            }
            Command::SetSinkPath {
                connector_nr,
                enable,
            } => {
                bw.write(7, u32::from(*connector_nr))?;
                bw.write_bit(*enable)?;
            }
        }

        bw.byte_align()?;
        Ok(())
    }
}

/// The CONTROL data structure. See UCSI 3.0 - Table 3-3.
///
/// The opcode is kept raw: the OPM may write anything here and the PPM has to
/// answer unknown opcodes itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Control {
    pub command: u8,
    pub data_length: u8,
    pub command_specific: [u8; 6],
}

impl Control {
    /// Builds the CONTROL bytes for `command`.
    pub fn from_command(command: &Command) -> Result<Self> {
        let mut buf = [0u8; UCSI_CONTROL_SIZE];
        let mut bw = BitWriter::new(Cursor::new(&mut buf[..]));
        command.to_bytes(&mut bw)?;

        let mut reader = BitReader::new(Cursor::new(&buf[..]));
        Self::from_bytes(&mut reader)
    }

    pub fn command_code(&self) -> Option<CommandCode> {
        CommandCode::n(self.command)
    }

    pub fn is_command(&self, code: CommandCode) -> bool {
        self.command == code as u8
    }

    /// The 1-based connector number of connector-addressed commands.
    pub fn connector_nr(&self) -> u8 {
        self.command_specific[0] & UCSI_MAX_PORTS
    }

    /// Interprets the command specific bytes as ACK_CC_CI parameters.
    pub fn ack_cc_ci(&self) -> AckCcCi {
        let flags = self.command_specific[0];
        AckCcCi {
            connector_change_ack: flags & 0b01 != 0,
            command_complete_ack: flags & 0b10 != 0,
        }
    }

    /// Interprets the command specific bytes as SET_NOTIFICATION_ENABLE
    /// parameters.
    pub fn notification_enable(&self) -> NotificationEnable {
        let cs = &self.command_specific;
        NotificationEnable::from_bits_retain(u32::from_le_bytes([cs[0], cs[1], cs[2], cs[3]]))
    }
}

impl FromBytes for Control {
    fn from_bytes(reader: &mut BitReader) -> Result<Self> {
        let command = reader.read::<u8>(8)?;
        let data_length = reader.read::<u8>(8)?;
        let mut command_specific = [0u8; 6];
        reader.read_bytes(&mut command_specific)?;

        Ok(Self {
            command,
            data_length,
            command_specific,
        })
    }
}

impl ToBytes for Control {
    fn to_bytes(&self, bw: &mut BitWriter) -> Result<()> {
        bw.write(8, u32::from(self.command))?;
        bw.write(8, u32::from(self.data_length))?;
        bw.write_bytes(&self.command_specific)?;
        Ok(())
    }
}

/// ACK_CC_CI parameters. See UCSI 3.0 - Table 6-9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckCcCi {
    /// Acknowledges the connector change reported in CCI.
    pub connector_change_ack: bool,
    /// Acknowledges the command completion reported in CCI.
    pub command_complete_ack: bool,
}

/// The Connector Change Indication. See UCSI 3.0 - Table 3-2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cci {
    pub end_of_message: bool,
    /// The 1-based connector that changed, 0 if none.
    pub connector_changed: u8,
    /// Number of valid bytes in MESSAGE_IN.
    pub data_length: u8,
    pub vendor_defined_message: bool,
    pub security_request: bool,
    pub fw_update_request: bool,
    pub not_supported: bool,
    pub cancel_completed: bool,
    pub reset_completed: bool,
    pub busy: bool,
    pub ack_command: bool,
    pub error: bool,
    pub cmd_complete: bool,
}

impl FromBytes for Cci {
    fn from_bytes(reader: &mut BitReader) -> Result<Self> {
        let end_of_message = reader.read_bit()?;
        let connector_changed = reader.read::<u8>(7)?;
        let data_length = reader.read::<u8>(8)?;
        let vendor_defined_message = reader.read_bit()?;
        // Reserved
        reader.skip(6)?;
        let security_request = reader.read_bit()?;
        let fw_update_request = reader.read_bit()?;
        let not_supported = reader.read_bit()?;
        let cancel_completed = reader.read_bit()?;
        let reset_completed = reader.read_bit()?;
        let busy = reader.read_bit()?;
        let ack_command = reader.read_bit()?;
        let error = reader.read_bit()?;
        let cmd_complete = reader.read_bit()?;

        Ok(Self {
            end_of_message,
            connector_changed,
            data_length,
            vendor_defined_message,
            security_request,
            fw_update_request,
            not_supported,
            cancel_completed,
            reset_completed,
            busy,
            ack_command,
            error,
            cmd_complete,
        })
    }
}

impl ToBytes for Cci {
    fn to_bytes(&self, bw: &mut BitWriter) -> Result<()> {
        bw.write_bit(self.end_of_message)?;
        bw.write(7, u32::from(self.connector_changed & UCSI_MAX_PORTS))?;
        bw.write(8, u32::from(self.data_length))?;
        bw.write_bit(self.vendor_defined_message)?;
        // Reserved
        bw.write(6, 0)?;
        bw.write_bit(self.security_request)?;
        bw.write_bit(self.fw_update_request)?;
        bw.write_bit(self.not_supported)?;
        bw.write_bit(self.cancel_completed)?;
        bw.write_bit(self.reset_completed)?;
        bw.write_bit(self.busy)?;
        bw.write_bit(self.ack_command)?;
        bw.write_bit(self.error)?;
        bw.write_bit(self.cmd_complete)?;
        Ok(())
    }
}

/// The VERSION data structure.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UcsiVersion {
    pub version: BcdWrapper,
    pub lpm_address: u8,
}

impl ToBytes for UcsiVersion {
    fn to_bytes(&self, bw: &mut BitWriter) -> Result<()> {
        bw.write(16, self.version.0 & 0xffff)?;
        bw.write(8, u32::from(self.lpm_address))?;
        // Reserved
        bw.write(8, 0)?;
        Ok(())
    }
}

/// The UCSI memory region shared with the OPM.
#[derive(Debug, Clone, PartialEq)]
pub struct UcsiMemoryRegion {
    pub version: UcsiVersion,
    pub cci: Cci,
    pub control: Control,
    pub message_in: [u8; UCSI_MESSAGE_IN_SIZE],
    pub message_out: [u8; UCSI_MESSAGE_OUT_SIZE],
}

impl Default for UcsiMemoryRegion {
    fn default() -> Self {
        Self {
            version: UcsiVersion::default(),
            cci: Cci::default(),
            control: Control::default(),
            message_in: [0; UCSI_MESSAGE_IN_SIZE],
            message_out: [0; UCSI_MESSAGE_OUT_SIZE],
        }
    }
}

impl UcsiMemoryRegion {
    /// Serializes the whole region, as the OPM sees it.
    pub fn to_image(&self) -> Result<[u8; UCSI_MEMORY_REGION_SIZE]> {
        let mut image = [0u8; UCSI_MEMORY_REGION_SIZE];
        let mut bw = BitWriter::new(Cursor::new(&mut image[..]));
        self.to_bytes(&mut bw)?;
        Ok(image)
    }
}

impl ToBytes for UcsiMemoryRegion {
    fn to_bytes(&self, bw: &mut BitWriter) -> Result<()> {
        self.version.to_bytes(bw)?;
        self.cci.to_bytes(bw)?;
        self.control.to_bytes(bw)?;
        bw.write_bytes(&self.message_in)?;
        bw.write_bytes(&self.message_out)?;
        Ok(())
    }
}

bitflags::bitflags! {
    /// Connector Status Change Field Description for GET_CONNECTOR_STATUS.
    /// See UCSI 3.0 - Table 6-44.
    ///
    /// Reserved bits are preserved when parsed, the PPM only ever intersects
    /// this with the notification mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConnectorStatusChange: u16 {
        const EXTERNAL_SUPPLY = 1 << 1;
        const POWER_OPERATION_MODE = 1 << 2;
        const ATTENTION = 1 << 3;
        const SUPPORTED_PROVIDER_CAPABILITIES = 1 << 5;
        const NEGOTIATED_POWER_LEVEL = 1 << 6;
        const PD_RESET_COMPLETE = 1 << 7;
        const SUPPORTED_CAM = 1 << 8;
        const BATTERY_CHARGING_STATUS = 1 << 9;
        const CONNECTOR_PARTNER = 1 << 11;
        const POWER_DIRECTION = 1 << 12;
        const SINK_PATH_STATUS = 1 << 13;
        const CONNECT = 1 << 14;
        const ERROR = 1 << 15;
    }
}

bitflags::bitflags! {
    /// SET_NOTIFICATION_ENABLE parameters. See UCSI 3.0 - Table 6-10.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NotificationEnable: u32 {
        const COMMAND_COMPLETE = 1 << 0;
        const EXTERNAL_SUPPLY_CHANGE = 1 << 1;
        const POWER_OPERATION_MODE_CHANGE = 1 << 2;
        const ATTENTION = 1 << 3;
        const FW_UPDATE_REQUEST = 1 << 4;
        const PROVIDER_CAPABILITY_CHANGE = 1 << 5;
        const NEGOTIATED_POWER_LEVEL_CHANGE = 1 << 6;
        const PD_RESET_COMPLETE = 1 << 7;
        const SUPPORTED_CAM_CHANGE = 1 << 8;
        const BATTERY_CHARGING_STATUS_CHANGE = 1 << 9;
        const SECURITY_REQUEST = 1 << 10;
        const CONNECTOR_PARTNER_CHANGE = 1 << 11;
        const POWER_DIRECTION_CHANGE = 1 << 12;
        const SET_RETIMER_MODE = 1 << 13;
        const CONNECT_CHANGE = 1 << 14;
        const ERROR = 1 << 15;
        const SINK_PATH_STATUS_CHANGE = 1 << 16;
    }
}

impl NotificationEnable {
    /// Whether any of the `change` bits is enabled for notification.
    pub fn allows(&self, change: ConnectorStatusChange) -> bool {
        self.bits() & u32::from(change.bits()) != 0
    }
}

bitflags::bitflags! {
    /// GET_ERROR_STATUS Error Information. See UCSI 3.0 - Table 6-50.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ErrorStatus: u32 {
        const UNRECOGNIZED_COMMAND = 1 << 0;
        const NON_EXISTENT_CONNECTOR_NUMBER = 1 << 1;
        const INVALID_COMMAND_SPECIFIC_PARAM = 1 << 2;
        const INCOMPATIBLE_CONNECTOR_PARTNER = 1 << 3;
        const CC_COMMUNICATION_ERROR = 1 << 4;
        const CMD_UNSUCCESSFUL_DEAD_BATTERY = 1 << 5;
        const CONTRACT_NEGOTIATION_FAILURE = 1 << 6;
        const OVERCURRENT = 1 << 7;
        const UNDEFINED = 1 << 8;
        const PORT_PARTNER_REJECTED_SWAP = 1 << 9;
        const HARD_RESET = 1 << 10;
        const PPM_POLICY_CONFLICT = 1 << 11;
        const SWAP_REJECTED = 1 << 12;
        const REVERSE_CURRENT_PROTECTION = 1 << 13;
        const SET_SINK_PATH_REJECTED = 1 << 14;
    }
}

#[derive(Debug, Clone, PartialEq, Default, N, Copy)]
pub enum ConnectorOrientation {
    /// The connection is in the normal orientation.
    #[default]
    Normal = 0,
    /// The connection is in the reverse orientation.
    Reverse = 1,
}

#[derive(Debug, Clone, PartialEq, Default, N, Copy)]
pub enum SinkPathStatus {
    #[default]
    Disabled = 0,
    Enabled = 1,
}

#[derive(Debug, Clone, PartialEq, Default, N, Copy)]
pub enum PowerOperationMode {
    #[default]
    Reserved = 0,
    UsbDefaultOperation = 1,
    BatteryCharging = 2,
    PowerDelivery = 3,
    UsbTypeCCurrent1_5A = 4,
    UsbTypeCCurrent3A = 5,
    UsbTypeCCurrent5A = 6,
    Reserved2 = 7,
}

#[derive(Debug, Clone, PartialEq, Default, N, Copy)]
pub enum PowerDirection {
    #[default]
    Consumer = 0,
    Provider = 1,
}

#[derive(Debug, Clone, PartialEq, Default, N, Copy)]
pub enum ConnectorPartnerType {
    #[default]
    Reserved = 0,
    DfpAttached = 1,
    UfpAttached = 2,
    PoweredCableNoUfpAttached = 3,
    PoweredCableUfpAttached = 4,
    DebugAccessoryAttached = 5,
    AudioAdapterAccessoryAttached = 6,
    Reserved2 = 7,
}

#[derive(Debug, Clone, PartialEq, Default, N, Copy)]
pub enum BatteryChargingCapabilityStatus {
    #[default]
    NotCharging = 0,
    NominalChargingRate = 1,
    SlowChargingRate = 2,
    VerySlowChargingRate = 3,
}

#[derive(Debug, Clone, PartialEq, Default)]
/// This struct represents the GET_CONNECTOR_STATUS data.
/// See UCSI 3.0 - Table 6-43.
pub struct ConnectorStatus {
    /// A bitmap indicating the types of status changes that have occurred on
    /// the connector.
    pub connector_status_change: ConnectorStatusChange,
    /// This field shall indicate the current power operation mode of the
    /// connector.
    pub power_operation_mode: PowerOperationMode,
    /// This field indicates the current connect status of the connector.
    pub connect_status: bool,
    /// This field shall indicate whether the connector is operating as a
    /// consumer or provider.
    pub power_direction: PowerDirection,
    /// This field is only valid when the Connect Status field is set.
    pub connector_partner_flags: u8,
    /// This field indicates the type of connector partner detected on this
    /// connector.
    pub connector_partner_type: ConnectorPartnerType,
    /// The currently negotiated power level (the RDO). Only valid with an
    /// explicit PD contract.
    pub negotiated_power_level: u32,
    /// This field is only valid if the connector is operating as a Sink.
    pub battery_charging_capability_status: BatteryChargingCapabilityStatus,
    /// A bitmap indicating the reasons why the Provider capabilities of the
    /// connector have been limited.
    pub provider_capabilities_limited_reason: u8,
    /// The USB PD revision the connector uses during an Explicit Contract.
    pub pd_version_operation_mode: BcdWrapper,
    pub orientation: ConnectorOrientation,
    pub sink_path_status: SinkPathStatus,
    pub reverse_current_protection_status: bool,
    /// This field is set if the power reading is valid.
    pub power_reading_ready: bool,
    pub scale_current: u8,
    pub peak_current: u16,
    pub average_current: u16,
    pub scale_voltage: u8,
    /// This field is the most recent VBUS voltage measurement.
    pub voltage_reading: u16,
}

impl FromBytes for ConnectorStatus {
    fn from_bytes(reader: &mut BitReader) -> Result<Self> {
        let connector_status_change =
            ConnectorStatusChange::from_bits_retain(reader.read::<u16>(16)?);
        let power_operation_mode = reader.read::<u32>(3)?;
        let power_operation_mode =
            PowerOperationMode::n(power_operation_mode).ok_or_else(|| Error::ParseError {
                field: "power_operation_mode".into(),
                value: power_operation_mode,
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            })?;
        let connect_status = reader.read_bit()?;
        let power_direction = reader.read::<u32>(1)?;
        let power_direction =
            PowerDirection::n(power_direction).ok_or_else(|| Error::ParseError {
                field: "power_direction".into(),
                value: power_direction,
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            })?;
        let connector_partner_flags = reader.read::<u8>(8)?;
        let connector_partner_type = reader.read::<u32>(3)?;
        let connector_partner_type =
            ConnectorPartnerType::n(connector_partner_type).ok_or_else(|| Error::ParseError {
                field: "connector_partner_type".into(),
                value: connector_partner_type,
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            })?;
        let negotiated_power_level = reader.read::<u32>(32)?;
        let battery_charging_capability_status = reader.read::<u32>(2)?;
        let battery_charging_capability_status =
            BatteryChargingCapabilityStatus::n(battery_charging_capability_status).ok_or_else(
                || Error::ParseError {
                    field: "battery_charging_capability_status".into(),
                    value: battery_charging_capability_status,
                    #[cfg(feature = "backtrace")]
                    backtrace: std::backtrace::Backtrace::capture(),
                },
            )?;
        let provider_capabilities_limited_reason = reader.read::<u8>(4)?;
        let pd_version_operation_mode = BcdWrapper(reader.read::<u32>(16)?);
        let orientation = reader.read::<u32>(1)?;
        let orientation =
            ConnectorOrientation::n(orientation).ok_or_else(|| Error::ParseError {
                field: "orientation".into(),
                value: orientation,
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            })?;
        let sink_path_status = reader.read::<u32>(1)?;
        let sink_path_status =
            SinkPathStatus::n(sink_path_status).ok_or_else(|| Error::ParseError {
                field: "sink_path_status".into(),
                value: sink_path_status,
                #[cfg(feature = "backtrace")]
                backtrace: std::backtrace::Backtrace::capture(),
            })?;
        let reverse_current_protection_status = reader.read_bit()?;
        let power_reading_ready = reader.read_bit()?;
        let scale_current = reader.read::<u8>(3)?;
        let peak_current = reader.read::<u16>(16)?;
        let average_current = reader.read::<u16>(16)?;
        let scale_voltage = reader.read::<u8>(4)?;
        let voltage_reading = reader.read::<u16>(16)?;

        Ok(Self {
            connector_status_change,
            power_operation_mode,
            connect_status,
            power_direction,
            connector_partner_flags,
            connector_partner_type,
            negotiated_power_level,
            battery_charging_capability_status,
            provider_capabilities_limited_reason,
            pd_version_operation_mode,
            orientation,
            sink_path_status,
            reverse_current_protection_status,
            power_reading_ready,
            scale_current,
            peak_current,
            average_current,
            scale_voltage,
            voltage_reading,
        })
    }
}

impl ToBytes for ConnectorStatus {
    fn to_bytes(&self, bw: &mut BitWriter) -> Result<()> {
        bw.write(16, self.connector_status_change.bits())?;
        bw.write(3, self.power_operation_mode as u32)?;
        bw.write_bit(self.connect_status)?;
        bw.write(1, self.power_direction as u32)?;
        bw.write(8, u32::from(self.connector_partner_flags))?;
        bw.write(3, self.connector_partner_type as u32)?;
        bw.write(32, self.negotiated_power_level)?;
        bw.write(2, self.battery_charging_capability_status as u32)?;
        bw.write(4, u32::from(self.provider_capabilities_limited_reason & 0xf))?;
        bw.write(16, self.pd_version_operation_mode.0 & 0xffff)?;
        bw.write(1, self.orientation as u32)?;
        bw.write(1, self.sink_path_status as u32)?;
        bw.write_bit(self.reverse_current_protection_status)?;
        bw.write_bit(self.power_reading_ready)?;
        bw.write(3, u32::from(self.scale_current & 0x7))?;
        bw.write(16, self.peak_current)?;
        bw.write(16, self.average_current)?;
        bw.write(4, u32::from(self.scale_voltage & 0xf))?;
        bw.write(16, self.voltage_reading)?;
        // Reserved
        bw.write(7, 0)?;
        Ok(())
    }
}
