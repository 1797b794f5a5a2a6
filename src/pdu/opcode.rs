//! Opcodes carried in the low six bits of the first BHS byte.

use thiserror::Error;

/// Mask selecting the opcode from the first BHS byte.
pub const OPCODE_MASK: u8 = 0x3f;
/// Immediate-delivery flag in the first BHS byte.
pub const IMMEDIATE_FLAG: u8 = 0x40;
/// Final flag in the second BHS byte.
pub const FINAL_FLAG: u8 = 0x80;
/// Status-present flag in the second byte of a Data-In PDU.
pub const STATUS_FLAG: u8 = 0x01;

/// Every opcode the initiator sends or understands.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    NopOut = 0x00,
    ScsiCommand = 0x01,
    TaskManagement = 0x02,
    Login = 0x03,
    Text = 0x04,
    DataOut = 0x05,
    Logout = 0x06,
    Snack = 0x10,
    NopIn = 0x20,
    ScsiResponse = 0x21,
    TaskManagementResponse = 0x22,
    LoginResponse = 0x23,
    TextResponse = 0x24,
    DataIn = 0x25,
    LogoutResponse = 0x26,
    ReadyToTransfer = 0x31,
    AsyncMessage = 0x32,
    Reject = 0x3f,
}

/// Returned when the opcode bits hold a value this engine does not handle.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("unimplemented opcode: {0:#04x}")]
pub struct UnknownOpcode(pub u8);

impl TryFrom<u8> for Opcode {
    type Error = UnknownOpcode;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        let op = match byte & OPCODE_MASK {
            0x00 => Self::NopOut,
            0x01 => Self::ScsiCommand,
            0x02 => Self::TaskManagement,
            0x03 => Self::Login,
            0x04 => Self::Text,
            0x05 => Self::DataOut,
            0x06 => Self::Logout,
            0x10 => Self::Snack,
            0x20 => Self::NopIn,
            0x21 => Self::ScsiResponse,
            0x22 => Self::TaskManagementResponse,
            0x23 => Self::LoginResponse,
            0x24 => Self::TextResponse,
            0x25 => Self::DataIn,
            0x26 => Self::LogoutResponse,
            0x31 => Self::ReadyToTransfer,
            0x32 => Self::AsyncMessage,
            0x3f => Self::Reject,
            other => return Err(UnknownOpcode(other)),
        };
        Ok(op)
    }
}

impl Opcode {
    /// Raw six-bit value.
    #[must_use]
    pub fn as_u8(self) -> u8 { self as u8 }

    /// Whether the PDU consumes (or is stamped with) a CmdSN.
    ///
    /// Data-Out continuation PDUs are the only initiator PDUs outside the
    /// command window.
    #[must_use]
    pub fn is_command(self) -> bool {
        matches!(
            self,
            Self::NopOut
                | Self::ScsiCommand
                | Self::TaskManagement
                | Self::Login
                | Self::Text
                | Self::Logout
                | Self::Snack
        )
    }

    /// Whether the PDU originates at the target.
    #[must_use]
    pub fn is_target_opcode(self) -> bool { self.as_u8() & 0x20 != 0 }

    /// Whether the StatSN field at bytes 24..28 is meaningful for this
    /// opcode. Data-In carries it only alongside the status flag.
    #[must_use]
    pub fn carries_stat_sn(self) -> bool {
        matches!(
            self,
            Self::NopIn
                | Self::ScsiResponse
                | Self::TaskManagementResponse
                | Self::LoginResponse
                | Self::TextResponse
                | Self::LogoutResponse
                | Self::ReadyToTransfer
                | Self::AsyncMessage
                | Self::Reject
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}({:#04x})", self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0x00, Opcode::NopOut)]
    #[case(0x41, Opcode::ScsiCommand)]
    #[case(0x25, Opcode::DataIn)]
    #[case(0x31, Opcode::ReadyToTransfer)]
    #[case(0xff, Opcode::Reject)]
    fn parses_opcode_ignoring_flag_bits(#[case] byte: u8, #[case] expected: Opcode) {
        assert_eq!(Opcode::try_from(byte), Ok(expected));
    }

    #[test]
    fn unknown_opcode_is_reported() {
        assert_eq!(Opcode::try_from(0x1c), Err(UnknownOpcode(0x1c)));
    }

    #[test]
    fn data_out_is_not_a_command() {
        assert!(!Opcode::DataOut.is_command());
        assert!(Opcode::NopOut.is_command());
        assert!(!Opcode::DataIn.carries_stat_sn());
    }
}
