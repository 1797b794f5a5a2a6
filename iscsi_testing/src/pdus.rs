//! Builders for the PDUs a target sends, plus a few initiator requests.
//!
//! Every target PDU carries a [`Window`] so tests control the command
//! window the session observes.

use bytes::Bytes;
use iscsi_initiator::{
    pdu::{Bhs, Opcode, Pdu},
    sequence::RESERVED_TAG,
};

/// Sequence fields stamped on target PDUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            stat_sn: 1,
            exp_cmd_sn: 1,
            max_cmd_sn: 16,
        }
    }
}

impl Window {
    /// A window admitting `exp_cmd_sn..=max_cmd_sn`.
    #[must_use]
    pub fn new(exp_cmd_sn: u32, max_cmd_sn: u32) -> Self {
        Self {
            exp_cmd_sn,
            max_cmd_sn,
            ..Self::default()
        }
    }

    /// A window the target has closed (`MaxCmdSN = ExpCmdSN - 1`).
    #[must_use]
    pub fn closed(exp_cmd_sn: u32) -> Self { Self::new(exp_cmd_sn, exp_cmd_sn.wrapping_sub(1)) }

    #[must_use]
    pub fn stat(mut self, stat_sn: u32) -> Self {
        self.stat_sn = stat_sn;
        self
    }

    fn stamp(self, header: &mut Bhs) {
        header.set_stat_sn(self.stat_sn);
        header.set_exp_cmd_sn(self.exp_cmd_sn);
        header.set_max_cmd_sn(self.max_cmd_sn);
    }
}

fn target_header(opcode: Opcode, itt: u32, window: Window) -> Bhs {
    let mut header = Bhs::new(opcode);
    header.set_final(true);
    header.set_itt(itt);
    header.set_ttt(RESERVED_TAG);
    window.stamp(&mut header);
    header
}

fn with_data(header: Bhs, data: Bytes) -> Pdu {
    Pdu::new(header)
        .with_data(data)
        .unwrap_or_else(|err| panic!("test payload must fit a data segment: {err}"))
}

/// SCSI Response completing `itt` with GOOD status.
#[must_use]
pub fn scsi_response(itt: u32, window: Window) -> Pdu { Pdu::new(target_header(Opcode::ScsiResponse, itt, window)) }

/// Task Management Function Response for `itt`.
#[must_use]
pub fn task_management_response(itt: u32, window: Window) -> Pdu {
    Pdu::new(target_header(Opcode::TaskManagementResponse, itt, window))
}

/// Data-In segment for `itt` at `offset`; `last` sets the F bit.
#[must_use]
pub fn data_in(itt: u32, data_sn: u32, offset: u32, data: &'static [u8], last: bool, window: Window) -> Pdu {
    let mut header = target_header(Opcode::DataIn, itt, window);
    header.set_final(last);
    header.set_status(last);
    header.set_data_sn(data_sn);
    header.set_buffer_offset(offset);
    with_data(header, Bytes::from_static(data))
}

/// Final Data-In without the S bit: status follows in a SCSI Response.
#[must_use]
pub fn data_in_without_status(itt: u32, data_sn: u32, offset: u32, data: &'static [u8], window: Window) -> Pdu {
    let mut header = target_header(Opcode::DataIn, itt, window);
    header.set_final(true);
    header.set_data_sn(data_sn);
    header.set_buffer_offset(offset);
    with_data(header, Bytes::from_static(data))
}

/// R2T soliciting `length` bytes of write data from `offset`.
#[must_use]
pub fn r2t(itt: u32, ttt: u32, offset: u32, length: u32, window: Window) -> Pdu {
    let mut header = target_header(Opcode::ReadyToTransfer, itt, window);
    header.set_ttt(ttt);
    header.set_buffer_offset(offset);
    header.set_desired_length(length);
    Pdu::new(header)
}

/// Target-initiated ping: reserved ITT, `ttt` present.
#[must_use]
pub fn nop_in_ping(ttt: u32, data: &'static [u8], window: Window) -> Pdu {
    let mut header = target_header(Opcode::NopIn, RESERVED_TAG, window);
    header.set_ttt(ttt);
    header.set_lun([0, 1, 0, 0, 0, 0, 0, 0]);
    with_data(header, Bytes::from_static(data))
}

/// NOP-In answering an initiator NOP-Out with `itt`.
#[must_use]
pub fn nop_in_reply(itt: u32, window: Window) -> Pdu { Pdu::new(target_header(Opcode::NopIn, itt, window)) }

/// NOP-In with both tags reserved; carries only window updates.
#[must_use]
pub fn nop_in_update(window: Window) -> Pdu { Pdu::new(target_header(Opcode::NopIn, RESERVED_TAG, window)) }

/// Reject of the request whose header was `rejected`, with `reason`.
#[must_use]
pub fn reject(rejected: &Bhs, reason: u8, window: Window) -> Pdu {
    let mut header = target_header(Opcode::Reject, RESERVED_TAG, window);
    header.as_bytes_mut()[2] = reason;
    with_data(header, Bytes::copy_from_slice(rejected.as_bytes()))
}

/// Asynchronous message carrying `event`; a reserved `itt` addresses the
/// whole session.
#[must_use]
pub fn async_message(itt: u32, event: u8, window: Window) -> Pdu {
    let mut header = target_header(Opcode::AsyncMessage, itt, window);
    header.as_bytes_mut()[36] = event;
    Pdu::new(header)
}

/// Login Response for `itt`.
#[must_use]
pub fn login_response(itt: u32, window: Window) -> Pdu { Pdu::new(target_header(Opcode::LoginResponse, itt, window)) }

/// Logout Response for `itt`.
#[must_use]
pub fn logout_response(itt: u32, window: Window) -> Pdu {
    Pdu::new(target_header(Opcode::LogoutResponse, itt, window))
}

/// Non-immediate SCSI command addressed to LUN 0.
#[must_use]
pub fn scsi_command() -> Pdu {
    let mut header = Bhs::new(Opcode::ScsiCommand);
    header.set_final(true);
    Pdu::new(header)
}

/// ABORT TASK management request. The referenced task tag is left zero.
#[must_use]
pub fn abort_task() -> Pdu {
    let mut header = Bhs::new(Opcode::TaskManagement);
    header.set_flags(0x81);
    Pdu::new(header)
}

/// Immediate Login request; the session assigns the ITT.
#[must_use]
pub fn login_request() -> Pdu {
    let mut header = Bhs::new(Opcode::Login);
    header.set_immediate(true);
    header.set_final(true);
    Pdu::new(header)
}

/// Immediate Logout request.
#[must_use]
pub fn logout_request() -> Pdu {
    let mut header = Bhs::new(Opcode::Logout);
    header.set_immediate(true);
    header.set_final(true);
    Pdu::new(header)
}
