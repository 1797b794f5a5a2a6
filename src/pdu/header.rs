//! The 48-byte Basic Header Segment.
//!
//! `Bhs` stores the header exactly as it appears on the wire and exposes
//! typed accessors for the fields the session engine reads or stamps.

use crate::byte_order::{read_network_u24, read_network_u32, write_network_u24, write_network_u32};

use super::opcode::{FINAL_FLAG, IMMEDIATE_FLAG, OPCODE_MASK, Opcode, STATUS_FLAG, UnknownOpcode};

/// Size of the Basic Header Segment in bytes.
pub const BHS_LEN: usize = 48;

const AHS_LEN_OFFSET: usize = 4;
const DSL_OFFSET: usize = 5;
const LUN_OFFSET: usize = 8;
const ITT_OFFSET: usize = 16;
const TTT_OFFSET: usize = 20;
const CMD_SN_OFFSET: usize = 24;
const EXP_SN_OFFSET: usize = 28;
const MAX_CMD_SN_OFFSET: usize = 32;
const DATA_SN_OFFSET: usize = 36;
const BUFFER_OFFSET_OFFSET: usize = 40;
const DESIRED_LEN_OFFSET: usize = 44;

/// Basic Header Segment in wire layout.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Bhs([u8; BHS_LEN]);

impl Default for Bhs {
    fn default() -> Self { Self([0; BHS_LEN]) }
}

impl From<[u8; BHS_LEN]> for Bhs {
    fn from(bytes: [u8; BHS_LEN]) -> Self { Self(bytes) }
}

impl std::fmt::Debug for Bhs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bhs")
            .field("opcode", &format_args!("{:#04x}", self.raw_opcode()))
            .field("immediate", &self.is_immediate())
            .field("final", &self.is_final())
            .field("itt", &format_args!("{:#010x}", self.itt()))
            .field("data_segment_length", &self.data_segment_length())
            .finish_non_exhaustive()
    }
}

impl Bhs {
    /// Start a header for `opcode` with every other field zeroed.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        let mut bhs = Self::default();
        bhs.set_opcode(opcode);
        bhs
    }

    /// Borrow the raw wire bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; BHS_LEN] { &self.0 }

    /// Mutably borrow the raw wire bytes for opcode-specific fields.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; BHS_LEN] { &mut self.0 }

    fn u32_at(&self, offset: usize) -> u32 {
        let mut field = [0u8; 4];
        field.copy_from_slice(&self.0[offset..offset + 4]);
        read_network_u32(field)
    }

    fn set_u32_at(&mut self, offset: usize, value: u32) {
        self.0[offset..offset + 4].copy_from_slice(&write_network_u32(value));
    }

    /// Opcode bits without the immediate flag.
    #[must_use]
    pub fn raw_opcode(&self) -> u8 { self.0[0] & OPCODE_MASK }

    /// Decode the opcode.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownOpcode`] for values this engine does not handle.
    pub fn opcode(&self) -> Result<Opcode, UnknownOpcode> { Opcode::try_from(self.0[0]) }

    /// Replace the opcode, preserving the immediate flag.
    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.0[0] = (self.0[0] & IMMEDIATE_FLAG) | opcode.as_u8();
    }

    #[must_use]
    pub fn is_immediate(&self) -> bool { self.0[0] & IMMEDIATE_FLAG != 0 }

    pub fn set_immediate(&mut self, immediate: bool) {
        if immediate {
            self.0[0] |= IMMEDIATE_FLAG;
        } else {
            self.0[0] &= !IMMEDIATE_FLAG;
        }
    }

    /// Opcode-specific flag byte (byte 1).
    #[must_use]
    pub fn flags(&self) -> u8 { self.0[1] }

    pub fn set_flags(&mut self, flags: u8) { self.0[1] = flags; }

    #[must_use]
    pub fn is_final(&self) -> bool { self.0[1] & FINAL_FLAG != 0 }

    pub fn set_final(&mut self, fin: bool) {
        if fin {
            self.0[1] |= FINAL_FLAG;
        } else {
            self.0[1] &= !FINAL_FLAG;
        }
    }

    /// Data-In status flag.
    #[must_use]
    pub fn has_status(&self) -> bool { self.0[1] & STATUS_FLAG != 0 }

    pub fn set_status(&mut self, status: bool) {
        if status {
            self.0[1] |= STATUS_FLAG;
        } else {
            self.0[1] &= !STATUS_FLAG;
        }
    }

    /// Length of the additional header segment in bytes.
    #[must_use]
    pub fn ahs_len(&self) -> usize { usize::from(self.0[AHS_LEN_OFFSET]) * 4 }

    /// Set the AHS length from a byte count; must be a multiple of four.
    pub fn set_ahs_words(&mut self, words: u8) { self.0[AHS_LEN_OFFSET] = words; }

    /// 24-bit data segment length, excluding padding.
    #[must_use]
    pub fn data_segment_length(&self) -> u32 {
        let mut field = [0u8; 3];
        field.copy_from_slice(&self.0[DSL_OFFSET..DSL_OFFSET + 3]);
        read_network_u24(field)
    }

    pub fn set_data_segment_length(&mut self, len: u32) {
        self.0[DSL_OFFSET..DSL_OFFSET + 3].copy_from_slice(&write_network_u24(len));
    }

    #[must_use]
    pub fn lun(&self) -> [u8; 8] {
        let mut lun = [0u8; 8];
        lun.copy_from_slice(&self.0[LUN_OFFSET..LUN_OFFSET + 8]);
        lun
    }

    pub fn set_lun(&mut self, lun: [u8; 8]) {
        self.0[LUN_OFFSET..LUN_OFFSET + 8].copy_from_slice(&lun);
    }

    /// Initiator Task Tag.
    #[must_use]
    pub fn itt(&self) -> u32 { self.u32_at(ITT_OFFSET) }

    pub fn set_itt(&mut self, itt: u32) { self.set_u32_at(ITT_OFFSET, itt); }

    /// Target Transfer Tag.
    #[must_use]
    pub fn ttt(&self) -> u32 { self.u32_at(TTT_OFFSET) }

    pub fn set_ttt(&mut self, ttt: u32) { self.set_u32_at(TTT_OFFSET, ttt); }

    /// CmdSN on initiator PDUs.
    #[must_use]
    pub fn cmd_sn(&self) -> u32 { self.u32_at(CMD_SN_OFFSET) }

    pub fn set_cmd_sn(&mut self, sn: u32) { self.set_u32_at(CMD_SN_OFFSET, sn); }

    /// StatSN on target PDUs (same offset as CmdSN).
    #[must_use]
    pub fn stat_sn(&self) -> u32 { self.u32_at(CMD_SN_OFFSET) }

    pub fn set_stat_sn(&mut self, sn: u32) { self.set_u32_at(CMD_SN_OFFSET, sn); }

    /// ExpStatSN on initiator PDUs.
    #[must_use]
    pub fn exp_stat_sn(&self) -> u32 { self.u32_at(EXP_SN_OFFSET) }

    pub fn set_exp_stat_sn(&mut self, sn: u32) { self.set_u32_at(EXP_SN_OFFSET, sn); }

    /// ExpCmdSN on target PDUs (same offset as ExpStatSN).
    #[must_use]
    pub fn exp_cmd_sn(&self) -> u32 { self.u32_at(EXP_SN_OFFSET) }

    pub fn set_exp_cmd_sn(&mut self, sn: u32) { self.set_u32_at(EXP_SN_OFFSET, sn); }

    /// MaxCmdSN on target PDUs.
    #[must_use]
    pub fn max_cmd_sn(&self) -> u32 { self.u32_at(MAX_CMD_SN_OFFSET) }

    pub fn set_max_cmd_sn(&mut self, sn: u32) { self.set_u32_at(MAX_CMD_SN_OFFSET, sn); }

    /// DataSN on Data-In/Data-Out, R2TSN on R2T.
    #[must_use]
    pub fn data_sn(&self) -> u32 { self.u32_at(DATA_SN_OFFSET) }

    pub fn set_data_sn(&mut self, sn: u32) { self.set_u32_at(DATA_SN_OFFSET, sn); }

    /// Buffer offset on Data-In/Data-Out/R2T.
    #[must_use]
    pub fn buffer_offset(&self) -> u32 { self.u32_at(BUFFER_OFFSET_OFFSET) }

    pub fn set_buffer_offset(&mut self, offset: u32) {
        self.set_u32_at(BUFFER_OFFSET_OFFSET, offset);
    }

    /// Desired data transfer length on R2T.
    #[must_use]
    pub fn desired_length(&self) -> u32 { self.u32_at(DESIRED_LEN_OFFSET) }

    pub fn set_desired_length(&mut self, len: u32) { self.set_u32_at(DESIRED_LEN_OFFSET, len); }

    /// Zero `range` of the header.
    pub fn clear(&mut self, range: std::ops::Range<usize>) { self.0[range].fill(0); }
}
