//! Command-window accounting and task-tag generation.
//!
//! iSCSI sequence numbers are 32-bit serial numbers (RFC 1982): every
//! comparison goes through the helpers below rather than plain integer
//! ordering so the window keeps working across wraparound.

use thiserror::Error;

/// Reserved tag value meaning "no task" for ITT and TTT fields.
pub const RESERVED_TAG: u32 = 0xffff_ffff;

/// Slack allowed between `MaxCmdSN` and `ExpCmdSN`.
///
/// A target closes the window by advertising `MaxCmdSN = ExpCmdSN - 1`; any
/// advertisement further behind is corrupt and must be ignored.
pub const WINDOW_SLOP: u32 = 1;

#[expect(
    clippy::cast_possible_wrap,
    reason = "serial arithmetic reinterprets the wrapped distance as signed"
)]
fn distance(a: u32, b: u32) -> i32 { a.wrapping_sub(b) as i32 }

/// Serial `a < b`.
#[must_use]
pub fn sn_lt(a: u32, b: u32) -> bool { distance(a, b) < 0 }

/// Serial `a <= b`.
#[must_use]
pub fn sn_lte(a: u32, b: u32) -> bool { distance(a, b) <= 0 }

/// Serial `a > b`.
#[must_use]
pub fn sn_gt(a: u32, b: u32) -> bool { distance(a, b) > 0 }

/// Window fields carried by every target-originated PDU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowUpdate {
    /// Highest CmdSN the target will currently accept.
    pub max_cmd_sn: u32,
    /// Next CmdSN the target expects.
    pub exp_cmd_sn: u32,
    /// StatSN of the PDU, when the opcode carries a valid one.
    pub stat_sn: Option<u32>,
}

/// Returned when an advertised window cannot be applied.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    /// `MaxCmdSN` trails `ExpCmdSN` by more than [`WINDOW_SLOP`].
    #[error("regressive window: max_cmd_sn={max_cmd_sn} exp_cmd_sn={exp_cmd_sn}")]
    Regressive {
        /// Advertised `MaxCmdSN`.
        max_cmd_sn: u32,
        /// Advertised `ExpCmdSN`.
        exp_cmd_sn: u32,
    },
}

/// Point-in-time view of the tracker, used for diagnostics and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct WindowSnapshot {
    pub cmd: u32,
    pub exp_cmd: u32,
    pub max_cmd: u32,
    pub stat: u32,
    pub window: u32,
}

/// The four counters implementing the command window plus the ITT counter.
///
/// Only the transmit engine (via [`admit_command`](Self::admit_command))
/// and the receive engine (via [`observe_response`](Self::observe_response))
/// mutate the tracker; the session keeps it behind a single mutex.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceTracker {
    cmd: u32,
    exp_cmd: u32,
    max_cmd: u32,
    stat: u32,
    itt: u32,
    window: u32,
}

impl SequenceTracker {
    /// Create a tracker whose window admits exactly one command at
    /// `initial_cmd_sn` until the target advertises otherwise.
    ///
    /// # Examples
    ///
    /// ```
    /// use iscsi_initiator::sequence::SequenceTracker;
    ///
    /// let tracker = SequenceTracker::new(1);
    /// assert!(tracker.window_open());
    /// assert_eq!(tracker.window(), 1);
    /// ```
    #[must_use]
    pub fn new(initial_cmd_sn: u32) -> Self {
        Self::with_window(initial_cmd_sn, initial_cmd_sn, initial_cmd_sn)
    }

    /// Create a tracker with an explicit window.
    #[must_use]
    pub fn with_window(cmd: u32, exp_cmd: u32, max_cmd: u32) -> Self {
        Self {
            cmd,
            exp_cmd,
            max_cmd,
            stat: 0,
            itt: 0,
            window: window_size(exp_cmd, max_cmd),
        }
    }

    /// Returns `true` while `cmd` has not passed `max_cmd`.
    #[must_use]
    pub fn window_open(&self) -> bool { sn_lte(self.cmd, self.max_cmd) }

    /// Window size last advertised by the target (`max - exp + 1`, floored
    /// at zero).
    #[must_use]
    pub fn window(&self) -> u32 { self.window }

    /// Next CmdSN to be assigned.
    #[must_use]
    pub fn cmd_sn(&self) -> u32 { self.cmd }

    /// Value stamped into the `ExpStatSN` field of outbound PDUs.
    #[must_use]
    pub fn exp_stat_sn(&self) -> u32 { self.stat.wrapping_add(1) }

    /// Stamp a CmdSN for a command PDU.
    ///
    /// Immediate commands receive the current value without consuming a
    /// window slot.
    ///
    /// # Examples
    ///
    /// ```
    /// use iscsi_initiator::sequence::SequenceTracker;
    ///
    /// let mut tracker = SequenceTracker::with_window(7, 7, 10);
    /// assert_eq!(tracker.admit_command(true), 7);
    /// assert_eq!(tracker.admit_command(false), 7);
    /// assert_eq!(tracker.cmd_sn(), 8);
    /// ```
    pub fn admit_command(&mut self, immediate: bool) -> u32 {
        let sn = self.cmd;
        if !immediate {
            self.cmd = self.cmd.wrapping_add(1);
        }
        sn
    }

    /// Reconcile the window with values advertised by the target.
    ///
    /// Returns the window size now in force.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::Regressive`] when `MaxCmdSN` trails `ExpCmdSN`
    /// by more than [`WINDOW_SLOP`]; the tracker is left untouched.
    pub fn observe_response(&mut self, update: WindowUpdate) -> Result<u32, WindowError> {
        let WindowUpdate {
            max_cmd_sn,
            exp_cmd_sn,
            stat_sn,
        } = update;
        if sn_lt(max_cmd_sn.wrapping_add(WINDOW_SLOP), exp_cmd_sn) {
            return Err(WindowError::Regressive {
                max_cmd_sn,
                exp_cmd_sn,
            });
        }
        if sn_gt(exp_cmd_sn, self.exp_cmd) {
            self.exp_cmd = exp_cmd_sn;
        }
        if sn_gt(max_cmd_sn, self.max_cmd) {
            self.max_cmd = max_cmd_sn;
        }
        if let Some(stat) = stat_sn.filter(|stat| sn_gt(*stat, self.stat)) {
            self.stat = stat;
        }
        self.window = window_size(self.exp_cmd, self.max_cmd);
        Ok(self.window)
    }

    /// Allocate the next Initiator Task Tag, never yielding [`RESERVED_TAG`].
    pub fn next_itt(&mut self) -> u32 {
        let itt = self.itt;
        self.itt = self.itt.wrapping_add(1);
        if self.itt == RESERVED_TAG {
            self.itt = 0;
        }
        itt
    }

    /// Rewind `cmd` to the target's last acknowledged position.
    pub fn resync_to_target(&mut self) { self.cmd = self.exp_cmd; }

    /// Capture the counters for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            cmd: self.cmd,
            exp_cmd: self.exp_cmd,
            max_cmd: self.max_cmd,
            stat: self.stat,
            window: self.window,
        }
    }
}

impl Default for SequenceTracker {
    fn default() -> Self { Self::new(1) }
}

fn window_size(exp_cmd: u32, max_cmd: u32) -> u32 {
    if sn_lt(max_cmd, exp_cmd) {
        0
    } else {
        max_cmd.wrapping_sub(exp_cmd).wrapping_add(1)
    }
}
