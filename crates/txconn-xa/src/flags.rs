//! XA flags, votes and return codes (X/Open XA values).

use bitflags::bitflags;

bitflags! {
    /// Flags passed to `start`, `end` and `recover`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct XaFlags: i32 {
        /// Caller is joining an existing branch.
        const JOIN = 0x0020_0000;
        /// Caller is resuming a suspended branch.
        const RESUME = 0x0800_0000;
        /// Dissociate successfully.
        const SUCCESS = 0x0400_0000;
        /// Dissociate and mark rollback-only.
        const FAIL = 0x2000_0000;
        /// Suspend the association.
        const SUSPEND = 0x0200_0000;
        /// Start a recovery scan.
        const START_RSCAN = 0x0100_0000;
        /// End a recovery scan.
        const END_RSCAN = 0x0080_0000;
        /// One-phase commit optimisation.
        const ONE_PHASE = 0x4000_0000;
    }
}

impl XaFlags {
    /// No flags (`TMNOFLAGS`).
    pub const NONE: Self = Self::empty();

    /// Check whether a `start` with these flags continues an existing branch.
    #[must_use]
    pub fn continues_branch(&self) -> bool {
        self.intersects(Self::JOIN | Self::RESUME)
    }
}

impl Default for XaFlags {
    fn default() -> Self {
        Self::NONE
    }
}

/// Result of a successful `prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// The branch is prepared and can be committed (`XA_OK`).
    Commit,
    /// The branch was read-only and is already complete (`XA_RDONLY`).
    ReadOnly,
}

impl Vote {
    /// The XA return code for this vote.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Commit => codes::XA_OK,
            Self::ReadOnly => codes::XA_RDONLY,
        }
    }
}

/// Raw XA return and error codes.
pub mod codes {
    /// Normal execution.
    pub const XA_OK: i32 = 0;
    /// Branch was read-only and has been committed.
    pub const XA_RDONLY: i32 = 3;
    /// Rollback for an unspecified reason.
    pub const XA_RBROLLBACK: i32 = 100;
    /// Asynchronous operation already outstanding.
    pub const XAER_ASYNC: i32 = -2;
    /// Resource manager error.
    pub const XAER_RMERR: i32 = -3;
    /// The XID is not valid.
    pub const XAER_NOTA: i32 = -4;
    /// Invalid arguments were given.
    pub const XAER_INVAL: i32 = -5;
    /// Routine invoked in an improper context.
    pub const XAER_PROTO: i32 = -6;
    /// Resource manager unavailable.
    pub const XAER_RMFAIL: i32 = -7;
    /// The XID already exists.
    pub const XAER_DUPID: i32 = -8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continues_branch() {
        assert!(XaFlags::JOIN.continues_branch());
        assert!(XaFlags::RESUME.continues_branch());
        assert!(!XaFlags::NONE.continues_branch());
        assert!(!XaFlags::SUCCESS.continues_branch());
    }

    #[test]
    fn test_vote_codes() {
        assert_eq!(Vote::Commit.code(), codes::XA_OK);
        assert_eq!(Vote::ReadOnly.code(), codes::XA_RDONLY);
    }
}
