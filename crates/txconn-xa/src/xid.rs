//! Transaction branch identifiers.

use std::fmt;

use crate::error::XaError;

/// X/Open transaction branch identifier.
///
/// An `Xid` names one branch of a global transaction: the global
/// transaction id is shared by every branch, the branch qualifier tells
/// the branches apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Xid {
    format_id: i32,
    global_transaction_id: Vec<u8>,
    branch_qualifier: Vec<u8>,
}

impl Xid {
    /// Maximum length of the global transaction id.
    pub const MAX_GTRID_SIZE: usize = 64;
    /// Maximum length of the branch qualifier.
    pub const MAX_BQUAL_SIZE: usize = 64;

    /// Create a branch identifier.
    ///
    /// Fails with [`XaError::InvalidArgument`] when either component
    /// exceeds its maximum size.
    pub fn new(
        format_id: i32,
        global_transaction_id: &[u8],
        branch_qualifier: &[u8],
    ) -> Result<Self, XaError> {
        if global_transaction_id.len() > Self::MAX_GTRID_SIZE {
            return Err(XaError::InvalidArgument(format!(
                "global transaction id is {} bytes (max {})",
                global_transaction_id.len(),
                Self::MAX_GTRID_SIZE
            )));
        }
        if branch_qualifier.len() > Self::MAX_BQUAL_SIZE {
            return Err(XaError::InvalidArgument(format!(
                "branch qualifier is {} bytes (max {})",
                branch_qualifier.len(),
                Self::MAX_BQUAL_SIZE
            )));
        }

        Ok(Self {
            format_id,
            global_transaction_id: global_transaction_id.to_vec(),
            branch_qualifier: branch_qualifier.to_vec(),
        })
    }

    /// Generate a fresh identifier with a random global id and an empty
    /// branch qualifier.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self {
            format_id: 0,
            global_transaction_id: uuid.as_bytes().to_vec(),
            branch_qualifier: Vec::new(),
        }
    }

    /// Derive a sibling branch of the same global transaction.
    pub fn branch(&self, branch_qualifier: &[u8]) -> Result<Self, XaError> {
        Self::new(self.format_id, &self.global_transaction_id, branch_qualifier)
    }

    /// Returns the format identifier.
    #[must_use]
    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    /// Returns the global transaction identifier.
    #[must_use]
    pub fn global_transaction_id(&self) -> &[u8] {
        &self.global_transaction_id
    }

    /// Returns the branch qualifier.
    #[must_use]
    pub fn branch_qualifier(&self) -> &[u8] {
        &self.branch_qualifier
    }

    /// Pad the branch qualifier with zero bytes to [`Xid::MAX_BQUAL_SIZE`].
    ///
    /// Some resource managers only accept fixed-length qualifiers.
    #[must_use]
    pub fn padded(&self) -> Self {
        let mut branch_qualifier = self.branch_qualifier.clone();
        branch_qualifier.resize(Self::MAX_BQUAL_SIZE, 0);
        Self {
            format_id: self.format_id,
            global_transaction_id: self.global_transaction_id.clone(),
            branch_qualifier,
        }
    }

    /// Check whether two identifiers belong to the same global transaction.
    #[must_use]
    pub fn same_global_transaction(&self, other: &Xid) -> bool {
        self.format_id == other.format_id
            && self.global_transaction_id == other.global_transaction_id
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format_id)?;
        for byte in &self.global_transaction_id {
            write!(f, "{byte:02x}")?;
        }
        f.write_str(":")?;
        for byte in &self.branch_qualifier {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
