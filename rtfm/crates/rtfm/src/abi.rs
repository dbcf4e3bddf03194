//! ABI Descriptor - Compatibility Between Instrumented Code and the Runtime
//!
//! Instrumented code embeds the descriptor it was built against and hands it
//! to `check_abi` at startup. Every field is a native-endian `u32`:
//!
//! ```text
//! ┌───────┬─────────┬───────────────┬─────────┬──────────────┬──────────────┐
//! │ magic │ version │ pointer_width │ max_tag │ result codes │ status codes │
//! │  4 B  │   4 B   │      4 B      │   4 B   │   5 x 4 B    │   7 x 4 B    │
//! └───────┴─────────┴───────────────┴─────────┴──────────────┴──────────────┘
//! ```

use crate::context::{ContextStatus, TransactionResult};
use crate::error::{Result, RtfmError};
use crate::memory::TaggedMemoryLocation;

/// "RTFM" in ASCII
pub const ABI_MAGIC: u32 = u32::from_be_bytes(*b"RTFM");

/// Bumped on any change to the flat surface or the codes below
pub const ABI_VERSION: u32 = 1;

const RESULT_COUNT: usize = 5;
const STATUS_COUNT: usize = 7;

/// Results in code order
pub const RESULTS: [TransactionResult; RESULT_COUNT] = [
    TransactionResult::Committed,
    TransactionResult::AbortedByRequest,
    TransactionResult::AbortedByLanguage,
    TransactionResult::AbortedByCascade,
    TransactionResult::AbortedByFailedLockAcquisition,
];

/// Statuses in code order
pub const STATUSES: [ContextStatus; STATUS_COUNT] = [
    ContextStatus::Idle,
    ContextStatus::OnTrack,
    ContextStatus::AbortedByRequest,
    ContextStatus::AbortedByLanguage,
    ContextStatus::AbortedByFailedLockAcquisition,
    ContextStatus::AbortedByCascade,
    ContextStatus::Committing,
];

/// Flat code of a transaction result
pub fn result_code(result: TransactionResult) -> u32 {
    match result {
        TransactionResult::Committed => 0,
        TransactionResult::AbortedByRequest => 1,
        TransactionResult::AbortedByLanguage => 2,
        TransactionResult::AbortedByCascade => 3,
        TransactionResult::AbortedByFailedLockAcquisition => 4,
    }
}

/// Flat code of a context status
pub fn status_code(status: ContextStatus) -> u32 {
    match status {
        ContextStatus::Idle => 0,
        ContextStatus::OnTrack => 1,
        ContextStatus::AbortedByRequest => 2,
        ContextStatus::AbortedByLanguage => 3,
        ContextStatus::AbortedByFailedLockAcquisition => 4,
        ContextStatus::AbortedByCascade => 5,
        ContextStatus::Committing => 6,
    }
}

/// AbiDescriptor - layout facts both sides must agree on
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbiDescriptor {
    pub magic: u32,
    pub version: u32,
    pub pointer_width: u32,
    pub max_tag: u32,
    pub result_codes: [u32; RESULT_COUNT],
    pub status_codes: [u32; STATUS_COUNT],
}

impl AbiDescriptor {
    /// Serialized size in bytes
    pub const SIZE: usize = 4 * (4 + RESULT_COUNT + STATUS_COUNT);

    /// Descriptor of this runtime build
    pub fn current() -> Self {
        Self {
            magic: ABI_MAGIC,
            version: ABI_VERSION,
            pointer_width: std::mem::size_of::<usize>() as u32,
            max_tag: TaggedMemoryLocation::MAX_SIZE as u32,
            result_codes: RESULTS.map(result_code),
            status_codes: STATUSES.map(status_code),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIZE);
        for word in self.words() {
            bytes.extend_from_slice(&word.to_ne_bytes());
        }
        bytes
    }

    /// Decode a serialized descriptor
    ///
    /// # Errors
    ///
    /// `RtfmError::InvalidArgument` for a blob of the wrong length or with
    /// the wrong magic.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(RtfmError::InvalidArgument(format!(
                "ABI descriptor is {} bytes, expected {}",
                bytes.len(),
                Self::SIZE
            )));
        }

        let mut words = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        let mut next = || words.next().unwrap_or(0);

        let magic = next();
        if magic != ABI_MAGIC {
            return Err(RtfmError::InvalidArgument(format!(
                "ABI descriptor magic {:#010x}, expected {:#010x}",
                magic, ABI_MAGIC
            )));
        }

        let version = next();
        let pointer_width = next();
        let max_tag = next();
        let mut result_codes = [0u32; RESULT_COUNT];
        for code in &mut result_codes {
            *code = next();
        }
        let mut status_codes = [0u32; STATUS_COUNT];
        for code in &mut status_codes {
            *code = next();
        }

        Ok(Self {
            magic,
            version,
            pointer_width,
            max_tag,
            result_codes,
            status_codes,
        })
    }

    /// Name of the first field that differs from `other`
    pub fn mismatch(&self, other: &AbiDescriptor) -> Option<&'static str> {
        if self.magic != other.magic {
            Some("magic")
        } else if self.version != other.version {
            Some("version")
        } else if self.pointer_width != other.pointer_width {
            Some("pointer_width")
        } else if self.max_tag != other.max_tag {
            Some("max_tag")
        } else if self.result_codes != other.result_codes {
            Some("result_codes")
        } else if self.status_codes != other.status_codes {
            Some("status_codes")
        } else {
            None
        }
    }

    fn words(&self) -> impl Iterator<Item = u32> + '_ {
        [self.magic, self.version, self.pointer_width, self.max_tag]
            .into_iter()
            .chain(self.result_codes.iter().copied())
            .chain(self.status_codes.iter().copied())
    }
}

/// Compare a serialized descriptor with this runtime; fatal on mismatch
pub fn check_abi(blob: &[u8]) {
    let theirs = match AbiDescriptor::from_bytes(blob) {
        Ok(descriptor) => descriptor,
        Err(e) => crate::fatal!("ABI check failed: {}", e),
    };
    let ours = AbiDescriptor::current();
    if let Some(field) = ours.mismatch(&theirs) {
        crate::fatal!(
            "ABI mismatch in {}: runtime {:?}, caller {:?}",
            field,
            ours,
            theirs
        );
    }
    log::debug!("ABI version {} verified", ours.version);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn test_current_roundtrips() {
        let ours = AbiDescriptor::current();
        let bytes = ours.to_bytes();
        assert_eq!(bytes.len(), AbiDescriptor::SIZE);
        assert_eq!(AbiDescriptor::from_bytes(&bytes).unwrap(), ours);
        check_abi(&bytes);
    }

    #[test]
    fn test_codes_are_distinct() {
        let codes: FxHashSet<u32> = RESULTS.iter().map(|r| result_code(*r)).collect();
        assert_eq!(codes.len(), RESULTS.len());
        let codes: FxHashSet<u32> = STATUSES.iter().map(|s| status_code(*s)).collect();
        assert_eq!(codes.len(), STATUSES.len());
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(AbiDescriptor::from_bytes(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let mut bytes = AbiDescriptor::current().to_bytes();
        bytes[0] ^= 0xFF;
        assert!(AbiDescriptor::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_mismatch_names_field() {
        let ours = AbiDescriptor::current();
        let theirs = AbiDescriptor {
            version: ABI_VERSION + 1,
            ..ours
        };
        assert_eq!(ours.mismatch(&theirs), Some("version"));
        assert_eq!(ours.mismatch(&ours), None);
    }

    #[test]
    #[should_panic(expected = "ABI mismatch in pointer_width")]
    fn test_check_abi_fatal_on_mismatch() {
        let theirs = AbiDescriptor {
            pointer_width: 2,
            ..AbiDescriptor::current()
        };
        check_abi(&theirs.to_bytes());
    }
}
