//! # Record Store Errors
//!
//! Every fallible operation returns `eyre::Result`. Failures that callers need
//! to tell apart are raised as a [`CollectionError`] inside the report, so they
//! can be recovered with `downcast_ref`:
//!
//! ```ignore
//! match collection.read_record(&op, position) {
//!     Ok(record) => use_record(record),
//!     Err(e) if CollectionError::is_record_not_found(&e) => skip(),
//!     Err(e) => return Err(e),
//! }
//! ```
//!
//! ## Taxonomy
//!
//! | Class        | Variants                                            | Recoverable |
//! |--------------|-----------------------------------------------------|-------------|
//! | Not found    | `RecordNotFound`                                    | yes         |
//! | Corruption   | `Corrupted`                                         | no          |
//! | Precondition | `PositionOutOfRange`, `PageIndexOutOfRange`, ...    | no (bug)    |
//!
//! I/O failures from the storage layer are propagated as plain reports with
//! file and page context attached.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectionError {
    /// Position is absent, removed, only allocated, or its chain head is gone.
    #[error("record #{collection}:{position} not found")]
    RecordNotFound { collection: u32, position: u64 },

    /// Chunk chain or record header does not match the index.
    #[error("content of record #{collection}:{position} is broken: {reason}")]
    Corrupted {
        collection: u32,
        position: u64,
        reason: String,
    },

    #[error("position {position} is outside of position map extent ({extent} positions)")]
    PositionOutOfRange { position: u64, extent: u64 },

    #[error("page index {page_index} exceeds free space map capacity of {capacity} pages")]
    PageIndexOutOfRange { page_index: u32, capacity: u64 },

    #[error("atomic operation is read-only")]
    ReadOnlyOperation,

    #[error("record of {size} bytes exceeds maximum record size")]
    RecordTooLarge { size: usize },

    #[error("invalid collection name '{name}'")]
    InvalidCollectionName { name: String },

    #[error("unknown record conflict strategy '{name}'")]
    UnknownConflictStrategy { name: String },
}

impl CollectionError {
    pub fn is_record_not_found(report: &eyre::Report) -> bool {
        matches!(
            report.downcast_ref::<CollectionError>(),
            Some(CollectionError::RecordNotFound { .. })
        )
    }

    pub fn is_corruption(report: &eyre::Report) -> bool {
        matches!(
            report.downcast_ref::<CollectionError>(),
            Some(CollectionError::Corrupted { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_error_survives_eyre_report() {
        let report: eyre::Report = CollectionError::RecordNotFound {
            collection: 3,
            position: 17,
        }
        .into();

        assert!(CollectionError::is_record_not_found(&report));
        assert!(!CollectionError::is_corruption(&report));
        assert_eq!(report.to_string(), "record #3:17 not found");
    }

    #[test]
    fn plain_report_is_not_typed() {
        let report = eyre::eyre!("disk on fire");

        assert!(!CollectionError::is_record_not_found(&report));
        assert!(report.downcast_ref::<CollectionError>().is_none());
    }

    #[test]
    fn corruption_message_carries_reason() {
        let err = CollectionError::Corrupted {
            collection: 1,
            position: 2,
            reason: "position mismatch".into(),
        };

        assert!(err.to_string().contains("position mismatch"));
    }
}
