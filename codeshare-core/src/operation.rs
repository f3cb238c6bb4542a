//! Edit operations and the batches they travel in.
//!
//! Wire format (JSON, internally tagged):
//! ```text
//! {"type":"insert","position":0,"text":"hello"}
//! {"type":"delete","position":3,"length":2}
//! ```
//!
//! Operations inside a batch are ordered: each one is interpreted against
//! the document produced by every earlier operation of the same batch.

use serde::{Deserialize, Serialize};

/// A single insert or delete expressed in character offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    /// Insert `text` starting at `position`.
    Insert { position: usize, text: String },
    /// Remove `length` characters starting at `position`.
    Delete { position: usize, length: usize },
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Self::Insert {
            position,
            text: text.into(),
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self::Delete { position, length }
    }

    /// Offset the operation starts at.
    pub fn position(&self) -> usize {
        match self {
            Self::Insert { position, .. } | Self::Delete { position, .. } => *position,
        }
    }

    /// Change in document length (in chars) caused by this operation.
    pub fn len_delta(&self) -> isize {
        match self {
            Self::Insert { text, .. } => text.chars().count() as isize,
            Self::Delete { length, .. } => -(*length as isize),
        }
    }

    /// Whether applying this operation leaves any document unchanged.
    pub fn is_noop(&self) -> bool {
        match self {
            Self::Insert { text, .. } => text.is_empty(),
            Self::Delete { length, .. } => *length == 0,
        }
    }
}

/// An ordered list of operations attributed to one peer, carrying the
/// document it produced as a full-state fallback and the revision it was
/// written against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationBatch {
    /// Originating peer identity.
    pub user: String,
    /// Last server revision the author had seen.
    pub revision: u64,
    /// Operations in emission order.
    pub operations: Vec<Operation>,
    /// Document after applying `operations`.
    pub snapshot: String,
}

impl OperationBatch {
    pub fn new(
        user: impl Into<String>,
        revision: u64,
        operations: Vec<Operation>,
        snapshot: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            revision,
            operations,
            snapshot: snapshot.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let insert = serde_json::to_string(&Operation::insert(0, "hello")).unwrap();
        assert_eq!(insert, r#"{"type":"insert","position":0,"text":"hello"}"#);

        let delete = serde_json::to_string(&Operation::delete(3, 2)).unwrap();
        assert_eq!(delete, r#"{"type":"delete","position":3,"length":2}"#);
    }

    #[test]
    fn test_parse_unknown_kind_fails() {
        let raw = r#"{"type":"retain","position":0}"#;
        assert!(serde_json::from_str::<Operation>(raw).is_err());
    }

    #[test]
    fn test_len_delta() {
        assert_eq!(Operation::insert(0, "héllo").len_delta(), 5);
        assert_eq!(Operation::delete(1, 3).len_delta(), -3);
    }

    #[test]
    fn test_noop() {
        assert!(Operation::insert(4, "").is_noop());
        assert!(Operation::delete(4, 0).is_noop());
        assert!(!Operation::delete(4, 1).is_noop());
    }

    #[test]
    fn test_batch_accessors() {
        let batch = OperationBatch::new("alice", 7, vec![Operation::insert(0, "x")], "x");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.revision, 7);
        assert!(!batch.is_empty());
        assert_eq!(batch.user, "alice");
    }
}
