//! Operation applier.
//!
//! Every position goes through the position codec before the splice, so an
//! offset past the end of the snapshot lands at the end of the last line
//! instead of failing. That clamp is reported through [`Applied::clamped`]
//! so the caller can distrust the result and ask for an authoritative
//! snapshot.

use crate::operation::Operation;
use crate::position::{char_len, offset_to_position, position_to_byte};

/// Result of applying one or more operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// The new snapshot.
    pub text: String,
    /// Whether any offset had to be clamped to the document bounds.
    pub clamped: bool,
}

/// Apply a single operation to `snapshot`.
pub fn apply(snapshot: &str, operation: &Operation) -> Applied {
    let len = char_len(snapshot);

    match operation {
        Operation::Insert { position, text } => {
            let at = position_to_byte(snapshot, offset_to_position(snapshot, *position));
            let mut out = String::with_capacity(snapshot.len() + text.len());
            out.push_str(&snapshot[..at]);
            out.push_str(text);
            out.push_str(&snapshot[at..]);
            Applied {
                text: out,
                clamped: *position > len,
            }
        }
        Operation::Delete { position, length } => {
            let end_offset = position.saturating_add(*length);
            let start = position_to_byte(snapshot, offset_to_position(snapshot, *position));
            let end = position_to_byte(snapshot, offset_to_position(snapshot, end_offset));
            let mut out = String::with_capacity(snapshot.len());
            out.push_str(&snapshot[..start]);
            out.push_str(&snapshot[end.max(start)..]);
            Applied {
                text: out,
                clamped: end_offset > len,
            }
        }
    }
}

/// Apply `operations` strictly in order, each against the result of the
/// previous one.
pub fn apply_batch(snapshot: &str, operations: &[Operation]) -> Applied {
    let mut text = snapshot.to_owned();
    let mut clamped = false;

    for operation in operations {
        let applied = apply(&text, operation);
        if applied.clamped {
            log::debug!("clamped out-of-range operation {operation:?}");
        }
        clamped |= applied.clamped;
        text = applied.text;
    }

    Applied { text, clamped }
}
