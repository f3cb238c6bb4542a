//! Position codec: linear character offsets ⇄ (line, column) coordinates.
//!
//! Both directions are total. Offsets past the end of the document clamp to
//! the end of the last line, columns past the end of a line clamp to the end
//! of that line, and lines past the last line clamp to the end of the
//! document. A rendering path that receives a stale offset therefore never
//! fails, it only lands somewhere wrong (callers detect that separately, see
//! [`crate::apply::Applied::clamped`]).

use serde::{Deserialize, Serialize};

/// Zero-based line and column. Columns count `char`s within the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub const ZERO: Position = Position { line: 0, column: 0 };

    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

/// Convert a character offset into a (line, column) coordinate.
///
/// Walks the document line by line, accumulating `line_len + 1` for the
/// newline, until the accumulated length would pass `offset`.
pub fn offset_to_position(document: &str, offset: usize) -> Position {
    let mut accumulated = 0usize;
    let mut end = Position::ZERO;

    for (line, text) in document.split('\n').enumerate() {
        let len = text.chars().count();
        if accumulated + len + 1 > offset {
            return Position::new(line, offset - accumulated);
        }
        accumulated += len + 1;
        end = Position::new(line, len);
    }

    end
}

/// Convert a (line, column) coordinate back into a character offset.
pub fn position_to_offset(document: &str, position: Position) -> usize {
    let mut accumulated = 0usize;

    for (line, text) in document.split('\n').enumerate() {
        let len = text.chars().count();
        if line == position.line {
            return accumulated + position.column.min(len);
        }
        accumulated += len + 1;
    }

    // Past the last line: the loop over-counted one trailing newline.
    accumulated.saturating_sub(1)
}

/// Byte index of a coordinate inside `document`, for splicing a `String`.
pub(crate) fn position_to_byte(document: &str, position: Position) -> usize {
    let mut start = 0usize;

    for (line, text) in document.split('\n').enumerate() {
        if line == position.line {
            return start
                + text
                    .char_indices()
                    .nth(position.column)
                    .map_or(text.len(), |(byte, _)| byte);
        }
        start += text.len() + 1;
    }

    document.len()
}

/// Number of characters in `document`.
pub fn char_len(document: &str) -> usize {
    document.chars().count()
}
