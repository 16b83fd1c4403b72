//! Line/column positions and half-open text ranges.
//!
//! Lines and columns are 1-based. Columns count Unicode scalar values, not
//! bytes, so a position means the same thing on every replica regardless of
//! how the editor widget encodes text.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A location between two characters of a document.
///
/// Ordering is lexicographic: line first, ties broken by column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    /// The first position of every document.
    pub const START: Position = Position { line: 1, column: 1 };

    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }

    /// Position reached after writing `text` starting here.
    pub fn advance(&self, text: &str) -> Position {
        let mut line = self.line;
        let mut column = self.column;
        for ch in text.chars() {
            if ch == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        Position { line, column }
    }

    /// Express this position relative to `origin`, so that `origin` becomes
    /// `START`. Only meaningful when `self >= origin`.
    pub fn relative_to(&self, origin: Position) -> Position {
        if self.line == origin.line {
            Position::new(1, self.column.saturating_sub(origin.column) + 1)
        } else {
            Position::new(self.line.saturating_sub(origin.line) + 1, self.column)
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::START
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Half-open range `[start, end)`.
///
/// An empty range (`start == end`) is the point an insert lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextRange {
    pub start: Position,
    pub end: Position,
}

impl TextRange {
    /// Build a range, swapping the ends if they are given backwards.
    pub fn new(start: Position, end: Position) -> Self {
        if end < start {
            Self { start: end, end: start }
        } else {
            Self { start, end }
        }
    }

    /// Shorthand for a range on line/column pairs.
    pub fn from_coords(start_line: u32, start_column: u32, end_line: u32, end_column: u32) -> Self {
        Self::new(
            Position::new(start_line, start_column),
            Position::new(end_line, end_column),
        )
    }

    /// Empty range at `at`.
    pub fn point(at: Position) -> Self {
        Self { start: at, end: at }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True for a range whose end precedes its start. Only reachable by
    /// building the struct directly or decoding one off the wire.
    pub fn is_inverted(&self) -> bool {
        self.end < self.start
    }

    /// Range intersection test used for conflict detection.
    ///
    /// Two ranges overlap unless one ends strictly before the other starts.
    /// Touching ranges and points on a boundary count as overlapping.
    pub fn overlaps(&self, other: &TextRange) -> bool {
        !(self.end < other.start || self.start > other.end)
    }

    /// Smallest range covering both.
    pub fn union(&self, other: &TextRange) -> TextRange {
        TextRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn contains(&self, pos: Position) -> bool {
        self.start <= pos && pos < self.end
    }

    /// Whether this range ends strictly before `other` starts.
    pub fn precedes(&self, other: &TextRange) -> bool {
        self.end < other.start
    }

    /// Express this range relative to `origin` (see [`Position::relative_to`]).
    pub fn relative_to(&self, origin: Position) -> TextRange {
        TextRange {
            start: self.start.relative_to(origin),
            end: self.end.relative_to(origin),
        }
    }
}

impl fmt::Display for TextRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
