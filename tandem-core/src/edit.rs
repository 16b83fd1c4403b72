//! The single primitive every operation reduces to: replace a range with text.

use serde::{Deserialize, Serialize};

use crate::position::{Position, TextRange};

/// Replace `range` with `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    pub range: TextRange,
    pub text: String,
}

impl Edit {
    pub fn new(range: TextRange, text: impl Into<String>) -> Self {
        Self {
            range,
            text: text.into(),
        }
    }

    /// Range the inserted text occupies once the edit is applied.
    pub fn post_range(&self) -> TextRange {
        TextRange::new(self.range.start, self.range.start.advance(&self.text))
    }

    /// Edit that undoes this one, given the text it replaced.
    pub fn inverse(&self, replaced: &str) -> Edit {
        Edit::new(self.post_range(), replaced)
    }

    /// Map a position from before this edit to after it.
    ///
    /// Positions before the edited range are unchanged. Positions at or past
    /// its end shift with the text that follows. Positions strictly inside
    /// the replaced range collapse to the end of the inserted text.
    pub fn map_position(&self, pos: Position) -> Position {
        let new_end = self.range.start.advance(&self.text);

        if pos < self.range.end {
            return if pos <= self.range.start { pos } else { new_end };
        }

        if pos.line == self.range.end.line {
            Position::new(new_end.line, new_end.column + (pos.column - self.range.end.column))
        } else {
            let shifted = pos.line as i64 + new_end.line as i64 - self.range.end.line as i64;
            Position::new(shifted.max(1) as u32, pos.column)
        }
    }

    /// Map both ends of a range through this edit.
    pub fn map_range(&self, range: TextRange) -> TextRange {
        TextRange::new(self.map_position(range.start), self.map_position(range.end))
    }

    /// Net change in line count caused by applying this edit.
    pub fn line_delta(&self) -> i64 {
        let added = self.text.matches('\n').count() as i64;
        let removed = (self.range.end.line - self.range.start.line) as i64;
        added - removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_range_of_insert() {
        let edit = Edit::new(TextRange::point(Position::new(2, 3)), "xy\nz");
        assert_eq!(edit.post_range(), TextRange::from_coords(2, 3, 3, 2));
    }

    #[test]
    fn test_inverse_of_delete_reinserts() {
        let edit = Edit::new(TextRange::from_coords(1, 1, 1, 4), "");
        let inverse = edit.inverse("abc");
        assert_eq!(inverse.range, TextRange::point(Position::START));
        assert_eq!(inverse.text, "abc");
    }

    #[test]
    fn test_map_position_before_is_unchanged() {
        let edit = Edit::new(TextRange::from_coords(3, 1, 3, 5), "");
        assert_eq!(edit.map_position(Position::new(2, 9)), Position::new(2, 9));
        assert_eq!(edit.map_position(Position::new(3, 1)), Position::new(3, 1));
    }

    #[test]
    fn test_map_position_same_line_after_insert() {
        let edit = Edit::new(TextRange::point(Position::new(1, 1)), "foo");
        assert_eq!(edit.map_position(Position::new(1, 4)), Position::new(1, 7));
    }

    #[test]
    fn test_map_position_same_line_after_delete() {
        let edit = Edit::new(TextRange::from_coords(1, 1, 1, 4), "");
        assert_eq!(edit.map_position(Position::new(1, 4)), Position::new(1, 1));
        assert_eq!(edit.map_position(Position::new(1, 9)), Position::new(1, 6));
    }

    #[test]
    fn test_map_position_later_line_shifts_by_line_delta() {
        let insert_line = Edit::new(TextRange::point(Position::new(1, 1)), "new line\n");
        assert_eq!(insert_line.map_position(Position::new(5, 3)), Position::new(6, 3));

        let join_lines = Edit::new(TextRange::from_coords(1, 4, 3, 1), "");
        assert_eq!(join_lines.map_position(Position::new(5, 3)), Position::new(3, 3));
    }

    #[test]
    fn test_map_position_inside_collapses() {
        let edit = Edit::new(TextRange::from_coords(1, 2, 1, 8), "ab");
        assert_eq!(edit.map_position(Position::new(1, 5)), Position::new(1, 4));
    }

    #[test]
    fn test_line_delta() {
        assert_eq!(Edit::new(TextRange::point(Position::START), "a\nb\n").line_delta(), 2);
        assert_eq!(Edit::new(TextRange::from_coords(2, 1, 4, 1), "").line_delta(), -2);
    }
}
