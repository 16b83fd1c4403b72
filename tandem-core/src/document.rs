//! Line-based text buffer and deterministic replay.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::edit::Edit;
use crate::operation::ChangeOperation;
use crate::position::{Position, TextRange};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Position {position} is outside the document ({line_count} lines)")]
    OutOfBounds { position: Position, line_count: usize },
    #[error("Range {range} ends before it starts")]
    InvertedRange { range: TextRange },
    #[error("Operation {operation} failed to apply: {reason}")]
    ApplyFailed { operation: uuid::Uuid, reason: String },
}

/// Plain text held as a vector of lines without their terminators.
///
/// There is always at least one (possibly empty) line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDocument {
    lines: Vec<String>,
}

impl Default for TextDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl TextDocument {
    /// Empty document.
    pub fn new() -> Self {
        Self {
            lines: vec![String::new()],
        }
    }

    pub fn from_text(text: &str) -> Self {
        Self {
            lines: text.split('\n').map(str::to_owned).collect(),
        }
    }

    /// Full content, lines joined with `\n`.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Line `number` (1-based).
    pub fn line(&self, number: u32) -> Option<&str> {
        let idx = (number as usize).checked_sub(1)?;
        self.lines.get(idx).map(String::as_str)
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Position just past the last character.
    pub fn end(&self) -> Position {
        let last = self.lines.len();
        let width = self.lines[last - 1].chars().count();
        Position::new(last as u32, width as u32 + 1)
    }

    /// Whole document as a range.
    pub fn full_range(&self) -> TextRange {
        TextRange::new(Position::START, self.end())
    }

    fn check_range(&self, range: TextRange) -> Result<(), DocumentError> {
        if range.is_inverted() {
            return Err(DocumentError::InvertedRange { range });
        }
        self.check(range.start)?;
        self.check(range.end)
    }

    fn check(&self, position: Position) -> Result<(), DocumentError> {
        let out_of_bounds = || DocumentError::OutOfBounds {
            position,
            line_count: self.lines.len(),
        };
        let line = self.line(position.line).ok_or_else(out_of_bounds)?;
        if position.column == 0 || position.column as usize > line.chars().count() + 1 {
            return Err(out_of_bounds());
        }
        Ok(())
    }

    /// Byte offset of a 1-based column within `line`.
    fn byte_offset(line: &str, column: u32) -> usize {
        line.char_indices()
            .nth(column as usize - 1)
            .map(|(offset, _)| offset)
            .unwrap_or(line.len())
    }

    /// Text covered by `range`.
    pub fn slice(&self, range: TextRange) -> Result<String, DocumentError> {
        self.check_range(range)?;

        let start_line = &self.lines[range.start.line as usize - 1];
        let start_at = Self::byte_offset(start_line, range.start.column);

        if range.start.line == range.end.line {
            let end_at = Self::byte_offset(start_line, range.end.column);
            return Ok(start_line[start_at..end_at].to_owned());
        }

        let mut out = String::from(&start_line[start_at..]);
        for idx in range.start.line as usize..range.end.line as usize - 1 {
            out.push('\n');
            out.push_str(&self.lines[idx]);
        }
        let end_line = &self.lines[range.end.line as usize - 1];
        out.push('\n');
        out.push_str(&end_line[..Self::byte_offset(end_line, range.end.column)]);
        Ok(out)
    }

    /// Replace `edit.range` with `edit.text`.
    ///
    /// The range is validated before anything changes, so a failed edit
    /// leaves the document untouched.
    pub fn apply_edit(&mut self, edit: &Edit) -> Result<(), DocumentError> {
        self.check_range(edit.range)?;

        let first = edit.range.start.line as usize - 1;
        let last = edit.range.end.line as usize - 1;

        let prefix_at = Self::byte_offset(&self.lines[first], edit.range.start.column);
        let suffix_at = Self::byte_offset(&self.lines[last], edit.range.end.column);

        let mut joined = String::with_capacity(prefix_at + edit.text.len() + 16);
        joined.push_str(&self.lines[first][..prefix_at]);
        joined.push_str(&edit.text);
        joined.push_str(&self.lines[last][suffix_at..]);

        let replacement: Vec<String> = joined.split('\n').map(str::to_owned).collect();
        self.lines.splice(first..=last, replacement);
        Ok(())
    }

    /// Apply one operation.
    pub fn apply(&mut self, operation: &ChangeOperation) -> Result<(), DocumentError> {
        self.apply_edit(&operation.edit())
            .map_err(|e| DocumentError::ApplyFailed {
                operation: operation.id(),
                reason: e.to_string(),
            })
    }
}

/// Rebuild a document by applying `operations` in order on top of `base`.
///
/// Same base and same ordered history always yield the same text.
pub fn replay<'a, I>(base: &str, operations: I) -> Result<TextDocument, DocumentError>
where
    I: IntoIterator<Item = &'a ChangeOperation>,
{
    let mut doc = TextDocument::from_text(base);
    let mut applied = 0usize;
    for op in operations {
        doc.apply(op)?;
        applied += 1;
    }
    log::trace!("Replayed {applied} operations onto {} byte base", base.len());
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn doc(text: &str) -> TextDocument {
        TextDocument::from_text(text)
    }

    #[test]
    fn test_empty_document_has_one_line() {
        let d = TextDocument::new();
        assert_eq!(d.line_count(), 1);
        assert_eq!(d.text(), "");
        assert_eq!(d.end(), Position::START);
    }

    #[test]
    fn test_from_text_keeps_trailing_newline() {
        let d = doc("a\nb\n");
        assert_eq!(d.line_count(), 3);
        assert_eq!(d.text(), "a\nb\n");
    }

    #[test]
    fn test_insert_into_empty() {
        let mut d = TextDocument::new();
        d.apply_edit(&Edit::new(TextRange::point(Position::START), "foo")).unwrap();
        assert_eq!(d.text(), "foo");
    }

    #[test]
    fn test_insert_with_newlines() {
        let mut d = doc("hello world");
        d.apply_edit(&Edit::new(TextRange::point(Position::new(1, 6)), ",\nbig")).unwrap();
        assert_eq!(d.text(), "hello,\nbig world");
        assert_eq!(d.line(2), Some("big world"));
    }

    #[test]
    fn test_delete_across_lines() {
        let mut d = doc("one\ntwo\nthree");
        d.apply_edit(&Edit::new(TextRange::from_coords(1, 3, 3, 3), "")).unwrap();
        assert_eq!(d.text(), "onree");
    }

    #[test]
    fn test_replace_multibyte() {
        let mut d = doc("naïve café");
        d.apply_edit(&Edit::new(TextRange::from_coords(1, 7, 1, 11), "bar")).unwrap();
        assert_eq!(d.text(), "naïve bar");
    }

    #[test]
    fn test_slice() {
        let d = doc("one\ntwo\nthree");
        assert_eq!(d.slice(TextRange::from_coords(1, 2, 1, 4)).unwrap(), "ne");
        assert_eq!(d.slice(TextRange::from_coords(1, 3, 3, 3)).unwrap(), "e\ntwo\nth");
        assert_eq!(d.slice(d.full_range()).unwrap(), "one\ntwo\nthree");
    }

    #[test]
    fn test_out_of_bounds_leaves_document_untouched() {
        let mut d = doc("abc");
        let err = d
            .apply_edit(&Edit::new(TextRange::from_coords(1, 2, 2, 1), ""))
            .unwrap_err();
        assert!(matches!(err, DocumentError::OutOfBounds { .. }));
        assert_eq!(d.text(), "abc");

        assert!(d.apply_edit(&Edit::new(TextRange::point(Position::new(1, 5)), "x")).is_err());
        assert!(d.apply_edit(&Edit::new(TextRange::point(Position::new(1, 0)), "x")).is_err());
        assert!(d.apply_edit(&Edit::new(TextRange::point(Position::new(1, 4)), "d")).is_ok());
        assert_eq!(d.text(), "abcd");
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let mut d = doc("abcdef");
        let backwards = TextRange {
            start: Position::new(1, 5),
            end: Position::new(1, 2),
        };

        let err = d.apply_edit(&Edit::new(backwards, "")).unwrap_err();
        assert_eq!(err, DocumentError::InvertedRange { range: backwards });
        assert_eq!(d.text(), "abcdef");
        assert!(matches!(d.slice(backwards), Err(DocumentError::InvertedRange { .. })));

        let author = Uuid::new_v4();
        let op = ChangeOperation::delete(author, "f", 1, TextRange::from_coords(1, 2, 1, 5), "bcd")
            .rebased(backwards);
        assert!(matches!(d.apply(&op), Err(DocumentError::ApplyFailed { .. })));
    }

    #[test]
    fn test_replay_is_deterministic() {
        let author = Uuid::new_v4();
        let ops = vec![
            ChangeOperation::insert(author, "f", 1, Position::START, "fn main() {}\n"),
            ChangeOperation::insert(author, "f", 2, Position::new(1, 12), "\n    run();\n"),
            ChangeOperation::delete(author, "f", 3, TextRange::from_coords(1, 1, 1, 4), "fn "),
        ];

        let a = replay("", &ops).unwrap();
        let b = replay("", &ops).unwrap();
        assert_eq!(a.text().as_bytes(), b.text().as_bytes());
        assert_eq!(a.text(), "main() {\n    run();\n}\n");
    }

    #[test]
    fn test_undo_redo_replay() {
        let author = Uuid::new_v4();
        let insert = ChangeOperation::insert(author, "f", 1, Position::new(1, 4), "XYZ");
        let undo = ChangeOperation::undo(author, 2, &insert);
        let redo = ChangeOperation::redo(author, 3, &undo);

        assert_eq!(replay("abcdef", [&insert]).unwrap().text(), "abcXYZdef");
        assert_eq!(replay("abcdef", [&insert, &undo]).unwrap().text(), "abcdef");
        assert_eq!(replay("abcdef", [&insert, &undo, &redo]).unwrap().text(), "abcXYZdef");
    }

    #[test]
    fn test_replay_reports_failing_operation() {
        let author = Uuid::new_v4();
        let bad = ChangeOperation::insert(author, "f", 1, Position::new(7, 1), "x");
        let err = replay("short", [&bad]).unwrap_err();
        match err {
            DocumentError::ApplyFailed { operation, .. } => assert_eq!(operation, bad.id()),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
