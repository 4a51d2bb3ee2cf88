use chumsky::error::Simple;
use std::fmt::Display;
use std::hash::Hash;

use crate::traits::ManifestError;

/// 1-based line and column of a manifest location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pos {
    pub line: usize,
    pub column: usize,
}

/// Maps character offsets (as produced by the lexer spans) to [`Pos`].
#[derive(Debug)]
pub(crate) struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub(crate) fn new(source: &str) -> Self {
        let mut starts = vec![0];
        for (idx, ch) in source.chars().enumerate() {
            if ch == '\n' {
                starts.push(idx + 1);
            }
        }
        Self { starts }
    }

    pub(crate) fn pos(&self, offset: usize) -> Pos {
        // starts[0] == 0, so at least one line start precedes any offset
        let line = self.starts.partition_point(|&start| start <= offset).max(1) - 1;
        Pos {
            line: line + 1,
            column: offset - self.starts[line] + 1,
        }
    }
}

/// Converts the first parser error into a positioned syntax error.
pub(crate) fn to_syntax_error<T: Display + Hash + Eq>(
    errors: Vec<Simple<T>>,
    index: &LineIndex,
) -> ManifestError {
    match errors.into_iter().next() {
        Some(err) => {
            let pos = index.pos(err.span().start);
            ManifestError::Syntax {
                line: pos.line,
                column: pos.column,
                message: err.to_string(),
            }
        }
        None => ManifestError::Syntax {
            line: 1,
            column: 1,
            message: "invalid manifest".to_string(),
        },
    }
}
