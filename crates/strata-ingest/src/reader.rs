//! Streaming reader over JSON-lines artifacts.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use crate::error::{Error, Result};
use crate::snapshot::{RawRecord, SnapshotKind};

/// One non-blank line of an artifact.
#[derive(Debug)]
pub enum ArtifactLine {
    /// A raw record of the reader's kind.
    Record(RawRecord),
    /// A line that is not a raw record of the reader's kind. Dropped by callers.
    Unreadable {
        /// One-based line number.
        line: u64,
        /// Why decoding failed.
        message: String,
    },
}

/// Reads raw records one line at a time; blank lines are skipped.
pub struct RecordReader {
    kind: SnapshotKind,
    lines: Lines<BufReader<File>>,
    line_number: u64,
}

impl RecordReader {
    /// Opens a reader over a local artifact file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened.
    pub async fn open(path: &Path, kind: SnapshotKind) -> Result<Self> {
        let file = File::open(path)
            .await
            .map_err(|e| Error::io(format!("failed to open {}", path.display()), e))?;
        Ok(Self {
            kind,
            lines: BufReader::new(file).lines(),
            line_number: 0,
        })
    }

    /// Returns the next non-blank line, or `None` at end of file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if reading fails. Lines that do not decode are
    /// returned as [`ArtifactLine::Unreadable`], not as errors.
    pub async fn next_line(&mut self) -> Result<Option<ArtifactLine>> {
        loop {
            let Some(line) = self
                .lines
                .next_line()
                .await
                .map_err(|e| Error::io("failed to read artifact", e))?
            else {
                return Ok(None);
            };
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(match self.kind.parse_line(&line) {
                Ok(record) => ArtifactLine::Record(record),
                Err(e) => ArtifactLine::Unreadable {
                    line: self.line_number,
                    message: e.to_string(),
                },
            }));
        }
    }

    /// Lines consumed so far, including blank ones.
    #[must_use]
    pub const fn line_number(&self) -> u64 {
        self.line_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn artifact(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn reads_records_and_skips_blank_lines() {
        let file = artifact(
            "{\"timestamp\":1,\"userId\":2}\n\n{\"timestamp\":3,\"userId\":4}\n",
        );
        let mut reader = RecordReader::open(file.path(), SnapshotKind::UserAccess)
            .await
            .unwrap();

        let mut count = 0;
        while let Some(line) = reader.next_line().await.unwrap() {
            assert!(matches!(line, ArtifactLine::Record(RawRecord::Access(_))));
            count += 1;
        }
        assert_eq!(count, 2);
        assert_eq!(reader.line_number(), 3);
    }

    #[tokio::test]
    async fn undecodable_lines_are_returned_with_position() {
        let file = artifact(
            "{\"timestamp\":1,\"userId\":2}\n{broken\n{\"timestamp\":3,\"userId\":4}\n",
        );
        let mut reader = RecordReader::open(file.path(), SnapshotKind::UserAccess)
            .await
            .unwrap();
        assert!(matches!(
            reader.next_line().await.unwrap(),
            Some(ArtifactLine::Record(_))
        ));
        assert!(matches!(
            reader.next_line().await.unwrap(),
            Some(ArtifactLine::Unreadable { line: 2, .. })
        ));
        assert!(matches!(
            reader.next_line().await.unwrap(),
            Some(ArtifactLine::Record(_))
        ));
        assert!(reader.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_shape_is_unreadable() {
        let file = artifact("{\"timestamp\":1704182400000,\"jsonClassName\":\"x\"}\n");
        let mut reader = RecordReader::open(file.path(), SnapshotKind::TeamMember)
            .await
            .unwrap();
        let Some(ArtifactLine::Unreadable { line, message }) = reader.next_line().await.unwrap()
        else {
            panic!("expected an unreadable line");
        };
        assert_eq!(line, 1);
        assert!(message.contains("jsonString"), "{message}");
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let result =
            RecordReader::open(Path::new("/nonexistent/artifact.jsonl"), SnapshotKind::TeamMember)
                .await;
        assert!(matches!(result, Err(Error::Io { .. })));
    }
}
