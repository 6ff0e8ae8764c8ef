//! Byte stream to line splitters.

use tracing::warn;

use crate::record::Record;
use crate::stage::Transform;

/// Longest remainder carried between chunks before it is discarded.
pub const MAX_REMAINDER: usize = 2048;

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn to_line(bytes: &[u8]) -> Option<String> {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    if bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Splits a byte stream into lines, carrying partial lines across chunks.
#[derive(Debug)]
pub struct Liner {
    separator: Vec<u8>,
    remainder: Vec<u8>,
}

impl Default for Liner {
    fn default() -> Self {
        Self::new("\n")
    }
}

impl Liner {
    pub fn new(separator: &str) -> Self {
        let separator = if separator.is_empty() { "\n" } else { separator };
        Self {
            separator: separator.as_bytes().to_vec(),
            remainder: Vec::new(),
        }
    }

    /// Append `chunk` and return every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.remainder.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = find(&self.remainder[start..], &self.separator) {
            if let Some(line) = to_line(&self.remainder[start..start + pos]) {
                lines.push(line);
            }
            start += pos + self.separator.len();
        }
        self.remainder.drain(..start);
        if self.remainder.len() > MAX_REMAINDER {
            warn!(
                "Discarding {} bytes without a line separator",
                self.remainder.len()
            );
            self.remainder.clear();
        }
        lines
    }

    /// Emit the carried remainder, if any.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.remainder);
        to_line(&rest)
    }
}

impl Transform for Liner {
    fn name(&self) -> &str {
        "liner"
    }

    fn handle_read(&mut self, record: Record, out: &mut Vec<Record>) {
        match record {
            Record::Bytes(bytes) => out.extend(self.push(&bytes).into_iter().map(Record::Line)),
            other => out.push(other),
        }
    }

    fn close(&mut self, out: &mut Vec<Record>) {
        out.extend(self.flush().map(Record::Line));
    }
}

/// Splits every chunk on its own, for transports that keep record
/// boundaries (UDP datagrams).
#[derive(Debug)]
pub struct NonBufferingLiner {
    separator: String,
}

impl Default for NonBufferingLiner {
    fn default() -> Self {
        Self::new("\n")
    }
}

impl NonBufferingLiner {
    pub fn new(separator: &str) -> Self {
        let separator = if separator.is_empty() { "\n" } else { separator };
        Self {
            separator: separator.to_string(),
        }
    }

    pub fn split(&self, chunk: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(chunk)
            .split(self.separator.as_str())
            .filter_map(|part| to_line(part.as_bytes()))
            .collect()
    }
}

impl Transform for NonBufferingLiner {
    fn name(&self) -> &str {
        "non-buffering-liner"
    }

    fn handle_read(&mut self, record: Record, out: &mut Vec<Record>) {
        match record {
            Record::Bytes(bytes) => out.extend(self.split(&bytes).into_iter().map(Record::Line)),
            other => out.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{run_to_end, transform};

    #[test]
    fn test_lines_across_three_writes() {
        let mut liner = Liner::default();
        let mut lines = Vec::new();
        lines.extend(liner.push(b"$GPHDT,12"));
        lines.extend(liner.push(b"3.4,T*31\r\n$IIMTW,1"));
        lines.extend(liner.push(b"5.2,C*1A\n$IIDBT,"));

        assert_eq!(lines, vec!["$GPHDT,123.4,T*31", "$IIMTW,15.2,C*1A"]);
        assert_eq!(liner.flush(), Some("$IIDBT,".to_string()));
        assert_eq!(liner.flush(), None);
    }

    #[test]
    fn test_empty_lines_skipped() {
        let mut liner = Liner::default();
        assert_eq!(liner.push(b"\n\r\na\n\n"), vec!["a"]);
    }

    #[test]
    fn test_custom_separator() {
        let mut liner = Liner::new("\r\n");
        assert_eq!(liner.push(b"a\r\nb\nc\r\n"), vec!["a", "b\nc"]);
    }

    #[test]
    fn test_overlong_remainder_discarded() {
        let mut liner = Liner::default();
        assert!(liner.push(&vec![b'x'; MAX_REMAINDER + 1]).is_empty());
        assert_eq!(liner.push(b"tail\n"), vec!["tail"]);
    }

    #[test]
    fn test_non_buffering_liner() {
        let liner = NonBufferingLiner::default();
        assert_eq!(liner.split(b"a\nb"), vec!["a", "b"]);
        assert_eq!(liner.split(b"c"), vec!["c"]);
    }

    #[tokio::test]
    async fn test_partial_line_only_after_end() {
        let out = run_to_end(
            vec![transform(Liner::default())],
            vec![
                Record::Bytes(b"one\ntw".to_vec()),
                Record::Bytes(b"o\nthr".to_vec()),
                Record::Bytes(b"ee".to_vec()),
            ],
        )
        .await;

        assert_eq!(
            out,
            vec![
                Record::Line("one".into()),
                Record::Line("two".into()),
                Record::Line("three".into()),
            ]
        );
    }
}
