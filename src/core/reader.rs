//! Tokenizer for the line oriented trace protocol.
//!
//! The data files are large and consist almost entirely of small hex
//! fields; going through locale-aware formatted input would dominate the
//! parse time. This reader does exactly what the protocol needs and nothing
//! more: one line at a time, hex fields terminated by a single space,
//! string fields running to the next space.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;

pub struct LineReader {
    line: Vec<u8>,
    pos: usize,
}

impl LineReader {
    pub fn new() -> LineReader {
        LineReader {
            line: Vec::with_capacity(1024),
            pos: 0,
        }
    }

    /// Read the next line; returns false at end of stream. The cursor is
    /// placed on the first field after the mode character.
    pub fn next_line(&mut self, input: &mut dyn BufRead) -> io::Result<bool> {
        self.line.clear();
        let read = input.read_until(b'\n', &mut self.line)?;
        if read == 0 {
            return Ok(false);
        }
        if self.line.last() == Some(&b'\n') {
            self.line.pop();
        }
        self.pos = self.line.len().min(2);
        Ok(true)
    }

    /// First byte of the line; empty lines read as comments.
    pub fn mode(&self) -> u8 {
        if self.line.is_empty() {
            b'#'
        } else {
            self.line[0]
        }
    }

    /// The raw line, for diagnostics.
    pub fn line(&self) -> String {
        String::from_utf8_lossy(&self.line).into_owned()
    }

    /// Everything after the mode character and its separator, i.e. the
    /// verbatim payload of `s` and `X` lines.
    pub fn remainder(&self) -> &[u8] {
        &self.line[self.line.len().min(2)..]
    }

    /// Consume one space-delimited lowercase hex field.
    pub fn read_hex(&mut self) -> Option<u64> {
        let end = self.line.len();
        if self.pos >= end {
            return None;
        }
        let mut hex = 0u64;
        let mut it = self.pos;
        while it < end {
            let c = self.line[it];
            match c {
                b'0'..=b'9' => {
                    hex = hex * 16 + (c - b'0') as u64;
                }
                b'a'..=b'f' => {
                    hex = hex * 16 + (c - b'a' + 10) as u64;
                }
                b' ' => {
                    it += 1;
                    break;
                }
                _ => {
                    log::warn!("unexpected non-hex char {} at column {}", c as char, it);
                    return None;
                }
            }
            it += 1;
        }
        self.pos = it;
        Some(hex)
    }

    pub fn read_hex_u32(&mut self) -> Option<u32> {
        self.read_hex().map(|value| value as u32)
    }

    /// Consume one space-delimited token.
    pub fn read_token(&mut self) -> Option<&[u8]> {
        let end = self.line.len();
        let start = self.pos;
        let mut it = start;
        while it < end && self.line[it] != b' ' {
            it += 1;
        }
        if it == start {
            return None;
        }
        self.pos = if it < end { it + 1 } else { it };
        Some(&self.line[start..it])
    }
}

impl Default for LineReader {
    fn default() -> LineReader {
        LineReader::new()
    }
}

/// Open a trace file for reading, transparently decompressing gzip input
/// detected by the `.gz` suffix. Re-parsing always re-opens: gzip streams
/// are not seekable.
pub fn open_trace_file(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open heapscope data file: {}", path.display()))?;
    Ok(buffer_input(file, is_compressed(path)))
}

pub fn is_compressed(path: &Path) -> bool {
    path.extension().is_some_and(|extension| extension == "gz")
}

fn buffer_input<R: Read + 'static>(input: R, compressed: bool) -> Box<dyn BufRead> {
    if compressed {
        Box::new(BufReader::new(GzDecoder::new(input)))
    } else {
        Box::new(BufReader::new(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader_over(data: &str) -> (LineReader, Cursor<Vec<u8>>) {
        (LineReader::new(), Cursor::new(data.as_bytes().to_vec()))
    }

    #[test]
    fn reads_modes_and_hex_fields() {
        let (mut reader, mut input) = reader_over("+ 40 2 7f00deadbeef\n- 7f00deadbeef\n");
        assert!(reader.next_line(&mut input).unwrap());
        assert_eq!(reader.mode(), b'+');
        assert_eq!(reader.read_hex(), Some(0x40));
        assert_eq!(reader.read_hex(), Some(0x2));
        assert_eq!(reader.read_hex(), Some(0x7f00deadbeef));
        assert_eq!(reader.read_hex(), None);

        assert!(reader.next_line(&mut input).unwrap());
        assert_eq!(reader.mode(), b'-');
        assert_eq!(reader.read_hex(), Some(0x7f00deadbeef));
        assert!(!reader.next_line(&mut input).unwrap());
    }

    #[test]
    fn string_payload_starts_at_column_three() {
        let (mut reader, mut input) = reader_over("s operator new(unsigned long)\n");
        assert!(reader.next_line(&mut input).unwrap());
        assert_eq!(reader.mode(), b's');
        assert_eq!(reader.remainder(), b"operator new(unsigned long)");
    }

    #[test]
    fn tokens_split_on_spaces() {
        let (mut reader, mut input) = reader_over("m /usr/lib/libc.so.6 7f00 0 1000\n");
        assert!(reader.next_line(&mut input).unwrap());
        assert_eq!(reader.read_token(), Some(b"/usr/lib/libc.so.6" as &[u8]));
        assert_eq!(reader.read_hex(), Some(0x7f00));
        assert_eq!(reader.read_hex(), Some(0));
        assert_eq!(reader.read_hex(), Some(0x1000));
        assert_eq!(reader.read_hex(), None);
    }

    #[test]
    fn malformed_hex_fails_the_field() {
        let (mut reader, mut input) = reader_over("c 12zz\n");
        assert!(reader.next_line(&mut input).unwrap());
        assert_eq!(reader.read_hex(), None);
    }

    #[test]
    fn empty_lines_read_as_comments() {
        let (mut reader, mut input) = reader_over("\n# note\n");
        assert!(reader.next_line(&mut input).unwrap());
        assert_eq!(reader.mode(), b'#');
        assert!(reader.next_line(&mut input).unwrap());
        assert_eq!(reader.mode(), b'#');
    }

    #[test]
    fn gzipped_input_round_trips() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"v 10200 3\nc 1f\n").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut input = buffer_input(Cursor::new(compressed), true);
        let mut reader = LineReader::new();
        assert!(reader.next_line(&mut input).unwrap());
        assert_eq!(reader.mode(), b'v');
        assert_eq!(reader.read_hex(), Some(0x10200));
        assert_eq!(reader.read_hex(), Some(3));
        assert!(reader.next_line(&mut input).unwrap());
        assert_eq!(reader.read_hex(), Some(0x1f));
    }

    #[test]
    fn compressed_suffix_detection() {
        assert!(is_compressed(Path::new("trace.gz")));
        assert!(!is_compressed(Path::new("trace.txt")));
    }
}
