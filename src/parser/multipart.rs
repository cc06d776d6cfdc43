//! Streaming multipart tokenizer.
//!
//! Turns a byte stream delimited by `--boundary` lines into [`MimeEvent`]s.
//! Only as much input is read as the next event needs, in reads of at most
//! `chunk_size` bytes. Tolerant of:
//!
//! - Mixed `\n` and `\r\n` line endings
//! - Preamble text before the first delimiter and an epilogue after the last
//! - Transport padding (trailing whitespace) on delimiter lines
//! - An empty body whose delimiter directly follows the header block

use std::io::{ErrorKind, Read};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{MimeError, Result};
use crate::parser::event::MimeEvent;
use crate::parser::header::parse_headers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Preamble,
    StartPart,
    Headers,
    /// `fresh` is true until the first body byte has been examined.
    Body { fresh: bool },
    AfterDelimiter,
    Done,
}

/// Pull tokenizer over any [`Read`].
pub struct MimeParser<R> {
    reader: R,
    /// `--` followed by the boundary.
    delimiter: Vec<u8>,
    chunk_size: usize,
    buf: Vec<u8>,
    pos: usize,
    /// Stream offset of `buf[0]`.
    base: u64,
    eof: bool,
    state: State,
}

impl<R: Read> MimeParser<R> {
    /// Create a tokenizer for `boundary` (without the leading `--`).
    pub fn new(reader: R, boundary: &str, chunk_size: usize) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            reader,
            delimiter,
            chunk_size: chunk_size.max(1),
            buf: Vec::with_capacity(chunk_size.max(1) * 2),
            pos: 0,
            base: 0,
            eof: false,
            state: State::Start,
        }
    }

    /// Stream offset of the next unconsumed byte.
    pub fn offset(&self) -> u64 {
        self.base + self.pos as u64
    }

    fn available(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Read up to `chunk_size` more bytes. Returns `false` at end of input.
    fn fill(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.base += self.pos as u64;
            self.pos = 0;
        }

        let start = self.buf.len();
        self.buf.resize(start + self.chunk_size, 0);
        let n = loop {
            match self.reader.read(&mut self.buf[start..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(MimeError::io("<stream>", e));
                }
            }
        };
        self.buf.truncate(start + n);
        if n == 0 {
            self.eof = true;
        }
        Ok(n > 0)
    }

    fn malformed(&self, reason: &str) -> MimeError {
        MimeError::malformed(self.offset(), reason)
    }

    /// Skip everything up to and including the first delimiter.
    fn skip_preamble(&mut self) -> Result<()> {
        let pattern = self.line_delimiter();
        loop {
            let data = self.available();
            let at_stream_start = self.offset() == 0;
            let undecided = at_stream_start && data.len() < self.delimiter.len();

            if at_stream_start && data.starts_with(&self.delimiter) {
                self.pos += self.delimiter.len();
                return Ok(());
            }
            if let Some(i) = find(data, &pattern) {
                self.pos += i + pattern.len();
                return Ok(());
            }
            // Keep a tail that might hold the start of the delimiter line.
            let keep = pattern.len() - 1;
            if !undecided && data.len() > keep {
                self.pos += data.len() - keep;
            }
            if !self.fill()? {
                return Err(self.malformed("missing start boundary"));
            }
        }
    }

    /// The delimiter as it appears at the start of a line: `\n--boundary`.
    fn line_delimiter(&self) -> Vec<u8> {
        let mut pattern = Vec::with_capacity(self.delimiter.len() + 1);
        pattern.push(b'\n');
        pattern.extend_from_slice(&self.delimiter);
        pattern
    }

    /// Consume the rest of a delimiter line. Returns `true` for the closing delimiter.
    fn finish_delimiter_line(&mut self) -> Result<bool> {
        while self.available().len() < 2 {
            if !self.fill()? {
                return Err(self.malformed("no closing MIME boundary"));
            }
        }
        if self.available().starts_with(b"--") {
            self.pos += 2;
            return Ok(true);
        }
        loop {
            if let Some(i) = self.available().iter().position(|&b| b == b'\n') {
                self.pos += i + 1;
                return Ok(false);
            }
            self.pos = self.buf.len();
            if !self.fill()? {
                return Err(self.malformed("no closing MIME boundary"));
            }
        }
    }

    fn read_headers(&mut self) -> Result<MimeEvent> {
        loop {
            let data = self.available();
            let found = if data.starts_with(b"\r\n") {
                Some((0, 2))
            } else if data.starts_with(b"\n") {
                Some((0, 1))
            } else {
                find_header_end(data)
            };
            if let Some((end, body_start)) = found {
                let headers = parse_headers(&data[..end]);
                self.pos += body_start;
                trace!(count = headers.len(), "Parsed part headers");
                return Ok(MimeEvent::Headers(headers));
            }
            if !self.fill()? {
                return Err(self.malformed("end of stream inside part headers"));
            }
        }
    }

    /// Produce the next body event: a content run or the end of the part.
    fn read_body(&mut self, fresh: bool) -> Result<MimeEvent> {
        let pattern = self.line_delimiter();

        loop {
            let data = self.available();

            if fresh && data.len() >= self.delimiter.len() && data.starts_with(&self.delimiter) {
                self.pos += self.delimiter.len();
                self.state = State::AfterDelimiter;
                return Ok(MimeEvent::EndPart);
            }

            if let Some(i) = find(data, &pattern) {
                let body_end = if i > 0 && data[i - 1] == b'\r' { i - 1 } else { i };
                if body_end == 0 {
                    self.pos += i + pattern.len();
                    self.state = State::AfterDelimiter;
                    return Ok(MimeEvent::EndPart);
                }
                let n = body_end.min(self.chunk_size);
                let run = Bytes::copy_from_slice(&data[..n]);
                self.pos += n;
                self.state = State::Body { fresh: false };
                return Ok(MimeEvent::Content(run));
            }

            if self.eof {
                return Err(self.malformed("no closing MIME boundary"));
            }

            // Hold back enough bytes to recognise a delimiter split across reads.
            let safe = data.len().saturating_sub(pattern.len());
            if safe >= self.chunk_size {
                let run = Bytes::copy_from_slice(&data[..self.chunk_size]);
                self.pos += self.chunk_size;
                self.state = State::Body { fresh: false };
                return Ok(MimeEvent::Content(run));
            }

            self.fill()?;
        }
    }

    fn step(&mut self) -> Result<Option<MimeEvent>> {
        match self.state {
            State::Start => {
                self.state = State::Preamble;
                Ok(Some(MimeEvent::StartMessage))
            }
            State::Preamble => {
                self.skip_preamble()?;
                if self.finish_delimiter_line()? {
                    self.state = State::Done;
                    return Ok(Some(MimeEvent::EndMessage));
                }
                self.state = State::Headers;
                Ok(Some(MimeEvent::StartPart))
            }
            State::StartPart => {
                self.state = State::Headers;
                Ok(Some(MimeEvent::StartPart))
            }
            State::Headers => {
                let event = self.read_headers()?;
                self.state = State::Body { fresh: true };
                Ok(Some(event))
            }
            State::Body { fresh } => self.read_body(fresh).map(Some),
            State::AfterDelimiter => {
                if self.finish_delimiter_line()? {
                    debug!(offset = self.offset(), "Reached closing boundary");
                    self.state = State::Done;
                    return Ok(Some(MimeEvent::EndMessage));
                }
                self.state = State::StartPart;
                self.step()
            }
            State::Done => Ok(None),
        }
    }
}

impl<R: Read> Iterator for MimeParser<R> {
    type Item = Result<MimeEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(event) => event.map(Ok),
            Err(e) => {
                self.state = State::Done;
                Some(Err(e))
            }
        }
    }
}

/// Locate the blank line ending a header block.
///
/// Returns `(header_end, body_start)`; `header_end` keeps the newline of the
/// last header line.
fn find_header_end(data: &[u8]) -> Option<(usize, usize)> {
    for i in 0..data.len().saturating_sub(1) {
        if data[i] != b'\n' {
            continue;
        }
        if data[i + 1] == b'\n' {
            return Some((i + 1, i + 2));
        }
        if i + 2 < data.len() && data[i + 1] == b'\r' && data[i + 2] == b'\n' {
            return Some((i + 1, i + 3));
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Derive the boundary from the first delimiter line of a stream.
///
/// Scans `head` for a line starting with `--` and returns the rest of that
/// line without trailing whitespace.
pub fn sniff_boundary(head: &[u8]) -> Option<String> {
    head.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .find_map(|line| line.strip_prefix(b"--"))
        .map(|rest| String::from_utf8_lossy(rest).trim_end().to_string())
        .filter(|b| !b.is_empty())
}

/// Extract the `boundary` parameter of a multipart `Content-Type` value.
///
/// Format: `multipart/related; type="text/xml"; boundary="uuid:1234"`
pub fn boundary_from_content_type(content_type: &str) -> Result<String> {
    let main = content_type.split(';').next().unwrap_or("").trim();
    if !main.to_ascii_lowercase().starts_with("multipart/") {
        return Err(MimeError::malformed(
            0,
            format!("not a multipart content type: '{main}'"),
        ));
    }

    for param in content_type.split(';').skip(1) {
        let Some((k, v)) = param.trim().split_once('=') else {
            continue;
        };
        if k.trim().eq_ignore_ascii_case("boundary") {
            let v = v.trim().trim_matches('"');
            if v.is_empty() {
                break;
            }
            return Ok(v.to_string());
        }
    }

    Err(MimeError::malformed(0, "content type has no boundary parameter"))
}
