//! Streaming multipart/form-data decoder.
//!
//! Decodes one part at a time from a raw request byte stream without ever
//! materializing the whole body. Part bodies are arbitrary binary, so the
//! scanner is byte-exact: a part ends only at the full `CRLF + "--" +
//! boundary` marker, never at a bare `--boundary` appearing inside content.
//! Boundary detection runs through an incremental prefix matcher with O(1)
//! amortized work per byte.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::error::DecodeError;

/// Upper bound on a single part header line
const MAX_HEADER_LINE: usize = 8 * 1024;

/// Case-insensitive header map for one decoded part.
#[derive(Debug, Clone, Default)]
pub struct PartHeaders {
    map: HashMap<String, String>,
}

impl PartHeaders {
    fn insert(&mut self, name: &str, value: &str) {
        self.map.insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn content_disposition(&self) -> Option<&str> {
        self.get("content-disposition")
    }

    /// `filename` parameter of the content-disposition header, if any.
    /// Its presence is what makes a part a file rather than a form field.
    pub fn file_name(&self) -> Option<String> {
        disposition_param(self.content_disposition()?, "filename")
    }

    /// `name` parameter of the content-disposition header, if any.
    pub fn field_name(&self) -> Option<String> {
        disposition_param(self.content_disposition()?, "name")
    }

}

/// Extract one parameter from a content-disposition value, e.g.
/// `form-data; name="files"; filename="a.txt"`.
fn disposition_param(disposition: &str, key: &str) -> Option<String> {
    for segment in disposition.split(';') {
        let Some((name, value)) = segment.split_once('=') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case(key) {
            continue;
        }
        return Some(value.trim().trim_matches('"').to_string());
    }
    None
}

/// Result of feeding one byte to the marker matcher.
struct Feed {
    /// How many bytes of the marker prefix are now known to be content
    release: usize,
    /// The fed byte itself, when it turned out to be content
    literal: Option<u8>,
    /// Whole marker matched
    hit: bool,
}

/// Incremental matcher for the `CRLF + "--" + boundary` marker.
///
/// Bytes that are a prefix of a possible marker are held (as a match length,
/// not a copy); once a byte rules the match out, the ruled-out prefix is
/// released to the caller. Knuth-Morris-Pratt failure links keep the work
/// per byte O(1) amortized.
#[derive(Debug)]
struct MarkerMatcher {
    marker: Vec<u8>,
    failure: Vec<usize>,
    matched: usize,
}

impl MarkerMatcher {
    fn new(marker: Vec<u8>) -> Self {
        let mut failure = vec![0usize; marker.len()];
        let mut k = 0;
        for i in 1..marker.len() {
            while k > 0 && marker[i] != marker[k] {
                k = failure[k - 1];
            }
            if marker[i] == marker[k] {
                k += 1;
            }
            failure[i] = k;
        }
        Self {
            marker,
            failure,
            matched: 0,
        }
    }

    /// First `n` bytes of the marker; the held bytes a `Feed::release`
    /// refers to are always exactly this prefix.
    fn prefix(&self, n: usize) -> &[u8] {
        &self.marker[..n]
    }

    fn feed(&mut self, byte: u8) -> Feed {
        let mut j = self.matched;
        while j > 0 && self.marker[j] != byte {
            j = self.failure[j - 1];
        }
        if self.marker[j] == byte {
            let release = self.matched - j;
            self.matched = j + 1;
            let hit = self.matched == self.marker.len();
            if hit {
                self.matched = 0;
            }
            Feed {
                release,
                literal: None,
                hit,
            }
        } else {
            let release = self.matched;
            self.matched = 0;
            Feed {
                release,
                literal: Some(byte),
                hit: false,
            }
        }
    }
}

/// Streaming decoder over a raw multipart body.
///
/// Yields [`Part`]s in source order; each part's body must be consumed (or
/// dropped, in which case the next `next_part` call drains it) before the
/// next part is available.
#[derive(Debug)]
pub struct MultipartDecoder<R> {
    reader: BufReader<R>,
    matcher: MarkerMatcher,
    /// 1-based index of the part currently being decoded, for error reports
    part_index: usize,
    started: bool,
    finished: bool,
    at_boundary: bool,
}

impl<R: AsyncRead + Unpin> MultipartDecoder<R> {
    /// `boundary` is the bare token from the content-type header, without
    /// the leading dashes.
    pub fn new(reader: R, boundary: &str) -> Self {
        let marker = [b"\r\n--", boundary.as_bytes()].concat();
        Self {
            reader: BufReader::new(reader),
            matcher: MarkerMatcher::new(marker),
            part_index: 0,
            started: false,
            finished: false,
            at_boundary: false,
        }
    }

    /// Advance to the next part. Returns `None` after the terminal boundary.
    pub async fn next_part(&mut self) -> Result<Option<Part<'_, R>>, DecodeError> {
        if self.finished {
            return Ok(None);
        }
        if !self.started {
            self.skip_preamble().await?;
            self.started = true;
        } else {
            // Drain whatever the caller left of the previous body
            while self.body_chunk().await?.is_some() {}
        }

        self.at_boundary = false;
        if self.finish_boundary_line().await? {
            self.finished = true;
            return Ok(None);
        }

        self.part_index += 1;
        let headers = self.read_headers().await?;
        Ok(Some(Part {
            headers,
            decoder: self,
        }))
    }

    /// Discard input up to the first boundary marker.
    async fn skip_preamble(&mut self) -> Result<(), DecodeError> {
        // Pretend a CRLF precedes the stream so a body opening with
        // "--boundary" at offset zero still matches the full marker.
        self.matcher.matched = 2;
        loop {
            let buf = self.reader.fill_buf().await.map_err(|source| DecodeError::Io {
                part_index: 0,
                source,
            })?;
            if buf.is_empty() {
                return Err(DecodeError::MissingBoundary);
            }
            let mut consumed = 0;
            let mut hit = false;
            for &byte in buf {
                consumed += 1;
                if self.matcher.feed(byte).hit {
                    hit = true;
                    break;
                }
            }
            self.reader.consume(consumed);
            if hit {
                self.at_boundary = true;
                return Ok(());
            }
        }
    }

    /// Consume the remainder of a boundary line. Returns `true` when this
    /// was the terminal `--` suffix that ends the whole stream.
    async fn finish_boundary_line(&mut self) -> Result<bool, DecodeError> {
        let line = self.read_line_capped().await?;
        if line.starts_with(b"--") {
            return Ok(true);
        }
        if line.is_empty() {
            // Boundary matched but the stream just stops
            return Err(DecodeError::Truncated {
                part_index: self.part_index,
            });
        }
        Ok(false)
    }

    async fn read_headers(&mut self) -> Result<PartHeaders, DecodeError> {
        let mut headers = PartHeaders::default();
        loop {
            let line = self.read_header_line().await?;
            if line.is_empty() {
                return Ok(headers);
            }
            match line.split_once(':') {
                Some((name, value)) => headers.insert(name.trim(), value.trim()),
                None => {
                    return Err(DecodeError::MalformedHeader {
                        part_index: self.part_index,
                        reason: format!("missing ':' in header line {:?}", line),
                    });
                }
            }
        }
    }

    async fn read_header_line(&mut self) -> Result<String, DecodeError> {
        let mut raw = self.read_line_capped().await?;
        if !raw.ends_with(b"\n") {
            return Err(DecodeError::Truncated {
                part_index: self.part_index,
            });
        }
        raw.pop();
        if raw.ends_with(b"\r") {
            raw.pop();
        }
        String::from_utf8(raw).map_err(|_| DecodeError::MalformedHeader {
            part_index: self.part_index,
            reason: "header line is not valid UTF-8".to_string(),
        })
    }

    /// Read one line including its trailing newline, or whatever remains at
    /// EOF. The [`MAX_HEADER_LINE`] cap is enforced while reading, so a
    /// stream that never delivers a newline cannot buffer without bound.
    async fn read_line_capped(&mut self) -> Result<Vec<u8>, DecodeError> {
        let mut raw = Vec::new();
        loop {
            let buf = self.reader.fill_buf().await.map_err(|source| DecodeError::Io {
                part_index: self.part_index,
                source,
            })?;
            if buf.is_empty() {
                return Ok(raw);
            }
            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                raw.extend_from_slice(&buf[..=pos]);
                self.reader.consume(pos + 1);
            } else {
                let n = buf.len();
                raw.extend_from_slice(buf);
                self.reader.consume(n);
            }
            if raw.len() > MAX_HEADER_LINE {
                return Err(DecodeError::MalformedHeader {
                    part_index: self.part_index,
                    reason: "line too long".to_string(),
                });
            }
            if raw.ends_with(b"\n") {
                return Ok(raw);
            }
        }
    }

    /// Next chunk of the current part's body, `None` once the boundary is
    /// reached. EOF before the boundary is a truncated stream.
    async fn body_chunk(&mut self) -> Result<Option<Bytes>, DecodeError> {
        if self.at_boundary {
            return Ok(None);
        }
        let mut out = BytesMut::new();
        loop {
            let buf = self.reader.fill_buf().await.map_err(|source| DecodeError::Io {
                part_index: self.part_index,
                source,
            })?;
            if buf.is_empty() {
                return Err(DecodeError::Truncated {
                    part_index: self.part_index,
                });
            }
            let mut consumed = 0;
            for &byte in buf {
                consumed += 1;
                let fed = self.matcher.feed(byte);
                if fed.release > 0 {
                    out.extend_from_slice(self.matcher.prefix(fed.release));
                }
                if let Some(b) = fed.literal {
                    out.put_u8(b);
                }
                if fed.hit {
                    self.at_boundary = true;
                    break;
                }
            }
            self.reader.consume(consumed);
            if self.at_boundary {
                return if out.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(out.freeze()))
                };
            }
            if !out.is_empty() {
                return Ok(Some(out.freeze()));
            }
            // Everything read so far is held as a partial marker match;
            // keep reading until it resolves either way.
        }
    }
}

/// One decoded part: headers plus a lazily consumed body.
///
/// Borrows the decoder, so the body has to be read before asking for the
/// next part.
#[derive(Debug)]
pub struct Part<'a, R> {
    headers: PartHeaders,
    decoder: &'a mut MultipartDecoder<R>,
}

impl<'a, R: AsyncRead + Unpin> Part<'a, R> {
    pub fn headers(&self) -> &PartHeaders {
        &self.headers
    }

    pub fn file_name(&self) -> Option<String> {
        self.headers.file_name()
    }

    pub fn field_name(&self) -> Option<String> {
        self.headers.field_name()
    }

    /// Whether the part carries a file (content-disposition has a filename)
    pub fn is_file(&self) -> bool {
        self.headers.file_name().is_some()
    }

    /// Next chunk of body bytes, `None` once the part ends.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, DecodeError> {
        self.decoder.body_chunk().await
    }

    /// Collect the whole body into memory. Meant for form fields and tests;
    /// file bodies should be streamed through [`Part::chunk`].
    pub async fn into_bytes(mut self) -> Result<Vec<u8>, DecodeError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}
