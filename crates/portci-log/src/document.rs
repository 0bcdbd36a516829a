//! The multipart document every build log ends up in.
//!
//! Layout matches `multipart/form-data`: each part has a single
//! `Content-Disposition: form-data; name="<field>"` header followed by the raw
//! body. Parts are flushed one by one so the document can be consumed live,
//! e.g. as the body of a long-running HTTP response.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::LogError;
use crate::Result;

/// Streaming writer for the document.
pub struct DocumentWriter<W> {
    inner: W,
    boundary: String,
    parts: usize,
}

impl<W: AsyncWrite + Unpin> DocumentWriter<W> {
    /// Create a writer with a random boundary.
    pub fn new(inner: W) -> Self {
        Self::with_boundary(inner, uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn with_boundary(inner: W, boundary: impl Into<String>) -> Self {
        Self {
            inner,
            boundary: boundary.into(),
            parts: 0,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// `Content-Type` value a consumer needs to parse the stream.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Parts started so far.
    pub fn parts(&self) -> usize {
        self.parts
    }

    async fn begin_part(&mut self, field: &str) -> std::io::Result<()> {
        let mut header = if self.parts == 0 {
            format!("--{}\r\n", self.boundary)
        } else {
            format!("\r\n--{}\r\n", self.boundary)
        };
        header.push_str(&format!(
            "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
            escape_quotes(field)
        ));
        self.parts += 1;
        self.inner.write_all(header.as_bytes()).await
    }

    /// Write a part from an in-memory body.
    pub async fn write_part(&mut self, field: &str, body: &[u8]) -> std::io::Result<()> {
        self.begin_part(field).await?;
        self.inner.write_all(body).await?;
        self.inner.flush().await
    }

    /// Write a part whose body is streamed from `reader`. Returns the body length.
    pub async fn write_part_from<R>(&mut self, field: &str, reader: &mut R) -> std::io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.begin_part(field).await?;
        let copied = tokio::io::copy(reader, &mut self.inner).await?;
        self.inner.flush().await?;
        Ok(copied)
    }

    /// Write the closing delimiter and hand back the underlying writer.
    pub async fn finish(mut self) -> std::io::Result<W> {
        let trailer = if self.parts == 0 {
            format!("--{}--\r\n", self.boundary)
        } else {
            format!("\r\n--{}--\r\n", self.boundary)
        };
        self.inner.write_all(trailer.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(self.inner)
    }
}

fn escape_quotes(field: &str) -> String {
    field.replace('\\', "\\\\").replace('"', "\\\"")
}

/// One parsed part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub name: String,
    pub body: Vec<u8>,
}

/// Parse a complete document. Parts keep their order; names may repeat.
pub fn parse_document(bytes: &[u8], boundary: &str) -> Result<Vec<Part>> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();
    let separator = [&b"\r\n"[..], delimiter].concat();

    let start = find(bytes, delimiter).ok_or_else(|| malformed("missing opening delimiter"))?;
    let mut rest = &bytes[start + delimiter.len()..];
    let mut parts = Vec::new();

    loop {
        if rest.starts_with(b"--") {
            return Ok(parts);
        }
        rest = rest
            .strip_prefix(b"\r\n")
            .ok_or_else(|| malformed("delimiter not followed by CRLF"))?;

        let header_end =
            find(rest, b"\r\n\r\n").ok_or_else(|| malformed("unterminated part headers"))?;
        let headers = std::str::from_utf8(&rest[..header_end])
            .map_err(|_| malformed("part headers are not UTF-8"))?;
        let name = part_name(headers).ok_or_else(|| malformed("part without a form-data name"))?;

        let body = &rest[header_end + 4..];
        let body_len = find(body, &separator).ok_or_else(|| malformed("unterminated part body"))?;
        parts.push(Part {
            name,
            body: body[..body_len].to_vec(),
        });
        rest = &body[body_len + separator.len()..];
    }
}

/// Parse a document whose boundary is taken from its first delimiter line.
pub fn parse_document_detect(bytes: &[u8]) -> Result<Vec<Part>> {
    let line_end = find(bytes, b"\r\n").ok_or_else(|| malformed("missing delimiter line"))?;
    let line = std::str::from_utf8(&bytes[..line_end])
        .map_err(|_| malformed("delimiter line is not UTF-8"))?;
    let boundary = line
        .strip_prefix("--")
        .ok_or_else(|| malformed("document does not start with a delimiter"))?;
    // An empty document is only the closing delimiter.
    let boundary = boundary.strip_suffix("--").unwrap_or(boundary);
    parse_document(bytes, boundary)
}

/// Extract the boundary parameter of a `multipart/*` content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        Some(value.trim().trim_matches('"').to_string())
    })
}

fn part_name(headers: &str) -> Option<String> {
    headers.split("\r\n").find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if !key.trim().eq_ignore_ascii_case("content-disposition") {
            return None;
        }
        value.split(';').skip(1).find_map(|param| {
            let (key, value) = param.trim().split_once('=')?;
            if key != "name" {
                return None;
            }
            Some(unquote(value))
        })
    })
}

fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"') else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            '"' => break,
            _ => out.push(c),
        }
    }
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn malformed(reason: &str) -> LogError {
    LogError::MalformedDocument(reason.to_string())
}
