//! `multipart/form-data` decoding.
//!
//! Decoding runs over the buffered body (already bounded by the server's
//! body-size policy) and delivers fields strictly sequentially: a field
//! handler that returns a deferred outcome blocks the next delivery until it
//! settles, and the transport stays paused in the meantime. Limit violations
//! reject the whole operation with a per-limit error.

use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::Path;
use std::rc::Rc;

use tracing::debug;

use crate::dispatcher::{HandlerResult, Outcome};
use crate::engine::BytesSource;
use crate::error::MultipartError;
use crate::request::Request;

/// Decoding bounds; `None` means unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultipartLimits {
    pub max_parts: Option<usize>,
    pub max_files: Option<usize>,
    pub max_fields: Option<usize>,
}

/// Field payload: inline text value or an uploaded file.
pub enum FieldData {
    Value(String),
    File {
        filename: Option<String>,
        bytes: Rc<[u8]>,
    },
}

/// One decoded form field, delivered to the field handler.
pub struct MultipartField {
    name: String,
    content_type: String,
    data: FieldData,
}

impl MultipartField {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn mime_type(&self) -> &str {
        &self.content_type
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        matches!(self.data, FieldData::File { .. })
    }

    /// Inline value for non-file fields.
    #[must_use]
    pub fn value(&self) -> Option<&str> {
        match &self.data {
            FieldData::Value(v) => Some(v),
            FieldData::File { .. } => None,
        }
    }

    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        match &self.data {
            FieldData::File { filename, .. } => filename.as_deref(),
            FieldData::Value(_) => None,
        }
    }

    #[must_use]
    pub fn file_bytes(&self) -> Option<Rc<[u8]>> {
        match &self.data {
            FieldData::File { bytes, .. } => Some(Rc::clone(bytes)),
            FieldData::Value(_) => None,
        }
    }

    /// File content as a streamable source (for `Response::stream` or
    /// custom sinks).
    #[must_use]
    pub fn file_source(&self) -> Option<Rc<RefCell<BytesSource>>> {
        self.file_bytes()
            .map(|bytes| Rc::new(RefCell::new(BytesSource::from_bytes(bytes.to_vec()))))
    }

    /// Persists the field content to a file.
    pub fn write_to(&self, path: impl AsRef<Path>) -> io::Result<()> {
        match &self.data {
            FieldData::Value(v) => fs::write(path, v.as_bytes()),
            FieldData::File { bytes, .. } => fs::write(path, bytes),
        }
    }
}

impl Request {
    /// Decodes the body as `multipart/form-data`.
    ///
    /// `handler` runs once per field, in order; returning a deferred
    /// outcome defers the next field until it settles. `done` settles once
    /// with the overall result.
    pub fn multipart(
        &self,
        limits: MultipartLimits,
        handler: impl FnMut(MultipartField) -> HandlerResult + 'static,
        done: impl FnOnce(Result<(), MultipartError>) + 'static,
    ) {
        let Some(boundary) = self
            .header("content-type")
            .as_deref()
            .and_then(extract_boundary)
        else {
            done(Err(MultipartError::Malformed(
                "content type carries no multipart boundary".to_string(),
            )));
            return;
        };
        let request = self.clone();
        self.buffer(move |bytes| match parse_parts(&bytes, &boundary) {
            Err(err) => done(Err(err)),
            Ok(parts) => {
                debug!(request_id = %request.id(), parts = parts.len(), "multipart body parsed");
                let delivery = Rc::new(RefCell::new(Delivery {
                    request,
                    parts: parts.into_iter(),
                    limits,
                    files_seen: 0,
                    fields_seen: 0,
                    parts_seen: 0,
                    handler: Box::new(handler),
                    done: Some(Box::new(done)),
                }));
                deliver(&delivery);
            }
        });
    }
}

struct Delivery {
    request: Request,
    parts: std::vec::IntoIter<RawPart>,
    limits: MultipartLimits,
    parts_seen: usize,
    files_seen: usize,
    fields_seen: usize,
    handler: Box<dyn FnMut(MultipartField) -> HandlerResult>,
    done: Option<Box<dyn FnOnce(Result<(), MultipartError>)>>,
}

fn finish(delivery: &Rc<RefCell<Delivery>>, result: Result<(), MultipartError>) {
    let done = delivery.borrow_mut().done.take();
    if let Some(done) = done {
        done(result);
    }
}

fn deliver(delivery: &Rc<RefCell<Delivery>>) {
    loop {
        let part = { delivery.borrow_mut().parts.next() };
        let Some(part) = part else {
            finish(delivery, Ok(()));
            return;
        };

        // Limit accounting happens at delivery so earlier fields are still
        // observed before the rejection.
        {
            let mut state = delivery.borrow_mut();
            state.parts_seen += 1;
            if state.limits.max_parts.is_some_and(|max| state.parts_seen > max) {
                drop(state);
                finish(delivery, Err(MultipartError::PartsLimit));
                return;
            }
            if part.filename.is_some() {
                state.files_seen += 1;
                if state.limits.max_files.is_some_and(|max| state.files_seen > max) {
                    drop(state);
                    finish(delivery, Err(MultipartError::FilesLimit));
                    return;
                }
            } else {
                state.fields_seen += 1;
                if state
                    .limits
                    .max_fields
                    .is_some_and(|max| state.fields_seen > max)
                {
                    drop(state);
                    finish(delivery, Err(MultipartError::FieldsLimit));
                    return;
                }
            }
        }

        let field = part.into_field();
        let outcome = {
            let mut state = delivery.borrow_mut();
            (state.handler)(field)
        };
        match outcome {
            Ok(Outcome::Completed) => {}
            Ok(Outcome::Deferred(deferred)) => {
                // Hold the transport while the handler works; delivery of
                // the next field is gated on settlement, never on arrival.
                let _ = delivery.borrow().request.pause();
                let gated = Rc::clone(delivery);
                deferred.on_settled(move |result| {
                    let _ = gated.borrow().request.resume();
                    match result {
                        Ok(()) => deliver(&gated),
                        Err(err) => finish(&gated, Err(MultipartError::Handler(Box::new(err)))),
                    }
                });
                return;
            }
            Err(err) => {
                finish(delivery, Err(MultipartError::Handler(Box::new(err))));
                return;
            }
        }
    }
}

#[derive(Debug)]
struct RawPart {
    name: String,
    filename: Option<String>,
    content_type: String,
    data: Vec<u8>,
}

impl RawPart {
    fn into_field(self) -> MultipartField {
        let data = if self.filename.is_some() {
            FieldData::File {
                filename: self.filename,
                bytes: self.data.into(),
            }
        } else {
            FieldData::Value(String::from_utf8_lossy(&self.data).into_owned())
        };
        MultipartField {
            name: self.name,
            content_type: self.content_type,
            data,
        }
    }
}

fn extract_boundary(content_type: &str) -> Option<String> {
    if !content_type
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
    {
        return None;
    }
    let marker = "boundary=";
    let start = content_type.find(marker)? + marker.len();
    let rest = &content_type[start..];
    let value = rest.split(';').next().unwrap_or(rest).trim();
    let value = value.trim_matches('"');
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

fn parse_parts(bytes: &[u8], boundary: &str) -> Result<Vec<RawPart>, MultipartError> {
    let delim = format!("--{boundary}").into_bytes();
    let closing = format!("\r\n--{boundary}").into_bytes();
    let mut parts = Vec::new();
    let mut pos = find(bytes, &delim, 0).ok_or_else(|| {
        MultipartError::Malformed("opening boundary not found".to_string())
    })?;
    loop {
        pos += delim.len();
        let rest = &bytes[pos..];
        if rest.starts_with(b"--") {
            break;
        }
        if rest.starts_with(b"\r\n") {
            pos += 2;
        } else {
            return Err(MultipartError::Malformed(
                "boundary not followed by CRLF".to_string(),
            ));
        }
        let end = find(bytes, &closing, pos).ok_or_else(|| {
            MultipartError::Malformed("unterminated part".to_string())
        })?;
        parts.push(parse_part(&bytes[pos..end])?);
        // Leave `pos` on the "--" of the next boundary line.
        pos = end + 2;
    }
    Ok(parts)
}

fn parse_part(section: &[u8]) -> Result<RawPart, MultipartError> {
    let header_end = find(section, b"\r\n\r\n", 0).ok_or_else(|| {
        MultipartError::Malformed("part headers not terminated".to_string())
    })?;
    let headers = String::from_utf8_lossy(&section[..header_end]);
    let data = section[header_end + 4..].to_vec();

    let mut name = None;
    let mut filename = None;
    let mut content_type = "text/plain".to_string();
    for line in headers.lines() {
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("content-disposition:") {
            name = quoted_param(line, "name");
            filename = quoted_param(line, "filename");
        } else if let Some(value) = lower
            .starts_with("content-type:")
            .then(|| line.split_once(':').map(|(_, v)| v.trim().to_string()))
            .flatten()
        {
            content_type = value;
        }
    }

    Ok(RawPart {
        name: name.ok_or_else(|| {
            MultipartError::Malformed("part is missing a field name".to_string())
        })?,
        filename,
        content_type,
        data,
    })
}

fn quoted_param(line: &str, key: &str) -> Option<String> {
    let marker = format!("{key}=\"");
    let start = line.find(&marker)? + marker.len();
    let rest = &line[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}
