// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Response metadata of a served file variant

use http::{header, status::StatusCode};
use httpdate::fmt_http_date;
use pingora::http::{RequestHeader, ResponseHeader};
use pingora::Error;
use std::time::SystemTime;

/// Checks an `If-Match`/`If-None-Match` header value against an entity tag. Weak comparison
/// matches tags by their opaque value, strong comparison requires both tags to be strong.
fn etag_listed(value: &str, etag: &str, weak: bool) -> bool {
    if value.trim() == "*" {
        return true;
    }

    if weak {
        let strip_weak = |tag: &str| tag.strip_prefix("W/").unwrap_or(tag).to_owned();
        let etag = strip_weak(etag);
        value.split(',').any(|tag| strip_weak(tag.trim()) == etag)
    } else {
        !etag.starts_with("W/") && value.split(',').any(|tag| tag.trim() == etag)
    }
}

/// Headers and conditional request logic derived from a file variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// MIME type of the logical resource, not the variant
    pub content_type: String,
    /// Size of the variant in bytes
    pub size: u64,
    /// Last modified time of the variant in the format `Fri, 15 May 2015 15:34:21 GMT` if the
    /// time can be retrieved
    pub modified: Option<String>,
    /// ETag header for the variant, encoding last modified time and file size
    pub etag: String,
}

impl Metadata {
    /// Collects the metadata for a variant given its file system metadata.
    pub fn new(meta: &std::fs::Metadata, content_type: impl Into<String>) -> Self {
        let modified = meta.modified().ok();
        let timestamp = modified
            .and_then(|modified| modified.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map_or(0, |duration| duration.as_secs());

        Self {
            content_type: content_type.into(),
            size: meta.len(),
            modified: modified.map(fmt_http_date),
            etag: format!("\"{timestamp:x}-{:x}\"", meta.len()),
        }
    }

    /// Checks `If-Match` and `If-Unmodified-Since` headers of the request to determine whether
    /// a `412 Precondition Failed` response should be produced.
    pub fn has_failed_precondition(&self, req: &RequestHeader) -> bool {
        let header_str = |name| req.headers.get(name).and_then(|value| value.to_str().ok());

        if let Some(value) = header_str(header::IF_MATCH) {
            !etag_listed(value, &self.etag, false)
        } else if let Some(value) = header_str(header::IF_UNMODIFIED_SINCE) {
            self.modified
                .as_ref()
                .is_some_and(|modified| modified != value)
        } else {
            false
        }
    }

    /// Checks `If-None-Match` and `If-Modified-Since` headers of the request to determine whether
    /// a `304 Not Modified` response should be produced.
    pub fn is_not_modified(&self, req: &RequestHeader) -> bool {
        let header_str = |name| req.headers.get(name).and_then(|value| value.to_str().ok());

        if let Some(value) = header_str(header::IF_NONE_MATCH) {
            etag_listed(value, &self.etag, true)
        } else if let Some(value) = header_str(header::IF_MODIFIED_SINCE) {
            self.modified
                .as_ref()
                .is_some_and(|modified| modified == value)
        } else {
            false
        }
    }

    /// Produces a response header with the given status. `Content-Length` is only added if
    /// `content_length` is given.
    pub(crate) fn response_header(
        &self,
        status: StatusCode,
        content_length: Option<u64>,
    ) -> Result<ResponseHeader, Box<Error>> {
        let mut header = ResponseHeader::build(status, Some(8))?;
        if let Some(length) = content_length {
            header.append_header(header::CONTENT_LENGTH, length.to_string())?;
        }
        if status == StatusCode::OK {
            header.append_header(header::ACCEPT_RANGES, "bytes")?;
        }
        header.append_header(header::CONTENT_TYPE, &self.content_type)?;
        if let Some(modified) = &self.modified {
            header.append_header(header::LAST_MODIFIED, modified)?;
        }
        header.append_header(header::ETAG, &self.etag)?;
        Ok(header)
    }
}
