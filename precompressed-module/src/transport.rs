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

//! Writing a resolved file variant to the session.

use bytes::BytesMut;
use http::{header, method::Method, status::StatusCode};
use log::{debug, error};
use pingora::http::ResponseHeader;
use pingora::{Error, ErrorType};
use std::cmp::min;
use std::fmt::Debug;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use crate::metadata::Metadata;
use crate::range::{extract_range, Range};
use crate::session::ResponseSink;
use crate::variant::ResolvedVariant;

const BUFFER_SIZE: usize = 64 * 1024;

/// A callback adjusting the response header of a resolved variant before it is written
#[derive(Clone)]
pub struct ResponseHook(Arc<dyn Fn(&ResolvedVariant, &mut ResponseHeader) + Send + Sync>);

impl ResponseHook {
    /// Wraps a callback. It is called after a variant has been resolved, with the complete
    /// response header, and before any part of the response is written.
    pub fn new(hook: impl Fn(&ResolvedVariant, &mut ResponseHeader) + Send + Sync + 'static) -> Self {
        Self(Arc::new(hook))
    }
}

impl Debug for ResponseHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResponseHook")
    }
}

/// Response settings that don’t depend on the variant
#[derive(Debug, Clone, Copy)]
pub(crate) struct ServeOptions<'a> {
    /// Content type of the logical resource
    pub(crate) content_type: &'a str,
    /// Whether to add `Vary: Accept-Encoding`
    pub(crate) vary: bool,
    pub(crate) hook: Option<&'a ResponseHook>,
}

/// Responds with the variant: conditional requests, byte ranges and the response body are
/// handled here. Returns the status code of the response.
pub(crate) async fn serve(
    session: &mut impl ResponseSink,
    mut variant: ResolvedVariant,
    options: ServeOptions<'_>,
) -> Result<StatusCode, Box<Error>> {
    let meta = Metadata::new(&variant.file.metadata, options.content_type);

    let (status, span, send_body) = {
        let req = session.req_header();
        let send_body = req.method != Method::HEAD;
        if meta.has_failed_precondition(req) {
            debug!("If-Match/If-Unmodified-Since precondition failed");
            (StatusCode::PRECONDITION_FAILED, None, send_body)
        } else if meta.is_not_modified(req) {
            debug!("If-None-Match/If-Modified-Since check resulted in Not Modified");
            (StatusCode::NOT_MODIFIED, None, send_body)
        } else {
            match extract_range(req, &meta) {
                Some(Range::Valid(start, end)) => {
                    debug!("bytes range requested: {start}-{end}");
                    (StatusCode::PARTIAL_CONTENT, Some((start, end)), send_body)
                }
                Some(Range::OutOfBounds) => {
                    debug!("requested bytes range is out of bounds");
                    (StatusCode::RANGE_NOT_SATISFIABLE, None, send_body)
                }
                None if meta.size == 0 => (StatusCode::OK, None, send_body),
                None => (StatusCode::OK, Some((0, meta.size - 1)), send_body),
            }
        }
    };

    let content_length = match (status, span) {
        (_, Some((start, end))) => Some(end - start + 1),
        (StatusCode::OK, None) => Some(0),
        _ => None,
    };
    let mut header = meta.response_header(status, content_length)?;

    match (status, span) {
        (StatusCode::PARTIAL_CONTENT, Some((start, end))) => {
            header.insert_header(
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{}", meta.size),
            )?;
        }
        (StatusCode::RANGE_NOT_SATISFIABLE, _) => {
            header.insert_header(header::CONTENT_RANGE, format!("bytes */{}", meta.size))?;
        }
        _ => {}
    }

    if status == StatusCode::OK || status == StatusCode::PARTIAL_CONTENT {
        if let Some(encoding) = &variant.encoding {
            header.insert_header(header::CONTENT_ENCODING, encoding.as_str())?;
        }
    }

    if options.vary {
        // The response depends on Accept-Encoding even when serving the uncompressed file.
        header.insert_header(header::VARY, "Accept-Encoding")?;
    }

    if let Some(ResponseHook(hook)) = options.hook {
        hook(&variant, &mut header);
    }

    session.write_response_header(Box::new(header)).await?;

    if let (true, Some((start, end))) = (send_body, span) {
        let path = variant.file.path.clone();
        write_body(session, &mut variant.file.file, &path, start, end).await?;
    }

    Ok(status)
}

fn read_error(path: &Path, action: &str, err: std::io::Error) -> Box<Error> {
    error!("failed {action} {path:?}: {err}");
    Error::because(
        ErrorType::ReadError,
        format!("failed {action} {path:?}"),
        err,
    )
}

/// Writes the bytes `start` to `end` (inclusive) of a file as response body.
async fn write_body(
    session: &mut impl ResponseSink,
    file: &mut File,
    path: &Path,
    start: u64,
    end: u64,
) -> Result<(), Box<Error>> {
    if start != 0 {
        file.seek(SeekFrom::Start(start))
            .map_err(|err| read_error(path, "seeking in", err))?;
    }

    let mut remaining = end - start + 1;
    while remaining > 0 {
        let chunk = min(remaining, BUFFER_SIZE as u64) as usize;
        let mut buf = BytesMut::zeroed(chunk);
        let len = file
            .read(buf.as_mut())
            .map_err(|err| read_error(path, "reading data from", err))?;

        if len == 0 {
            error!("file {path:?} ended with {remaining} bytes left to be written");
            return Err(Error::explain(ErrorType::ReadError, "unexpected end of file"));
        }

        buf.truncate(len);
        session.write_response_body(buf.freeze()).await?;
        remaining -= len as u64;
    }

    Ok(())
}
