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

//! Byte range processing (`Range` HTTP header)

use http::header;
use pingora::http::RequestHeader;

use crate::metadata::Metadata;

/// Represents the result of parsing the `Range` HTTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Range {
    /// A valid range with the given start and end bounds, both inclusive
    Valid(u64, u64),
    /// A range that is outside of the variant’s boundaries
    OutOfBounds,
}

impl Range {
    /// Parses the value of a `Range` HTTP header, e.g. `bytes=0-99`, `bytes=100-` or `bytes=-50`.
    /// Values that cannot be parsed, including lists of multiple ranges, result in `None`.
    pub fn parse(value: &str, size: u64) -> Option<Self> {
        let ranges = value.trim().strip_prefix("bytes=")?;
        if ranges.contains(',') {
            return None;
        }

        let (start, end) = ranges.trim().split_once('-')?;
        let (start, end) = (start.trim(), end.trim());
        let (start, end) = match (start.is_empty(), end.is_empty()) {
            (true, true) => return None,
            (true, false) => {
                let len = end.parse::<u64>().ok()?;
                if len == 0 || len > size {
                    return Some(Self::OutOfBounds);
                }
                (size - len, size - 1)
            }
            (false, true) => (start.parse().ok()?, size.checked_sub(1)?),
            (false, false) => (start.parse().ok()?, end.parse().ok()?),
        };

        if start > end || end >= size {
            Some(Self::OutOfBounds)
        } else {
            Some(Self::Valid(start, end))
        }
    }
}

/// Processes the `Range` and `If-Range` request headers to produce the requested byte range if
/// any. A missing or unsupported `Range` header or a non-matching `If-Range` header all result
/// in `None`.
pub fn extract_range(req: &RequestHeader, meta: &Metadata) -> Option<Range> {
    if let Some(value) = req
        .headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    {
        let matches_modified = meta.modified.as_deref() == Some(value);
        if value != meta.etag && !matches_modified {
            return None;
        }
    }

    let value = req.headers.get(header::RANGE)?.to_str().ok()?;
    Range::parse(value, meta.size)
}
