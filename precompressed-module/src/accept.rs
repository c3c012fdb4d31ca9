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

//! Ranking the encodings listed in the `Accept-Encoding` HTTP header.

use std::collections::hash_map::{Entry, HashMap};
use std::str::{FromStr, Split};

use crate::encoding::EncodingRegistry;

const DEFAULT_QUALITY: f64 = 1.0;

/// An encoding accepted by the client along with its quality value.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    /// Encoding token, normalized to lower case
    pub token: String,
    /// Quality value, always positive. Values above 1 are kept as specified by the client.
    pub quality: f64,
}

/// Extracts the value of the first `q` parameter. Missing or invalid values result in quality 1.
fn parse_quality(params: Split<'_, char>) -> f64 {
    for param in params {
        let Some((name, value)) = param.split_once('=') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("q") {
            return f64::from_str(value.trim())
                .ok()
                .filter(|quality| quality.is_finite())
                .unwrap_or(DEFAULT_QUALITY);
        }
    }
    DEFAULT_QUALITY
}

/// Parses an encoding specifier like `gzip;q=0.8` into a token/quality pair. The wildcard `*` and
/// empty specifiers produce `None`.
fn parse_encoding(encoding: &str) -> Option<(&str, f64)> {
    let mut params = encoding.split(';');
    let token = params.next()?.trim();
    if token.is_empty() || token == "*" {
        return None;
    }
    Some((token, parse_quality(params)))
}

/// Parses the values of all `Accept-Encoding` headers in a request and returns the acceptable
/// encodings, most preferred first.
///
/// Encodings with quality 0 as well as the wildcard `*` are dropped. If an encoding is listed
/// multiple times, the highest quality value is used. Equal quality values are ordered by the
/// priority of the respective encoding in the registry, encodings missing from the registry come
/// last then. The relative order of two registered encodings with equal quality and equal
/// priority is unspecified.
pub fn rank<I, S>(header_values: I, known: &EncodingRegistry) -> Vec<RankedCandidate>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut candidates: Vec<RankedCandidate> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for value in header_values {
        let parsed = value
            .as_ref()
            .split(',')
            .filter_map(parse_encoding)
            .filter(|(_, quality)| *quality > 0.0);

        for (token, quality) in parsed {
            let token = token.to_ascii_lowercase();
            match positions.entry(token) {
                Entry::Occupied(entry) => {
                    let existing = &mut candidates[*entry.get()];
                    existing.quality = existing.quality.max(quality);
                }
                Entry::Vacant(entry) => {
                    let token = entry.key().clone();
                    entry.insert(candidates.len());
                    candidates.push(RankedCandidate { token, quality });
                }
            }
        }
    }

    let mut keyed = candidates
        .into_iter()
        .map(|candidate| {
            let priority = known
                .get(&candidate.token)
                .map_or(i64::MAX, |entry| i64::from(entry.priority()));
            (candidate, priority)
        })
        .collect::<Vec<_>>();
    keyed.sort_by(|(a, a_priority), (b, b_priority)| {
        b.quality
            .total_cmp(&a.quality)
            .then(a_priority.cmp(b_priority))
    });

    keyed.into_iter().map(|(candidate, _)| candidate).collect()
}
