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

//! Content type detection that refuses to recognize pre-compressed files.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

/// Result of a content type lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentTypeLookup<'a> {
    /// The file has a known content type.
    Known(Cow<'a, str>),
    /// The file extension isn’t mapped to any content type.
    Unknown,
    /// The file name ends with the suffix of a pre-compressed variant.
    Excluded,
}

/// Maps file extensions to MIME types. Extensions are stored lower-case and with a leading dot.
///
/// Configured overrides take precedence over the built-in table. File names ending in the suffix
/// of a pre-compressed variant never get a content type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentTypes {
    overrides: HashMap<String, String>,
    excluded: Vec<String>,
}

fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim();
    let ext = ext.strip_prefix('.').unwrap_or(ext);
    format!(".{}", ext.to_ascii_lowercase())
}

impl ContentTypes {
    /// Derives the mapping from the configured overrides, with all keys matching one of the
    /// suffixes removed.
    pub fn new<I, S>(overrides: &BTreeMap<String, String>, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut excluded = suffixes
            .into_iter()
            .map(|suffix| normalize_extension(suffix.as_ref()))
            .collect::<Vec<_>>();
        excluded.sort_unstable();
        excluded.dedup();

        let overrides = overrides
            .iter()
            .map(|(ext, mime)| (normalize_extension(ext), mime.clone()))
            .filter(|(ext, _)| !excluded.contains(ext))
            .collect();

        Self {
            overrides,
            excluded,
        }
    }

    /// Determines the content type of a path from its file extension.
    pub fn lookup(&self, path: &str) -> ContentTypeLookup<'_> {
        let name = path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase();
        if self.excluded.iter().any(|suffix| name.ends_with(suffix)) {
            return ContentTypeLookup::Excluded;
        }

        let Some((_, ext)) = name.rsplit_once('.') else {
            return ContentTypeLookup::Unknown;
        };

        if let Some(mime) = self.overrides.get(&format!(".{ext}")) {
            ContentTypeLookup::Known(Cow::Borrowed(mime))
        } else if let Some(mime) = mime_guess::from_ext(ext).first_raw() {
            ContentTypeLookup::Known(Cow::Borrowed(mime))
        } else {
            ContentTypeLookup::Unknown
        }
    }
}
