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

//! The registry of content encodings that can be served from pre-compressed files.

use std::collections::HashMap;
use std::fmt::Display;

use crate::configuration::ConfigurationError;

/// Encodings used when the configuration doesn’t list any: `br` → `.br` and `gzip` → `.gz`, with
/// Brotli preferred if the client has no preference.
pub const DEFAULT_ENCODINGS: [(&str, &str, i32); 2] = [("br", ".br", 0), ("gzip", ".gz", 1)];

/// A content encoding served from pre-compressed files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingEntry {
    token: String,
    suffix: String,
    priority: i32,
}

impl EncodingEntry {
    /// Creates a new entry. The token is normalized to lower case, the suffix is normalized to
    /// start with a dot: `br` and `.br` both result in the suffix `.br`.
    ///
    /// Results in an error if the token isn’t a valid `Accept-Encoding` token or if the suffix is
    /// empty or contains path separators.
    pub fn new(token: &str, suffix: &str, priority: i32) -> Result<Self, ConfigurationError> {
        let token = normalize_token(token)?;
        let suffix = normalize_suffix(&token, suffix)?;
        Ok(Self {
            token,
            suffix,
            priority,
        })
    }

    /// Encoding token as used in `Accept-Encoding` and `Content-Encoding` HTTP headers.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// File name suffix of the pre-compressed files, always starting with a dot.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Tie-break priority, lower values are preferred when the client states equal quality.
    pub fn priority(&self) -> i32 {
        self.priority
    }
}

impl Display for EncodingEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{} ({}, priority {})", self.token, self.suffix, self.priority)
    }
}

fn normalize_token(token: &str) -> Result<String, ConfigurationError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(ConfigurationError::EmptyToken);
    }

    // The wildcard and separators would never match a parsed Accept-Encoding token.
    if token == "*"
        || token
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, ',' | ';' | '=' | '"'))
    {
        return Err(ConfigurationError::InvalidToken(token.to_owned()));
    }

    Ok(token.to_ascii_lowercase())
}

fn normalize_suffix(token: &str, suffix: &str) -> Result<String, ConfigurationError> {
    let suffix = suffix.trim();
    let ext = suffix.strip_prefix('.').unwrap_or(suffix);
    if ext.is_empty() {
        return Err(ConfigurationError::EmptySuffix(token.to_owned()));
    }

    if ext.contains(['/', '\\', '\0']) {
        return Err(ConfigurationError::InvalidSuffix {
            token: token.to_owned(),
            suffix: suffix.to_owned(),
        });
    }

    Ok(format!(".{ext}"))
}

/// Maps encoding tokens to their [`EncodingEntry`]. Token lookups are case-insensitive.
///
/// The registry is built once at configuration time and is read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodingRegistry {
    entries: HashMap<String, EncodingEntry>,
}

impl EncodingRegistry {
    /// Creates an empty registry. No pre-compressed files will be considered with it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry containing the [`DEFAULT_ENCODINGS`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (token, suffix, priority) in DEFAULT_ENCODINGS {
            registry.entries.insert(
                token.to_owned(),
                EncodingEntry {
                    token: token.to_owned(),
                    suffix: suffix.to_owned(),
                    priority,
                },
            );
        }
        registry
    }

    /// Creates a registry from a list of entries, see [`EncodingRegistry::insert`].
    pub fn from_entries(
        entries: impl IntoIterator<Item = EncodingEntry>,
    ) -> Result<Self, ConfigurationError> {
        let mut registry = Self::new();
        for entry in entries {
            registry.insert(entry)?;
        }
        Ok(registry)
    }

    /// Adds an entry to the registry.
    ///
    /// Registering a token again with the same suffix is allowed, the lower priority value wins
    /// then. Registering it again with a different suffix is an error.
    pub fn insert(&mut self, entry: EncodingEntry) -> Result<(), ConfigurationError> {
        if let Some(existing) = self.entries.get_mut(&entry.token) {
            if existing.suffix != entry.suffix {
                return Err(ConfigurationError::ConflictingEncoding {
                    token: entry.token,
                    first: existing.suffix.clone(),
                    second: entry.suffix,
                });
            }
            existing.priority = existing.priority.min(entry.priority);
        } else {
            self.entries.insert(entry.token.clone(), entry);
        }
        Ok(())
    }

    /// Looks up the entry for an encoding token, ignoring case.
    pub fn get(&self, token: &str) -> Option<&EncodingEntry> {
        if let Some(entry) = self.entries.get(token) {
            Some(entry)
        } else {
            self.entries.get(&token.to_ascii_lowercase())
        }
    }

    /// Returns all entries, ordered by priority and token.
    pub fn entries(&self) -> Vec<&EncodingEntry> {
        let mut entries = self.entries.values().collect::<Vec<_>>();
        entries.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.token.cmp(&b.token)));
        entries
    }

    /// Iterates over the distinct file name suffixes of all entries.
    pub fn suffixes(&self) -> impl Iterator<Item = &str> {
        let mut suffixes = self
            .entries
            .values()
            .map(EncodingEntry::suffix)
            .collect::<Vec<_>>();
        suffixes.sort_unstable();
        suffixes.dedup();
        suffixes.into_iter()
    }

    /// Number of registered encodings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks whether any encodings are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
