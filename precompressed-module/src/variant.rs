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

//! Mapping logical paths to the on-disk variants of a resource.

use std::io::Error;
use std::sync::Arc;

use crate::encoding::EncodingEntry;
use crate::provider::{ChangeToken, FileProvider, OpenedFile};

/// A file variant selected to be served for a logical resource.
#[derive(Debug)]
pub struct ResolvedVariant {
    /// The logical path requested
    pub logical_path: String,
    /// The opened file
    pub file: OpenedFile,
    /// Value of the `Content-Encoding` header, `None` for the uncompressed variant
    pub encoding: Option<String>,
}

/// Resolves logical paths to the variant with a particular file name suffix.
///
/// The suffix only applies to file lookups, directory listings and watches operate on the
/// unmodified path.
#[derive(Debug, Clone)]
pub struct VariantResolver {
    provider: Arc<dyn FileProvider>,
    suffix: String,
    encoding: Option<String>,
}

impl VariantResolver {
    /// Creates a resolver for the uncompressed files.
    pub fn uncompressed(provider: Arc<dyn FileProvider>) -> Self {
        Self {
            provider,
            suffix: String::new(),
            encoding: None,
        }
    }

    /// Creates a resolver for the pre-compressed files of an encoding.
    pub fn for_encoding(provider: Arc<dyn FileProvider>, entry: &EncodingEntry) -> Self {
        Self {
            provider,
            suffix: entry.suffix().to_owned(),
            encoding: Some(entry.token().to_owned()),
        }
    }

    /// The encoding token of this resolver, `None` for uncompressed files.
    pub fn encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }

    /// The file name suffix appended to logical paths.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Opens the variant of a file. Directories (paths ending with a slash) never resolve.
    ///
    /// `Ok(None)` means that the variant doesn’t exist, an error means that it exists but
    /// couldn’t be opened.
    pub fn resolve(&self, logical_path: &str) -> Result<Option<ResolvedVariant>, Error> {
        if logical_path.is_empty() || logical_path.ends_with('/') {
            return Ok(None);
        }

        let path = format!("{logical_path}{}", self.suffix);
        Ok(self.provider.open(&path)?.map(|file| ResolvedVariant {
            logical_path: logical_path.to_owned(),
            file,
            encoding: self.encoding.clone(),
        }))
    }

    /// Lists a directory, without applying the suffix.
    pub fn read_dir(&self, logical_path: &str) -> Result<Vec<String>, Error> {
        self.provider.read_dir(logical_path)
    }

    /// Watches a file or directory for changes, without applying the suffix.
    pub fn watch(&self, logical_path: &str) -> Result<ChangeToken, notify::Error> {
        self.provider.watch(logical_path)
    }
}
