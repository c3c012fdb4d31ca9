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

//! File access for the variant resolvers.

use log::{debug, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::fmt::Debug;
use std::fs::{File, Metadata};
use std::io::{Error, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::path::confine;

/// A regular file opened for reading.
#[derive(Debug)]
pub struct OpenedFile {
    /// Location of the file on disk
    pub path: PathBuf,
    /// The open file handle
    pub file: File,
    /// File metadata retrieved after opening
    pub metadata: Metadata,
}

/// Signals changes to a watched file or directory.
pub struct ChangeToken {
    changed: Arc<AtomicBool>,
    _watcher: Option<RecommendedWatcher>,
}

impl ChangeToken {
    /// Creates a token that is never going to signal a change.
    pub fn never() -> Self {
        Self {
            changed: Arc::new(AtomicBool::new(false)),
            _watcher: None,
        }
    }

    /// Checks whether the watched location changed since the token was created.
    pub fn has_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }
}

impl Debug for ChangeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeToken")
            .field("changed", &self.has_changed())
            .finish()
    }
}

/// Access to the files of a directory tree. Paths are logical paths relative to the tree’s root,
/// with `/` as separator.
pub trait FileProvider: Debug + Send + Sync {
    /// Opens a regular file. `Ok(None)` means that there is no such file, an error means that a
    /// file exists but cannot be accessed.
    fn open(&self, path: &str) -> Result<Option<OpenedFile>, Error>;

    /// Lists the names of the entries in a directory.
    fn read_dir(&self, path: &str) -> Result<Vec<String>, Error>;

    /// Produces a token signaling changes to a file or directory.
    fn watch(&self, path: &str) -> Result<ChangeToken, notify::Error>;
}

/// Provides access to the files in a directory on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryProvider {
    root: PathBuf,
}

impl DirectoryProvider {
    /// Creates a provider for the given directory. This will canonicalize the path to the root
    /// directory and might result in an error if that path isn’t accessible.
    pub fn new(root: &Path) -> Result<Self, Error> {
        let root = root.canonicalize()?;
        if !root.is_dir() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("{root:?} is not a directory"),
            ));
        }
        Ok(Self { root })
    }

    /// The canonical path of the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn locate(&self, path: &str) -> Result<Option<PathBuf>, Error> {
        match confine(&self.root, path) {
            Ok(path) => Ok(Some(path)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) if err.kind() == ErrorKind::InvalidData => {
                warn!("path {path} resolves outside the root directory");
                Ok(None)
            }
            Err(err) if err.kind() == ErrorKind::PermissionDenied => Err(err),
            Err(err) => {
                // E.g. a file being used as a directory
                debug!("cannot resolve {path}: {err}");
                Ok(None)
            }
        }
    }
}

impl FileProvider for DirectoryProvider {
    fn open(&self, path: &str) -> Result<Option<OpenedFile>, Error> {
        let Some(path) = self.locate(path)? else {
            return Ok(None);
        };

        let file = File::open(&path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            debug!("{path:?} is not a regular file");
            return Ok(None);
        }

        Ok(Some(OpenedFile {
            path,
            file,
            metadata,
        }))
    }

    fn read_dir(&self, path: &str) -> Result<Vec<String>, Error> {
        let Some(path) = self.locate(path)? else {
            return Err(ErrorKind::NotFound.into());
        };

        let mut names = Vec::new();
        for entry in path.read_dir()? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn watch(&self, path: &str) -> Result<ChangeToken, notify::Error> {
        let Some(path) = self.locate(path)? else {
            return Ok(ChangeToken::never());
        };

        let changed = Arc::new(AtomicBool::new(false));
        let flag = changed.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if !event.kind.is_access() => flag.store(true, Ordering::Release),
                Ok(_) => {}
                Err(err) => warn!("watch error: {err}"),
            }
        })?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;
        debug!("watching {path:?} for changes");

        Ok(ChangeToken {
            changed,
            _watcher: Some(watcher),
        })
    }
}
