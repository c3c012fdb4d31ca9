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

//! Path resolution logic

use percent_encoding::percent_decode_str;
use std::io::{Error, ErrorKind};
use std::path::{Component, Path, PathBuf};

/// Normalizes a mount path: it has to start with a slash, trailing slashes are removed unless the
/// mount path is the root.
pub fn normalize_mount_path(mount_path: &str) -> Option<String> {
    if !mount_path.starts_with('/') {
        return None;
    }

    let trimmed = mount_path.trim_end_matches('/');
    if trimmed.is_empty() {
        Some("/".to_owned())
    } else {
        Some(trimmed.to_owned())
    }
}

/// Translates the path from a URI into the logical resource path relative to the mount path, e.g.
/// `/static/css/site%20main.css` with the mount path `/static` becomes `css/site main.css`.
///
/// A trailing slash is preserved to signal a directory. `None` is returned for paths outside the
/// mount path and for paths that cannot be mapped to a file safely: `..` components, encoded
/// slashes or null bytes, invalid UTF-8.
pub fn logical_path(uri_path: &str, mount_path: &str) -> Option<String> {
    let rest = if mount_path == "/" {
        uri_path.strip_prefix('/')?
    } else {
        let rest = uri_path.strip_prefix(mount_path)?;
        if rest.is_empty() {
            rest
        } else {
            rest.strip_prefix('/')?
        }
    };

    let mut logical = String::with_capacity(rest.len());
    for component in rest.split('/') {
        let decoded = percent_decode_str(component).decode_utf8().ok()?;
        match decoded.as_ref() {
            "" | "." => continue,
            ".." => return None,
            name if name.contains(['/', '\\', '\0']) => return None,
            name => {
                if !logical.is_empty() {
                    logical.push('/');
                }
                logical.push_str(name);
            }
        }
    }

    if rest.is_empty() || rest.ends_with('/') {
        logical.push('/');
    }
    Some(logical)
}

/// Joins a logical path to the root directory and makes sure that the result stays inside it,
/// following symbolic links.
///
/// This will return an error under the following conditions:
///
/// * Path pointing outside the root directory: results in [`ErrorKind::InvalidData`]
/// * [`std::fs::canonicalize()`] failed: results in [`ErrorKind::NotFound`],
///   [`ErrorKind::PermissionDenied`] and other errors
pub fn confine(root: &Path, logical: &str) -> Result<PathBuf, Error> {
    let mut path = root.to_path_buf();
    for component in Path::new(logical).components() {
        match component {
            Component::Normal(name) => path.push(name),
            Component::CurDir => {}
            _ => return Err(ErrorKind::InvalidData.into()),
        }
    }

    let path = path.canonicalize()?;
    if path.starts_with(root) {
        Ok(path)
    } else {
        Err(ErrorKind::InvalidData.into())
    }
}
