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

//! Data structures required for `NegotiationHandler` configuration

use clap::{ArgAction, Parser};
use log::trace;
use pingora::{Error, ErrorType};
use serde::de::{DeserializeOwned, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::encoding::{EncodingEntry, EncodingRegistry};
use crate::path::normalize_mount_path;

/// Errors detected when validating the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// An encoding token is empty.
    EmptyToken,
    /// An encoding token cannot appear in `Accept-Encoding` header.
    InvalidToken(String),
    /// The file name suffix of an encoding is empty.
    EmptySuffix(String),
    /// The file name suffix of an encoding contains path separators.
    InvalidSuffix {
        /// Encoding token
        token: String,
        /// Configured suffix
        suffix: String,
    },
    /// An encoding token is configured repeatedly with different suffixes.
    ConflictingEncoding {
        /// Encoding token
        token: String,
        /// Suffix configured first
        first: String,
        /// Conflicting suffix
        second: String,
    },
    /// The mount path doesn’t start with a slash.
    InvalidMountPath(String),
    /// A value passed as `TOKEN=SUFFIX[:PRIORITY]` on the command line cannot be parsed.
    InvalidEncodingArgument(String),
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::EmptyToken => write!(f, "Encoding token cannot be empty"),
            Self::InvalidToken(token) => write!(f, "Invalid encoding token: {token}"),
            Self::EmptySuffix(token) => write!(f, "File name suffix of encoding {token} is empty"),
            Self::InvalidSuffix { token, suffix } => {
                write!(f, "Invalid file name suffix of encoding {token}: {suffix}")
            }
            Self::ConflictingEncoding {
                token,
                first,
                second,
            } => write!(
                f,
                "Encoding {token} configured with conflicting suffixes {first} and {second}"
            ),
            Self::InvalidMountPath(path) => {
                write!(f, "Mount path has to start with a slash: {path}")
            }
            Self::InvalidEncodingArgument(value) => write!(
                f,
                "Expected encoding in the format TOKEN=SUFFIX[:PRIORITY], got: {value}"
            ),
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// Trait for configuration structures that can be loaded from YAML. This trait has a blanket
/// implementation for any structure implementing [`serde::Deserialize`].
pub trait FromYaml {
    /// Loads configuration from a YAML file.
    fn load_from_yaml<P>(path: P) -> Result<Self, Box<Error>>
    where
        P: AsRef<Path>,
        Self: Sized;

    /// Parses configuration from a YAML string.
    fn from_yaml<S>(yaml: S) -> Result<Self, Box<Error>>
    where
        S: AsRef<str>,
        Self: Sized;
}

impl<D> FromYaml for D
where
    D: DeserializeOwned + Debug,
{
    fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Box<Error>> {
        let file = File::open(path.as_ref()).map_err(|err| {
            Error::because(
                ErrorType::FileOpenError,
                "failed opening configuration file",
                err,
            )
        })?;
        let reader = BufReader::new(file);

        let conf = serde_yaml::from_reader(reader).map_err(|err| {
            Error::because(
                ErrorType::FileReadError,
                "failed reading configuration file",
                err,
            )
        })?;
        trace!("Loaded configuration file: {conf:#?}");

        Ok(conf)
    }

    fn from_yaml<S: AsRef<str>>(yaml: S) -> Result<Self, Box<Error>> {
        let conf = serde_yaml::from_str(yaml.as_ref()).map_err(|err| {
            Error::because(ErrorType::ReadError, "failed parsing configuration", err)
        })?;
        trace!("Parsed configuration: {conf:#?}");

        Ok(conf)
    }
}

/// Configuration of a single encoding: the file name suffix and the tie-break priority.
///
/// In configuration files this can be given either as a suffix string (priority 0) or as a map
/// with the `suffix` and `priority` keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingConf {
    /// File name suffix of the pre-compressed files, e.g. `.br`
    pub suffix: String,
    /// Lower values are preferred if the client states equal quality for multiple encodings.
    pub priority: i32,
}

impl From<&str> for EncodingConf {
    fn from(value: &str) -> Self {
        Self {
            suffix: value.to_owned(),
            priority: 0,
        }
    }
}

impl<'de> Deserialize<'de> for EncodingConf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EncodingVisitor;

        impl<'de> Visitor<'de> for EncodingVisitor {
            type Value = EncodingConf;

            fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("file name suffix or a map with suffix and priority")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(v.into())
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                use serde::de::Error as _;

                const SUFFIX_FIELD: &str = "suffix";
                const PRIORITY_FIELD: &str = "priority";

                let mut suffix = None;
                let mut priority = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        SUFFIX_FIELD => {
                            if suffix.is_some() {
                                return Err(A::Error::duplicate_field(SUFFIX_FIELD));
                            }
                            suffix = Some(map.next_value()?);
                        }
                        PRIORITY_FIELD => {
                            if priority.is_some() {
                                return Err(A::Error::duplicate_field(PRIORITY_FIELD));
                            }
                            priority = Some(map.next_value()?);
                        }
                        other => {
                            return Err(A::Error::unknown_field(
                                other,
                                &[SUFFIX_FIELD, PRIORITY_FIELD],
                            ))
                        }
                    }
                }

                let suffix = suffix.ok_or_else(|| A::Error::missing_field(SUFFIX_FIELD))?;
                Ok(EncodingConf {
                    suffix,
                    priority: priority.unwrap_or(0),
                })
            }
        }

        deserializer.deserialize_any(EncodingVisitor)
    }
}

/// The list of configured encodings, in the order they were listed
///
/// This deserializes from a map keyed by encoding token. Unlike a `HashMap` it keeps keys that
/// differ only in case, so that conflicting entries can be reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodingsConf(pub Vec<(String, EncodingConf)>);

impl<'de> Deserialize<'de> for EncodingsConf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EncodingsVisitor;

        impl<'de> Visitor<'de> for EncodingsVisitor {
            type Value = EncodingsConf;

            fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("map of encoding tokens to file name suffixes")
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(EncodingsConf::default())
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::new();
                while let Some((token, conf)) = map.next_entry::<String, EncodingConf>()? {
                    entries.push((token, conf));
                }
                Ok(EncodingsConf(entries))
            }
        }

        deserializer.deserialize_any(EncodingsVisitor)
    }
}

impl EncodingsConf {
    /// Validates the entries and builds the registry from them.
    pub fn to_registry(&self) -> Result<EncodingRegistry, ConfigurationError> {
        let entries = self
            .0
            .iter()
            .map(|(token, conf)| EncodingEntry::new(token, &conf.suffix, conf.priority))
            .collect::<Result<Vec<_>, _>>()?;
        EncodingRegistry::from_entries(entries)
    }
}

/// An encoding given on the command line as `TOKEN=SUFFIX[:PRIORITY]`, e.g. `br=.br:0`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingArg {
    /// Encoding token
    pub token: String,
    /// Suffix and priority
    pub conf: EncodingConf,
}

impl FromStr for EncodingArg {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigurationError::InvalidEncodingArgument(s.to_owned());

        let (token, rest) = s.split_once('=').ok_or_else(invalid)?;
        let (suffix, priority) = match rest.rsplit_once(':') {
            Some((suffix, priority)) => (suffix, priority.trim().parse().map_err(|_| invalid())?),
            None => (rest, 0),
        };

        Ok(Self {
            token: token.trim().to_owned(),
            conf: EncodingConf {
                suffix: suffix.trim().to_owned(),
                priority,
            },
        })
    }
}

/// Command line options of the negotiation module
#[derive(Debug, Default, Parser)]
pub struct NegotiationOpt {
    /// The root directory.
    #[clap(short, long)]
    pub root: Option<PathBuf>,

    /// URI path prefix to serve files under, e.g. /static
    #[clap(long)]
    pub mount_path: Option<String>,

    /// Encoding to serve from pre-compressed files, in the format TOKEN=SUFFIX[:PRIORITY], e.g.
    /// br=.br:0 or gzip=.gz:1. This command line flag can be specified multiple times and replaces
    /// the configured encodings.
    #[clap(long)]
    pub encoding: Option<Vec<EncodingArg>>,

    /// Serve files with unknown extensions using the default content type.
    #[clap(long, action = ArgAction::SetTrue)]
    pub serve_unknown_file_types: bool,
}

/// Configuration file settings of the negotiation module
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NegotiationConf {
    /// URI path prefix to serve files under, `/` by default.
    pub mount_path: String,

    /// The root directory. Without it no requests are handled.
    pub root: Option<PathBuf>,

    /// Map of encoding tokens to file name suffixes (or suffix and priority). If missing, `br`
    /// (`.br`) and `gzip` (`.gz`) are used, Brotli being preferred.
    pub encodings: Option<EncodingsConf>,

    /// Additional mappings of file extensions to content types, e.g. `.webmanifest:
    /// application/manifest+json`.
    pub content_types: BTreeMap<String, String>,

    /// If `true`, files with unknown extensions are served using `default_content_type`.
    /// Otherwise they are treated as missing.
    pub serve_unknown_file_types: bool,

    /// Content type for files with unknown extensions.
    pub default_content_type: String,
}

impl Default for NegotiationConf {
    fn default() -> Self {
        Self {
            mount_path: "/".to_owned(),
            root: None,
            encodings: None,
            content_types: BTreeMap::new(),
            serve_unknown_file_types: false,
            default_content_type: "application/octet-stream".to_owned(),
        }
    }
}

impl NegotiationConf {
    /// Merges the command line options into the current configuration. Any command line options
    /// present overwrite existing settings.
    pub fn merge_with_opt(&mut self, opt: NegotiationOpt) {
        if opt.root.is_some() {
            self.root = opt.root;
        }

        if let Some(mount_path) = opt.mount_path {
            self.mount_path = mount_path;
        }

        if let Some(encoding) = opt.encoding {
            self.encodings = Some(EncodingsConf(
                encoding.into_iter().map(|arg| (arg.token, arg.conf)).collect(),
            ));
        }

        if opt.serve_unknown_file_types {
            self.serve_unknown_file_types = true;
        }
    }

    /// Builds the encoding registry, using the defaults if no encodings are configured.
    pub fn registry(&self) -> Result<EncodingRegistry, ConfigurationError> {
        match &self.encodings {
            Some(encodings) => encodings.to_registry(),
            None => Ok(EncodingRegistry::with_defaults()),
        }
    }

    /// Validates and normalizes the mount path.
    pub fn normalized_mount_path(&self) -> Result<String, ConfigurationError> {
        normalize_mount_path(&self.mount_path)
            .ok_or_else(|| ConfigurationError::InvalidMountPath(self.mount_path.clone()))
    }
}
