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

//! Handler for the `request_filter` phase.

use http::{header, method::Method, status::StatusCode};
use log::{debug, error, info, warn};
use pingora::{Error, ErrorType};
use std::borrow::Cow;
use std::collections::HashMap;
use std::iter::once;
use std::sync::Arc;

use crate::accept::rank;
use crate::configuration::NegotiationConf;
use crate::content_type::{ContentTypeLookup, ContentTypes};
use crate::encoding::EncodingRegistry;
use crate::path::logical_path;
use crate::provider::{DirectoryProvider, FileProvider};
use crate::session::ResponseSink;
use crate::standard_response::error_response;
use crate::transport::{serve, ResponseHook, ServeOptions};
use crate::variant::VariantResolver;

/// Handler for Pingora’s `request_filter` phase
///
/// For requests under the mount path it selects the file variant best matching the client’s
/// `Accept-Encoding` header and serves it. Requests it cannot serve are left to the subsequent
/// handlers.
#[derive(Debug)]
pub struct NegotiationHandler {
    mount_path: String,
    registry: Arc<EncodingRegistry>,
    resolvers: HashMap<String, VariantResolver>,
    uncompressed: Option<VariantResolver>,
    content_types: Arc<ContentTypes>,
    serve_unknown_file_types: bool,
    default_content_type: String,
    hook: Option<ResponseHook>,
}

fn configuration_error(err: impl std::error::Error + Send + Sync + 'static) -> Box<Error> {
    Error::because(ErrorType::InternalError, "Invalid negotiation configuration", err)
}

impl NegotiationHandler {
    /// Creates a new handler with given configuration. This will canonicalize the path to the root
    /// directory and might result in an error if that path isn’t accessible. Without a root
    /// directory the handler won’t handle any requests.
    pub fn new(conf: NegotiationConf) -> Result<Self, Box<Error>> {
        let provider = match &conf.root {
            Some(root) => {
                let provider = DirectoryProvider::new(root).map_err(|err| {
                    Error::because(
                        ErrorType::InternalError,
                        format!("Failed accessing root path {root:?}"),
                        err,
                    )
                })?;
                let provider: Arc<dyn FileProvider> = Arc::new(provider);
                Some(provider)
            }
            None => None,
        };
        Self::build(conf, provider)
    }

    /// Creates a new handler serving files from a custom file provider. The `root` configuration
    /// setting is ignored then.
    pub fn with_provider(
        conf: NegotiationConf,
        provider: Arc<dyn FileProvider>,
    ) -> Result<Self, Box<Error>> {
        Self::build(conf, Some(provider))
    }

    fn build(
        conf: NegotiationConf,
        provider: Option<Arc<dyn FileProvider>>,
    ) -> Result<Self, Box<Error>> {
        let mount_path = conf.normalized_mount_path().map_err(configuration_error)?;
        let registry = Arc::new(conf.registry().map_err(configuration_error)?);
        let content_types = Arc::new(ContentTypes::new(&conf.content_types, registry.suffixes()));

        let resolvers = provider
            .iter()
            .flat_map(|provider| {
                registry.entries().into_iter().map(move |entry| {
                    (
                        entry.token().to_owned(),
                        VariantResolver::for_encoding(provider.clone(), entry),
                    )
                })
            })
            .collect();
        let uncompressed = provider.map(VariantResolver::uncompressed);

        let handler = Self {
            mount_path,
            registry,
            resolvers,
            uncompressed,
            content_types,
            serve_unknown_file_types: conf.serve_unknown_file_types,
            default_content_type: conf.default_content_type,
            hook: None,
        };
        debug!("Initialized negotiation handler: {handler:#?}");
        Ok(handler)
    }

    /// Sets a callback to be invoked with the response header of every variant served, before
    /// the response is written.
    pub fn with_response_hook(mut self, hook: ResponseHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// The encodings this handler can serve.
    pub fn registry(&self) -> &Arc<EncodingRegistry> {
        &self.registry
    }

    /// Normalized mount path, e.g. `/static`.
    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    /// Handles the current request. Returns `true` if a response has been produced and `false`
    /// if the request should be passed on to the next handler.
    ///
    /// Errors are only returned if writing the response failed.
    pub async fn handle(&self, session: &mut impl ResponseSink) -> Result<bool, Box<Error>> {
        let Some(uncompressed) = &self.uncompressed else {
            return Ok(false);
        };

        if session.response_written().is_some() {
            debug!("response already committed, not handling request");
            return Ok(false);
        }

        let req = session.req_header();
        let Some(logical) = logical_path(req.uri.path(), &self.mount_path) else {
            debug!("URI path {} not handled under {}", req.uri.path(), self.mount_path);
            return Ok(false);
        };

        if !matches!(req.method, Method::GET | Method::HEAD) {
            debug!("not handling method {}", req.method);
            return Ok(false);
        }

        let content_type = match self.content_types.lookup(&logical) {
            ContentTypeLookup::Known(content_type) => content_type,
            ContentTypeLookup::Unknown if self.serve_unknown_file_types => {
                Cow::Borrowed(self.default_content_type.as_str())
            }
            ContentTypeLookup::Unknown => {
                debug!("no content type known for {logical}, not handling");
                return Ok(false);
            }
            ContentTypeLookup::Excluded => {
                debug!("{logical} addresses a pre-compressed file directly, not handling");
                return Ok(false);
            }
        };

        let ranked = rank(
            req.headers
                .get_all(header::ACCEPT_ENCODING)
                .iter()
                .filter_map(|value| value.to_str().ok()),
            &self.registry,
        );
        debug!("ranked encodings: {ranked:?}");

        let steps = ranked
            .iter()
            .filter_map(|candidate| self.resolvers.get(&candidate.token))
            .chain(once(uncompressed));

        for resolver in steps {
            let encoding = resolver.encoding().unwrap_or("identity");
            let variant = match resolver.resolve(&logical) {
                Ok(Some(variant)) => variant,
                Ok(None) => {
                    debug!("no {encoding} variant of {logical}");
                    continue;
                }
                Err(err) if resolver.encoding().is_some() => {
                    warn!("failed opening {encoding} variant of {logical}, falling back: {err}");
                    continue;
                }
                Err(err) => {
                    warn!("failed opening {logical}: {err}");
                    error_response(session, StatusCode::INTERNAL_SERVER_ERROR).await?;
                    return Ok(true);
                }
            };

            info!("serving {encoding} variant of {logical}: {:?}", variant.file.path);
            let options = ServeOptions {
                content_type: &content_type,
                vary: !self.registry.is_empty(),
                hook: self.hook.as_ref(),
            };
            return match serve(session, variant, options).await {
                Ok(status) => {
                    debug!("responded with status {status}");
                    Ok(true)
                }
                Err(err) => {
                    error!("failed serving {logical}: {err}");
                    Err(err)
                }
            };
        }

        debug!("no variant of {logical} found, passing on");
        Ok(false)
    }
}

impl TryFrom<NegotiationConf> for NegotiationHandler {
    type Error = Box<Error>;

    fn try_from(conf: NegotiationConf) -> Result<Self, Self::Error> {
        Self::new(conf)
    }
}
