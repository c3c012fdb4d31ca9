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

//! # Pre-compressed Files Module for Pingora
//!
//! This crate allows extending [Pingora Proxy](https://github.com/cloudflare/pingora) with the
//! capability to serve pre-compressed variants of static files. For a request to `file.txt` the
//! client’s `Accept-Encoding` header decides whether `file.txt.br`, `file.txt.gz` or `file.txt`
//! itself is served. Nothing is compressed on the fly, only files already present are selected.
//!
//! ## Supported functionality
//!
//! * `GET` and `HEAD` requests, other methods are left to subsequent handlers
//! * Configurable encodings, each with a file name suffix and a priority to break ties
//! * Quality values in `Accept-Encoding`, `q=0` rejecting an encoding
//! * Falling back to the uncompressed file, or to subsequent handlers if that one is missing
//! * Direct requests to pre-compressed files like `file.txt.br` are never served
//! * Conditional requests via `If-Modified-Since`, `If-Unmodified-Since`, `If-Match`,
//!   `If-None-Match` HTTP headers
//! * Byte range requests via `Range` and `If-Range` HTTP headers
//!
//! ## Known limitations
//!
//! * The wildcard `*` in `Accept-Encoding` never selects an encoding, only explicitly named
//!   encodings are considered.
//! * Requests with multiple byte ranges are not supported and will result in the full file being
//!   returned.
//!
//! ## Code example
//!
//! You will typically create a [`NegotiationHandler`] instance and make your server call it during
//! the `request_filter` stage. If the handler returns `false`, the request wasn’t handled and
//! should be passed on.
//!
//! ```rust
//! use async_trait::async_trait;
//! use pingora::prelude::*;
//! use pingora::proxy::{ProxyHttp, Session};
//! use precompressed_module::{NegotiationConf, NegotiationHandler};
//!
//! struct Proxy {
//!     handler: NegotiationHandler,
//! }
//!
//! #[async_trait]
//! impl ProxyHttp for Proxy {
//!     type CTX = ();
//!     fn new_ctx(&self) -> Self::CTX {}
//!
//!     async fn request_filter(&self, session: &mut Session, _ctx: &mut Self::CTX) -> Result<bool> {
//!         self.handler.handle(session).await
//!     }
//!
//!     async fn upstream_peer(
//!         &self,
//!         _session: &mut Session,
//!         _ctx: &mut Self::CTX,
//!     ) -> Result<Box<HttpPeer>> {
//!         Err(Error::new(ErrorType::HTTPStatus(404)))
//!     }
//! }
//!
//! let handler = NegotiationHandler::new(NegotiationConf::default()).unwrap();
//! let proxy = Proxy { handler };
//! ```
//!
//! See the `precompressed-server` crate in the repository for a complete server.
//!
//! ## Configuration
//!
//! Without explicit configuration, Brotli (`.br`) and gzip (`.gz`) variants are looked up, Brotli
//! being preferred if the client accepts both with the same quality. This configuration file
//! serves `/var/www/html` under the `/static` path and adds Zstandard support:
//!
//! ```yaml
//! root: /var/www/html
//! mount_path: /static
//! encodings:
//!     zstd: {suffix: .zst, priority: 0}
//!     br: {suffix: .br, priority: 1}
//!     gzip: .gz
//! content_types:
//!     webmanifest: application/manifest+json
//! ```
//!
//! A client requesting `/static/app.js` with `Accept-Encoding: gzip, br;q=0.9` will receive
//! `app.js.gz` if it exists, otherwise `app.js.br` and finally `app.js`. The `Content-Encoding`
//! response header indicates which variant was chosen.

pub mod accept;
mod configuration;
pub mod content_type;
pub mod encoding;
mod handler;
pub mod metadata;
pub mod path;
pub mod provider;
pub mod range;
mod session;
pub mod standard_response;
#[cfg(test)]
mod tests;
mod transport;
pub mod variant;

pub use configuration::{
    ConfigurationError, EncodingArg, EncodingConf, EncodingsConf, FromYaml, NegotiationConf,
    NegotiationOpt,
};
pub use handler::NegotiationHandler;
pub use session::ResponseSink;
pub use transport::ResponseHook;
