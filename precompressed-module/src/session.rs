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

//! The part of a Pingora session the handler writes responses to.

use async_trait::async_trait;
use bytes::Bytes;
use pingora::http::{RequestHeader, ResponseHeader};
use pingora::proxy::Session;
use pingora::Error;

/// A request being handled along with the means to respond to it
///
/// This is implemented for Pingora’s [`Session`] and allows the handler to be used with other
/// session types, e.g. in tests.
#[async_trait]
pub trait ResponseSink: Send {
    /// The request header
    fn req_header(&self) -> &RequestHeader;

    /// The response header if one has been written already. A written header means that the
    /// response is committed.
    fn response_written(&self) -> Option<&ResponseHeader>;

    /// Writes the response header.
    async fn write_response_header(&mut self, header: Box<ResponseHeader>) -> Result<(), Box<Error>>;

    /// Writes a chunk of the response body.
    async fn write_response_body(&mut self, data: Bytes) -> Result<(), Box<Error>>;
}

#[async_trait]
impl ResponseSink for Session {
    fn req_header(&self) -> &RequestHeader {
        self.downstream_session.req_header()
    }

    fn response_written(&self) -> Option<&ResponseHeader> {
        self.downstream_session.response_written()
    }

    async fn write_response_header(&mut self, header: Box<ResponseHeader>) -> Result<(), Box<Error>> {
        self.downstream_session.write_response_header(header).await
    }

    async fn write_response_body(&mut self, data: Bytes) -> Result<(), Box<Error>> {
        self.downstream_session.write_response_body(data).await
    }
}
