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

use crate::configuration::{FromYaml, NegotiationConf};
use crate::handler::NegotiationHandler;
use crate::provider::{ChangeToken, DirectoryProvider, FileProvider, OpenedFile};
use crate::session::ResponseSink;
use crate::standard_response::{error_response, response_text};
use crate::transport::ResponseHook;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use http::status::StatusCode;
use pingora::http::{RequestHeader, ResponseHeader};
use pingora::proxy::Session;
use pingora::Error;
use std::fs;
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use test_log::test;

#[derive(Debug)]
struct TestSession {
    req: RequestHeader,
    response: Option<ResponseHeader>,
    body: BytesMut,
}

impl TestSession {
    fn new(method: &str, path: &str, headers: &[(&str, &str)]) -> Self {
        let mut req = RequestHeader::build(method, path.as_bytes(), None).unwrap();
        for (name, value) in headers {
            req.append_header(name.to_string(), *value).unwrap();
        }
        Self {
            req,
            response: None,
            body: BytesMut::new(),
        }
    }

    fn status(&self) -> u16 {
        self.response.as_ref().unwrap().status.as_u16()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.response
            .as_ref()
            .unwrap()
            .headers
            .get(name)
            .map(|value| value.to_str().unwrap())
    }

    fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }

    /// Decodes the body according to the `Content-Encoding` header.
    fn decoded_body(&self) -> String {
        let mut decoded = String::new();
        match self.header("Content-Encoding") {
            Some("br") => {
                brotli::Decompressor::new(&self.body[..], 4096)
                    .read_to_string(&mut decoded)
                    .unwrap();
            }
            Some("gzip") => {
                GzDecoder::new(&self.body[..])
                    .read_to_string(&mut decoded)
                    .unwrap();
            }
            Some(other) => panic!("unexpected encoding {other}"),
            None => decoded.push_str(self.body_str()),
        }
        decoded
    }
}

#[async_trait]
impl ResponseSink for TestSession {
    fn req_header(&self) -> &RequestHeader {
        &self.req
    }

    fn response_written(&self) -> Option<&ResponseHeader> {
        self.response.as_ref()
    }

    async fn write_response_header(&mut self, header: Box<ResponseHeader>) -> Result<(), Box<Error>> {
        assert!(self.response.is_none(), "response header written twice");
        self.response = Some(*header);
        Ok(())
    }

    async fn write_response_body(&mut self, data: Bytes) -> Result<(), Box<Error>> {
        assert!(self.response.is_some(), "response body written before header");
        self.body.extend_from_slice(&data);
        Ok(())
    }
}

/// A provider failing to open files with a particular suffix.
#[derive(Debug)]
struct FailingProvider {
    inner: DirectoryProvider,
    failing_suffix: &'static str,
}

impl FileProvider for FailingProvider {
    fn open(&self, path: &str) -> Result<Option<OpenedFile>, std::io::Error> {
        if path.ends_with(self.failing_suffix) {
            Err(ErrorKind::PermissionDenied.into())
        } else {
            self.inner.open(path)
        }
    }

    fn read_dir(&self, path: &str) -> Result<Vec<String>, std::io::Error> {
        self.inner.read_dir(path)
    }

    fn watch(&self, path: &str) -> Result<ChangeToken, notify::Error> {
        self.inner.watch(path)
    }
}

fn brotli_compress(data: &[u8]) -> Vec<u8> {
    let mut writer = brotli::CompressorWriter::new(Vec::new(), 4096, 11, 22);
    writer.write_all(data).unwrap();
    writer.into_inner()
}

fn gzip_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn fixture() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::write(root.join("sample.txt"), "Test1").unwrap();
    fs::write(root.join("sample.txt.br"), brotli_compress(b"Test2")).unwrap();
    fs::write(root.join("sample.txt.gz"), gzip_compress(b"Test3")).unwrap();
    fs::write(root.join("plain.txt"), "Only plain").unwrap();
    fs::write(root.join("blob.nosuchext"), "Blob").unwrap();
    fs::create_dir(root.join("dir")).unwrap();
    dir
}

fn conf(root: &Path) -> NegotiationConf {
    NegotiationConf {
        root: Some(root.to_path_buf()),
        ..Default::default()
    }
}

fn make_handler(root: &Path) -> NegotiationHandler {
    NegotiationHandler::new(conf(root)).unwrap()
}

async fn request(
    handler: &NegotiationHandler,
    path: &str,
    accept_encoding: Option<&str>,
) -> (bool, TestSession) {
    let headers = accept_encoding
        .map(|value| vec![("Accept-Encoding", value)])
        .unwrap_or_default();
    let mut session = TestSession::new("GET", path, &headers);
    let handled = handler.handle(&mut session).await.unwrap();
    (handled, session)
}

/// Handles the request like a server would: a request not handled results in 404.
async fn request_with_fallback(
    handler: &NegotiationHandler,
    path: &str,
    accept_encoding: Option<&str>,
) -> TestSession {
    let (handled, mut session) = request(handler, path, accept_encoding).await;
    if !handled {
        assert!(session.response.is_none());
        error_response(&mut session, StatusCode::NOT_FOUND)
            .await
            .unwrap();
    }
    session
}

#[test(tokio::test)]
async fn unconfigured() {
    let handler = NegotiationHandler::new(NegotiationConf::default()).unwrap();
    let (handled, session) = request(&handler, "/sample.txt", Some("br")).await;
    assert!(!handled);
    assert!(session.response.is_none());
}

#[test(tokio::test)]
async fn brotli_preferred() {
    let root = fixture();
    let handler = make_handler(root.path());

    let session = request_with_fallback(&handler, "/sample.txt", Some("br")).await;
    assert_eq!(session.status(), 200);
    assert_eq!(session.header("Content-Encoding"), Some("br"));
    assert_eq!(session.header("Content-Type"), Some("text/plain"));
    assert_eq!(session.header("Vary"), Some("Accept-Encoding"));
    assert_eq!(session.decoded_body(), "Test2");

    // Equal quality, lower priority value wins
    let session = request_with_fallback(&handler, "/sample.txt", Some("gzip, br")).await;
    assert_eq!(session.header("Content-Encoding"), Some("br"));
    assert_eq!(session.decoded_body(), "Test2");
}

#[test(tokio::test)]
async fn quality_beats_priority() {
    let root = fixture();
    let handler = make_handler(root.path());

    let session =
        request_with_fallback(&handler, "/sample.txt", Some("gzip;q=0.9, br;q=0.8")).await;
    assert_eq!(session.status(), 200);
    assert_eq!(session.header("Content-Encoding"), Some("gzip"));
    assert_eq!(session.decoded_body(), "Test3");

    let session = request_with_fallback(&handler, "/sample.txt", Some("GZIP")).await;
    assert_eq!(session.header("Content-Encoding"), Some("gzip"));
    assert_eq!(session.decoded_body(), "Test3");
}

#[test(tokio::test)]
async fn uncompressed_fallback() {
    let root = fixture();
    let handler = make_handler(root.path());

    for accept_encoding in [None, Some("deflate"), Some("*"), Some("br;q=0, gzip;q=0"), Some("")] {
        let session = request_with_fallback(&handler, "/sample.txt", accept_encoding).await;
        assert_eq!(session.status(), 200, "Accept-Encoding: {accept_encoding:?}");
        assert_eq!(session.header("Content-Encoding"), None);
        assert_eq!(session.header("Content-Length"), Some("5"));
        assert_eq!(session.body_str(), "Test1");
    }

    let session = request_with_fallback(&handler, "/plain.txt", Some("br, gzip")).await;
    assert_eq!(session.status(), 200);
    assert_eq!(session.header("Content-Encoding"), None);
    assert_eq!(session.body_str(), "Only plain");
}

#[test(tokio::test)]
async fn not_found() {
    let root = fixture();
    let handler = make_handler(root.path());

    for path in ["/nonexistent.txt", "/sample.txt.br", "/sample.txt.gz", "/dir/", "/dir"] {
        let (handled, session) = request(&handler, path, Some("br, gzip")).await;
        assert!(!handled, "{path} should not be handled");
        assert!(session.response.is_none());
    }

    // No encoding selectable and no uncompressed file either
    for accept_encoding in [
        None,
        Some("*"),
        Some("br;q=0"),
        Some("br;q=0, gzip;q=0"),
        Some("identity"),
    ] {
        let (handled, session) = request(&handler, "/nonexistent.txt", accept_encoding).await;
        assert!(!handled, "{accept_encoding:?} should not be handled");
        assert!(session.response.is_none());
    }

    for accept_encoding in [Some("br"), Some("*"), Some("br;q=0")] {
        let session = request_with_fallback(&handler, "/nonexistent.txt", accept_encoding).await;
        assert_eq!(session.status(), 404);
        assert!(session.header("Content-Encoding").is_none());
        assert_eq!(session.body_str(), response_text(StatusCode::NOT_FOUND));
    }

    // Direct request for a pre-compressed file, even with a matching override
    let mut conf = conf(root.path());
    conf.content_types
        .insert("br".to_owned(), "application/x-brotli".to_owned());
    let handler = NegotiationHandler::new(conf).unwrap();
    let session = request_with_fallback(&handler, "/sample.txt.br", None).await;
    assert_eq!(session.status(), 404);
}

#[test(tokio::test)]
async fn idempotence() {
    let root = fixture();
    let handler = make_handler(root.path());

    let first = request_with_fallback(&handler, "/sample.txt", Some("gzip, br;q=0.5")).await;
    let second = request_with_fallback(&handler, "/sample.txt", Some("gzip, br;q=0.5")).await;
    assert_eq!(first.status(), second.status());
    assert_eq!(
        first.response.as_ref().unwrap().headers,
        second.response.as_ref().unwrap().headers
    );
    assert_eq!(first.body, second.body);
}

#[test(tokio::test)]
async fn unsafe_paths() {
    let root = fixture();
    let handler = make_handler(&root.path().join("dir"));

    for path in ["/../sample.txt", "/%2e%2e/sample.txt", "/..%2fsample.txt"] {
        let (handled, session) = request(&handler, path, None).await;
        assert!(!handled, "{path} should not be handled");
        assert!(session.response.is_none());
    }
}

#[test(tokio::test)]
async fn mount_path() {
    let root = fixture();
    let mut conf = conf(root.path());
    conf.mount_path = "/static/".to_owned();
    let handler = NegotiationHandler::new(conf).unwrap();
    assert_eq!(handler.mount_path(), "/static");

    let (handled, _) = request(&handler, "/sample.txt", Some("br")).await;
    assert!(!handled);
    let (handled, _) = request(&handler, "/staticsample.txt", Some("br")).await;
    assert!(!handled);

    let (handled, session) = request(&handler, "/static/sample.txt", Some("br")).await;
    assert!(handled);
    assert_eq!(session.decoded_body(), "Test2");
}

#[test(tokio::test)]
async fn methods() {
    let root = fixture();
    let handler = make_handler(root.path());

    let mut session = TestSession::new("HEAD", "/sample.txt", &[("Accept-Encoding", "br")]);
    assert!(handler.handle(&mut session).await.unwrap());
    assert_eq!(session.status(), 200);
    assert_eq!(session.header("Content-Encoding"), Some("br"));
    let size = fs::metadata(root.path().join("sample.txt.br")).unwrap().len();
    assert_eq!(session.header("Content-Length"), Some(size.to_string().as_str()));
    assert!(session.body.is_empty());

    let mut session = TestSession::new("POST", "/sample.txt", &[("Accept-Encoding", "br")]);
    assert!(!handler.handle(&mut session).await.unwrap());
    assert!(session.response.is_none());
}

#[test(tokio::test)]
async fn committed_response() {
    let root = fixture();
    let handler = make_handler(root.path());

    let mut session = TestSession::new("GET", "/sample.txt", &[]);
    session.response = Some(ResponseHeader::build(StatusCode::FORBIDDEN, None).unwrap());
    assert!(!handler.handle(&mut session).await.unwrap());
    assert_eq!(session.status(), 403);
    assert!(session.body.is_empty());
}

#[test(tokio::test)]
async fn unknown_file_types() {
    let root = fixture();
    let handler = make_handler(root.path());
    let (handled, _) = request(&handler, "/blob.nosuchext", None).await;
    assert!(!handled);

    let mut conf = conf(root.path());
    conf.serve_unknown_file_types = true;
    let handler = NegotiationHandler::new(conf).unwrap();
    let (handled, session) = request(&handler, "/blob.nosuchext", None).await;
    assert!(handled);
    assert_eq!(
        session.header("Content-Type"),
        Some("application/octet-stream")
    );
    assert_eq!(session.body_str(), "Blob");

    // Still never serving pre-compressed files directly
    let (handled, _) = request(&handler, "/sample.txt.gz", None).await;
    assert!(!handled);
}

#[test(tokio::test)]
async fn custom_encodings() {
    let root = fixture();
    fs::write(root.path().join("sample.txt.zst"), "Not really zstd").unwrap();

    let conf = NegotiationConf::from_yaml(format!(
        r#"
            root: {:?}
            encodings:
                zstd: .zst
                gzip: {{suffix: .gz, priority: 1}}
        "#,
        root.path()
    ))
    .unwrap();
    let handler = NegotiationHandler::new(conf).unwrap();
    assert_eq!(handler.registry().len(), 2);

    let (_, session) = request(&handler, "/sample.txt", Some("br, gzip, zstd")).await;
    assert_eq!(session.header("Content-Encoding"), Some("zstd"));
    assert_eq!(session.body_str(), "Not really zstd");

    let (handled, session) = request(&handler, "/sample.txt.zst", None).await;
    assert!(!handled);
    assert!(session.response.is_none());

    let conf = NegotiationConf::from_yaml(format!("root: {:?}\nencodings: {{}}", root.path()))
        .unwrap();
    let handler = NegotiationHandler::new(conf).unwrap();
    let (_, session) = request(&handler, "/sample.txt", Some("br, gzip")).await;
    assert_eq!(session.header("Content-Encoding"), None);
    assert_eq!(session.header("Vary"), None);
    assert_eq!(session.body_str(), "Test1");
}

#[test(tokio::test)]
async fn invalid_configuration() {
    let root = fixture();

    let mut conf = conf(root.path());
    conf.mount_path = "static".to_owned();
    assert!(NegotiationHandler::new(conf).is_err());

    let conf = NegotiationConf::from_yaml(format!(
        "root: {:?}\nencodings: {{br: \"\"}}",
        root.path()
    ))
    .unwrap();
    assert!(NegotiationHandler::new(conf).is_err());

    assert!(NegotiationHandler::new(self::conf(&root.path().join("missing"))).is_err());
}

#[test(tokio::test)]
async fn failing_encoded_variant() {
    let root = fixture();
    let provider = FailingProvider {
        inner: DirectoryProvider::new(root.path()).unwrap(),
        failing_suffix: ".br",
    };
    let handler =
        NegotiationHandler::with_provider(NegotiationConf::default(), Arc::new(provider)).unwrap();

    let (handled, session) = request(&handler, "/sample.txt", Some("br, gzip")).await;
    assert!(handled);
    assert_eq!(session.header("Content-Encoding"), Some("gzip"));
    assert_eq!(session.decoded_body(), "Test3");

    let (handled, session) = request(&handler, "/sample.txt", Some("br")).await;
    assert!(handled);
    assert_eq!(session.header("Content-Encoding"), None);
    assert_eq!(session.body_str(), "Test1");
}

#[test(tokio::test)]
async fn failing_uncompressed_variant() {
    let root = fixture();
    let provider = FailingProvider {
        inner: DirectoryProvider::new(root.path()).unwrap(),
        failing_suffix: ".txt",
    };
    let handler =
        NegotiationHandler::with_provider(NegotiationConf::default(), Arc::new(provider)).unwrap();

    let (handled, session) = request(&handler, "/sample.txt", Some("deflate")).await;
    assert!(handled);
    assert_eq!(session.status(), 500);
    assert_eq!(
        session.body_str(),
        response_text(StatusCode::INTERNAL_SERVER_ERROR)
    );

    // Encoded variants are unaffected
    let (handled, session) = request(&handler, "/sample.txt", Some("br")).await;
    assert!(handled);
    assert_eq!(session.decoded_body(), "Test2");
}

#[test(tokio::test)]
async fn response_hook() {
    let root = fixture();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook_seen = seen.clone();
    let handler = make_handler(root.path()).with_response_hook(ResponseHook::new(
        move |variant, header| {
            hook_seen
                .lock()
                .unwrap()
                .push((variant.logical_path.clone(), variant.encoding.clone()));
            header
                .insert_header("Cache-Control", "max-age=604800")
                .unwrap();
        },
    ));

    let (_, session) = request(&handler, "/sample.txt", Some("gzip")).await;
    assert_eq!(session.header("Cache-Control"), Some("max-age=604800"));
    let (_, session) = request(&handler, "/plain.txt", Some("gzip")).await;
    assert_eq!(session.header("Cache-Control"), Some("max-age=604800"));
    let (handled, _) = request(&handler, "/missing.txt", Some("gzip")).await;
    assert!(!handled);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ("sample.txt".to_owned(), Some("gzip".to_owned())),
            ("plain.txt".to_owned(), None),
        ]
    );
}

#[test(tokio::test)]
async fn conditional_requests() {
    let root = fixture();
    let handler = make_handler(root.path());

    let (_, session) = request(&handler, "/sample.txt", Some("br")).await;
    let etag = session.header("ETag").unwrap().to_owned();

    let mut session = TestSession::new(
        "GET",
        "/sample.txt",
        &[("Accept-Encoding", "br"), ("If-None-Match", &etag)],
    );
    assert!(handler.handle(&mut session).await.unwrap());
    assert_eq!(session.status(), 304);
    assert_eq!(session.header("Content-Encoding"), None);
    assert_eq!(session.header("Vary"), Some("Accept-Encoding"));
    assert_eq!(session.header("ETag"), Some(etag.as_str()));
    assert!(session.body.is_empty());

    let mut session = TestSession::new(
        "GET",
        "/sample.txt",
        &[("Accept-Encoding", "br"), ("If-Match", "\"nonmatching\"")],
    );
    assert!(handler.handle(&mut session).await.unwrap());
    assert_eq!(session.status(), 412);
    assert!(session.body.is_empty());
}

#[test(tokio::test)]
async fn ranges() {
    let root = fixture();
    let handler = make_handler(root.path());

    let mut session = TestSession::new("GET", "/sample.txt", &[("Range", "bytes=1-3")]);
    assert!(handler.handle(&mut session).await.unwrap());
    assert_eq!(session.status(), 206);
    assert_eq!(session.header("Content-Range"), Some("bytes 1-3/5"));
    assert_eq!(session.header("Content-Length"), Some("3"));
    assert_eq!(session.body_str(), "est");

    let mut session = TestSession::new("GET", "/sample.txt", &[("Range", "bytes=10-")]);
    assert!(handler.handle(&mut session).await.unwrap());
    assert_eq!(session.status(), 416);
    assert_eq!(session.header("Content-Range"), Some("bytes */5"));
    assert!(session.body.is_empty());

    let size = fs::metadata(root.path().join("sample.txt.gz")).unwrap().len();
    let mut session = TestSession::new(
        "GET",
        "/sample.txt",
        &[("Accept-Encoding", "gzip"), ("Range", "bytes=0-")],
    );
    assert!(handler.handle(&mut session).await.unwrap());
    assert_eq!(session.status(), 206);
    assert_eq!(session.header("Content-Encoding"), Some("gzip"));
    assert_eq!(
        session.header("Content-Range"),
        Some(format!("bytes 0-{}/{size}", size - 1).as_str())
    );
    assert_eq!(session.decoded_body(), "Test3");
}

/// Creates a Pingora session reading the request from an in-memory stream.
async fn pingora_session(method: &str, path: &str, accept_encoding: &str) -> Session {
    let mut cursor = Cursor::new(Vec::<u8>::new());
    let _ = cursor.write(format!("{method} {path} HTTP/1.1\r\n").as_bytes());
    let _ = cursor.write(b"Host: localhost\r\n");
    let _ = cursor.write(format!("Accept-Encoding: {accept_encoding}\r\n").as_bytes());
    let _ = cursor.write(b"Connection: close\r\n");
    let _ = cursor.write(b"\r\n");
    let _ = cursor.seek(SeekFrom::Start(0));

    let mut session = Session::new_h1(Box::new(cursor));
    assert!(session.read_request().await.unwrap());
    session
}

#[test(tokio::test)]
async fn pingora_session_served() {
    let root = fixture();
    let handler = make_handler(root.path());
    let br_len = fs::metadata(root.path().join("sample.txt.br")).unwrap().len();

    let mut session = pingora_session("GET", "/sample.txt", "gzip;q=0.5, br").await;
    assert!(handler.handle(&mut session).await.unwrap());

    let response = session.response_written().unwrap();
    assert_eq!(response.status.as_u16(), 200);
    let header = |name: &str| {
        response
            .headers
            .get(name)
            .map(|value| value.to_str().unwrap().to_owned())
    };
    assert_eq!(header("Content-Encoding").as_deref(), Some("br"));
    assert_eq!(header("Content-Length"), Some(br_len.to_string()));
    assert_eq!(header("Content-Type").as_deref(), Some("text/plain"));
    assert!(header("Vary").unwrap().contains("Accept-Encoding"));

    let mut session = pingora_session("HEAD", "/sample.txt", "gzip").await;
    assert!(handler.handle(&mut session).await.unwrap());
    let response = session.response_written().unwrap();
    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(
        response.headers.get("Content-Encoding").unwrap().to_str().unwrap(),
        "gzip"
    );
}

#[test(tokio::test)]
async fn pingora_session_passed_on() {
    let root = fixture();
    let handler = make_handler(root.path());

    for path in ["/nonexistent.txt", "/sample.txt.br", "/dir/"] {
        let mut session = pingora_session("GET", path, "br, gzip").await;
        assert!(
            !handler.handle(&mut session).await.unwrap(),
            "{path} should not be handled"
        );
        assert!(session.response_written().is_none());
    }

    let mut session = pingora_session("GET", "/nonexistent.txt", "*").await;
    assert!(!handler.handle(&mut session).await.unwrap());
    assert!(session.response_written().is_none());
}
