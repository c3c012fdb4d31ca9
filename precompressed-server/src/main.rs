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

#![doc = include_str!("../README.md")]

use async_trait::async_trait;
use clap::Parser;
use log::{error, info};
use pingora::proxy::{http_proxy_service, ProxyHttp, Session};
use pingora::server::configuration::Opt as ServerOpt;
use pingora::server::Server;
use pingora::upstreams::peer::HttpPeer;
use pingora::{Error, ErrorType};
use precompressed_module::{FromYaml, NegotiationConf, NegotiationHandler, NegotiationOpt};
use serde::Deserialize;

/// Run a web server delivering pre-compressed static files
#[derive(Debug, Parser)]
struct Opt {
    /// Address and port to listen on, e.g. "127.0.0.1:8080". This command line flag can be
    /// specified multiple times.
    #[clap(short, long)]
    listen: Option<Vec<String>>,

    /// Use this flag to make the server run in the background.
    #[clap(short, long)]
    daemon: bool,

    /// Test the configuration and exit. This is useful to validate the configuration before
    /// restarting the process.
    #[clap(short, long)]
    test: bool,

    /// The path to the configuration file.
    #[clap(short, long)]
    conf: Option<String>,

    #[clap(flatten)]
    negotiation: NegotiationOpt,
}

/// The configuration of the server
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Conf {
    /// List of address/port combinations to listen on, e.g. "127.0.0.1:8080".
    listen: Vec<String>,

    /// Negotiation settings
    negotiation: NegotiationConf,
}

/// Proxy application answering all requests from the negotiation handler
#[derive(Debug)]
struct App {
    handler: NegotiationHandler,
}

#[async_trait]
impl ProxyHttp for App {
    type CTX = ();

    fn new_ctx(&self) -> Self::CTX {}

    async fn request_filter(
        &self,
        session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<bool, Box<Error>> {
        self.handler.handle(session).await
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>, Box<Error>> {
        // Requests not handled by the negotiation handler have nothing else to go to.
        Err(Error::new(ErrorType::HTTPStatus(404)))
    }

    async fn logging(&self, session: &mut Session, _e: Option<&Error>, _ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map_or(0, |response| response.status.as_u16());
        let req = session.req_header();
        info!("{} {} {status}", req.method, req.uri);
    }
}

fn make_server(opt: Opt) -> Result<Server, Box<Error>> {
    let mut conf = match &opt.conf {
        Some(path) => Conf::load_from_yaml(path)?,
        None => Conf::default(),
    };
    conf.negotiation.merge_with_opt(opt.negotiation);

    let handler = NegotiationHandler::new(conf.negotiation)?;

    let mut listen = opt.listen.unwrap_or(conf.listen);
    if listen.is_empty() {
        // Make certain we have a listening address
        listen.push("127.0.0.1:8080".to_owned());
        listen.push("[::1]:8080".to_owned());
    }

    let mut server = Server::new(Some(ServerOpt {
        upgrade: false,
        daemon: opt.daemon,
        nocapture: false,
        test: opt.test,
        conf: None,
    }))?;
    server.bootstrap();

    let mut proxy = http_proxy_service(&server.configuration, App { handler });
    for addr in &listen {
        proxy.add_tcp(addr);
    }
    server.add_service(proxy);

    Ok(server)
}

fn main() {
    env_logger::init();

    let server = match make_server(Opt::parse()) {
        Ok(server) => server,
        Err(err) => {
            error!("{err}");
            return;
        }
    };

    server.run_forever();
}
