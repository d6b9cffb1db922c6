// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Minimal HTTP/1.1 GET client for local daemons reachable over a unix
//! socket, plain TCP or TLS. TLS peers are local agents with self-signed
//! certificates, so their certificates and hostnames are not verified.

use std::fmt;
use std::path::PathBuf;

use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::Bytes;
use hyper::header::{ACCEPT, HOST};
use hyper::{Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use log::debug;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::context::Context;
use crate::errors::Error;

/// Upper bound on response bodies.
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    Unix(PathBuf),
    /// `host:port`
    Tcp(String),
    /// `host:port` reached over TLS; `host` is the name sent for SNI.
    Tls { authority: String, host: String },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(authority) => write!(f, "http://{authority}"),
            Endpoint::Tls { authority, .. } => write!(f, "https://{authority}"),
        }
    }
}

impl Endpoint {
    /// Parses an `http://` or `https://` URL. Missing ports default to 80
    /// and 443.
    pub fn from_url(url: &str) -> Result<Self, String> {
        let uri: Uri = url.parse().map_err(|e| format!("invalid URL {url}: {e}"))?;
        let tls = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            Some(other) => return Err(format!("unsupported scheme {other}")),
            None => return Err(format!("missing scheme in {url}")),
        };
        let authority = uri
            .authority()
            .ok_or_else(|| format!("missing host in {url}"))?;
        let port = authority.port_u16().unwrap_or(if tls { 443 } else { 80 });
        let authority_host = authority.host();
        let authority = format!("{authority_host}:{port}");
        if tls {
            let host = authority_host
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            Ok(Endpoint::Tls { authority, host })
        } else {
            Ok(Endpoint::Tcp(authority))
        }
    }

    fn host_header(&self) -> &str {
        match self {
            Endpoint::Unix(_) => "localhost",
            Endpoint::Tcp(authority) | Endpoint::Tls { authority, .. } => authority,
        }
    }

    /// Issues `GET path` and returns the status and body.
    pub async fn get(&self, path: &str, ctx: &Context) -> Result<(StatusCode, Bytes), Error> {
        let request = async {
            match self {
                Endpoint::Unix(socket) => send(UnixStream::connect(socket).await?, self, path).await,
                Endpoint::Tcp(authority) => {
                    send(TcpStream::connect(authority.as_str()).await?, self, path).await
                }
                Endpoint::Tls { authority, host } => {
                    let tcp_stream = TcpStream::connect(authority.as_str()).await?;
                    let tls_stream = tls_connector()
                        .map_err(|e| self.error(path, e))?
                        .connect(host, tcp_stream)
                        .await
                        .map_err(|e| self.error(path, e))?;
                    send(tls_stream, self, path).await
                }
            }
        };
        ctx.run(request).await?
    }

    /// Issues `GET path` and decodes a successful JSON response.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        what: &'static str,
        ctx: &Context,
    ) -> Result<T, Error> {
        let (status, body) = self.get(path, ctx).await?;
        if !status.is_success() {
            return Err(self.error(path, format!("unexpected status {status}")));
        }
        serde_json::from_slice(&body).map_err(|source| Error::Decode { what, source })
    }

    fn error(&self, path: &str, reason: impl ToString) -> Error {
        Error::Http {
            endpoint: format!("{self}{path}"),
            reason: reason.to_string(),
        }
    }
}

fn tls_connector() -> Result<tokio_native_tls::TlsConnector, native_tls::Error> {
    let mut tls_builder = native_tls::TlsConnector::builder();
    tls_builder.danger_accept_invalid_certs(true);
    tls_builder.danger_accept_invalid_hostnames(true);
    let native_tls = tls_builder.build()?;
    Ok(tokio_native_tls::TlsConnector::from(native_tls))
}

async fn send<S>(stream: S, endpoint: &Endpoint, path: &str) -> Result<(StatusCode, Bytes), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| endpoint.error(path, e))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("connection closed with error: {e}");
        }
    });

    let request = Request::get(path)
        .header(HOST, endpoint.host_header())
        .header(ACCEPT, "application/json")
        .body(Empty::<Bytes>::new())
        .map_err(|e| endpoint.error(path, e))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| endpoint.error(path, e))?;
    let status = response.status();

    let body = Limited::new(response.into_body(), MAX_BODY_SIZE)
        .collect()
        .await
        .map_err(|e| endpoint.error(path, e))?
        .to_bytes();

    Ok((status, body))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use std::time::Duration;
    use tokio::net::{TcpListener, UnixListener};

    #[derive(Clone)]
    struct Routes {
        routes: Vec<(String, String)>,
        /// Targets containing this text are answered only after the delay.
        slow: Option<(String, Duration)>,
    }

    impl Routes {
        fn new(routes: &[(&str, &str)]) -> Self {
            Routes {
                routes: routes
                    .iter()
                    .map(|(route, body)| (route.to_string(), body.to_string()))
                    .collect(),
                slow: None,
            }
        }
    }

    /// Answers one request: the request target is looked up in `routes`,
    /// unknown targets get a 404.
    async fn respond<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S, routes: &Routes) {
        let mut buf = vec![0u8; 8192];
        let mut read = 0;
        while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf[read..]).await {
                Ok(0) | Err(_) => return,
                Ok(n) => read += n,
            }
        }
        let head = String::from_utf8_lossy(&buf[..read]).to_string();
        let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
        if let Some((pattern, delay)) = &routes.slow {
            if target.contains(pattern.as_str()) {
                tokio::time::sleep(*delay).await;
            }
        }
        let response = match routes.routes.iter().find(|(route, _)| *route == target) {
            Some((_, body)) => format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            ),
            None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_string(),
        };
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
    }

    fn spawn_unix(path: PathBuf, routes: Routes) -> tokio::task::JoinHandle<()> {
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let routes = routes.clone();
                tokio::spawn(async move { respond(stream, &routes).await });
            }
        })
    }

    /// Serves canned JSON responses on a unix socket.
    pub(crate) fn serve_unix(path: PathBuf, routes: &[(&str, &str)]) -> tokio::task::JoinHandle<()> {
        spawn_unix(path, Routes::new(routes))
    }

    /// Like `serve_unix`, but requests whose target contains `slow` wait for
    /// `delay` before being answered.
    pub(crate) fn serve_unix_slow(
        path: PathBuf,
        routes: &[(&str, &str)],
        slow: &str,
        delay: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let mut routes = Routes::new(routes);
        routes.slow = Some((slow.to_string(), delay));
        spawn_unix(path, routes)
    }

    /// Serves canned JSON responses on an ephemeral localhost port and
    /// returns its `host:port`.
    pub(crate) async fn serve_tcp(routes: &[(&str, &str)]) -> (String, tokio::task::JoinHandle<()>) {
        let routes = Routes::new(routes);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let routes = routes.clone();
                tokio::spawn(async move { respond(stream, &routes).await });
            }
        });
        (address, server)
    }

    /// Serves canned JSON responses over TLS with a self-signed certificate
    /// issued to `kubelet.test`, and returns the `host:port`.
    pub(crate) async fn serve_tls(routes: &[(&str, &str)]) -> (String, tokio::task::JoinHandle<()>) {
        let identity = native_tls::Identity::from_pkcs8(
            include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/kubelet-cert.pem")),
            include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/kubelet-key.pem")),
        )
        .unwrap();
        let acceptor =
            tokio_native_tls::TlsAcceptor::from(native_tls::TlsAcceptor::new(identity).unwrap());
        let routes = Routes::new(routes);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let routes = routes.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(stream) = acceptor.accept(stream).await {
                        respond(stream, &routes).await;
                    }
                });
            }
        });
        (address, server)
    }

    #[test]
    fn test_from_url() {
        assert_eq!(
            Endpoint::from_url("http://localhost:10255").unwrap(),
            Endpoint::Tcp("localhost:10255".to_string())
        );
        assert_eq!(
            Endpoint::from_url("http://10.0.0.1").unwrap(),
            Endpoint::Tcp("10.0.0.1:80".to_string())
        );
        assert_eq!(
            Endpoint::from_url("https://localhost:10250").unwrap(),
            Endpoint::Tls {
                authority: "localhost:10250".to_string(),
                host: "localhost".to_string(),
            }
        );
        let endpoint = Endpoint::from_url("https://node-1").unwrap();
        assert_eq!(endpoint.host_header(), "node-1:443");
        assert_eq!(endpoint.to_string(), "https://node-1:443");
        assert!(Endpoint::from_url("ftp://localhost:21").is_err());
        assert!(Endpoint::from_url("localhost:10255").is_err());
    }

    #[tokio::test]
    async fn test_get_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("test.sock");
        let server = serve_unix(socket.clone(), &[("/ping", "{\"ok\":true}")]);

        let endpoint = Endpoint::Unix(socket);
        let ctx = Context::background();

        let (status, body) = endpoint.get("/ping", &ctx).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"{\"ok\":true}");

        let value: serde_json::Value = endpoint.get_json("/ping", "ping", &ctx).await.unwrap();
        assert_eq!(value["ok"], true);

        let err = endpoint
            .get_json::<serde_json::Value>("/missing", "missing", &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http { .. }));

        server.abort();
    }

    #[tokio::test]
    async fn test_get_over_tcp() {
        let (address, server) = serve_tcp(&[("/healthz", "ok")]).await;
        let endpoint = Endpoint::from_url(&format!("http://{address}")).unwrap();

        let (status, body) = endpoint.get("/healthz", &Context::background()).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"ok");

        let (status, _) = endpoint.get("/nope", &Context::background()).await.unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);

        server.abort();
    }

    #[tokio::test]
    async fn test_get_over_tls_with_self_signed_certificate() {
        let (address, server) = serve_tls(&[("/healthz", "ok")]).await;
        let endpoint = Endpoint::from_url(&format!("https://{address}")).unwrap();

        let (status, body) = endpoint.get("/healthz", &Context::background()).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"ok");

        // A peer that hangs up during the handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = listener.local_addr().unwrap().to_string();
        let closer = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });
        let endpoint = Endpoint::from_url(&format!("https://{closed}")).unwrap();
        let err = endpoint.get("/healthz", &Context::background()).await.unwrap_err();
        assert!(matches!(err, Error::Http { .. }));

        server.abort();
        closer.abort();
    }
}
