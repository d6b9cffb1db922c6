// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Read-only JSON view of the latest snapshot.

use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{ALLOW, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use serde_json::json;
use tokio::net::TcpListener;

use crate::context::Context;
use crate::manager::Manager;

type Body = BoxBody<Bytes, std::io::Error>;

static NOTFOUND: &[u8] = b"Not found";
static NOTALLOWED: &[u8] = b"Method not allowed";

pub async fn bind(address: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("could not listen on {address}"))?;
    info!("Status API listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accepts connections until `ctx` is canceled.
pub async fn serve(listener: TcpListener, manager: Arc<Manager>, ctx: &Context) -> Result<()> {
    loop {
        tokio::select! {
            biased;
            _ = ctx.done() => {
                info!("Status API stopped");
                return Ok(());
            }
            accept_result = listener.accept() => {
                let (stream, peer) = accept_result?;
                debug!("Status API connection from {peer}");
                let io = TokioIo::new(stream);
                let manager = Arc::clone(&manager);

                tokio::task::spawn(async move {
                    if let Err(err) = http1::Builder::new()
                        .serve_connection(
                            io,
                            service_fn(|req: Request<hyper::body::Incoming>| {
                                let manager = Arc::clone(&manager);
                                async move {
                                    Ok::<_, anyhow::Error>(
                                        route(req.method(), req.uri().path(), &manager)
                                            .unwrap_or_else(internal_error),
                                    )
                                }
                            }),
                        )
                        .await
                    {
                        error!("Error serving connection: {err}");
                    }
                });
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resource {
    Health,
    Data,
    Processes,
    Ports,
    System,
    Containers,
    Systemd,
    Pods,
    Collectors,
}

impl Resource {
    const ALL: [Resource; 9] = [
        Resource::Health,
        Resource::Data,
        Resource::Processes,
        Resource::Ports,
        Resource::System,
        Resource::Containers,
        Resource::Systemd,
        Resource::Pods,
        Resource::Collectors,
    ];

    fn path(self) -> &'static str {
        match self {
            Resource::Health => "/api/v1/health",
            Resource::Data => "/api/v1/data",
            Resource::Processes => "/api/v1/processes",
            Resource::Ports => "/api/v1/ports",
            Resource::System => "/api/v1/system",
            Resource::Containers => "/api/v1/containers",
            Resource::Systemd => "/api/v1/systemd",
            Resource::Pods => "/api/v1/pods",
            Resource::Collectors => "/api/v1/collectors",
        }
    }

    fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|resource| resource.path() == path)
    }

    fn render(self, manager: &Manager) -> serde_json::Result<Vec<u8>> {
        let data = manager.latest();
        match self {
            Resource::Health => serde_json::to_vec(&json!({
                "status": "ok",
                "state": manager.state().to_string(),
                "timestamp": data.timestamp.unix_timestamp(),
            })),
            Resource::Data => serde_json::to_vec(&*data),
            Resource::Processes => serde_json::to_vec(&data.processes),
            Resource::Ports => serde_json::to_vec(&data.ports),
            Resource::System => serde_json::to_vec(&data.system),
            Resource::Containers => serde_json::to_vec(&data.containers),
            Resource::Systemd => serde_json::to_vec(&data.systemd_units),
            Resource::Pods => serde_json::to_vec(&data.pods),
            Resource::Collectors => serde_json::to_vec(&manager.collector_names()),
        }
    }
}

fn route(method: &Method, path: &str, manager: &Manager) -> Result<Response<Body>> {
    let Some(resource) = Resource::from_path(path) else {
        return not_found(method, path);
    };
    if method != Method::GET {
        return method_not_allowed();
    }
    json_response(resource.render(manager)?)
}

fn json_response(body: Vec<u8>) -> Result<Response<Body>> {
    Response::builder()
        .header(CONTENT_TYPE, "application/json")
        .body(full(body))
        .map_err(|e| anyhow!("Failed to build response: {}", e))
}

fn not_found(method: &Method, path: &str) -> Result<Response<Body>> {
    info!("{method} Request to unknown endpoint: {path}");
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(full(NOTFOUND))
        .map_err(|e| anyhow!("Failed to build not found response: {}", e))
}

fn method_not_allowed() -> Result<Response<Body>> {
    Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .header(ALLOW, "GET")
        .body(full(NOTALLOWED))
        .map_err(|e| anyhow!("Failed to build method not allowed response: {}", e))
}

fn internal_error(err: anyhow::Error) -> Response<Body> {
    error!("Request handling failed: {err}");
    let mut response = Response::new(full(&b"Internal Server Error"[..]));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

fn full(body: impl Into<Bytes>) -> Body {
    Full::new(body.into()).map_err(|e| match e {}).boxed()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::collector::Collector;
    use crate::errors::Error;
    use crate::http::Endpoint;
    use crate::model::{CollectionResult, PortInfo, ProcessInfo, Protocol};
    use async_trait::async_trait;
    use std::time::Duration;

    struct StaticCollector;

    #[async_trait]
    impl Collector for StaticCollector {
        fn name(&self) -> &str {
            "static"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(10)
        }

        async fn collect(&self, _ctx: &Context) -> Result<CollectionResult, Error> {
            Ok(CollectionResult {
                processes: vec![ProcessInfo {
                    pid: 42,
                    name: "nginx".to_string(),
                    ..ProcessInfo::default()
                }],
                ports: vec![PortInfo::new(Protocol::Tcp, "0.0.0.0", 80)],
                ..CollectionResult::default()
            })
        }
    }

    async fn manager() -> Arc<Manager> {
        let mut manager = Manager::new(Duration::from_secs(10));
        manager.register(Arc::new(StaticCollector));
        manager.collect(&Context::background()).await;
        Arc::new(manager)
    }

    async fn body(response: Response<Body>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_routes() {
        let manager = manager().await;

        let processes = route(&Method::GET, "/api/v1/processes", &manager).unwrap();
        assert_eq!(processes.status(), StatusCode::OK);
        assert_eq!(
            processes.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let processes = body(processes).await;
        assert_eq!(processes[0]["pid"], 42);
        assert_eq!(processes[0]["name"], "nginx");

        let ports = body(route(&Method::GET, "/api/v1/ports", &manager).unwrap()).await;
        assert_eq!(ports[0]["port"], 80);
        assert_eq!(ports[0]["protocol"], "tcp");

        let system = body(route(&Method::GET, "/api/v1/system", &manager).unwrap()).await;
        assert!(system.is_null());

        let collectors = body(route(&Method::GET, "/api/v1/collectors", &manager).unwrap()).await;
        assert_eq!(collectors, json!(["static"]));

        let health = body(route(&Method::GET, "/api/v1/health", &manager).unwrap()).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["state"], "created");

        let data = body(route(&Method::GET, "/api/v1/data", &manager).unwrap()).await;
        assert!(data["timestamp"].is_string());
        assert_eq!(data["processes"][0]["pid"], 42);
    }

    #[tokio::test]
    async fn test_unknown_path_and_method() {
        let manager = manager().await;

        for path in ["/", "/api/v1/", "/api/v1/nope", "/api/v2/data"] {
            let response = route(&Method::GET, path, &manager).unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
        }

        let response = route(&Method::POST, "/api/v1/data", &manager).unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(ALLOW).unwrap(), "GET");

        let response = route(&Method::DELETE, "/api/v1/nope", &manager).unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_method_checked_before_rendering() {
        let manager = manager().await;
        for resource in Resource::ALL {
            assert_eq!(Resource::from_path(resource.path()), Some(resource));
            for method in [Method::POST, Method::PUT, Method::DELETE] {
                let response = route(&method, resource.path(), &manager).unwrap();
                assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
                let body = response.into_body().collect().await.unwrap().to_bytes();
                assert_eq!(&body[..], NOTALLOWED);
            }
        }
        assert_eq!(Resource::from_path("/api/v1/"), None);
        assert_eq!(Resource::from_path("/api/v1/data/extra"), None);
    }

    #[tokio::test]
    async fn test_serve_until_canceled() {
        let manager = manager().await;
        let listener = bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let ctx = Context::background();

        let server = {
            let ctx = ctx.clone();
            tokio::spawn(async move { serve(listener, manager, &ctx).await })
        };

        let endpoint = Endpoint::Tcp(address);
        let client = Context::background();
        let processes: serde_json::Value = endpoint
            .get_json("/api/v1/processes", "processes", &client)
            .await
            .unwrap();
        assert_eq!(processes.as_array().unwrap().len(), 1);
        assert_eq!(processes[0]["pid"], 42);

        let (status, _) = endpoint.get("/missing", &client).await.unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);

        ctx.cancel();
        server.await.unwrap().unwrap();
    }
}
