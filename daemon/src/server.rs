/// Thin HTTP front end: health and status endpoints over the entity store.
/// The orchestration work itself lives in `worker`; this binary exists so an
/// operator or load balancer has something to poll (SPEC_FULL.md §2,
/// "process entrypoints").
use crate::errors::{DaemonError, DaemonResult};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use orchestration_core::config::OrchestrationConfig;
use serde_json::json;
use sqlx::SqlitePool;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct StatusServer {
    config: OrchestrationConfig,
    pool: SqlitePool,
}

impl StatusServer {
    pub fn new(config: OrchestrationConfig, pool: SqlitePool) -> Self {
        StatusServer { config, pool }
    }

    pub async fn run(self) -> DaemonResult<()> {
        let addr: SocketAddr =
            format!("{}:{}", self.config.server.listen_address, self.config.server.listen_port)
                .parse()
                .map_err(|_| DaemonError::Server("invalid listen address".to_string()))?;

        let shared = Arc::new(self);
        let make_svc = make_service_fn(move |_conn| {
            let shared = shared.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let shared = shared.clone();
                    async move { Ok::<_, Infallible>(shared.route(req).await) }
                }))
            }
        });

        info!(%addr, "status server listening");
        Server::bind(&addr)
            .serve(make_svc)
            .await
            .map_err(|e| DaemonError::Bind(addr, std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    async fn route(&self, req: Request<Body>) -> Response<Body> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/healthz") => self.healthz(),
            (&Method::GET, "/statusz") => self.statusz().await,
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from("not found"))
                .unwrap(),
        }
    }

    fn healthz(&self) -> Response<Body> {
        Response::new(Body::from(json!({"status": "ok"}).to_string()))
    }

    async fn statusz(&self) -> Response<Body> {
        match sqlx::query_scalar::<_, i64>("SELECT count(*) FROM avms WHERE status != 'DELETED'")
            .fetch_one(&self.pool)
            .await
        {
            Ok(live_avms) => {
                let body = json!({"live_avms": live_avms});
                Response::new(Body::from(body.to_string()))
            }
            Err(e) => {
                error!(error = %e, "statusz query failed");
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from(json!({"error": e.to_string()}).to_string()))
                    .unwrap()
            }
        }
    }
}
