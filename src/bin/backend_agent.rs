//! The backend-agent binary: a demo backend that serves `/` and `/probe`,
//! tracks its own RIF/latency metrics, and heartbeats to a proxy (§6).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tracing::info;

use prequal::config::Config;
use prequal::heartbeat::HeartbeatClient;
use prequal::http_client::new_client;
use prequal::metrics::MetricsManager;
use prequal::wire::ProbeResponse;

#[derive(Parser, Debug)]
#[command(author, version, about = "Prequal demo backend agent")]
struct Args {
    /// Address to bind this backend's HTTP server to.
    #[arg(long, default_value = "0.0.0.0:9000")]
    listen: SocketAddr,
}

struct AppState {
    metrics: Arc<MetricsManager>,
    self_url: String,
}

async fn handle(state: Arc<AppState>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.method() == Method::GET && req.uri().path() == "/probe" {
        let (rif, rif_avg_latency, overall_avg_latency) = state.metrics.snapshot();
        let body = ProbeResponse {
            status: "ok".to_string(),
            in_flight_requests: rif,
            rif_avg_latency,
            overall_avg_latency,
        };
        let payload = serde_json::to_vec(&body).unwrap_or_default();
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Body::from(payload))
            .unwrap());
    }

    let _guard = state.metrics.track_request();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("X-Backend-Id", state.self_url.clone())
        .body(Body::from("ok"))
        .unwrap())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    prequal::logging::init();
    let args = Args::parse();
    let config = Config::from_env()?;

    let metrics = Arc::new(MetricsManager::new(vec![]));
    // Reported identity matches what we heartbeat under, not the local bind
    // address, so the proxy's X-Backend-Id expectation (§6) and the
    // registry's key for this backend always agree.
    let self_url = config.backend_url.clone();

    let heartbeat = HeartbeatClient::new(
        new_client(),
        config.proxy_url.clone(),
        config.backend_url.clone(),
        Some(config.backend_port),
        metrics.clone(),
        config.heartbeat_interval,
    );
    tokio::spawn(heartbeat.run());

    let state = Arc::new(AppState { metrics, self_url });
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { handle(state, req).await }
            }))
        }
    });

    info!(listen = %args.listen, proxy_url = %config.proxy_url, "starting prequal backend agent");
    let server = Server::bind(&args.listen).serve(make_svc);
    server.await?;
    Ok(())
}
