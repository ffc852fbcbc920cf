//! The proxy binary: a reverse-proxy HTTP server that load-balances over a
//! dynamic backend fleet using the Prequal chooser, backed by the registry
//! and out-of-band probe subsystem (§6 external interfaces).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tracing::{error, info};

use prequal::chooser::{Chooser, PrequalChooser};
use prequal::config::Config;
use prequal::forwarder::{ForwardBody, ProxyForwarder};
use prequal::hooks::Identity;
use prequal::http_client::new_client;
use prequal::probe::{ProbeManager, ProbePool, ProbeScheduler, ProbeTaskQueue};
use prequal::registry::BackendRegistry;
use prequal::wire::{RegisterRequest, RegisterResponse};

#[derive(Parser, Debug)]
#[command(author, version, about = "Prequal reverse proxy")]
struct Args {
    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// Overrides `BACKEND_HEALTH_PATH` for the path the probe manager GETs.
    #[arg(long)]
    probe_path: Option<String>,
}

struct AppState {
    registry: Arc<BackendRegistry>,
    probe_scheduler: Arc<ProbeScheduler>,
    forwarder: ProxyForwarder,
    chooser: PrequalChooser,
}

async fn handle(state: Arc<AppState>, req: Request<Body>) -> Result<Response<ForwardBody>, Infallible> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    if method == Method::POST && path == "/register" {
        return Ok(handle_register(&state, req, true).await);
    }
    if method == Method::POST && path == "/unregister" {
        return Ok(handle_register(&state, req, false).await);
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    state.probe_scheduler.record_request();
    let backend_url = state.chooser.get_next_backend().unwrap_or_default();
    Ok(state.forwarder.forward(req, &path_and_query, &backend_url).await)
}

async fn handle_register(state: &AppState, req: Request<Body>, registering: bool) -> Response<ForwardBody> {
    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(b) => b,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, &e.to_string()),
    };
    let parsed: RegisterRequest = match serde_json::from_slice(&bytes) {
        Ok(p) => p,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    if registering {
        match state.registry.register(parsed) {
            Ok(view) => json_response(&RegisterResponse { status: "registered", backend: view }),
            Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        }
    } else {
        match state.registry.unregister(&parsed.url) {
            Ok(Some(view)) => json_response(&RegisterResponse { status: "unregistered", backend: view }),
            Ok(None) => json_error(StatusCode::NOT_FOUND, "backend not registered"),
            Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        }
    }
}

fn json_response<T: serde::Serialize>(body: &T) -> Response<ForwardBody> {
    let payload = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(ForwardBody::full(payload))
        .expect("serialized json body is always a valid response")
}

fn json_error(status: StatusCode, message: &str) -> Response<ForwardBody> {
    Response::builder()
        .status(status)
        .body(ForwardBody::full(format!("{{\"error\":{message:?}}}")))
        .expect("static error response is always valid")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    prequal::logging::init();
    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(probe_path) = args.probe_path.clone() {
        config.probe_path = probe_path;
    }

    let registry = Arc::new(BackendRegistry::new(config.heartbeat_timeout));
    let probe_pool = Arc::new(ProbePool::new());
    let probe_queue = Arc::new(ProbeTaskQueue::new());
    let client = new_client();

    let probe_manager = Arc::new(ProbeManager::new(
        probe_pool.clone(),
        probe_queue.clone(),
        registry.clone(),
        client.clone(),
        config.probe_path.clone(),
        config.max_concurrent_probes,
        config.consecutive_failure_threshold,
    ));
    let probe_scheduler = Arc::new(ProbeScheduler::new(
        registry.clone(),
        probe_queue.clone(),
        config.probe_rate_k,
        config.min_probe_interval,
    ));

    tokio::spawn(probe_manager.clone().run());
    tokio::spawn(probe_scheduler.clone().run());

    let state = Arc::new(AppState {
        registry: registry.clone(),
        probe_scheduler: probe_scheduler.clone(),
        forwarder: ProxyForwarder::new(
            client,
            registry.clone(),
            config.consecutive_failure_threshold,
            Box::new(Identity),
            Box::new(Identity),
        ),
        chooser: PrequalChooser::new(registry, probe_pool),
    });

    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { handle(state, req).await }
            }))
        }
    });

    info!(listen = %args.listen, "starting prequal proxy");
    let server = Server::bind(&args.listen).serve(make_svc);
    if let Err(e) = server.await {
        error!(error = %e, "server error");
        return Err(e.into());
    }
    Ok(())
}
