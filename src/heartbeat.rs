//! Heartbeat Client (§4.J): periodic `/register` push from a backend.
//! Errors are logged and ignored; the next tick retries; there is no
//! sequence number, the registry is last-writer-wins.

use std::sync::Arc;
use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, Uri};
use tracing::warn;

use crate::metrics::MetricsManager;
use crate::wire::RegisterRequest;

pub struct HeartbeatClient {
    client: Client<HttpConnector>,
    proxy_url: String,
    self_url: String,
    self_port: Option<u16>,
    metrics: Arc<MetricsManager>,
    interval: Duration,
}

impl HeartbeatClient {
    pub fn new(
        client: Client<HttpConnector>,
        proxy_url: String,
        self_url: String,
        self_port: Option<u16>,
        metrics: Arc<MetricsManager>,
        interval: Duration,
    ) -> Self {
        Self { client, proxy_url, self_url, self_port, metrics, interval }
    }

    /// Runs forever, sleeping `interval` between pushes. Intended to be
    /// spawned as its own task; cancel by dropping the `JoinHandle`.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.push_once().await {
                warn!(error = %e, "heartbeat push failed, will retry next tick");
            }
        }
    }

    async fn push_once(&self) -> Result<(), String> {
        let (rif, rif_avg_latency, overall_avg_latency) = self.metrics.snapshot();
        let body = RegisterRequest {
            url: self.self_url.clone(),
            port: self.self_port,
            health: true,
            in_flight_requests: Some(rif),
            rif_avg_latency: Some(rif_avg_latency),
            overall_avg_latency: Some(overall_avg_latency),
        };
        let payload = serde_json::to_vec(&body).map_err(|e| e.to_string())?;

        let uri: Uri = format!("{}/register", self.proxy_url).parse().map_err(|e| format!("{e}"))?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(payload))
            .map_err(|e| e.to_string())?;

        let response = self.client.request(request).await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("proxy returned {}", response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Response, Server};

    #[tokio::test]
    async fn push_once_posts_current_snapshot_to_register() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let received_bodies: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let received_bodies_for_svc = received_bodies.clone();

        let make_svc = make_service_fn(move |_conn| {
            let received_bodies = received_bodies_for_svc.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let received_bodies = received_bodies.clone();
                    async move {
                        let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap();
                        received_bodies.lock().unwrap().push(bytes.to_vec());
                        Ok::<_, Infallible>(Response::builder().status(200).body(Body::from("{}")).unwrap())
                    }
                }))
            }
        });
        let server = Server::bind(&addr).serve(make_svc);
        let bound_addr = server.local_addr();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let graceful = server.with_graceful_shutdown(async { rx.await.ok(); });
            let _ = graceful.await;
        });

        let metrics = Arc::new(MetricsManager::new(vec![]));
        let client = HeartbeatClient::new(
            Client::new(),
            format!("http://{bound_addr}"),
            "http://self:9000".to_string(),
            Some(9000),
            metrics,
            Duration::from_secs(30),
        );
        client.push_once().await.unwrap();

        let bodies = received_bodies.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        let parsed: RegisterRequest = serde_json::from_slice(&bodies[0]).unwrap();
        assert_eq!(parsed.url, "http://self:9000");
        assert!(parsed.health);

        let _ = tx.send(());
    }
}
