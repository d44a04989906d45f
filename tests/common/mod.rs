// Shared fixtures for the integration tests
#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use axum::body::Body as AxumBody;
use hyper::{HeaderMap, Request, Response, StatusCode, header};
use switchyard::{
    GatewayRouter, GatewayService,
    config::GatewayConfig,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Connect,
    Timeout,
    /// Never answers
    Hang,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub uri: String,
    pub headers: HeaderMap,
}

/// In-memory upstream: answers for every instance url, scripted per instance
#[derive(Default)]
pub struct MockUpstream {
    forwards: AtomicUsize,
    probes: AtomicUsize,
    failures: Mutex<HashMap<String, Failure>>,
    statuses: Mutex<HashMap<String, StatusCode>>,
    bodies: Mutex<HashMap<String, Bytes>>,
    unhealthy_probes: Mutex<Vec<String>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, instance: &str, failure: Failure) {
        self.failures
            .lock()
            .unwrap()
            .insert(instance.to_string(), failure);
    }

    pub fn recover(&self, instance: &str) {
        self.failures.lock().unwrap().remove(instance);
    }

    pub fn respond_with(&self, instance: &str, status: StatusCode) {
        self.statuses
            .lock()
            .unwrap()
            .insert(instance.to_string(), status);
    }

    /// Answer with `body` instead of the default JSON echo
    pub fn respond_with_body(&self, instance: &str, body: impl Into<Bytes>) {
        self.bodies
            .lock()
            .unwrap()
            .insert(instance.to_string(), body.into());
    }

    pub fn fail_probe(&self, probe_url: &str) {
        self.unhealthy_probes
            .lock()
            .unwrap()
            .push(probe_url.to_string());
    }

    pub fn recover_probe(&self, probe_url: &str) {
        self.unhealthy_probes.lock().unwrap().retain(|u| u != probe_url);
    }

    pub fn forward_count(&self) -> usize {
        self.forwards.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> RecordedRequest {
        self.requests
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no request was forwarded")
    }
}

#[async_trait]
impl HttpClient for MockUpstream {
    async fn forward(
        &self,
        req: Request<AxumBody>,
        timeout: Duration,
    ) -> HttpClientResult<Response<AxumBody>> {
        self.forwards.fetch_add(1, Ordering::SeqCst);

        let uri = req.uri().clone();
        let instance = format!(
            "{}://{}",
            uri.scheme_str().unwrap_or("http"),
            uri.authority().map(|a| a.as_str()).unwrap_or_default()
        );
        self.requests.lock().unwrap().push(RecordedRequest {
            method: req.method().to_string(),
            uri: uri.to_string(),
            headers: req.headers().clone(),
        });

        let failure = self.failures.lock().unwrap().get(&instance).copied();
        match failure {
            Some(Failure::Connect) => {
                return Err(HttpClientError::ConnectionError(format!(
                    "connection refused by {instance}"
                )));
            }
            Some(Failure::Timeout) => return Err(HttpClientError::Timeout(timeout)),
            Some(Failure::Hang) => std::future::pending::<()>().await,
            None => {}
        }

        let status = self
            .statuses
            .lock()
            .unwrap()
            .get(&instance)
            .copied()
            .unwrap_or(StatusCode::OK);
        let body = match self.bodies.lock().unwrap().get(&instance) {
            Some(body) => body.clone(),
            None => serde_json::json!({ "instance": instance, "path": uri.path() })
                .to_string()
                .into(),
        };

        Ok(Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(AxumBody::from(body))
            .unwrap())
    }

    async fn probe(&self, url: &str, _timeout: Duration) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        !self.unhealthy_probes.lock().unwrap().iter().any(|u| u == url)
    }
}

pub fn build(config: GatewayConfig, upstream: Arc<MockUpstream>) -> (Arc<GatewayService>, GatewayRouter) {
    let gateway = Arc::new(GatewayService::new(Arc::new(config)).unwrap());
    let router = GatewayRouter::new(gateway.clone(), upstream);
    (gateway, router)
}

pub fn get(path: &str) -> Request<AxumBody> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header(header::HOST, "gateway.test")
        .body(AxumBody::empty())
        .unwrap()
}

pub async fn json_body(response: Response<AxumBody>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
