//! Routers turn a [`ServiceRequest`] into a concrete HTTP call.
//!
//! All variants stamp `sent` immediately before dispatch and surface dispatch
//! failures as transport errors. Retries (5 attempts, 1 s timeout each) live
//! here, with the balancer re-consulted on every attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{GalileoError, Result};
use crate::routing::balancer::Balancer;
use crate::util;

const RETRY: usize = 5;
const TIMEOUT: Duration = Duration::from_secs(1);

/// Request options passed through from the app to the HTTP client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestKwargs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

/// One service request on its way through a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub service: String,
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub kwargs: RequestKwargs,

    /// Creation time, fractional epoch seconds.
    pub created: f64,
    /// Dispatch time, stamped by the router just before the call goes out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ServiceRequest {
    pub fn new(service: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            path: path.into(),
            method: "get".to_string(),
            kwargs: RequestKwargs::default(),
            created: util::timestamp(),
            sent: None,
            client_id: None,
            request_id: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_kwargs(mut self, kwargs: RequestKwargs) -> Self {
        self.kwargs = kwargs;
        self
    }
}

/// Outcome of a dispatched request.
#[derive(Debug, Clone)]
pub struct RouterResponse {
    pub status: i32,
    /// Final URL the request went to.
    pub url: String,
    /// `host[:port]` that served the request.
    pub host: String,
    pub body: String,
}

/// Turns service requests into HTTP responses.
#[async_trait]
pub trait Router: Send + Sync {
    async fn request(&self, request: &mut ServiceRequest) -> Result<RouterResponse>;
}

enum UrlStrategy {
    /// `{prefix}{path}`
    Prefix(String),
    /// `http://{balanced host}{path}`
    Host(Arc<dyn Balancer>),
    /// `http://{balanced host}/{service}{path}`
    Service(Arc<dyn Balancer>),
}

impl UrlStrategy {
    async fn url(&self, request: &ServiceRequest) -> Result<String> {
        match self {
            UrlStrategy::Prefix(prefix) => Ok(format!("{}{}", prefix, request.path)),
            UrlStrategy::Host(balancer) => {
                let host = balancer.next_host(&request.service).await?;
                Ok(format!("http://{}{}", host, request.path))
            }
            UrlStrategy::Service(balancer) => {
                let host = balancer.next_host(&request.service).await?;
                Ok(format!("http://{}/{}{}", host, request.service, request.path))
            }
        }
    }
}

struct HttpDispatcher {
    strategy: UrlStrategy,
    client: reqwest::Client,
}

impl HttpDispatcher {
    fn new(strategy: UrlStrategy) -> Self {
        Self {
            strategy,
            client: reqwest::Client::new(),
        }
    }

    async fn run(&self, request: &mut ServiceRequest) -> Result<RouterResponse> {
        let mut last_error = None;
        for attempt in 1..=RETRY {
            let url = self.strategy.url(request).await?;
            match self.dispatch(request, &url).await {
                Ok(response) => return Ok(response),
                Err(e @ GalileoError::Transport(_)) => {
                    info!(attempt, url, error = %e, "request attempt failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| GalileoError::Transport(format!("gave up after {RETRY} attempts"))))
    }

    async fn dispatch(&self, request: &mut ServiceRequest, url: &str) -> Result<RouterResponse> {
        let method: reqwest::Method = request.method.to_uppercase().parse().map_err(|_| {
            GalileoError::InvalidArgument(format!("unknown method {}", request.method))
        })?;

        let timeout = request
            .kwargs
            .timeout
            .map(Duration::from_secs_f64)
            .unwrap_or(TIMEOUT);

        let mut builder = self.client.request(method, url).timeout(timeout);
        if let Some(params) = &request.kwargs.params {
            builder = builder.query(params);
        }
        if let Some(headers) = &request.kwargs.headers {
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
        }
        if let Some(json) = &request.kwargs.json {
            builder = builder.json(json);
        }
        if let Some(body) = &request.kwargs.body {
            builder = builder.body(body.clone());
        }

        debug!(method = %request.method, url, "forwarding request");
        request.sent = Some(util::timestamp());

        let response = builder
            .send()
            .await
            .map_err(|e| GalileoError::Transport(e.to_string()))?;

        let status = response.status().as_u16() as i32;
        let url = response.url().to_string();
        let host = util::host_of_url(&url);
        let body = response
            .text()
            .await
            .map_err(|e| GalileoError::Transport(e.to_string()))?;

        debug!(method = %request.method, url, status, "request done");
        Ok(RouterResponse {
            status,
            url,
            host,
            body,
        })
    }
}

/// Routes every request to `{prefix}{path}`.
pub struct StaticRouter {
    dispatcher: HttpDispatcher,
}

impl StaticRouter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            dispatcher: HttpDispatcher::new(UrlStrategy::Prefix(prefix.into())),
        }
    }
}

#[async_trait]
impl Router for StaticRouter {
    async fn request(&self, request: &mut ServiceRequest) -> Result<RouterResponse> {
        self.dispatcher.run(request).await
    }
}

/// Routes to `http://{host}{path}` with the host picked by a balancer.
///
/// Useful when target containers are reachable directly, without a reverse
/// proxy on each node.
pub struct HostRouter {
    dispatcher: HttpDispatcher,
}

impl HostRouter {
    pub fn new(balancer: Arc<dyn Balancer>) -> Self {
        Self {
            dispatcher: HttpDispatcher::new(UrlStrategy::Host(balancer)),
        }
    }
}

#[async_trait]
impl Router for HostRouter {
    async fn request(&self, request: &mut ServiceRequest) -> Result<RouterResponse> {
        self.dispatcher.run(request).await
    }
}

/// Routes to `http://{host}/{service}{path}`, assuming a reverse proxy on
/// each node forwards to the right container.
pub struct ServiceRouter {
    dispatcher: HttpDispatcher,
}

impl ServiceRouter {
    pub fn new(balancer: Arc<dyn Balancer>) -> Self {
        Self {
            dispatcher: HttpDispatcher::new(UrlStrategy::Service(balancer)),
        }
    }
}

#[async_trait]
impl Router for ServiceRouter {
    async fn request(&self, request: &mut ServiceRequest) -> Result<RouterResponse> {
        self.dispatcher.run(request).await
    }
}

/// Resolves the URL like [`ServiceRouter`] but never dispatches; every
/// request succeeds with a synthetic 200. Useful for dry-running workloads.
pub struct DebugRouter {
    balancer: Option<Arc<dyn Balancer>>,
}

impl DebugRouter {
    pub fn new(balancer: Option<Arc<dyn Balancer>>) -> Self {
        Self { balancer }
    }
}

#[async_trait]
impl Router for DebugRouter {
    async fn request(&self, request: &mut ServiceRequest) -> Result<RouterResponse> {
        let host = match &self.balancer {
            Some(balancer) => balancer.next_host(&request.service).await?,
            None => "localhost".to_string(),
        };
        let url = format!("http://{}/{}{}", host, request.service, request.path);

        request.sent = Some(util::timestamp());
        info!(method = %request.method, url, "debug router swallowing request");

        Ok(RouterResponse {
            status: 200,
            url,
            host,
            body: "ok".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::balancer::StaticHostBalancer;

    #[tokio::test]
    async fn debug_router_resolves_without_dispatching() {
        let router = DebugRouter::new(Some(Arc::new(StaticHostBalancer::new("node1:8080"))));
        let mut request = ServiceRequest::new("myservice", "/predict");

        let response = router.request(&mut request).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.host, "node1:8080");
        assert_eq!(response.url, "http://node1:8080/myservice/predict");
        assert!(request.sent.is_some());
        assert!(request.sent.unwrap() >= request.created);
    }

    #[tokio::test]
    async fn url_strategies_compose_expected_urls() {
        let request = ServiceRequest::new("svc", "/api/unittest");
        let balancer: Arc<dyn Balancer> = Arc::new(StaticHostBalancer::new("host:1234"));

        let prefix = UrlStrategy::Prefix("http://localhost:8080".to_string());
        assert_eq!(
            prefix.url(&request).await.unwrap(),
            "http://localhost:8080/api/unittest"
        );

        let host = UrlStrategy::Host(balancer.clone());
        assert_eq!(
            host.url(&request).await.unwrap(),
            "http://host:1234/api/unittest"
        );

        let service = UrlStrategy::Service(balancer);
        assert_eq!(
            service.url(&request).await.unwrap(),
            "http://host:1234/svc/api/unittest"
        );
    }

    #[tokio::test]
    async fn static_router_fails_transport_on_unreachable_host() {
        // Port 1 is essentially never listening
        let router = StaticRouter::new("http://127.0.0.1:1");
        let mut request = ServiceRequest::new("svc", "/");
        request.kwargs.timeout = Some(0.2);

        let result = router.request(&mut request).await;
        assert!(matches!(result, Err(GalileoError::Transport(_))));
        assert!(request.sent.is_some());
    }
}
