//! Middleware implementation for reqwest.

use crate::config::ProxyPoolConfig;
use crate::crawler::CrawlContext;
use crate::error::ProxyError;
use crate::inspector::Inspection;
use crate::request::{CrawlRequest, CrawlResponse, ProxyMeta, RequestFailure};
use crate::session::ProxySession;
use crate::signals::SignalDispatcher;

use anyhow::anyhow;
use async_trait::async_trait;
use http::header::PROXY_AUTHORIZATION;
use log::{debug, info, warn};
use reqwest_middleware::{Error, Middleware, Next, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Middleware that rotates proxies over the requests of one crawl session.
///
/// A request may carry a [`ProxyMeta`] in its extensions to pin a proxy
/// (`ProxyMeta::Url`) or to go direct (`ProxyMeta::Disabled`).
#[derive(Clone)]
pub struct ProxyRotationMiddleware {
    session: Arc<Mutex<ProxySession>>,
    retry_count: usize,
    timeout: Duration,
}

impl ProxyRotationMiddleware {
    /// Open a proxy session for `ctx` and wrap it.
    pub async fn new(
        config: ProxyPoolConfig,
        ctx: CrawlContext,
        signals: Arc<dyn SignalDispatcher>,
    ) -> Result<Self> {
        match ProxySession::open(&config, ctx, signals).await {
            Ok(session) => {
                let counts = session.selector().pool().counts();
                info!("Proxy rotation initialized with {:?}", counts);
                if counts.values().all(|count| *count == 0) {
                    warn!("No proxies loaded, requests go out directly");
                }
                Ok(Self::from_session(session, &config))
            }
            Err(e) => Err(Error::Middleware(anyhow!(e))),
        }
    }

    pub fn from_session(session: ProxySession, config: &ProxyPoolConfig) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            retry_count: config.retry_count,
            timeout: config.request_timeout(),
        }
    }

    pub fn session(&self) -> Arc<Mutex<ProxySession>> {
        self.session.clone()
    }

    /// Close the underlying session.
    pub async fn close(&self) -> Result<()> {
        self.session
            .lock()
            .await
            .close()
            .await
            .map_err(|e| Error::Middleware(anyhow!(e)))
    }

    fn client_for(&self, crawl: &CrawlRequest) -> Result<reqwest::Client> {
        let builder = reqwest::Client::builder().timeout(self.timeout);
        let builder = match crawl.proxy.as_url() {
            Some(url) => {
                let mut proxy = reqwest::Proxy::all(url)?;
                if let Some(auth) = crawl.headers.get(PROXY_AUTHORIZATION) {
                    proxy = proxy.custom_http_auth(auth.clone());
                }
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };
        Ok(builder.build()?)
    }
}

fn crawl_request(req: &reqwest::Request, extensions: &http::Extensions) -> CrawlRequest {
    let mut crawl = CrawlRequest::new(req.url().clone());
    crawl.method = req.method().clone();
    crawl.headers = req.headers().clone();
    crawl.proxy = extensions.get::<ProxyMeta>().cloned().unwrap_or_default();
    crawl
}

#[async_trait]
impl Middleware for ProxyRotationMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        extensions: &mut http::Extensions,
        _next: Next<'_>,
    ) -> Result<reqwest::Response> {
        let mut crawl = crawl_request(&req, extensions);
        let mut retry_count = 0;

        loop {
            self.session
                .lock()
                .await
                .process_request(&mut crawl)
                .await
                .map_err(|e| Error::Middleware(anyhow!(e)))?;

            let mut attempt = req.try_clone().ok_or_else(|| {
                Error::Middleware(anyhow!(
                    "Request object is not cloneable. Are you passing a streaming body?"
                        .to_string()
                ))
            })?;
            // Credentials travel with the proxy configuration, not the request.
            *attempt.headers_mut() = crawl.headers.clone();
            attempt.headers_mut().remove(PROXY_AUTHORIZATION);

            let client = self.client_for(&crawl)?;
            debug!(
                "Sending {} via {} (attempt {})",
                crawl.url,
                crawl.proxy_label(),
                retry_count + 1
            );

            let (inspection, outcome) = match client.execute(attempt).await {
                Ok(response) => {
                    let mut seen = CrawlResponse::new(response.url().clone(), response.status());
                    seen.headers = response.headers().clone();
                    let inspection = self
                        .session
                        .lock()
                        .await
                        .process_response(&crawl, &seen)
                        .await
                        .map_err(|e| Error::Middleware(anyhow!(e)))?;
                    (inspection, Ok(response))
                }
                Err(err) => {
                    warn!(
                        "Request failed with proxy {} (attempt {}): {}",
                        crawl.proxy_label(),
                        retry_count + 1,
                        err
                    );
                    let failure = RequestFailure::from_reqwest(&err);
                    let inspection = self
                        .session
                        .lock()
                        .await
                        .process_exception(&crawl, &failure)
                        .await
                        .map_err(|e| Error::Middleware(anyhow!(e)))?;
                    (inspection, Err(Error::Reqwest(err)))
                }
            };

            match inspection {
                Inspection::Pass => return outcome,
                Inspection::Blocked { cause, recycled } => {
                    retry_count += 1;
                    if retry_count > self.retry_count {
                        return Err(Error::Middleware(anyhow!(ProxyError::Blocked { cause })));
                    }
                    crawl = recycled;
                }
            }
        }
    }
}
