//! The proxy layer of one crawl session.

use crate::config::ProxyPoolConfig;
use crate::crawler::CrawlContext;
use crate::error::Result;
use crate::inspector::{BlockInspector, Inspection};
use crate::request::{CrawlRequest, CrawlResponse, RequestFailure};
use crate::selector::ProxySelector;
use crate::signals::SignalDispatcher;

use log::{debug, info};
use std::sync::Arc;

/// Selector and block inspector bound to a crawl session.
///
/// Opened when the session starts and closed when it ends; never shared
/// between sessions.
#[derive(Debug)]
pub struct ProxySession {
    selector: ProxySelector,
    inspector: BlockInspector,
    ctx: CrawlContext,
}

impl ProxySession {
    /// Validate `config`, then build and open the selector and inspector.
    ///
    /// Fails if the first load of the storage fails; nothing is left open.
    pub async fn open(
        config: &ProxyPoolConfig,
        ctx: CrawlContext,
        signals: Arc<dyn SignalDispatcher>,
    ) -> Result<Self> {
        config.validate()?;
        let selector = ProxySelector::from_config(config, ctx.clone())?;
        let inspector = BlockInspector::new(config, signals);
        Self::from_parts(selector, inspector, ctx).await
    }

    /// Open a session from already built parts.
    pub async fn from_parts(
        mut selector: ProxySelector,
        inspector: BlockInspector,
        ctx: CrawlContext,
    ) -> Result<Self> {
        selector.open().await?;
        inspector.open();
        info!("Proxy session for {} is opened", ctx.name);
        Ok(Self {
            selector,
            inspector,
            ctx,
        })
    }

    pub fn selector(&self) -> &ProxySelector {
        &self.selector
    }

    pub fn context(&self) -> &CrawlContext {
        &self.ctx
    }

    /// Assign a proxy to `request`.
    pub async fn process_request(&mut self, request: &mut CrawlRequest) -> Result<()> {
        self.selector.process_request(request).await
    }

    /// Inspect `response`; on a block the proxy is invalidated and a
    /// recycled request is returned.
    pub async fn process_response(
        &mut self,
        request: &CrawlRequest,
        response: &CrawlResponse,
    ) -> Result<Inspection> {
        let inspection = self.inspector.inspect_response(request, response, &self.ctx).await;
        self.invalidate_on_block(request, &inspection);
        Ok(inspection)
    }

    pub async fn process_exception(
        &mut self,
        request: &CrawlRequest,
        failure: &RequestFailure,
    ) -> Result<Inspection> {
        let inspection = self.inspector.inspect_failure(request, failure, &self.ctx).await;
        self.invalidate_on_block(request, &inspection);
        Ok(inspection)
    }

    fn invalidate_on_block(&mut self, request: &CrawlRequest, inspection: &Inspection) {
        if let Inspection::Blocked { cause, .. } = inspection {
            if !self.selector.invalidate(request, cause) {
                debug!("{} was already invalidated", request.proxy_label());
            }
        }
    }

    /// Close the selector; closing twice is harmless.
    pub async fn close(&mut self) -> Result<()> {
        self.selector.close().await?;
        info!("Proxy session for {} is closed", self.ctx.name);
        Ok(())
    }
}
