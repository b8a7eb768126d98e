//! Proxies queried from an external document store.

use super::{LoadedProxies, ProxySource, NO_PROXY_SCHEME};
use crate::bypass::BypassRules;
use crate::config::{DocumentQuery, DocumentStoreConfig, StorageBackend};
use crate::crawler::CrawlContext;
use crate::error::{ProxyError, Result};
use crate::proxy::{AuthEncoding, Credential, ProxyRecord};

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One stored proxy, or one bypass rule when `scheme` is `no`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDocument {
    pub scheme: String,
    /// Proxy URL, or the suffix / `*` of a bypass rule.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyDocument {
    /// Build the record this document describes, if it names a proxy at all.
    ///
    /// Explicit `username`/`password` fields override credentials embedded
    /// in `proxy`.
    pub fn to_record(&self, encoding: AuthEncoding) -> Result<Option<ProxyRecord>> {
        let record = match (&self.proxy, &self.ip, self.port) {
            (Some(proxy), _, _) => ProxyRecord::parse(proxy, &self.scheme, encoding)?,
            (None, Some(ip), Some(port)) => {
                ProxyRecord::new(format!("{}://{}:{}", self.scheme, ip, port), None)
            }
            _ => return Ok(None),
        };
        match self.username.as_deref().filter(|user| !user.is_empty()) {
            Some(user) => {
                let password = self.password.as_deref().unwrap_or_default();
                let credential = Credential::basic(user, password, encoding)?;
                Ok(Some(record.with_credential(Some(credential))))
            }
            None => Ok(Some(record)),
        }
    }
}

/// Access to the collection holding proxy documents.
#[async_trait]
pub trait DocumentClient: Send + Sync {
    /// Open the connection; returns the address for logging.
    async fn connect(&mut self, app_name: &str) -> Result<String>;

    async fn find(&self, query: &DocumentQuery) -> Result<Vec<ProxyDocument>>;

    async fn close(&mut self) -> Result<()>;
}

/// Proxies read from a document store collection.
pub struct DocumentSource {
    client: Box<dyn DocumentClient>,
    query: DocumentQuery,
    encoding: AuthEncoding,
    address: Option<String>,
}

impl DocumentSource {
    /// Query `client` with `query`; nothing is sent before `connect`.
    pub fn new(client: Box<dyn DocumentClient>, query: DocumentQuery, encoding: AuthEncoding) -> Self {
        Self {
            client,
            query,
            encoding,
            address: None,
        }
    }

    fn group(&self, documents: Vec<ProxyDocument>) -> Result<LoadedProxies> {
        let mut loaded = LoadedProxies::default();
        let mut bypass = Vec::new();
        for doc in documents {
            if doc.scheme == NO_PROXY_SCHEME {
                match doc.proxy {
                    Some(rule) => bypass.push(rule),
                    None => warn!("Skipping bypass document without a proxy field"),
                }
                continue;
            }
            match doc.to_record(self.encoding)? {
                Some(record) => loaded.push(&doc.scheme, record),
                None => warn!("Skipping {} proxy document without proxy or ip/port", doc.scheme),
            }
        }
        if !bypass.is_empty() {
            loaded.bypass = Some(BypassRules::from_entries(bypass));
        }
        Ok(loaded)
    }
}

#[async_trait]
impl ProxySource for DocumentSource {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Document
    }

    async fn connect(&mut self, ctx: &CrawlContext) -> Result<()> {
        let address = self.client.connect(&ctx.name).await?;
        info!("Document proxy storage ({}) is connected", address);
        self.address = Some(address);
        Ok(())
    }

    async fn load(&self) -> Result<LoadedProxies> {
        if self.address.is_none() {
            return Err(ProxyError::NotOpen);
        }
        let documents = self.client.find(&self.query).await?;
        self.group(documents)
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(address) = self.address.take() {
            self.client.close().await?;
            info!("Document proxy storage ({}) is disconnected", address);
        }
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FindRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    data_source: Option<&'a str>,
    database: &'a str,
    collection: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    projection: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sort: Option<&'a Value>,
    skip: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
}

#[derive(Deserialize)]
struct FindResponse {
    documents: Vec<ProxyDocument>,
}

/// Client for a document store's JSON gateway (`POST /action/find`).
pub struct HttpDocumentClient {
    config: DocumentStoreConfig,
    client: Option<reqwest::Client>,
}

impl HttpDocumentClient {
    pub fn new(config: DocumentStoreConfig) -> Self {
        Self { config, client: None }
    }
}

#[async_trait]
impl DocumentClient for HttpDocumentClient {
    async fn connect(&mut self, app_name: &str) -> Result<String> {
        let client = reqwest::Client::builder()
            .timeout(self.config.timeout())
            .user_agent(app_name)
            .build()?;
        self.client = Some(client);

        let address = self.config.base_url();
        match &self.config.username {
            Some(username) => info!(
                "Document store {} opened with auth source {:?}, authorized by {:?}",
                address,
                self.config.auth_source(),
                username
            ),
            None => info!("Document store {} opened for database {:?}", address, self.config.database),
        }
        Ok(address)
    }

    async fn find(&self, query: &DocumentQuery) -> Result<Vec<ProxyDocument>> {
        let client = self.client.as_ref().ok_or(ProxyError::NotOpen)?;
        let body = FindRequest {
            data_source: self.config.data_source.as_deref(),
            database: &self.config.database,
            collection: &self.config.collection,
            filter: query.filter.as_ref(),
            projection: query.projection.as_ref(),
            sort: query.sort.as_ref(),
            skip: query.skip,
            limit: (query.limit > 0).then_some(query.limit),
        };

        let mut request = client
            .post(format!("{}/action/find", self.config.base_url()))
            .json(&body);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_ref());
        }

        let response = request.send().await?.error_for_status()?;
        let payload: FindResponse = serde_json::from_slice(&response.bytes().await?)?;
        Ok(payload.documents)
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}
