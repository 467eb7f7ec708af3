//! OpenSearch-backed executor.

use crate::config::{RepositoryConfig, RetryConfig};
use crate::error::{RepositoryError, Result};
use crate::executor::{BackendRequest, BackendResponse, Executor};
use async_trait::async_trait;
use opensearch::http::headers::HeaderMap;
use opensearch::http::request::JsonBody;
use opensearch::http::response::Response;
use opensearch::http::transport::{SingleNodeConnectionPool, TransportBuilder};
use opensearch::http::{Method, Url};
use opensearch::params::Refresh;
use opensearch::indices::{IndicesCreateParts, IndicesExistsParts};
use opensearch::{BulkParts, CountParts, DeleteByQueryParts, IndexParts, OpenSearch, SearchParts, UpdateParts};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// OpenSearch client implementing [`Executor`].
///
/// Build it once with [`OpenSearchClient::connect`] and share it through an
/// `Arc`; every node connection is created up front.
#[derive(Clone)]
pub struct OpenSearchClient {
    nodes: Arc<Vec<OpenSearch>>,
    next: Arc<AtomicUsize>,
    retry: RetryConfig,
    config: Arc<RepositoryConfig>,
}

impl OpenSearchClient {
    /// Build the transport for every configured address without contacting
    /// the cluster.
    pub fn new(config: RepositoryConfig) -> Result<Self> {
        info!(addresses = ?config.addresses, "Initializing OpenSearch client");

        if config.addresses.is_empty() {
            return Err(RepositoryError::Config("no addresses provided".to_string()));
        }

        let nodes = config
            .addresses
            .iter()
            .map(|address| build_node(address, &config))
            .collect::<Result<Vec<_>>>()?;

        debug!(nodes = nodes.len(), "OpenSearch client initialized");

        Ok(Self {
            nodes: Arc::new(nodes),
            next: Arc::new(AtomicUsize::new(0)),
            retry: config.retry.clone(),
            config: Arc::new(config),
        })
    }

    /// Build the client and wait until the cluster answers its info endpoint.
    ///
    /// Polls every `cluster_info_retry_interval` and fails with
    /// [`RepositoryError::ClusterUnavailable`] after
    /// `cluster_info_retry_max` attempts.
    pub async fn connect(config: RepositoryConfig) -> Result<Self> {
        let client = Self::new(config)?;
        client.wait_for_cluster().await?;
        Ok(client)
    }

    /// Get the configuration.
    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    async fn wait_for_cluster(&self) -> Result<()> {
        let max = self.config.cluster_info_retry_max.max(1);
        let interval = self.config.cluster_info_retry_interval;

        for attempt in 1..=max {
            match self.send_once(&BackendRequest::Info).await {
                Ok(response) if response.status == 200 => {
                    match serde_json::from_slice::<Value>(&response.body) {
                        Ok(body) => {
                            info!(
                                cluster = body["cluster_name"].as_str().unwrap_or_default(),
                                version = body["version"]["number"].as_str().unwrap_or_default(),
                                "Connected to cluster"
                            );
                            return Ok(());
                        }
                        Err(e) => {
                            let err = RepositoryError::decode("cluster info", e);
                            warn!(attempt, max, error = %err, "Waiting for cluster");
                        }
                    }
                }
                Ok(response) => {
                    info!(attempt, max, status = response.status, "Waiting for cluster");
                }
                Err(e) => {
                    info!(attempt, max, error = %e, "Waiting for cluster");
                }
            }
            if attempt < max {
                tokio::time::sleep(interval).await;
            }
        }

        Err(RepositoryError::ClusterUnavailable { retries: max })
    }

    fn node(&self) -> &OpenSearch {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.nodes.len();
        &self.nodes[i]
    }

    async fn send_once(&self, request: &BackendRequest) -> Result<BackendResponse> {
        let client = self.node();

        let response = match request {
            BackendRequest::Info => client.info().send().await?,
            BackendRequest::Search { index, body } => {
                client
                    .search(SearchParts::Index(&[index.as_str()]))
                    .body(body.clone())
                    .send()
                    .await?
            }
            BackendRequest::Count { index, body } => {
                client
                    .count(CountParts::Index(&[index.as_str()]))
                    .body(body.clone())
                    .send()
                    .await?
            }
            BackendRequest::Index { index, id, body, refresh } => {
                let parts = match id {
                    Some(id) => IndexParts::IndexId(index, id),
                    None => IndexParts::Index(index),
                };
                client
                    .index(parts)
                    .body(body.clone())
                    .refresh(refresh_param(*refresh))
                    .send()
                    .await?
            }
            BackendRequest::Update { index, id, body, refresh } => {
                client
                    .update(UpdateParts::IndexId(index, id))
                    .body(body.clone())
                    .refresh(refresh_param(*refresh))
                    .send()
                    .await?
            }
            BackendRequest::DeleteByQuery { index, body, refresh } => {
                client
                    .delete_by_query(DeleteByQueryParts::Index(&[index.as_str()]))
                    .body(body.clone())
                    .refresh(*refresh)
                    .send()
                    .await?
            }
            BackendRequest::Bulk { lines, refresh } => {
                let body: Vec<JsonBody<Value>> = lines.iter().cloned().map(JsonBody::from).collect();
                client
                    .bulk(BulkParts::None)
                    .body(body)
                    .refresh(refresh_param(*refresh))
                    .send()
                    .await?
            }
            BackendRequest::IndexExists { name } => {
                client
                    .indices()
                    .exists(IndicesExistsParts::Index(&[name.as_str()]))
                    .send()
                    .await?
            }
            BackendRequest::CreateIndex { name } => {
                client
                    .indices()
                    .create(IndicesCreateParts::Index(name))
                    .send()
                    .await?
            }
            BackendRequest::ComponentTemplateExists { name } => {
                raw(client, Method::Head, &format!("/_component_template/{}", name), None).await?
            }
            BackendRequest::PutComponentTemplate { name, body } => {
                raw(client, Method::Put, &format!("/_component_template/{}", name), Some(body)).await?
            }
            BackendRequest::IndexTemplateExists { name } => {
                raw(client, Method::Head, &format!("/_index_template/{}", name), None).await?
            }
            BackendRequest::PutIndexTemplate { name, body } => {
                raw(client, Method::Put, &format!("/_index_template/{}", name), Some(body)).await?
            }
            BackendRequest::DataStreamExists { name } => {
                raw(client, Method::Get, &format!("/_data_stream/{}", name), None).await?
            }
            BackendRequest::CreateDataStream { name } => {
                raw(client, Method::Put, &format!("/_data_stream/{}", name), None).await?
            }
        };

        into_backend_response(response).await
    }
}

#[async_trait]
impl Executor for OpenSearchClient {
    async fn execute(&self, request: BackendRequest) -> Result<BackendResponse> {
        let operation = request.kind().operation();
        let mut attempt = 0u32;

        loop {
            let outcome = self.send_once(&request).await;
            let can_retry = self.retry.enabled && attempt < self.retry.max_retries;

            match outcome {
                Ok(response) if can_retry && self.retry.should_retry_status(response.status) => {
                    warn!(operation, status = response.status, attempt, "Retrying request");
                }
                Err(RepositoryError::Client(e)) if can_retry => {
                    warn!(operation, error = %e, attempt, "Retrying request after transport error");
                }
                other => return other,
            }

            attempt += 1;
            tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
        }
    }
}

impl std::fmt::Debug for OpenSearchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenSearchClient")
            .field("addresses", &self.config.addresses)
            .finish()
    }
}

fn build_node(address: &str, config: &RepositoryConfig) -> Result<OpenSearch> {
    let url = Url::parse(address)
        .map_err(|e| RepositoryError::Config(format!("invalid address {:?}: {}", address, e)))?;

    let mut builder = TransportBuilder::new(SingleNodeConnectionPool::new(url))
        .timeout(config.request_timeout)
        .disable_proxy();

    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        builder = builder.auth(opensearch::auth::Credentials::Basic(user.clone(), pass.clone()));
    }

    #[cfg(any(feature = "rustls", feature = "native-tls"))]
    if config.danger_accept_invalid_certs {
        warn!(address, "TLS certificate validation disabled");
        builder = builder.cert_validation(opensearch::cert::CertificateValidation::None);
    }

    let transport = builder
        .build()
        .map_err(|e| RepositoryError::Config(e.to_string()))?;

    Ok(OpenSearch::new(transport))
}

fn refresh_param(refresh: bool) -> Refresh {
    if refresh {
        Refresh::True
    } else {
        Refresh::False
    }
}

async fn raw(
    client: &OpenSearch,
    method: Method,
    path: &str,
    body: Option<&Value>,
) -> std::result::Result<Response, opensearch::Error> {
    client
        .send(
            method,
            path,
            HeaderMap::new(),
            None::<&()>,
            body.cloned().map(JsonBody::new),
            None,
        )
        .await
}

async fn into_backend_response(response: Response) -> Result<BackendResponse> {
    let status = response.status_code().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect::<BTreeMap<_, _>>();
    let body = response.bytes().await?;

    Ok(BackendResponse { status, headers, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_addresses() {
        let mut config = RepositoryConfig::default();
        config.addresses.clear();
        assert!(matches!(
            OpenSearchClient::new(config),
            Err(RepositoryError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_address() {
        let config = RepositoryConfig::new("not a url");
        assert!(matches!(
            OpenSearchClient::new(config),
            Err(RepositoryError::Config(_))
        ));
    }

    #[test]
    fn test_builds_one_node_per_address() {
        let config = RepositoryConfig::default()
            .with_addresses("http://localhost:9200,http://localhost:9201");
        let client = OpenSearchClient::new(config).unwrap();
        assert_eq!(client.nodes.len(), 2);
    }
}
