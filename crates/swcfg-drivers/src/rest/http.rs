//! [`RevisionApi`] over HTTPS with `reqwest`.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use swcfg_common::{DeployConfig, DeployError, DeployResult};

use super::api::{Endpoint, RevisionApi, StateRequest};

/// Timeout of a single API request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct RevisionEntry {
    state: String,
}

/// HTTPS client for the NVUE revision API.
///
/// One `reqwest` client is kept per endpoint so that the certificate can be
/// verified against the DNS name while connecting to a literal address.
pub struct HttpRevisionApi {
    user: String,
    password: String,
    connect_timeout: Duration,
    clients: Mutex<HashMap<(String, SocketAddr), Client>>,
}

impl HttpRevisionApi {
    /// Creates a client authenticating as `user` with `password`.
    pub fn new(user: impl Into<String>, password: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            connect_timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Builds the client from the `[deploy]` and `[rest]` sections.
    pub fn from_config(config: &DeployConfig) -> Self {
        Self::new(
            config.deploy.user.clone(),
            config.rest.password.clone(),
            config.connect_timeout(),
        )
    }

    fn client(&self, endpoint: &Endpoint) -> DeployResult<Client> {
        let socket = SocketAddr::new(endpoint.address, endpoint.port);
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(client) = clients.get(&(endpoint.host.clone(), socket)) {
            return Ok(client.clone());
        }

        let client = Client::builder()
            .resolve(&endpoint.host, socket)
            .connect_timeout(self.connect_timeout)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DeployError::protocol(format!("failed to build HTTP client: {}", e)))?;
        clients.insert((endpoint.host.clone(), socket), client.clone());
        Ok(client)
    }

    fn request(&self, endpoint: &Endpoint, method: Method, path: &str) -> DeployResult<RequestBuilder> {
        let url = format!("{}{}", endpoint.base_url(), path);
        Ok(self
            .client(endpoint)?
            .request(method, url)
            .basic_auth(&self.user, Some(&self.password)))
    }

    async fn send(&self, endpoint: &Endpoint, request: RequestBuilder) -> DeployResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(endpoint, e))?;
        response
            .error_for_status()
            .map_err(|e| transport_error(endpoint, e))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        endpoint: &Endpoint,
        request: RequestBuilder,
    ) -> DeployResult<T> {
        self.send(endpoint, request)
            .await?
            .json()
            .await
            .map_err(|e| DeployError::protocol(format!("invalid response from {}: {}", endpoint.host, e)))
    }
}

/// Maps connect failures and timeouts to [`DeployError::Connection`] and
/// everything else to [`DeployError::Protocol`].
fn transport_error(endpoint: &Endpoint, e: reqwest::Error) -> DeployError {
    if e.is_connect() || e.is_timeout() {
        DeployError::connection(endpoint.address.to_string(), e.to_string())
    } else {
        DeployError::protocol(format!("request to {} failed: {}", endpoint.host, e))
    }
}

/// Revision ids may contain `/`, which must not split the URL path.
fn encode_revision(revision: &str) -> String {
    revision.replace('%', "%25").replace('/', "%2F")
}

#[async_trait]
impl RevisionApi for HttpRevisionApi {
    async fn probe(&self, endpoint: &Endpoint) -> DeployResult<()> {
        tracing::debug!(url = %endpoint.base_url(), address = %endpoint.address, "Probing API");
        let request = self.request(endpoint, Method::GET, "/")?;
        self.send(endpoint, request).await?;
        Ok(())
    }

    async fn revisions(&self, endpoint: &Endpoint) -> DeployResult<BTreeMap<String, String>> {
        let request = self.request(endpoint, Method::GET, "/revision")?;
        let entries: BTreeMap<String, RevisionEntry> = self.send_json(endpoint, request).await?;
        Ok(entries
            .into_iter()
            .map(|(id, entry)| (id, entry.state))
            .collect())
    }

    async fn create_revision(&self, endpoint: &Endpoint) -> DeployResult<String> {
        let request = self.request(endpoint, Method::POST, "/revision")?;
        let created: BTreeMap<String, serde_json::Value> =
            self.send_json(endpoint, request).await?;
        created
            .into_keys()
            .next()
            .ok_or_else(|| DeployError::protocol("revision create returned no id"))
    }

    async fn clear_revision(&self, endpoint: &Endpoint, revision: &str) -> DeployResult<()> {
        let request = self
            .request(endpoint, Method::DELETE, "/")?
            .query(&[("rev", revision)]);
        self.send(endpoint, request).await?;
        Ok(())
    }

    async fn patch_config(
        &self,
        endpoint: &Endpoint,
        revision: &str,
        config: &serde_json::Value,
    ) -> DeployResult<()> {
        let request = self
            .request(endpoint, Method::PATCH, "/")?
            .query(&[("rev", revision)])
            .json(config);
        self.send(endpoint, request).await?;
        Ok(())
    }

    async fn diff(&self, endpoint: &Endpoint, revision: &str) -> DeployResult<String> {
        let request = self
            .request(endpoint, Method::GET, "/")?
            .query(&[("rev", "applied"), ("diff", revision)]);
        self.send(endpoint, request)
            .await?
            .text()
            .await
            .map_err(|e| transport_error(endpoint, e))
    }

    async fn set_state(
        &self,
        endpoint: &Endpoint,
        revision: &str,
        request: &StateRequest,
    ) -> DeployResult<()> {
        tracing::debug!(revision, state = request.state(), "Requesting state change");
        let path = format!("/revision/{}", encode_revision(revision));
        let http = self.request(endpoint, Method::PATCH, &path)?.json(request);
        self.send(endpoint, http).await?;
        Ok(())
    }

    async fn revision_state(&self, endpoint: &Endpoint, revision: &str) -> DeployResult<String> {
        let path = format!("/revision/{}", encode_revision(revision));
        let request = self.request(endpoint, Method::GET, &path)?;
        let entry: RevisionEntry = self.send_json(endpoint, request).await?;
        Ok(entry.state)
    }
}
