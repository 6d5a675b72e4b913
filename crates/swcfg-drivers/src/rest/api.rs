//! Transport abstraction for the NVUE revision API.

use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use serde::Serialize;
use swcfg_common::DeployResult;

/// Where to reach the API of one device.
///
/// TLS is verified against `host` while the connection goes to `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// DNS name the server certificate is issued for.
    pub host: String,
    /// Management address the connection is made to.
    pub address: IpAddr,
    /// HTTPS port.
    pub port: u16,
}

impl Endpoint {
    /// Returns the API base URL.
    pub fn base_url(&self) -> String {
        format!("https://{}:{}/nvue_v1", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct StateControls {
    confirm: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct AutoPrompt {
    ays: &'static str,
}

/// Body of a revision state change request.
///
/// Interactive "are you sure" prompts are always answered with yes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateRequest {
    state: String,
    #[serde(rename = "state-controls", skip_serializing_if = "Option::is_none")]
    state_controls: Option<StateControls>,
    #[serde(rename = "auto-prompt")]
    auto_prompt: AutoPrompt,
}

impl StateRequest {
    /// Requests a transition to `state`.
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            state_controls: None,
            auto_prompt: AutoPrompt { ays: "ays_yes" },
        }
    }

    /// Asks the device to revert unless confirmed within `seconds`.
    pub fn with_confirm(mut self, seconds: u64) -> Self {
        self.state_controls = Some(StateControls { confirm: seconds });
        self
    }

    /// Returns the requested state.
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Returns the confirm window, if any.
    pub fn confirm(&self) -> Option<u64> {
        self.state_controls.as_ref().map(|controls| controls.confirm)
    }
}

/// Operations of the revision API used by [`super::RestRevisionDriver`].
///
/// Unreachable endpoints must be reported as
/// [`swcfg_common::DeployError::Connection`]; the driver treats those as
/// transient while polling.
#[async_trait]
pub trait RevisionApi: Send + Sync {
    /// Checks that the API answers on `endpoint`.
    async fn probe(&self, endpoint: &Endpoint) -> DeployResult<()>;

    /// Returns every known revision with its raw state.
    async fn revisions(&self, endpoint: &Endpoint) -> DeployResult<BTreeMap<String, String>>;

    /// Creates a new revision and returns its id.
    async fn create_revision(&self, endpoint: &Endpoint) -> DeployResult<String>;

    /// Removes all staged content from `revision`.
    async fn clear_revision(&self, endpoint: &Endpoint, revision: &str) -> DeployResult<()>;

    /// Writes the full target configuration into `revision`.
    async fn patch_config(
        &self,
        endpoint: &Endpoint,
        revision: &str,
        config: &serde_json::Value,
    ) -> DeployResult<()>;

    /// Returns the raw diff between the applied configuration and `revision`.
    async fn diff(&self, endpoint: &Endpoint, revision: &str) -> DeployResult<String>;

    /// Requests a state change of `revision`.
    async fn set_state(
        &self,
        endpoint: &Endpoint,
        revision: &str,
        request: &StateRequest,
    ) -> DeployResult<()>;

    /// Returns the raw state of `revision`.
    async fn revision_state(&self, endpoint: &Endpoint, revision: &str) -> DeployResult<String>;
}
