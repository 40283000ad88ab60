use std::{collections::BTreeMap, future::Future, pin::Pin};

use serde::Serialize;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Pending,
    Running,
    Terminated,
}

impl LifecycleState {
    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Cached view of one provisioned compute node. The provider owns the
/// authoritative state; this record is only ever a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub instance_id: String,
    /// Address used for remote execution: public when the provider reports
    /// one, private otherwise.
    pub network_address: String,
    pub lifecycle_state: LifecycleState,
    /// Set when the member was created through an asynchronous (spot)
    /// provisioning request.
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Open,
    Fulfilled,
    Failed,
}

/// A pending request for one member via asynchronous (spot) provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncProvisionRequest {
    pub request_id: String,
    pub status: RequestStatus,
    pub resulting_instance_id: Option<String>,
}

/// Everything the provider needs to place one batch of members.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisionSpec {
    pub image: String,
    pub instance_type: String,
    pub key_name: String,
    pub security_group_ids: Vec<String>,
    pub placement: Option<String>,
    pub subnet_id: Option<String>,
}

#[derive(Debug)]
pub enum ProviderError {
    Authentication(String),
    ResourceResolution(String),
    Provisioning(String),
    Http(reqwest::Error),
    Decode(serde_json::Error),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authentication(msg) => write!(f, "provider rejected credentials: {msg}"),
            Self::ResourceResolution(msg) => write!(f, "resource resolution failed: {msg}"),
            Self::Provisioning(msg) => write!(f, "provisioning failed: {msg}"),
            Self::Http(e) => write!(f, "provider http error: {e}"),
            Self::Decode(e) => write!(f, "provider response decode error: {e}"),
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value)
    }
}

/// Instance-management surface of the cloud provider. Ids passed to
/// `list_members` that the provider no longer recognizes are simply absent
/// from the result, not an error.
pub trait Provider: Send + Sync + 'static {
    fn list_members(&self, ids: Vec<String>) -> BoxFuture<'_, Result<Vec<Member>, ProviderError>>;

    fn create_members(
        &self,
        count: u32,
        spec: ProvisionSpec,
    ) -> BoxFuture<'_, Result<Vec<Member>, ProviderError>>;

    fn request_async_members(
        &self,
        count: u32,
        price: f64,
        spec: ProvisionSpec,
    ) -> BoxFuture<'_, Result<Vec<AsyncProvisionRequest>, ProviderError>>;

    fn poll_async_requests(
        &self,
        request_ids: Vec<String>,
    ) -> BoxFuture<'_, Result<Vec<AsyncProvisionRequest>, ProviderError>>;

    /// Returns the ids the provider acknowledged terminating.
    fn terminate_members(
        &self,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<Vec<String>, ProviderError>>;

    fn tag_members(
        &self,
        ids: Vec<String>,
        tags: BTreeMap<String, String>,
    ) -> BoxFuture<'_, Result<(), ProviderError>>;

    fn resolve_security_group(
        &self,
        name: String,
        subnet: Option<String>,
    ) -> BoxFuture<'_, Result<String, ProviderError>>;
}
