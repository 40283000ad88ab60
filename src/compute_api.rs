use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::provider::{
    AsyncProvisionRequest, BoxFuture, LifecycleState, Member, Provider, ProviderError,
    ProvisionSpec, RequestStatus,
};

const BODY_EXCERPT_LEN: usize = 200;

/// HTTP adapter for the provisioning API. Routes are scoped by the region the
/// client was constructed for; instance and request ids are unique across the
/// account, so lookups carry the ids in the request body.
#[derive(Debug, Clone)]
pub struct ComputeApiClient {
    base: String,
    token: String,
    region: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CreateInstancesBody<'a> {
    count: u32,
    #[serde(flatten)]
    spec: &'a ProvisionSpec,
}

#[derive(Debug, Serialize)]
struct SpotRequestsBody<'a> {
    count: u32,
    price: f64,
    #[serde(flatten)]
    spec: &'a ProvisionSpec,
}

#[derive(Debug, Serialize)]
struct InstanceIdsBody<'a> {
    instance_ids: &'a [String],
}

#[derive(Debug, Serialize)]
struct RequestIdsBody<'a> {
    request_ids: &'a [String],
}

#[derive(Debug, Serialize)]
struct TagInstancesBody<'a> {
    instance_ids: &'a [String],
    tags: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct InstancesEnvelope {
    instances: Vec<WireInstance>,
}

#[derive(Debug, Deserialize)]
struct WireInstance {
    instance_id: String,
    #[serde(default)]
    public_address: Option<String>,
    #[serde(default)]
    private_address: Option<String>,
    state: String,
    #[serde(default)]
    spot_request_id: Option<String>,
}

impl WireInstance {
    fn into_member(self) -> Member {
        let network_address = self
            .public_address
            .filter(|addr| !addr.is_empty())
            .or(self.private_address)
            .unwrap_or_default();
        Member {
            instance_id: self.instance_id,
            network_address,
            lifecycle_state: lifecycle_from_wire(&self.state),
            request_id: self.spot_request_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SpotRequestsEnvelope {
    requests: Vec<WireSpotRequest>,
}

#[derive(Debug, Deserialize)]
struct WireSpotRequest {
    request_id: String,
    status: String,
    #[serde(default)]
    instance_id: Option<String>,
}

impl WireSpotRequest {
    fn into_request(self) -> AsyncProvisionRequest {
        AsyncProvisionRequest {
            request_id: self.request_id,
            status: request_status_from_wire(&self.status),
            resulting_instance_id: self.instance_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TerminatedEnvelope {
    terminated: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SecurityGroupsEnvelope {
    groups: Vec<WireSecurityGroup>,
}

#[derive(Debug, Deserialize)]
struct WireSecurityGroup {
    group_id: String,
}

fn lifecycle_from_wire(state: &str) -> LifecycleState {
    match state {
        "pending" => LifecycleState::Pending,
        "running" => LifecycleState::Running,
        // Stopping, stopped, terminated and unrecognized states are all
        // non-reusable as far as the fleet is concerned.
        _ => LifecycleState::Terminated,
    }
}

fn request_status_from_wire(status: &str) -> RequestStatus {
    match status {
        "fulfilled" => RequestStatus::Fulfilled,
        "failed" | "cancelled" | "closed" => RequestStatus::Failed,
        _ => RequestStatus::Open,
    }
}

fn body_excerpt(body: &str) -> String {
    body.chars().take(BODY_EXCERPT_LEN).collect()
}

impl ComputeApiClient {
    pub fn new(base: String, token: String, region: String) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("anthive")
            .build()
            .expect("reqwest client");
        Self {
            base,
            token,
            region,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/v1/regions/{}/{path}",
            self.base.trim_end_matches('/'),
            self.region
        )
    }

    async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn decode<T: for<'de> Deserialize<'de>>(
        resp: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::Authentication(format!(
                "provisioning api returned {status}"
            )));
        }
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Provisioning(format!(
                "provisioning api returned {status}: {}",
                body_excerpt(&body)
            )));
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn describe_instances(&self, ids: Vec<String>) -> Result<Vec<Member>, ProviderError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let envelope: InstancesEnvelope = self
            .post_json("instances/describe", &InstanceIdsBody { instance_ids: &ids })
            .await?;
        Ok(envelope
            .instances
            .into_iter()
            .map(WireInstance::into_member)
            .collect())
    }

    async fn run_instances(
        &self,
        count: u32,
        spec: ProvisionSpec,
    ) -> Result<Vec<Member>, ProviderError> {
        let envelope: InstancesEnvelope = self
            .post_json("instances", &CreateInstancesBody { count, spec: &spec })
            .await?;
        Ok(envelope
            .instances
            .into_iter()
            .map(WireInstance::into_member)
            .collect())
    }

    async fn place_spot_requests(
        &self,
        count: u32,
        price: f64,
        spec: ProvisionSpec,
    ) -> Result<Vec<AsyncProvisionRequest>, ProviderError> {
        let envelope: SpotRequestsEnvelope = self
            .post_json(
                "spot-requests",
                &SpotRequestsBody {
                    count,
                    price,
                    spec: &spec,
                },
            )
            .await?;
        Ok(envelope
            .requests
            .into_iter()
            .map(WireSpotRequest::into_request)
            .collect())
    }

    async fn describe_spot_requests(
        &self,
        request_ids: Vec<String>,
    ) -> Result<Vec<AsyncProvisionRequest>, ProviderError> {
        let envelope: SpotRequestsEnvelope = self
            .post_json(
                "spot-requests/describe",
                &RequestIdsBody {
                    request_ids: &request_ids,
                },
            )
            .await?;
        Ok(envelope
            .requests
            .into_iter()
            .map(WireSpotRequest::into_request)
            .collect())
    }

    async fn terminate_instances(&self, ids: Vec<String>) -> Result<Vec<String>, ProviderError> {
        let envelope: TerminatedEnvelope = self
            .post_json(
                "instances/terminate",
                &InstanceIdsBody { instance_ids: &ids },
            )
            .await?;
        Ok(envelope.terminated)
    }

    async fn tag_instances(
        &self,
        ids: Vec<String>,
        tags: BTreeMap<String, String>,
    ) -> Result<(), ProviderError> {
        let resp = self
            .client
            .post(self.url("instances/tags"))
            .bearer_auth(&self.token)
            .json(&TagInstancesBody {
                instance_ids: &ids,
                tags: &tags,
            })
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::Authentication(format!(
                "provisioning api returned {status}"
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Provisioning(format!(
                "provisioning api returned {status}: {}",
                body_excerpt(&body)
            )));
        }
        Ok(())
    }

    async fn lookup_security_group(
        &self,
        name: String,
        subnet: Option<String>,
    ) -> Result<String, ProviderError> {
        let mut query = vec![("name", name.clone())];
        if let Some(subnet) = subnet {
            query.push(("subnet", subnet));
        }
        let resp = self
            .client
            .get(self.url("security-groups"))
            .bearer_auth(&self.token)
            .query(&query)
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::ResourceResolution(format!(
                "security group {name:?} not found"
            )));
        }
        let envelope: SecurityGroupsEnvelope = Self::decode(resp).await?;
        match envelope.groups.into_iter().next() {
            Some(group) => Ok(group.group_id),
            None => Err(ProviderError::ResourceResolution(format!(
                "security group {name:?} not found"
            ))),
        }
    }
}

impl Provider for ComputeApiClient {
    fn list_members(&self, ids: Vec<String>) -> BoxFuture<'_, Result<Vec<Member>, ProviderError>> {
        Box::pin(self.describe_instances(ids))
    }

    fn create_members(
        &self,
        count: u32,
        spec: ProvisionSpec,
    ) -> BoxFuture<'_, Result<Vec<Member>, ProviderError>> {
        Box::pin(self.run_instances(count, spec))
    }

    fn request_async_members(
        &self,
        count: u32,
        price: f64,
        spec: ProvisionSpec,
    ) -> BoxFuture<'_, Result<Vec<AsyncProvisionRequest>, ProviderError>> {
        Box::pin(self.place_spot_requests(count, price, spec))
    }

    fn poll_async_requests(
        &self,
        request_ids: Vec<String>,
    ) -> BoxFuture<'_, Result<Vec<AsyncProvisionRequest>, ProviderError>> {
        Box::pin(self.describe_spot_requests(request_ids))
    }

    fn terminate_members(
        &self,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<Vec<String>, ProviderError>> {
        Box::pin(self.terminate_instances(ids))
    }

    fn tag_members(
        &self,
        ids: Vec<String>,
        tags: BTreeMap<String, String>,
    ) -> BoxFuture<'_, Result<(), ProviderError>> {
        Box::pin(self.tag_instances(ids, tags))
    }

    fn resolve_security_group(
        &self,
        name: String,
        subnet: Option<String>,
    ) -> BoxFuture<'_, Result<String, ProviderError>> {
        Box::pin(self.lookup_security_group(name, subnet))
    }
}
