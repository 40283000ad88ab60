use std::{collections::BTreeMap, time::Duration};

use chrono::{SecondsFormat, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    fulfillment::{FulfillmentOptions, await_fulfillment},
    provider::{LifecycleState, Member, Provider, ProviderError, ProvisionSpec},
    roster::{Roster, RosterError, RosterStore},
};

pub const FLEET_TAG_KEY: &str = "Name";
pub const FLEET_TAG_VALUE: &str = "anthive member";

#[derive(Debug)]
pub enum FleetError {
    Roster(RosterError),
    Provider(ProviderError),
}

impl std::fmt::Display for FleetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Roster(e) => write!(f, "{e}"),
            Self::Provider(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for FleetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Roster(e) => Some(e),
            Self::Provider(e) => Some(e),
        }
    }
}

impl From<RosterError> for FleetError {
    fn from(value: RosterError) -> Self {
        Self::Roster(value)
    }
}

impl From<ProviderError> for FleetError {
    fn from(value: ProviderError) -> Self {
        Self::Provider(value)
    }
}

/// Region behind a zone descriptor: the trailing placement suffix is dropped,
/// except in sovereign partitions where zone and region are the same string.
pub fn region_for_zone(zone: &str) -> &str {
    if zone.contains("gov") {
        return zone;
    }
    let mut chars = zone.chars();
    chars.next_back();
    chars.as_str()
}

/// Placement sent to the provider; sovereign partitions take none.
pub fn placement_for_zone(zone: &str) -> Option<&str> {
    if zone.contains("gov") { None } else { Some(zone) }
}

#[derive(Debug, Clone)]
pub struct EnsureFleetRequest {
    pub desired_count: u32,
    pub owner_username: String,
    pub credential_key_name: String,
    pub zone: String,
    pub image: String,
    pub instance_type: String,
    pub group: String,
    pub subnet: Option<String>,
    pub bid: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct EnsureFleetOutcome {
    pub roster: Roster,
    pub reused: usize,
    pub created: usize,
    /// Previously tracked members the provider no longer reported as running.
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// Delay between run-state polls of newly created members.
    pub run_poll_interval: Duration,
    /// Grace period between placing spot requests and the first poll;
    /// freshly placed requests are not always visible yet.
    pub spot_settle_delay: Duration,
    pub fulfillment: FulfillmentOptions,
    /// Overall deadline for run-state convergence. `None` blocks until the
    /// provider either runs or kills every pending member.
    pub convergence_deadline: Option<Duration>,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            run_poll_interval: Duration::from_secs(5),
            spot_settle_delay: Duration::from_secs(5),
            fulfillment: FulfillmentOptions::default(),
            convergence_deadline: None,
        }
    }
}

/// Drives the fleet toward the requested size, reusing running members from a
/// prior run when the request identity matches and rebuilding from scratch
/// when it does not.
pub struct FleetReconciler<'a> {
    store: &'a RosterStore,
    provider: &'a dyn Provider,
    options: ReconcilerOptions,
}

impl<'a> FleetReconciler<'a> {
    pub fn new(store: &'a RosterStore, provider: &'a dyn Provider) -> Self {
        Self::with_options(store, provider, ReconcilerOptions::default())
    }

    pub fn with_options(
        store: &'a RosterStore,
        provider: &'a dyn Provider,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            store,
            provider,
            options,
        }
    }

    pub async fn ensure_fleet(
        &self,
        req: EnsureFleetRequest,
    ) -> Result<EnsureFleetOutcome, FleetError> {
        let mut reused: Vec<Member> = Vec::new();
        let mut dropped = 0usize;

        match self.store.load()? {
            Some(existing)
                if existing.identity_matches(
                    &req.owner_username,
                    &req.credential_key_name,
                    &req.zone,
                ) =>
            {
                if !existing.member_ids.is_empty() {
                    let known = self
                        .provider
                        .list_members(existing.member_ids.clone())
                        .await?;
                    reused = known
                        .into_iter()
                        .filter(|m| m.lifecycle_state.is_running())
                        .collect();
                    dropped = existing.member_ids.len() - reused.len();
                    if dropped > 0 {
                        info!(dropped, "dropping members the provider no longer reports as running");
                    }
                }
            }
            Some(existing) => {
                // The roster tracks exactly one owner/key/zone combination, so
                // a fleet raised under a different identity is unusable here.
                info!(
                    members = existing.member_ids.len(),
                    "existing fleet identity does not match request; standing it down"
                );
                self.terminate_fleet().await?;
            }
            None => {}
        }

        let desired = req.desired_count as usize;
        if desired <= reused.len() {
            info!(members = reused.len(), "fleet already assembled and awaiting orders");
            let roster = self.persist(&req, &reused, &[])?;
            return Ok(EnsureFleetOutcome {
                roster,
                reused: reused.len(),
                created: 0,
                dropped,
            });
        }
        let remaining = (desired - reused.len()) as u32;

        // Resolve everything that can fail before any resource is created.
        let security_group_ids = match &req.subnet {
            Some(subnet) => {
                let id = self
                    .provider
                    .resolve_security_group(req.group.clone(), Some(subnet.clone()))
                    .await?;
                debug!(group = %req.group, id = %id, "resolved security group");
                vec![id]
            }
            None => vec![req.group.clone()],
        };

        let spec = ProvisionSpec {
            image: req.image.clone(),
            instance_type: req.instance_type.clone(),
            key_name: req.credential_key_name.clone(),
            security_group_ids,
            placement: placement_for_zone(&req.zone).map(str::to_owned),
            subnet_id: req.subnet.clone(),
        };

        let mut created = match req.bid {
            Some(price) => {
                info!(count = remaining, price, "requesting spot members");
                let requests = self
                    .provider
                    .request_async_members(remaining, price, spec)
                    .await?;
                tokio::time::sleep(self.options.spot_settle_delay).await;
                await_fulfillment(self.provider, requests, &self.options.fulfillment).await?
            }
            None => {
                info!(count = remaining, "creating members");
                self.provider.create_members(remaining, spec).await?
            }
        };

        self.wait_until_running(&mut created).await?;

        let all_ids: Vec<String> = reused
            .iter()
            .chain(&created)
            .map(|m| m.instance_id.clone())
            .collect();
        if !all_ids.is_empty() {
            let mut tags = BTreeMap::new();
            tags.insert(FLEET_TAG_KEY.to_string(), FLEET_TAG_VALUE.to_string());
            tags.insert(
                "anthive:assembled-at".to_string(),
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            );
            if let Err(err) = self.provider.tag_members(all_ids, tags).await {
                warn!(error = %err, "failed to tag fleet members");
            }
        }

        let roster = self.persist(&req, &reused, &created)?;
        info!(members = roster.member_ids.len(), "fleet assembled");
        Ok(EnsureFleetOutcome {
            roster,
            reused: reused.len(),
            created: created.len(),
            dropped,
        })
    }

    /// Requests termination of every tracked member and clears the roster
    /// regardless of how the provider answered. Returns the number of members
    /// the provider acknowledged terminating.
    pub async fn terminate_fleet(&self) -> Result<usize, FleetError> {
        let Some(roster) = self.store.load()? else {
            return Ok(0);
        };

        let count = if roster.member_ids.is_empty() {
            0
        } else {
            match self
                .provider
                .terminate_members(roster.member_ids.clone())
                .await
            {
                Ok(terminated) => terminated.len(),
                Err(err) => {
                    warn!(error = %err, "provider failed to terminate members; clearing roster anyway");
                    0
                }
            }
        };

        self.store.clear()?;
        Ok(count)
    }

    /// Current provider-side view of every tracked member, reported verbatim.
    pub async fn report_fleet(&self) -> Result<Vec<Member>, FleetError> {
        let Some(roster) = self.store.load()? else {
            return Ok(Vec::new());
        };
        if roster.member_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.provider.list_members(roster.member_ids).await?)
    }

    /// Polls until no created member is still pending. Members the provider
    /// kills or forgets before they reach running are dropped, never waited
    /// on forever.
    async fn wait_until_running(&self, members: &mut Vec<Member>) -> Result<(), FleetError> {
        let deadline = self
            .options
            .convergence_deadline
            .map(|d| Instant::now() + d);

        loop {
            let pending: Vec<String> = members
                .iter()
                .filter(|m| m.lifecycle_state == LifecycleState::Pending)
                .map(|m| m.instance_id.clone())
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            if let Some(at) = deadline
                && Instant::now() >= at
            {
                return Err(FleetError::Provider(ProviderError::Provisioning(format!(
                    "{} member(s) still pending at the convergence deadline",
                    pending.len()
                ))));
            }

            tokio::time::sleep(self.options.run_poll_interval).await;

            let refreshed: BTreeMap<String, Member> = self
                .provider
                .list_members(pending)
                .await?
                .into_iter()
                .map(|m| (m.instance_id.clone(), m))
                .collect();

            members.retain_mut(|m| {
                if m.lifecycle_state != LifecycleState::Pending {
                    return true;
                }
                match refreshed.get(&m.instance_id) {
                    Some(fresh) if fresh.lifecycle_state == LifecycleState::Terminated => {
                        warn!(instance_id = %m.instance_id, "member terminated before reaching running; dropping");
                        false
                    }
                    Some(fresh) => {
                        if fresh.lifecycle_state.is_running() {
                            info!(instance_id = %m.instance_id, "member is ready");
                        }
                        *m = fresh.clone();
                        true
                    }
                    None => {
                        warn!(instance_id = %m.instance_id, "provider no longer reports member; dropping");
                        false
                    }
                }
            });
        }
    }

    /// Writes the merged membership under the request identity; an empty
    /// membership clears the roster instead, since an empty roster must
    /// never be persisted.
    fn persist(
        &self,
        req: &EnsureFleetRequest,
        reused: &[Member],
        created: &[Member],
    ) -> Result<Roster, RosterError> {
        let member_ids: Vec<String> = reused
            .iter()
            .chain(created)
            .map(|m| m.instance_id.clone())
            .collect();
        let roster = Roster {
            owner_username: req.owner_username.clone(),
            credential_key_name: req.credential_key_name.clone(),
            zone: req.zone.clone(),
            member_ids,
        };
        if roster.member_ids.is_empty() {
            self.store.clear()?;
        } else {
            self.store.save(&roster)?;
        }
        Ok(roster)
    }
}
