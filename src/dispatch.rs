use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::{
    executor::{ExecError, ExecTarget, Executor},
    fleet::FleetError,
    provider::{Member, Provider},
    roster::{Roster, RosterStore},
};

/// One thing to run on every member: a literal command, or a local payload
/// file to upload and execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Order {
    Command(String),
    Script(PathBuf),
}

impl Order {
    pub fn label(&self) -> String {
        match self {
            Self::Command(command) => command.clone(),
            Self::Script(path) => path.display().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderOutcome {
    Completed { output: String },
    /// The remote session itself failed; the member may never have seen the
    /// order.
    TransportFailed { message: String },
    /// Anything else that went wrong on this one member.
    Failed { message: String },
}

impl OrderOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Result of one fan-out round: exactly one outcome per target, even for
/// targets that failed.
#[derive(Debug, Clone)]
pub struct RoundReport {
    pub order: Order,
    pub results: BTreeMap<String, OrderOutcome>,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Size of the member snapshot the rounds ran against.
    pub targets: usize,
    pub rounds: Vec<RoundReport>,
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Ceiling on one member's execution within a round. `None` lets a hung
    /// session stall its worker until the session dies on its own.
    pub per_member_timeout: Option<Duration>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            per_member_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Fans orders out to every current member, one worker per member per round.
///
/// Rounds are strictly sequential: every command in the order given, then
/// every payload file in the order given, and round N+1 starts only after
/// every member of round N has a recorded outcome.
pub struct Dispatcher<'a> {
    store: &'a RosterStore,
    provider: &'a dyn Provider,
    executor: Arc<dyn Executor>,
    options: DispatchOptions,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        store: &'a RosterStore,
        provider: &'a dyn Provider,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self::with_options(store, provider, executor, DispatchOptions::default())
    }

    pub fn with_options(
        store: &'a RosterStore,
        provider: &'a dyn Provider,
        executor: Arc<dyn Executor>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            store,
            provider,
            executor,
            options,
        }
    }

    pub async fn dispatch(
        &self,
        orders: &[String],
        files: &[PathBuf],
    ) -> Result<DispatchReport, FleetError> {
        let Some(roster) = self.store.load()? else {
            return Ok(DispatchReport::default());
        };
        if roster.member_ids.is_empty() {
            return Ok(DispatchReport::default());
        }

        // One snapshot per dispatch call; every round runs against the same
        // read-only membership.
        let members = self.provider.list_members(roster.member_ids.clone()).await?;
        let mut report = DispatchReport {
            targets: members.len(),
            rounds: Vec::new(),
        };
        if members.is_empty() {
            return Ok(report);
        }

        for command in orders {
            let round = self
                .run_round(&roster, &members, Order::Command(command.clone()))
                .await;
            report.rounds.push(round);
        }
        for file in files {
            let round = self
                .run_round(&roster, &members, Order::Script(file.clone()))
                .await;
            report.rounds.push(round);
        }

        Ok(report)
    }

    /// Runs one order on every member concurrently and waits for the whole
    /// round. A failure on one member lands in that member's result slot and
    /// nowhere else.
    async fn run_round(&self, roster: &Roster, members: &[Member], order: Order) -> RoundReport {
        let mut ids = Vec::with_capacity(members.len());
        let mut workers = Vec::with_capacity(members.len());

        for (index, member) in members.iter().enumerate() {
            let executor = Arc::clone(&self.executor);
            let order = order.clone();
            let timeout = self.options.per_member_timeout;
            let target = ExecTarget {
                address: member.network_address.clone(),
                username: roster.owner_username.clone(),
                key_name: roster.credential_key_name.clone(),
            };

            ids.push(member.instance_id.clone());
            workers.push(tokio::spawn(async move {
                debug!(index, address = %target.address, "dispatching order to member");
                let work = match order {
                    Order::Command(command) => executor.run_command(target, command),
                    Order::Script(path) => executor.run_script(target, path),
                };
                let result = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, work).await {
                        Ok(result) => result,
                        Err(_) => Err(ExecError::Transport {
                            message: format!("no response within {limit:?}"),
                        }),
                    },
                    None => work.await,
                };
                match result {
                    Ok(output) => OrderOutcome::Completed { output },
                    Err(ExecError::Transport { message }) => {
                        OrderOutcome::TransportFailed { message }
                    }
                    Err(err) => OrderOutcome::Failed {
                        message: err.to_string(),
                    },
                }
            }));
        }

        let mut results = BTreeMap::new();
        for (instance_id, joined) in ids.into_iter().zip(join_all(workers).await) {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    warn!(%join_err, instance_id = %instance_id, "order worker join error");
                    OrderOutcome::Failed {
                        message: format!("worker join error: {join_err}"),
                    }
                }
            };
            results.insert(instance_id, outcome);
        }

        RoundReport { order, results }
    }
}
