use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::provider::{AsyncProvisionRequest, Member, Provider, ProviderError, RequestStatus};

#[derive(Debug, Clone)]
pub struct FulfillmentOptions {
    /// Delay between polls of the still-open request set.
    pub poll_interval: Duration,
    /// Overall deadline for the whole wait. `None` keeps polling until the
    /// provider resolves every request one way or the other.
    pub deadline: Option<Duration>,
}

impl Default for FulfillmentOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            deadline: None,
        }
    }
}

/// Converges a set of pending asynchronous provisioning requests into the
/// members they produced.
///
/// Fulfilled requests accumulate; requests the provider reports as terminally
/// failed are dropped with a warning, so the loop terminates as long as the
/// provider eventually resolves every request. The accumulated instance ids
/// are resolved into full member records in one batched lookup at the end.
pub async fn await_fulfillment(
    provider: &dyn Provider,
    requests: Vec<AsyncProvisionRequest>,
    options: &FulfillmentOptions,
) -> Result<Vec<Member>, ProviderError> {
    let mut open: Vec<String> = Vec::new();
    let mut fulfilled_instance_ids: Vec<String> = Vec::new();

    for request in requests {
        match request.status {
            RequestStatus::Open => open.push(request.request_id),
            _ => settle(request, &mut fulfilled_instance_ids),
        }
    }

    let started = Instant::now();
    while !open.is_empty() {
        if let Some(deadline) = options.deadline
            && started.elapsed() >= deadline
        {
            return Err(ProviderError::Provisioning(format!(
                "{} provisioning request(s) still open after {deadline:?}",
                open.len()
            )));
        }

        tokio::time::sleep(options.poll_interval).await;

        for request in provider.poll_async_requests(open.clone()).await? {
            if request.status != RequestStatus::Open {
                open.retain(|id| *id != request.request_id);
                settle(request, &mut fulfilled_instance_ids);
            }
        }

        debug!(
            open = open.len(),
            fulfilled = fulfilled_instance_ids.len(),
            "waiting for spot fulfillment"
        );
    }

    if fulfilled_instance_ids.is_empty() {
        return Ok(Vec::new());
    }
    provider.list_members(fulfilled_instance_ids).await
}

/// Records a request the provider has resolved, one way or the other.
fn settle(request: AsyncProvisionRequest, fulfilled: &mut Vec<String>) {
    match request.status {
        RequestStatus::Open => unreachable!("settle called on an open request"),
        RequestStatus::Fulfilled => match request.resulting_instance_id {
            Some(instance_id) => {
                debug!(request_id = %request.request_id, instance_id = %instance_id, "spot request fulfilled");
                if !fulfilled.contains(&instance_id) {
                    fulfilled.push(instance_id);
                }
            }
            None => {
                warn!(request_id = %request.request_id, "fulfilled request carried no instance id; dropping");
            }
        },
        RequestStatus::Failed => {
            warn!(request_id = %request.request_id, "provisioning request failed; dropping");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};

    use pretty_assertions::assert_eq;
    use tokio::sync::Mutex;

    use super::*;
    use crate::provider::{BoxFuture, LifecycleState, ProvisionSpec};

    fn open(id: &str) -> AsyncProvisionRequest {
        AsyncProvisionRequest {
            request_id: id.to_string(),
            status: RequestStatus::Open,
            resulting_instance_id: None,
        }
    }

    fn fulfilled(id: &str, instance_id: &str) -> AsyncProvisionRequest {
        AsyncProvisionRequest {
            request_id: id.to_string(),
            status: RequestStatus::Fulfilled,
            resulting_instance_id: Some(instance_id.to_string()),
        }
    }

    fn failed(id: &str) -> AsyncProvisionRequest {
        AsyncProvisionRequest {
            request_id: id.to_string(),
            status: RequestStatus::Failed,
            resulting_instance_id: None,
        }
    }

    fn member(instance_id: &str) -> Member {
        Member {
            instance_id: instance_id.to_string(),
            network_address: format!("{instance_id}.test"),
            lifecycle_state: LifecycleState::Running,
            request_id: None,
        }
    }

    /// Provider whose poll answers are scripted per cycle; once the script is
    /// exhausted every remaining request stays open.
    struct ScriptedProvider {
        polls: Mutex<VecDeque<Vec<AsyncProvisionRequest>>>,
        members: Vec<Member>,
        poll_count: Mutex<usize>,
        list_calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedProvider {
        fn new(polls: Vec<Vec<AsyncProvisionRequest>>, members: Vec<Member>) -> Self {
            Self {
                polls: Mutex::new(polls.into()),
                members,
                poll_count: Mutex::new(0),
                list_calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Provider for ScriptedProvider {
        fn list_members(
            &self,
            ids: Vec<String>,
        ) -> BoxFuture<'_, Result<Vec<Member>, ProviderError>> {
            Box::pin(async move {
                self.list_calls.lock().await.push(ids.clone());
                Ok(self
                    .members
                    .iter()
                    .filter(|m| ids.contains(&m.instance_id))
                    .cloned()
                    .collect())
            })
        }

        fn poll_async_requests(
            &self,
            request_ids: Vec<String>,
        ) -> BoxFuture<'_, Result<Vec<AsyncProvisionRequest>, ProviderError>> {
            Box::pin(async move {
                *self.poll_count.lock().await += 1;
                match self.polls.lock().await.pop_front() {
                    Some(answer) => Ok(answer),
                    None => Ok(request_ids.into_iter().map(|id| open(&id)).collect()),
                }
            })
        }

        fn create_members(
            &self,
            _count: u32,
            _spec: ProvisionSpec,
        ) -> BoxFuture<'_, Result<Vec<Member>, ProviderError>> {
            panic!("unexpected create_members call")
        }

        fn request_async_members(
            &self,
            _count: u32,
            _price: f64,
            _spec: ProvisionSpec,
        ) -> BoxFuture<'_, Result<Vec<AsyncProvisionRequest>, ProviderError>> {
            panic!("unexpected request_async_members call")
        }

        fn terminate_members(
            &self,
            _ids: Vec<String>,
        ) -> BoxFuture<'_, Result<Vec<String>, ProviderError>> {
            panic!("unexpected terminate_members call")
        }

        fn tag_members(
            &self,
            _ids: Vec<String>,
            _tags: BTreeMap<String, String>,
        ) -> BoxFuture<'_, Result<(), ProviderError>> {
            panic!("unexpected tag_members call")
        }

        fn resolve_security_group(
            &self,
            _name: String,
            _subnet: Option<String>,
        ) -> BoxFuture<'_, Result<String, ProviderError>> {
            panic!("unexpected resolve_security_group call")
        }
    }

    fn fast_options() -> FulfillmentOptions {
        FulfillmentOptions {
            poll_interval: Duration::from_millis(1),
            deadline: None,
        }
    }

    #[tokio::test]
    async fn converges_once_every_request_is_fulfilled() {
        let provider = ScriptedProvider::new(
            vec![
                vec![fulfilled("sir-1", "i-1"), open("sir-2")],
                vec![fulfilled("sir-2", "i-2")],
            ],
            vec![member("i-1"), member("i-2")],
        );

        let members = await_fulfillment(
            &provider,
            vec![open("sir-1"), open("sir-2")],
            &fast_options(),
        )
        .await
        .unwrap();

        assert_eq!(members.len(), 2);
        assert_eq!(*provider.poll_count.lock().await, 2);
        assert_eq!(
            provider.list_calls.lock().await.clone(),
            vec![vec!["i-1".to_string(), "i-2".to_string()]]
        );
    }

    #[tokio::test]
    async fn failed_requests_are_dropped_without_stalling_the_loop() {
        let provider = ScriptedProvider::new(
            vec![vec![fulfilled("sir-1", "i-1"), failed("sir-2")]],
            vec![member("i-1")],
        );

        let members = await_fulfillment(
            &provider,
            vec![open("sir-1"), open("sir-2")],
            &fast_options(),
        )
        .await
        .unwrap();

        assert_eq!(members, vec![member("i-1")]);
    }

    #[tokio::test]
    async fn already_resolved_requests_need_no_polling() {
        let provider = ScriptedProvider::new(Vec::new(), vec![member("i-1")]);

        let members = await_fulfillment(
            &provider,
            vec![fulfilled("sir-1", "i-1"), failed("sir-2")],
            &fast_options(),
        )
        .await
        .unwrap();

        assert_eq!(members, vec![member("i-1")]);
        assert_eq!(*provider.poll_count.lock().await, 0);
    }

    #[tokio::test]
    async fn no_requests_means_no_members_and_no_lookup() {
        let provider = ScriptedProvider::new(Vec::new(), Vec::new());

        let members = await_fulfillment(&provider, Vec::new(), &fast_options())
            .await
            .unwrap();

        assert_eq!(members, Vec::new());
        assert!(provider.list_calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn deadline_turns_a_stuck_request_into_an_error() {
        let provider = ScriptedProvider::new(Vec::new(), Vec::new());
        let options = FulfillmentOptions {
            poll_interval: Duration::from_millis(1),
            deadline: Some(Duration::from_millis(10)),
        };

        let err = await_fulfillment(&provider, vec![open("sir-1")], &options)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Provisioning(_)), "{err}");
    }
}
