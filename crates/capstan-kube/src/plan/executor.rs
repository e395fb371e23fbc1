//! Executor: drives the plan graph to a terminal state
//!
//! Ready operations (all predecessors completed) run on up to `workers`
//! tasks, picked in vertex-key order for reproducibility. The per-resource
//! mutex inside the client facade is the correctness boundary; worker count
//! is only a throughput knob.
//!
//! On the first failure nothing new is scheduled, in-flight siblings are
//! aborted, unstarted operations keep status `unknown` (reported as
//! canceled), and only the release-finalisation failure branch still runs.
//! Completed mutations are never reverted; rollback is a separate deploy
//! type initiated by the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use capstan_core::{Level, Logger};
use tokio::task::JoinSet;

use super::Plan;
use crate::error::{KubeError, Result};
use crate::operation::OperationType;

/// Executor configuration
#[derive(Clone, Default)]
pub struct ExecutorOptions {
    /// Maximum operations in flight; 0 and 1 both mean a single worker
    pub workers: usize,

    /// Receives `true` when the invocation should stop at the next
    /// suspension point
    pub cancel: Option<tokio::sync::watch::Receiver<bool>>,

    /// Collects the end-of-run operation report via grouped messages
    pub logger: Option<Arc<dyn Logger>>,
}

/// Drives one plan
pub struct PlanExecutor {
    options: ExecutorOptions,
}

impl PlanExecutor {
    pub fn new(options: ExecutorOptions) -> Self {
        Self { options }
    }

    /// Execute the graph; on failure the error aggregates the human IDs of
    /// every failed operation
    pub async fn execute(&self, plan: &Plan) -> Result<()> {
        let fail_branch = plan
            .operations()
            .into_iter()
            .find(|op| op.op_type() == OperationType::FailRelease);
        let fail_id = fail_branch.as_ref().map(|op| op.id());

        let mut indegree: BTreeMap<String, usize> = BTreeMap::new();
        let mut ready: BTreeSet<String> = BTreeSet::new();
        for op in plan.operations() {
            let id = op.id();
            if Some(&id) == fail_id.as_ref() {
                continue;
            }
            let preds = plan
                .predecessors(&id)
                .into_iter()
                .filter(|pred| Some(pred) != fail_id.as_ref())
                .count();
            if preds == 0 {
                ready.insert(id.clone());
            }
            indegree.insert(id, preds);
        }

        let workers = self.options.workers.max(1);
        let mut cancel = self.options.cancel.clone();
        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();
        let mut in_flight = 0usize;
        let mut first_error: Option<KubeError> = None;
        let mut canceled = false;

        loop {
            while first_error.is_none() && !canceled && in_flight < workers {
                let Some(id) = ready.iter().next().cloned() else {
                    break;
                };
                ready.remove(&id);

                let op = plan.operation(&id).expect("scheduled operation exists");
                tracing::debug!(operation = %op.human_id(), "starting operation");
                tasks.spawn(async move {
                    let result = op.execute().await;
                    (id, result)
                });
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }

            let mut watch_closed = false;
            let joined = match cancel.as_mut() {
                Some(rx) => tokio::select! {
                    joined = tasks.join_next() => Some(joined),
                    changed = rx.changed() => {
                        if changed.is_err() {
                            // Sender gone; nobody can cancel us anymore
                            watch_closed = true;
                        } else if *rx.borrow() && !canceled {
                            tracing::warn!("cancellation requested, aborting in-flight operations");
                            canceled = true;
                            tasks.abort_all();
                        }
                        None
                    }
                },
                None => Some(tasks.join_next().await),
            };
            if watch_closed {
                cancel = None;
            }
            let Some(joined) = joined else {
                continue;
            };

            match joined {
                Some(Ok((id, Ok(())))) => {
                    in_flight -= 1;
                    for succ in plan.successors(&id) {
                        if Some(&succ) == fail_id.as_ref() {
                            continue;
                        }
                        let remaining = indegree
                            .get_mut(&succ)
                            .expect("successor tracked in indegree map");
                        *remaining -= 1;
                        if *remaining == 0 {
                            ready.insert(succ);
                        }
                    }
                }
                Some(Ok((id, Err(err)))) => {
                    in_flight -= 1;
                    let human = plan
                        .operation(&id)
                        .map(|op| op.human_id())
                        .unwrap_or(id);
                    tracing::warn!(operation = %human, error = %err, "operation failed, canceling the rest of the plan");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    tasks.abort_all();
                }
                // Aborted sibling; its status stays unknown
                Some(Err(join_err)) => {
                    in_flight -= 1;
                    if join_err.is_panic() {
                        std::panic::resume_unwind(join_err.into_panic());
                    }
                }
                None => {
                    in_flight = 0;
                }
            }
        }

        if canceled && first_error.is_none() {
            first_error = Some(KubeError::Canceled);
        }

        let outcome = match first_error {
            None => Ok(()),
            Some(err) => {
                // Only the failure branch of release finalisation still runs,
                // and only once something actually happened
                let ran_any = !plan.completed_operations().is_empty()
                    || !plan.failed_operations().is_empty();
                if ran_any {
                    if let Some(op) = &fail_branch {
                        if let Err(fail_err) = op.execute().await {
                            tracing::error!(error = %fail_err, "failed to record release failure");
                        }
                    }
                }

                let failed = plan
                    .worthy_failed_operations()
                    .iter()
                    .filter(|op| op.op_type() != OperationType::FailRelease)
                    .map(|op| op.human_id())
                    .collect();
                Err(KubeError::ExecutionFailed {
                    failed,
                    source: Box::new(err),
                })
            }
        };

        self.report(plan);
        outcome
    }

    /// Push the per-operation outcome into logger groups and flush them
    fn report(&self, plan: &Plan) {
        let Some(logger) = &self.options.logger else {
            return;
        };

        for op in plan.worthy_completed_operations() {
            logger.push(Level::Info, "completed operations", &op.human_id());
        }
        for op in plan.worthy_failed_operations() {
            logger.push(Level::Error, "failed operations", &op.human_id());
        }
        for op in plan.worthy_canceled_operations() {
            logger.push(Level::Warn, "canceled operations", &op.human_id());
        }

        logger.pop(Level::Info, "completed operations");
        logger.pop(Level::Error, "failed operations");
        logger.pop(Level::Warn, "canceled operations");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::KubeClient;
    use crate::mapper::RestMapper;
    use crate::mock::{MockCluster, StaticMapper};
    use crate::operation::{
        CreateResourceOperation, OpStatus, Operation, ResourceOperationOptions, StageOperation,
        TrackReadinessOperation,
    };
    use crate::resource::ResourceID;
    use crate::track::TrackOptions;
    use std::time::Duration;

    fn setup() -> (Arc<MockCluster>, Arc<KubeClient>, Arc<dyn RestMapper>) {
        let cluster = Arc::new(MockCluster::new());
        let mapper: Arc<dyn RestMapper> = Arc::new(StaticMapper::with_builtins());
        let client = Arc::new(KubeClient::new(cluster.clone(), mapper.clone()));
        (cluster, client, mapper)
    }

    fn create_op(
        mapper: &Arc<dyn RestMapper>,
        client: &Arc<KubeClient>,
        name: &str,
    ) -> Operation {
        let id = ResourceID::new("", "v1", "ConfigMap", "app", name, mapper.clone());
        Operation::Create(CreateResourceOperation::new(
            id,
            MockCluster::object("v1", "ConfigMap", Some("app"), name),
            client.clone(),
            ResourceOperationOptions::default(),
        ))
    }

    #[tokio::test]
    async fn test_executes_all_operations_in_order() {
        let (cluster, client, mapper) = setup();

        let mut plan = Plan::new();
        plan.add_staged_operation(
            create_op(&mapper, &client, "a"),
            "stage/one:in",
            "stage/one:out",
        )
        .unwrap();
        plan.add_staged_operation(
            create_op(&mapper, &client, "b"),
            "stage/two:in",
            "stage/two:out",
        )
        .unwrap();
        plan.add_dependency("stage/one:out", "stage/two:in").unwrap();

        PlanExecutor::new(ExecutorOptions::default())
            .execute(&plan)
            .await
            .unwrap();

        assert!(cluster.contains("v1", "ConfigMap", "app", "a"));
        assert!(cluster.contains("v1", "ConfigMap", "app", "b"));
        for op in plan.operations() {
            assert_eq!(op.status(), OpStatus::Completed, "{} not completed", op.id());
        }
        assert!(plan.canceled_operations().is_empty());
    }

    #[tokio::test]
    async fn test_failure_cancels_unstarted_operations() {
        let (cluster, client, mapper) = setup();
        cluster.set_auto_ready(false);

        // Stage one applies a deployment that never becomes ready; stage two
        // must never start
        let deploy_id = ResourceID::new("apps", "v1", "Deployment", "app", "web", mapper.clone());
        let mut deploy_body = MockCluster::object("apps/v1", "Deployment", Some("app"), "web");
        deploy_body.data = serde_json::json!({"spec": {"replicas": 2}});

        let mut plan = Plan::new();
        let apply_id = plan
            .add_staged_operation(
                Operation::Create(CreateResourceOperation::new(
                    deploy_id.clone(),
                    deploy_body,
                    client.clone(),
                    ResourceOperationOptions::default(),
                )),
                "stage/one:in",
                "stage/one:out",
            )
            .unwrap()
            .id();
        let tracker_id = plan
            .add_staged_operation(
                Operation::TrackReadiness(TrackReadinessOperation::new(
                    deploy_id,
                    client.clone(),
                    TrackOptions {
                        timeout: Duration::from_millis(60),
                        poll_interval: Duration::from_millis(5),
                    },
                )),
                "stage/one:in",
                "stage/one:out",
            )
            .unwrap()
            .id();
        plan.add_dependency(&apply_id, &tracker_id).unwrap();

        let late_id = plan
            .add_staged_operation(
                create_op(&mapper, &client, "late"),
                "stage/two:in",
                "stage/two:out",
            )
            .unwrap()
            .id();
        plan.add_dependency("stage/one:out", "stage/two:in").unwrap();

        let err = PlanExecutor::new(ExecutorOptions::default())
            .execute(&plan)
            .await
            .unwrap_err();

        match err {
            KubeError::ExecutionFailed { failed, .. } => {
                assert_eq!(failed.len(), 1);
                assert!(failed[0].contains("track readiness"));
                assert!(failed[0].contains("Deployment"));
            }
            other => panic!("unexpected error: {}", other),
        }

        assert_eq!(
            plan.operation(&apply_id).unwrap().status(),
            OpStatus::Completed
        );
        assert_eq!(
            plan.operation(&tracker_id).unwrap().status(),
            OpStatus::Failed
        );
        assert_eq!(
            plan.operation(&late_id).unwrap().status(),
            OpStatus::Unknown,
            "unstarted operations stay unknown and report as canceled"
        );
        assert!(!cluster.contains("v1", "ConfigMap", "app", "late"));
        assert_eq!(plan.worthy_canceled_operations().len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_workers_complete_independent_operations() {
        let (cluster, client, mapper) = setup();

        let mut plan = Plan::new();
        for name in ["a", "b", "c", "d"] {
            plan.add_staged_operation(
                create_op(&mapper, &client, name),
                "stage/one:in",
                "stage/one:out",
            )
            .unwrap();
        }

        PlanExecutor::new(ExecutorOptions {
            workers: 4,
            ..Default::default()
        })
        .execute(&plan)
        .await
        .unwrap();

        assert_eq!(cluster.len(), 4);
    }

    #[tokio::test]
    async fn test_cancellation_surfaces_canceled_error() {
        let (cluster, client, mapper) = setup();
        cluster.set_auto_ready(false);

        // A tracker that would poll for a long time keeps the plan busy
        let deploy_id = ResourceID::new("apps", "v1", "Deployment", "app", "web", mapper.clone());
        let mut body = MockCluster::object("apps/v1", "Deployment", Some("app"), "web");
        body.data = serde_json::json!({"spec": {"replicas": 1}});
        cluster.seed(body);

        let mut plan = Plan::new();
        plan.add_operation(Operation::TrackReadiness(TrackReadinessOperation::new(
            deploy_id,
            client,
            TrackOptions {
                timeout: Duration::from_secs(30),
                poll_interval: Duration::from_millis(5),
            },
        )));
        plan.add_operation(Operation::Stage(StageOperation::new("stage/later:in")));

        let (tx, rx) = tokio::sync::watch::channel(false);
        let executor = PlanExecutor::new(ExecutorOptions {
            cancel: Some(rx),
            ..Default::default()
        });

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(true);
        });

        let err = executor.execute(&plan).await.unwrap_err();
        match err {
            KubeError::ExecutionFailed { source, .. } => {
                assert!(matches!(*source, KubeError::Canceled));
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
