//! Resource state tracking
//!
//! Trackers poll the cluster through the client facade until a resource
//! reaches the awaited state or the per-resource timeout expires. Readiness
//! rules are kind-specific for the workload kinds and fall back to the
//! conventional `Ready` condition, then to bare existence for inert kinds
//! like ConfigMaps and Services.

use std::time::Duration;

use kube::api::DynamicObject;

use crate::client::{GetOptions, KubeClient};
use crate::error::{KubeError, Result};
use crate::resource::ResourceID;

/// Poll budget for one tracking operation
#[derive(Debug, Clone, Copy)]
pub struct TrackOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for TrackOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Readiness verdict for one observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Readiness {
    Ready,
    Pending(String),
    /// The resource can no longer become ready (failed Job, failed Pod)
    Doomed(String),
}

/// Block until the resource reports ready
pub async fn wait_ready(
    client: &KubeClient,
    resource: &ResourceID,
    opts: TrackOptions,
) -> Result<()> {
    let what = format!("{} to become ready", resource.human_id());

    with_deadline(&what, opts.timeout, async {
        loop {
            match client.get(resource, GetOptions::default()).await {
                Ok(obj) => match readiness_of(&obj) {
                    Readiness::Ready => return Ok(()),
                    Readiness::Pending(reason) => {
                        tracing::trace!(resource = %resource.human_id(), %reason, "resource not ready yet");
                    }
                    Readiness::Doomed(reason) => {
                        return Err(KubeError::TrackFailed {
                            what: resource.human_id(),
                            reason,
                        });
                    }
                },
                Err(err) if err.is_not_found() => {
                    tracing::trace!(resource = %resource.human_id(), "resource not created yet");
                }
                Err(err) => return Err(err),
            }

            tokio::time::sleep(opts.poll_interval).await;
        }
    })
    .await
}

/// Block until the resource exists
pub async fn wait_present(
    client: &KubeClient,
    resource: &ResourceID,
    opts: TrackOptions,
) -> Result<()> {
    let what = format!("{} to appear", resource.human_id());

    with_deadline(&what, opts.timeout, async {
        loop {
            match client.get(resource, GetOptions::default()).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }

            tokio::time::sleep(opts.poll_interval).await;
        }
    })
    .await
}

/// Block until the resource no longer exists
pub async fn wait_absent(
    client: &KubeClient,
    resource: &ResourceID,
    opts: TrackOptions,
) -> Result<()> {
    let what = format!("{} to disappear", resource.human_id());

    with_deadline(&what, opts.timeout, async {
        loop {
            match client.get(resource, GetOptions::default()).await {
                Ok(_) => {}
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err),
            }

            tokio::time::sleep(opts.poll_interval).await;
        }
    })
    .await
}

async fn with_deadline(
    what: &str,
    timeout: Duration,
    wait: impl std::future::Future<Output = Result<()>>,
) -> Result<()> {
    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(KubeError::TrackTimeout {
            what: what.to_string(),
            after: timeout,
        }),
    }
}

pub(crate) fn readiness_of(obj: &DynamicObject) -> Readiness {
    let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("");
    let data = &obj.data;

    match kind {
        "Deployment" | "StatefulSet" | "ReplicaSet" => {
            let desired = data["spec"]["replicas"].as_i64().unwrap_or(1);
            let ready = data["status"]["readyReplicas"].as_i64().unwrap_or(0);
            if ready >= desired {
                Readiness::Ready
            } else {
                Readiness::Pending(format!("{}/{} replicas ready", ready, desired))
            }
        }
        "DaemonSet" => {
            let desired = data["status"]["desiredNumberScheduled"].as_i64().unwrap_or(0);
            let ready = data["status"]["numberReady"].as_i64().unwrap_or(0);
            if ready >= desired {
                Readiness::Ready
            } else {
                Readiness::Pending(format!("{}/{} pods ready", ready, desired))
            }
        }
        "Job" => {
            if condition_status(data, "Complete") == Some(true) {
                Readiness::Ready
            } else if condition_status(data, "Failed") == Some(true) {
                Readiness::Doomed("job failed".to_string())
            } else if data["status"]["succeeded"].as_i64().unwrap_or(0) > 0 {
                Readiness::Ready
            } else {
                Readiness::Pending("job not complete".to_string())
            }
        }
        "Pod" => match data["status"]["phase"].as_str() {
            Some("Succeeded") => Readiness::Ready,
            Some("Failed") => Readiness::Doomed("pod failed".to_string()),
            Some("Running") if condition_status(data, "Ready") == Some(true) => Readiness::Ready,
            phase => Readiness::Pending(format!("pod phase {}", phase.unwrap_or("unknown"))),
        },
        "PersistentVolumeClaim" => match data["status"]["phase"].as_str() {
            Some("Bound") => Readiness::Ready,
            phase => Readiness::Pending(format!("claim phase {}", phase.unwrap_or("Pending"))),
        },
        "Service" => {
            if data["spec"]["type"].as_str() == Some("LoadBalancer") {
                let has_ingress = data["status"]["loadBalancer"]["ingress"]
                    .as_array()
                    .map(|i| !i.is_empty())
                    .unwrap_or(false);
                if has_ingress {
                    Readiness::Ready
                } else {
                    Readiness::Pending("load balancer not provisioned".to_string())
                }
            } else {
                Readiness::Ready
            }
        }
        _ => match condition_status(data, "Ready") {
            Some(true) | None => Readiness::Ready,
            Some(false) => Readiness::Pending("Ready condition is false".to_string()),
        },
    }
}

fn condition_status(data: &serde_json::Value, condition_type: &str) -> Option<bool> {
    data["status"]["conditions"]
        .as_array()?
        .iter()
        .find(|c| c["type"].as_str() == Some(condition_type))
        .map(|c| c["status"].as_str() == Some("True"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCluster;

    fn object_with(kind: &str, data: serde_json::Value) -> DynamicObject {
        let mut obj = MockCluster::object("apps/v1", kind, Some("app"), "x");
        obj.data = data;
        obj
    }

    #[test]
    fn test_deployment_readiness() {
        let ready = object_with(
            "Deployment",
            serde_json::json!({"spec": {"replicas": 2}, "status": {"readyReplicas": 2}}),
        );
        assert_eq!(readiness_of(&ready), Readiness::Ready);

        let pending = object_with(
            "Deployment",
            serde_json::json!({"spec": {"replicas": 2}, "status": {"readyReplicas": 1}}),
        );
        assert!(matches!(readiness_of(&pending), Readiness::Pending(_)));

        // No replicas in spec means one is desired
        let default_replicas = object_with("Deployment", serde_json::json!({"status": {}}));
        assert!(matches!(readiness_of(&default_replicas), Readiness::Pending(_)));
    }

    #[test]
    fn test_job_readiness() {
        let complete = object_with(
            "Job",
            serde_json::json!({"status": {"conditions": [{"type": "Complete", "status": "True"}]}}),
        );
        assert_eq!(readiness_of(&complete), Readiness::Ready);

        let failed = object_with(
            "Job",
            serde_json::json!({"status": {"conditions": [{"type": "Failed", "status": "True"}]}}),
        );
        assert!(matches!(readiness_of(&failed), Readiness::Doomed(_)));

        let running = object_with("Job", serde_json::json!({"status": {"active": 1}}));
        assert!(matches!(readiness_of(&running), Readiness::Pending(_)));
    }

    #[test]
    fn test_pod_readiness() {
        let failed = object_with("Pod", serde_json::json!({"status": {"phase": "Failed"}}));
        assert!(matches!(readiness_of(&failed), Readiness::Doomed(_)));

        let succeeded = object_with("Pod", serde_json::json!({"status": {"phase": "Succeeded"}}));
        assert_eq!(readiness_of(&succeeded), Readiness::Ready);
    }

    #[test]
    fn test_inert_kinds_are_ready_when_present() {
        let configmap = object_with("ConfigMap", serde_json::json!({"data": {"k": "v"}}));
        assert_eq!(readiness_of(&configmap), Readiness::Ready);

        let service = object_with(
            "Service",
            serde_json::json!({"spec": {"type": "ClusterIP"}}),
        );
        assert_eq!(readiness_of(&service), Readiness::Ready);
    }

    #[test]
    fn test_generic_ready_condition() {
        let ready = object_with(
            "Widget",
            serde_json::json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}}),
        );
        assert_eq!(readiness_of(&ready), Readiness::Ready);

        let not_ready = object_with(
            "Widget",
            serde_json::json!({"status": {"conditions": [{"type": "Ready", "status": "False"}]}}),
        );
        assert!(matches!(readiness_of(&not_ready), Readiness::Pending(_)));
    }
}
