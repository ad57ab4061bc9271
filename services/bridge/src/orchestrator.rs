//! Production `Orchestrator` backed by the in-cluster Kubernetes API.
//!
//! Job/Secret/ConfigMap lifecycle is a genuinely new external collaborator
//! for this codebase; `kube` is the crate the wider ecosystem reaches for
//! here.

use std::collections::HashMap;

use bridge_proto::WorkloadStatus;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;

use crate::error::BridgeError;
use crate::update::{ClusterMetadata, JobOutcome, Orchestrator};

type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

pub struct KubeOrchestrator {
    client: Client,
    namespace: String,
    cluster_uid: String,
    cluster_name: String,
    cluster_version: String,
    local_address: String,
    local_port: u16,
    identity_configmap: String,
}

impl KubeOrchestrator {
    /// Connects to the in-cluster API and discovers everything about cluster
    /// identity that the API server itself can report: the `kube-system`
    /// namespace's UID stands in as the cluster UID (it is assigned once at
    /// cluster creation and never changes, the way several cluster-identity
    /// tools in the ecosystem key off it), and the server's own version
    /// endpoint gives the Kubernetes version. `cluster_name` has no such
    /// in-cluster source — it is operator-assigned and must come from the
    /// caller.
    pub async fn new(
        namespace: String,
        cluster_name: String,
        local_address: String,
        local_port: u16,
        identity_configmap: String,
    ) -> Result<Self, BridgeError> {
        let client = Client::try_default()
            .await
            .map_err(|e| BridgeError::ConnectFailed(format!("kube client: {e}")))?;

        let namespaces: Api<Namespace> = Api::all(client.clone());
        let kube_system = namespaces
            .get("kube-system")
            .await
            .map_err(|e| BridgeError::ConnectFailed(format!("discover cluster uid: {e}")))?;
        let cluster_uid = kube_system
            .metadata
            .uid
            .ok_or_else(|| BridgeError::ConnectFailed("kube-system namespace has no uid".to_owned()))?;

        let version_info = client
            .apiserver_version()
            .await
            .map_err(|e| BridgeError::ConnectFailed(format!("discover cluster version: {e}")))?;

        Ok(Self {
            client,
            namespace,
            cluster_uid,
            cluster_name,
            cluster_version: version_info.git_version,
            local_address,
            local_port,
            identity_configmap,
        })
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn configmaps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

impl Orchestrator for KubeOrchestrator {
    fn local_address<'a>(&'a self) -> BoxFuture<'a, Result<(String, u16), BridgeError>> {
        Box::pin(async move { Ok((self.local_address.clone(), self.local_port)) })
    }

    fn cluster_metadata<'a>(&'a self) -> BoxFuture<'a, Result<ClusterMetadata, BridgeError>> {
        Box::pin(async move {
            Ok(ClusterMetadata {
                uid: self.cluster_uid.clone(),
                name: self.cluster_name.clone(),
                version: self.cluster_version.clone(),
            })
        })
    }

    fn workload_state<'a>(
        &'a self,
    ) -> BoxFuture<'a, Result<(u32, Vec<WorkloadStatus>), BridgeError>> {
        Box::pin(async move {
            let nodes: Api<k8s_openapi::api::core::v1::Node> = Api::all(self.client.clone());
            let node_count = nodes
                .list(&ListParams::default())
                .await
                .map_err(|e| BridgeError::UpdateLaunch(format!("list nodes: {e}")))?
                .items
                .len() as u32;

            let pods: Api<k8s_openapi::api::core::v1::Pod> =
                Api::namespaced(self.client.clone(), &self.namespace);
            let workloads = pods
                .list(&ListParams::default())
                .await
                .map_err(|e| BridgeError::UpdateLaunch(format!("list pods: {e}")))?
                .items
                .into_iter()
                .filter_map(|pod| {
                    let name = pod.metadata.name?;
                    let phase = pod
                        .status
                        .as_ref()
                        .and_then(|s| s.phase.clone())
                        .unwrap_or_else(|| "Unknown".to_owned());
                    Some(WorkloadStatus {
                        name,
                        status: phase,
                        last_updated_unix_secs: 0,
                    })
                })
                .collect();

            Ok((node_count, workloads))
        })
    }

    fn render_job_manifest<'a>(
        &'a self,
        template: &'a str,
        substitutions: &'a HashMap<String, String>,
    ) -> BoxFuture<'a, Result<String, BridgeError>> {
        Box::pin(async move { Ok(crate::update::render_template(template, substitutions)) })
    }

    fn launch_job<'a>(&'a self, manifest: &'a str) -> BoxFuture<'a, Result<(), BridgeError>> {
        Box::pin(async move {
            let job: Job = parse_job_manifest(manifest)
                .map_err(|e| BridgeError::UpdateLaunch(format!("parse job manifest: {e}")))?;
            self.jobs()
                .create(&PostParams::default(), &job)
                .await
                .map_err(|e| BridgeError::UpdateLaunch(e.to_string()))?;
            Ok(())
        })
    }

    fn get_job<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, BridgeError>> {
        Box::pin(async move {
            match self.jobs().get_opt(name).await {
                Ok(job) => Ok(job.is_some()),
                Err(e) => Err(BridgeError::UpdateLaunch(e.to_string())),
            }
        })
    }

    fn wait_job_completion<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<JobOutcome, BridgeError>> {
        Box::pin(async move {
            loop {
                let job = self
                    .jobs()
                    .get(name)
                    .await
                    .map_err(|e| BridgeError::UpdateLaunch(e.to_string()))?;
                if let Some(status) = job.status {
                    if status.succeeded.unwrap_or(0) > 0 {
                        return Ok(JobOutcome::Success);
                    }
                    if status.failed.unwrap_or(0) > 0 {
                        return Ok(JobOutcome::Failure);
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        })
    }

    fn delete_job<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), BridgeError>> {
        Box::pin(async move {
            self.jobs()
                .delete(name, &DeleteParams::background())
                .await
                .map_err(|e| BridgeError::UpdateLaunch(e.to_string()))?;
            Ok(())
        })
    }

    fn create_secret<'a>(
        &'a self,
        name: &'a str,
        data: &'a HashMap<String, String>,
    ) -> BoxFuture<'a, Result<(), BridgeError>> {
        Box::pin(async move {
            let mut string_data = std::collections::BTreeMap::new();
            for (k, v) in data {
                string_data.insert(k.clone(), v.clone());
            }
            let secret = Secret {
                metadata: kube::api::ObjectMeta {
                    name: Some(name.to_owned()),
                    ..Default::default()
                },
                string_data: Some(string_data),
                ..Default::default()
            };

            let api = self.secrets();
            match api.get_opt(name).await {
                Ok(Some(_)) => {
                    api.replace(name, &PostParams::default(), &secret)
                        .await
                        .map_err(|e| BridgeError::UpdateSecret(e.to_string()))?;
                }
                Ok(None) => {
                    api.create(&PostParams::default(), &secret)
                        .await
                        .map_err(|e| BridgeError::UpdateSecret(e.to_string()))?;
                }
                Err(e) => return Err(BridgeError::UpdateSecret(e.to_string())),
            }
            Ok(())
        })
    }

    fn persist_cluster_id<'a>(&'a self, id: uuid::Uuid) -> BoxFuture<'a, Result<(), BridgeError>> {
        Box::pin(async move {
            let mut data = std::collections::BTreeMap::new();
            data.insert("vizier_id".to_owned(), id.to_string());
            let cm = ConfigMap {
                metadata: kube::api::ObjectMeta {
                    name: Some(self.identity_configmap.clone()),
                    ..Default::default()
                },
                data: Some(data),
                ..Default::default()
            };
            let api = self.configmaps();
            match api.get_opt(&self.identity_configmap).await {
                Ok(Some(_)) => {
                    api.replace(&self.identity_configmap, &PostParams::default(), &cm)
                        .await
                        .map_err(|e| BridgeError::UpdateLaunch(format!("persist cluster id: {e}")))?;
                }
                Ok(None) => {
                    api.create(&PostParams::default(), &cm)
                        .await
                        .map_err(|e| BridgeError::UpdateLaunch(format!("persist cluster id: {e}")))?;
                }
                Err(e) => return Err(BridgeError::UpdateLaunch(format!("persist cluster id: {e}"))),
            }
            Ok(())
        })
    }
}

/// Read a persisted cluster identity back out of the identity configmap at
/// startup, if one exists.
pub async fn load_persisted_identity(
    orchestrator: &KubeOrchestrator,
) -> Result<Option<uuid::Uuid>, BridgeError> {
    let api = orchestrator.configmaps();
    let cm = api
        .get_opt(&orchestrator.identity_configmap)
        .await
        .map_err(|e| BridgeError::UpdateLaunch(format!("read cluster id: {e}")))?;
    let Some(cm) = cm else { return Ok(None) };
    let Some(data) = cm.data else { return Ok(None) };
    let Some(raw) = data.get("vizier_id") else {
        return Ok(None);
    };
    uuid::Uuid::parse_str(raw)
        .map(Some)
        .map_err(|e| BridgeError::UpdateLaunch(format!("corrupt persisted cluster id: {e}")))
}

/// Job manifests are rendered as JSON rather than YAML — see
/// `update::render_template` — so parsing them back into the typed `Job`
/// resource is a plain `serde_json` deserialize.
fn parse_job_manifest(manifest: &str) -> Result<Job, serde_json::Error> {
    serde_json::from_str(manifest)
}
