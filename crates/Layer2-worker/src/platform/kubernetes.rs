//! Orchestration API - kube client behind `PodApi`

use super::{Applied, PodApi, PodExecOutput, PodStatusView, Prerequisite};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, AttachParams, DeleteParams, LogParams, PostParams};
use kube::{Client, Resource};
use relay_foundation::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

/// Name of the single container in a worker pod
pub const WORKER_CONTAINER: &str = "worker";

/// Pod operations scoped to one namespace
#[derive(Clone)]
pub struct KubePodApi {
    client: Client,
    namespace: String,
    pods: Api<Pod>,
}

impl KubePodApi {
    /// Connect with the inferred config (in-cluster or kubeconfig) and
    /// check the namespace exists
    pub async fn connect(namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let client = Client::try_default()
            .await
            .map_err(|e| Error::platform(format!("Failed to create cluster client: {}", e)))?;

        Api::<Namespace>::all(client.clone())
            .get(&namespace)
            .await
            .map_err(|e| {
                Error::platform(format!("Namespace {} is not reachable: {}", namespace, e))
            })?;

        info!(namespace = %namespace, "Connected to cluster");
        Ok(Self::from_client(client, namespace))
    }

    pub fn from_client(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let pods = Api::namespaced(client.clone(), &namespace);
        Self {
            client,
            namespace,
            pods,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create_tolerant<K>(&self, object: &K) -> Result<Applied>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.create(&PostParams::default(), object).await {
            Ok(_) => Ok(Applied::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(Applied::AlreadyExists),
            Err(e) => Err(Error::platform(e)),
        }
    }
}

#[async_trait]
impl PodApi for KubePodApi {
    async fn apply(&self, prerequisite: &Prerequisite) -> Result<Applied> {
        match prerequisite {
            Prerequisite::ServiceAccount(o) => self.create_tolerant::<ServiceAccount>(o).await,
            Prerequisite::Role(o) => self.create_tolerant::<Role>(o).await,
            Prerequisite::RoleBinding(o) => self.create_tolerant::<RoleBinding>(o).await,
            Prerequisite::Secret(o) => self.create_tolerant::<Secret>(o).await,
        }
    }

    async fn create_pod(&self, pod: &Pod) -> Result<String> {
        let created = self
            .pods
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| Error::platform(format!("Failed to create pod: {}", e)))?;
        created
            .metadata
            .name
            .ok_or_else(|| Error::platform("created pod has no name"))
    }

    async fn pod_status(&self, name: &str) -> Result<PodStatusView> {
        let pod = self
            .pods
            .get(name)
            .await
            .map_err(|e| Error::platform(format!("Failed to read pod {}: {}", name, e)))?;

        let status = pod.status.unwrap_or_default();
        let ready_condition = status
            .conditions
            .unwrap_or_default()
            .into_iter()
            .find(|c| c.type_ == "Ready")
            .map(|c| c.status == "True");

        Ok(PodStatusView {
            phase: status.phase,
            ready_condition,
        })
    }

    async fn exec(&self, name: &str, script: &str) -> Result<PodExecOutput> {
        let params = AttachParams::default()
            .container(WORKER_CONTAINER)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = self
            .pods
            .exec(name, vec!["sh", "-c", script], &params)
            .await
            .map_err(|e| Error::platform(format!("Failed to exec in pod {}: {}", name, e)))?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let (stdout, stderr) = tokio::join!(read_stream(stdout), read_stream(stderr));
        let status = match status {
            Some(status) => status.await,
            None => None,
        };

        if let Err(e) = attached.join().await {
            debug!(pod = name, "exec stream closed with error: {}", e);
        }

        let (stdout, stdout_error) = stdout;
        let (stderr, stderr_error) = stderr;

        let failure = status
            .filter(|s| s.status.as_deref() == Some("Failure"))
            .map(|s| {
                s.message
                    .or(s.reason)
                    .unwrap_or_else(|| "remote command failed".to_string())
            })
            .or_else(|| {
                stdout_error
                    .or(stderr_error)
                    .map(|e| format!("exec stream failed: {}", e))
            });

        Ok(PodExecOutput {
            stdout,
            stderr,
            failure,
        })
    }

    async fn logs(&self, name: &str, tail: i64) -> Result<String> {
        let params = LogParams {
            container: Some(WORKER_CONTAINER.to_string()),
            tail_lines: Some(tail),
            ..Default::default()
        };
        self.pods
            .logs(name, &params)
            .await
            .map_err(|e| Error::platform(format!("Failed to read logs of pod {}: {}", name, e)))
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        match self.pods.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::platform(format!("Failed to delete pod {}: {}", name, e))),
        }
    }
}

/// Drain a stream. A read error keeps the bytes read before it.
async fn read_stream<R>(stream: Option<R>) -> (String, Option<std::io::Error>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut error = None;
    if let Some(mut stream) = stream {
        if let Err(e) = stream.read_to_end(&mut buf).await {
            error = Some(e);
        }
    }
    (String::from_utf8_lossy(&buf).into_owned(), error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    struct ResetStream;

    impl AsyncRead for ResetStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::new(
                ErrorKind::ConnectionReset,
                "connection reset",
            )))
        }
    }

    #[tokio::test]
    async fn test_read_stream_keeps_output_before_error() {
        let stream = (&b"partial output\n"[..]).chain(ResetStream);
        let (output, error) = read_stream(Some(stream)).await;
        assert_eq!(output, "partial output\n");
        assert_eq!(error.unwrap().kind(), ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_read_stream_absent() {
        let (output, error) = read_stream(None::<&[u8]>).await;
        assert!(output.is_empty());
        assert!(error.is_none());
    }
}
