//! Object builders for pod workers
//!
//! Pure functions from task and settings to the orchestration objects the
//! pod backend submits: the worker pod and its namespace prerequisites.

use super::container::parse_memory;
use super::pod::PodSettings;
use super::KEEP_ALIVE_COMMAND;
use crate::platform::kubernetes::WORKER_CONTAINER;
use crate::platform::Prerequisite;
use crate::task::Task;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, EnvVar, Pod, PodSpec, ResourceRequirements,
    Secret, SecretVolumeSource, SecurityContext, ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use regex::Regex;
use relay_foundation::Result;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Maximum length of object names and label values
const MAX_NAME_LEN: usize = 63;

/// Scratch directory inside every pod worker
pub const TEMP_MOUNT_PATH: &str = "/tmp/relay";

const WORKSPACE_VOLUME: &str = "workspace";
const TEMP_VOLUME: &str = "relay-temp";
const AUTH_VOLUME: &str = "auth";

fn invalid_label_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid regex"))
}

fn invalid_name_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9-]+").expect("valid regex"))
}

/// Make `value` a valid label value: allowed characters only, at most 63
/// long, alphanumeric at both ends
pub fn label_value(value: &str) -> String {
    let replaced = invalid_label_chars().replace_all(value, "-");
    let truncated: String = replaced.chars().take(MAX_NAME_LEN).collect();
    truncated
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// `relay-worker-<task>-<suffix>`, lower-case and at most 63 long
pub fn pod_name(task: &Task) -> String {
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
    let lowered = task.id.as_str().to_ascii_lowercase();
    let sanitized = invalid_name_chars().replace_all(&lowered, "-");

    let prefix = "relay-worker-";
    let budget = MAX_NAME_LEN - prefix.len() - suffix.len() - 1;
    let middle: String = sanitized.chars().take(budget).collect();
    let middle = middle.trim_matches('-');

    if middle.is_empty() {
        format!("{}{}", prefix, suffix)
    } else {
        format!("{}{}-{}", prefix, middle, suffix)
    }
}

fn worker_labels(task: &Task) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "relay".to_string()),
        ("component".to_string(), "worker".to_string()),
        ("issue".to_string(), label_value(task.id.as_str())),
        (
            "repository".to_string(),
            label_value(&task.target_repository),
        ),
    ])
}

fn env_var(name: impl Into<String>, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: if read_only { Some(true) } else { None },
        ..Default::default()
    }
}

fn resources(settings: &PodSettings) -> Result<Option<ResourceRequirements>> {
    let mut amounts = BTreeMap::new();
    if let Some(memory) = settings.resources.memory.as_deref() {
        amounts.insert(
            "memory".to_string(),
            Quantity(parse_memory(memory)?.to_string()),
        );
    }
    if let Some(cpu) = settings.resources.cpu.as_deref() {
        amounts.insert("cpu".to_string(), Quantity(cpu.trim().to_string()));
    }

    if amounts.is_empty() {
        return Ok(None);
    }
    Ok(Some(ResourceRequirements {
        limits: Some(amounts.clone()),
        requests: Some(amounts),
        ..Default::default()
    }))
}

fn security_context(settings: &PodSettings) -> SecurityContext {
    let security = &settings.security;
    let capabilities = &security.capabilities;
    SecurityContext {
        read_only_root_filesystem: Some(security.read_only_root),
        privileged: Some(false),
        allow_privilege_escalation: if security.no_new_privileges {
            Some(false)
        } else {
            None
        },
        run_as_user: security.run_as_uid(),
        capabilities: if capabilities.add.is_empty() && capabilities.drop.is_empty() {
            None
        } else {
            Some(Capabilities {
                add: Some(capabilities.add.clone()).filter(|v| !v.is_empty()),
                drop: Some(capabilities.drop.clone()).filter(|v| !v.is_empty()),
            })
        },
        ..Default::default()
    }
}

/// The worker pod for `task`
pub fn worker_pod(task: &Task, name: &str, settings: &PodSettings) -> Result<Pod> {
    let repo = settings.repositories.resolve(&task.target_repository);

    let mut env = vec![
        env_var("REPOSITORY", &task.target_repository),
        env_var("WORKSPACE", &repo.workspace),
        env_var("ISSUE_NUMBER", task.id.as_str()),
    ];
    env.extend(
        repo.env_pairs()
            .into_iter()
            .map(|(name, value)| env_var(name, value)),
    );

    let mut volumes = vec![empty_dir(WORKSPACE_VOLUME), empty_dir(TEMP_VOLUME)];
    let mut mounts = vec![
        mount(WORKSPACE_VOLUME, &repo.workspace, false),
        mount(TEMP_VOLUME, TEMP_MOUNT_PATH, false),
    ];
    if settings.has_auth() {
        volumes.push(Volume {
            name: AUTH_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(settings.kubernetes.auth_secret.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(mount(AUTH_VOLUME, &settings.auth_mount_path, true));
    }

    let container = Container {
        name: WORKER_CONTAINER.to_string(),
        image: Some(repo.image.clone()),
        command: Some(KEEP_ALIVE_COMMAND.iter().map(|s| s.to_string()).collect()),
        working_dir: Some(repo.workspace.clone()),
        env: Some(env),
        volume_mounts: Some(mounts),
        resources: resources(settings)?,
        security_context: Some(security_context(settings)),
        ..Default::default()
    };

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(settings.kubernetes.namespace.clone()),
            labels: Some(worker_labels(task)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("Never".to_string()),
            service_account_name: Some(settings.kubernetes.service_account.clone()),
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn meta(name: &str, settings: &PodSettings) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(settings.kubernetes.namespace.clone()),
        labels: Some(BTreeMap::from([(
            "app".to_string(),
            "relay".to_string(),
        )])),
        ..Default::default()
    }
}

fn rule(resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![String::new()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// Service account, role and binding, plus the auth secret when auth
/// files are supplied. Applied in this order.
pub fn prerequisites(
    settings: &PodSettings,
    auth_files: Option<BTreeMap<String, ByteString>>,
) -> Vec<Prerequisite> {
    let k8s = &settings.kubernetes;

    let service_account = ServiceAccount {
        metadata: meta(&k8s.service_account, settings),
        ..Default::default()
    };

    let role = Role {
        metadata: meta(&k8s.role, settings),
        rules: Some(vec![
            rule(
                &["pods", "pods/log", "pods/exec"],
                &["get", "list", "create", "delete", "watch"],
            ),
            rule(
                &["persistentvolumeclaims"],
                &["get", "list", "create", "delete"],
            ),
        ]),
    };

    let role_binding = RoleBinding {
        metadata: meta(&k8s.role_binding, settings),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: k8s.role.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: k8s.service_account.clone(),
            namespace: Some(k8s.namespace.clone()),
            ..Default::default()
        }]),
    };

    let mut objects = vec![
        Prerequisite::ServiceAccount(service_account),
        Prerequisite::Role(role),
        Prerequisite::RoleBinding(role_binding),
    ];

    if let Some(files) = auth_files {
        objects.push(Prerequisite::Secret(Secret {
            metadata: meta(&k8s.auth_secret, settings),
            data: Some(files),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }));
    }

    objects
}

/// Whether a file name can be used as a secret key
pub fn is_valid_secret_key(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;
    use relay_foundation::RelayConfig;

    fn settings(with_auth: bool) -> PodSettings {
        let mut config = RelayConfig::default();
        config.resources.memory = Some("1g".into());
        config.resources.cpu = Some("500m".into());
        config.security.user = Some("1000:1000".into());
        config.security.capabilities.drop = vec!["ALL".into()];
        if with_auth {
            config.paths.auth_dir = Some("/srv/auth".into());
        }
        PodSettings::from_config(&config)
    }

    #[test]
    fn test_label_value_sanitized() {
        assert_eq!(label_value("acme/api"), "acme-api");
        assert_eq!(label_value("--x--"), "x");
        assert_eq!(label_value(&"a".repeat(100)).len(), 63);
    }

    #[test]
    fn test_pod_name_shape() {
        let task = Task::new(TaskId::new("Issue_42"), "x", "acme/api");
        let name = pod_name(&task);
        assert!(name.starts_with("relay-worker-issue-42-"));
        assert!(name.len() <= 63);
        assert_ne!(name, pod_name(&task));

        let long = Task::new(TaskId::new("9".repeat(200)), "x", "acme/api");
        assert!(pod_name(&long).len() <= 63);
    }

    #[test]
    fn test_worker_pod() {
        let task = Task::new(TaskId::new("42"), "Hello", "acme/api");
        let pod = worker_pod(&task, "relay-worker-42-abcd1234", &settings(true)).unwrap();

        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels["issue"], "42");
        assert_eq!(labels["repository"], "acme-api");

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.service_account_name.as_deref(), Some("relay-worker"));
        assert_eq!(spec.volumes.as_ref().unwrap().len(), 3);

        let container = &spec.containers[0];
        assert_eq!(container.name, WORKER_CONTAINER);
        let env = container.env.as_ref().unwrap();
        assert!(env
            .iter()
            .any(|e| e.name == "ISSUE_NUMBER" && e.value.as_deref() == Some("42")));

        let mounts = container.volume_mounts.as_ref().unwrap();
        let auth = mounts.iter().find(|m| m.name == "auth").unwrap();
        assert_eq!(auth.mount_path, "/app/auth");
        assert_eq!(auth.read_only, Some(true));

        let limits = container
            .resources
            .as_ref()
            .unwrap()
            .limits
            .as_ref()
            .unwrap();
        assert_eq!(limits["memory"], Quantity("1073741824".into()));
        assert_eq!(limits["cpu"], Quantity("500m".into()));

        let security = container.security_context.as_ref().unwrap();
        assert_eq!(security.allow_privilege_escalation, Some(false));
        assert_eq!(security.privileged, Some(false));
        assert_eq!(security.run_as_user, Some(1000));
    }

    #[test]
    fn test_pod_without_auth() {
        let task = Task::new(TaskId::new("1"), "Hello", "acme/api");
        let pod = worker_pod(&task, "relay-worker-1-abcd1234", &settings(false)).unwrap();
        let spec = pod.spec.unwrap();
        assert_eq!(spec.volumes.unwrap().len(), 2);
    }

    #[test]
    fn test_prerequisites_order() {
        let kinds: Vec<_> = prerequisites(&settings(false), None)
            .iter()
            .map(Prerequisite::kind)
            .collect();
        assert_eq!(kinds, vec!["ServiceAccount", "Role", "RoleBinding"]);

        let files = BTreeMap::from([("token".to_string(), ByteString(b"abc".to_vec()))]);
        let with_secret = prerequisites(&settings(true), Some(files));
        assert_eq!(with_secret.len(), 4);
        assert_eq!(with_secret[3].name(), "relay-auth");
    }

    #[test]
    fn test_secret_key_validation() {
        assert!(is_valid_secret_key("credentials.json"));
        assert!(!is_valid_secret_key("has space"));
        assert!(!is_valid_secret_key(""));
    }
}
