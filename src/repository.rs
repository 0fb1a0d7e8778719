//! Turns a `Repository` into a `CronJob` that mirrors `src` into `dst`,
//! plus a default `.gitconfig` ConfigMap when none is referenced.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec},
        core::v1::{
            ConfigMap, ConfigMapVolumeSource, Container, LocalObjectReference, PodSpec,
            PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{ResourceExt, api::ObjectMeta, runtime::controller::Action};
use tracing::info;

use crate::{
    Context,
    apply::{self, owner_reference},
    crds::Repository,
    error::Result,
    names::{self, APP_NAME},
    store::ObjectStore,
};

pub const CONTROLLER_NAME: &str = "gitbackup-repository-controller";

pub const GIT_CONFIG_KEY: &str = ".gitconfig";
pub const GIT_CONFIG_CONTENT: &str = "[credential]\n\thelper = store";
pub const GIT_CREDENTIALS_KEY: &str = ".git-credentials";

const CONFIG_MOUNT: &str = "/gitconfig";
const CREDENTIALS_MOUNT: &str = "/gitcredentials";
const HOME: &str = "/root";
const MIRROR_DIR: &str = "/tmp/mirror.git";

/// How late a missed run may still start. Bounded so that a long outage
/// doesn't stop the CronJob from ever being scheduled again.
const STARTING_DEADLINE_SECONDS: i64 = 3 * 60 * 60;

pub async fn reconcile<S: ObjectStore>(
    ctx: &Context<S>,
    namespace: &str,
    name: &str,
) -> Result<Action> {
    info!(%namespace, %name, "reconcile repository");

    let Some(repo) = ctx.store.get::<Repository>(namespace, name).await? else {
        info!(%namespace, %name, "repository is already deleted");
        return Ok(Action::await_change());
    };
    if repo.metadata.deletion_timestamp.is_some() {
        info!(%namespace, %name, "repository is being deleted");
        return Ok(Action::await_change());
    }

    let owner = owner_reference(&repo)?;
    reconcile_git_config(ctx, &repo, &owner).await?;
    reconcile_git_credentials(&repo);
    reconcile_cronjob(ctx, &repo, &owner).await?;

    Ok(Action::requeue(ctx.settings.resync()))
}

async fn reconcile_git_config<S: ObjectStore>(
    ctx: &Context<S>,
    repo: &Repository,
    owner: &OwnerReference,
) -> Result<()> {
    if !repo.uses_default_git_config() {
        info!(name = %repo.name_any(), git_config = %repo.git_config_name(), "git config specified");
        return Ok(());
    }

    let cm = default_git_config(
        &repo.namespace().unwrap_or_default(),
        &repo.git_config_name(),
        labels(&repo.name_any()),
    );
    apply::apply(&ctx.store, cm, owner).await?;
    Ok(())
}

/// Credentials are only referenced, never created.
fn reconcile_git_credentials(repo: &Repository) {
    match &repo.spec.git_credentials_ref {
        Some(r) => info!(name = %repo.name_any(), git_credentials = %r.name, "git credentials specified"),
        None => info!(name = %repo.name_any(), "no git credentials"),
    }
}

async fn reconcile_cronjob<S: ObjectStore>(
    ctx: &Context<S>,
    repo: &Repository,
    owner: &OwnerReference,
) -> Result<()> {
    apply::apply(&ctx.store, cronjob(repo), owner).await?;
    Ok(())
}

/// The `.gitconfig` ConfigMap used when nothing else is referenced.
pub fn default_git_config(
    namespace: &str,
    name: &str,
    labels: BTreeMap<String, String>,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_owned()),
            name: Some(name.to_owned()),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        data: Some(BTreeMap::from([(
            GIT_CONFIG_KEY.to_owned(),
            GIT_CONFIG_CONTENT.to_owned(),
        )])),
        ..ConfigMap::default()
    }
}

fn labels(instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_owned(), APP_NAME.to_owned()),
        ("app.kubernetes.io/instance".to_owned(), instance.to_owned()),
        (
            "app.kubernetes.io/created-by".to_owned(),
            CONTROLLER_NAME.to_owned(),
        ),
    ])
}

pub fn cronjob(repo: &Repository) -> CronJob {
    let name = repo.name_any();
    let spec = &repo.spec;

    let mut volumes = vec![Volume {
        name: "gitconfig".to_owned(),
        config_map: Some(ConfigMapVolumeSource {
            name: repo.git_config_name(),
            ..ConfigMapVolumeSource::default()
        }),
        ..Volume::default()
    }];
    let mut volume_mounts = vec![VolumeMount {
        name: "gitconfig".to_owned(),
        mount_path: CONFIG_MOUNT.to_owned(),
        read_only: Some(true),
        ..VolumeMount::default()
    }];
    if let Some(credentials) = &spec.git_credentials_ref {
        volumes.push(Volume {
            name: "gitcredentials".to_owned(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(credentials.name.clone()),
                default_mode: Some(0o400),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        });
        volume_mounts.push(VolumeMount {
            name: "gitcredentials".to_owned(),
            mount_path: CREDENTIALS_MOUNT.to_owned(),
            read_only: Some(true),
            ..VolumeMount::default()
        });
    }

    let container = Container {
        name: "git".to_owned(),
        image: Some(spec.image().to_owned()),
        command: Some(vec![
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            script(repo),
        ]),
        volume_mounts: Some(volume_mounts),
        ..Container::default()
    };

    let image_pull_secrets = spec.image_pull_secret_ref.as_ref().map(|r| {
        vec![LocalObjectReference {
            name: r.name.clone(),
        }]
    });

    let pod = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels(&name)),
            ..ObjectMeta::default()
        }),
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_owned()),
            containers: vec![container],
            volumes: Some(volumes),
            image_pull_secrets,
            ..PodSpec::default()
        }),
    };

    CronJob {
        metadata: ObjectMeta {
            namespace: repo.namespace(),
            name: Some(names::cronjob_name(&name)),
            labels: Some(labels(&name)),
            ..ObjectMeta::default()
        },
        spec: Some(CronJobSpec {
            schedule: spec.schedule.clone(),
            time_zone: spec.time_zone.clone(),
            concurrency_policy: Some("Replace".to_owned()),
            starting_deadline_seconds: Some(STARTING_DEADLINE_SECONDS),
            job_template: JobTemplateSpec {
                metadata: None,
                spec: Some(JobSpec {
                    parallelism: Some(1),
                    completions: Some(1),
                    template: pod,
                    ..JobSpec::default()
                }),
            },
            ..CronJobSpec::default()
        }),
        ..CronJob::default()
    }
}

/// Shell run by the CronJob. Steps stop at the first failure but the
/// `completed` line is printed either way; the exit status is left alone.
pub fn script(repo: &Repository) -> String {
    let spec = &repo.spec;
    let mut steps = vec![
        r#"log() { echo "$(date -u +%Y-%m-%dT%H:%M:%SZ) $*"; }"#.to_owned(),
        "trap 'log completed' EXIT".to_owned(),
        "set -e".to_owned(),
        format!("export HOME={HOME}"),
        "log 'copy gitconfig'".to_owned(),
        format!("cp {CONFIG_MOUNT}/{GIT_CONFIG_KEY} {HOME}/{GIT_CONFIG_KEY}"),
    ];
    if spec.git_credentials_ref.is_some() {
        steps.push("log 'copy gitcredentials'".to_owned());
        steps.push(format!(
            "cp {CREDENTIALS_MOUNT}/{GIT_CREDENTIALS_KEY} {HOME}/{GIT_CREDENTIALS_KEY}"
        ));
    }
    steps.extend([
        format!("log {}", quote(&format!("clone {}", spec.src))),
        format!("git clone --mirror {} {MIRROR_DIR}", quote(&spec.src)),
        format!("log {}", quote(&format!("push {}", spec.dst))),
        format!("cd {MIRROR_DIR}"),
        format!("git push --mirror {}", quote(&spec.dst)),
    ]);
    steps.join("\n")
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
