use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::names;

pub const DEFAULT_IMAGE: &str = "alpine/git:2.36.2";

/// Reference to an object in the same namespace.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LocalRef {
    pub name: String,
}

impl LocalRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Mirrors `src` into `dst` on `schedule`.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "gitbackup.ebiiim.com",
    version = "v1beta1",
    kind = "Repository",
    namespaced,
    shortname = "repo"
)]
pub struct RepositorySpec {
    pub src: String,
    pub dst: String,
    /// Standard 5 field cron expression.
    pub schedule: String,
    /// TZ database name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret_ref: Option<LocalRef>,
    /// ConfigMap holding `.gitconfig`. A generated one is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_config_ref: Option<LocalRef>,
    /// Secret holding `.git-credentials`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_credentials_ref: Option<LocalRef>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RepoItem {
    /// Defaults to the last path segment of `src`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub src: String,
    pub dst: String,
}

/// A set of mirror pairs sharing one base schedule. Each item becomes a
/// `Repository` whose schedule is staggered by one minute from the previous.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "gitbackup.ebiiim.com",
    version = "v1beta1",
    kind = "Collection",
    namespaced,
    shortname = "coll"
)]
pub struct CollectionSpec {
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret_ref: Option<LocalRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_config_ref: Option<LocalRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_credentials_ref: Option<LocalRef>,
    #[serde(default)]
    pub repos: Vec<RepoItem>,
}

impl RepositorySpec {
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_IMAGE)
    }
}

impl Repository {
    /// Name of the ConfigMap mounted as `.gitconfig`, defaulted when unset.
    pub fn git_config_name(&self) -> String {
        git_config_name(&self.spec.git_config_ref, || {
            names::repository_config_name(&self.metadata_name())
        })
    }

    pub fn uses_default_git_config(&self) -> bool {
        self.git_config_name() == names::repository_config_name(&self.metadata_name())
    }

    fn metadata_name(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }
}

impl Collection {
    pub fn git_config_name(&self) -> String {
        git_config_name(&self.spec.git_config_ref, || {
            names::collection_config_name(&self.metadata_name())
        })
    }

    pub fn uses_default_git_config(&self) -> bool {
        self.git_config_name() == names::collection_config_name(&self.metadata_name())
    }

    /// Names of the Repositories this Collection expands into, in list order.
    pub fn repository_names(&self) -> Vec<String> {
        let name = self.metadata_name();
        self.spec
            .repos
            .iter()
            .map(|item| names::repo_item_name(&name, item))
            .collect()
    }

    fn metadata_name(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }
}

fn git_config_name(reference: &Option<LocalRef>, default: impl FnOnce() -> String) -> String {
    reference
        .as_ref()
        .map(|r| r.name.clone())
        .unwrap_or_else(default)
}
