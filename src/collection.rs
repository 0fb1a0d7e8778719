//! Expands a `Collection` into one `Repository` per item, each scheduled one
//! minute after the previous, and prunes Repositories it no longer lists.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{ResourceExt, runtime::controller::Action};
use tracing::{error, info, warn};

use crate::{
    Context,
    apply::{self, is_controlled_by, owner_reference},
    cron,
    crds::{Collection, LocalRef, Repository, RepositorySpec},
    error::Result,
    names::APP_NAME,
    repository,
    store::ObjectStore,
};

pub const CONTROLLER_NAME: &str = "gitbackup-collection-controller";

pub async fn reconcile<S: ObjectStore>(
    ctx: &Context<S>,
    namespace: &str,
    name: &str,
) -> Result<Action> {
    info!(%namespace, %name, "reconcile collection");

    let Some(coll) = ctx.store.get::<Collection>(namespace, name).await? else {
        info!(%namespace, %name, "collection is already deleted");
        return Ok(Action::await_change());
    };
    if coll.metadata.deletion_timestamp.is_some() {
        info!(%namespace, %name, "collection is being deleted");
        return Ok(Action::await_change());
    }

    let owner = owner_reference(&coll)?;
    reconcile_git_config(ctx, &coll, &owner).await?;
    if let Some(r) = &coll.spec.git_credentials_ref {
        info!(%namespace, %name, git_credentials = %r.name, "git credentials specified");
    }
    reconcile_repositories(ctx, &coll, &owner).await?;

    Ok(Action::requeue(ctx.settings.resync()))
}

async fn reconcile_git_config<S: ObjectStore>(
    ctx: &Context<S>,
    coll: &Collection,
    owner: &OwnerReference,
) -> Result<()> {
    if !coll.uses_default_git_config() {
        info!(name = %coll.name_any(), git_config = %coll.git_config_name(), "git config specified");
        return Ok(());
    }

    let cm = repository::default_git_config(
        &coll.namespace().unwrap_or_default(),
        &coll.git_config_name(),
        labels(&coll.name_any()),
    );
    apply::apply(&ctx.store, cm, owner).await?;
    Ok(())
}

async fn reconcile_repositories<S: ObjectStore>(
    ctx: &Context<S>,
    coll: &Collection,
    owner: &OwnerReference,
) -> Result<()> {
    let namespace = coll.namespace().unwrap_or_default();
    prune_repositories(ctx, coll, &namespace, owner).await?;

    for repo in desired_repositories(coll) {
        let name = repo.name_any();
        // One bad child must not hold back its siblings; the next pass retries.
        if let Err(e) = apply::apply(&ctx.store, repo, owner).await {
            error!(%namespace, %name, "unable to apply repository: {e}");
        }
    }
    Ok(())
}

/// Deletes Repositories controlled by `coll` that it no longer lists.
async fn prune_repositories<S: ObjectStore>(
    ctx: &Context<S>,
    coll: &Collection,
    namespace: &str,
    owner: &OwnerReference,
) -> Result<()> {
    let wanted: BTreeSet<String> = coll.repository_names().into_iter().collect();
    let existing = ctx.store.list::<Repository>(namespace).await?;

    let stale = existing
        .iter()
        .filter(|repo| is_controlled_by(*repo, &owner.uid))
        .map(ResourceExt::name_any)
        .filter(|name| !wanted.contains(name));

    for name in stale {
        warn!(%namespace, %name, "pruning repository no longer in collection");
        if let Err(e) = ctx.store.delete::<Repository>(namespace, &name).await {
            error!(%namespace, %name, "unable to delete repository: {e}");
        }
    }
    Ok(())
}

/// One Repository per item in list order. The first uses the collection's
/// schedule, each later one runs a minute after its predecessor.
pub fn desired_repositories(coll: &Collection) -> Vec<Repository> {
    let spec = &coll.spec;
    let git_config_ref = Some(LocalRef::new(coll.git_config_name()));
    let mut schedule = spec.schedule.clone();

    coll.repository_names()
        .into_iter()
        .zip(&spec.repos)
        .map(|(name, item)| {
            let mut repo = Repository::new(
                &name,
                RepositorySpec {
                    src: item.src.clone(),
                    dst: item.dst.clone(),
                    schedule: schedule.clone(),
                    time_zone: spec.time_zone.clone(),
                    image: spec.image.clone(),
                    image_pull_secret_ref: spec.image_pull_secret_ref.clone(),
                    git_config_ref: git_config_ref.clone(),
                    git_credentials_ref: spec.git_credentials_ref.clone(),
                },
            );
            repo.metadata.namespace = coll.namespace();
            repo.metadata.labels = Some(labels(&coll.name_any()));

            if let Ok(next) = cron::cycle_minute(&schedule) {
                schedule = next;
            }
            repo
        })
        .collect()
}

fn labels(instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_owned(), APP_NAME.to_owned()),
        ("app.kubernetes.io/instance".to_owned(), instance.to_owned()),
        ("app.kubernetes.io/part-of".to_owned(), instance.to_owned()),
        (
            "app.kubernetes.io/created-by".to_owned(),
            CONTROLLER_NAME.to_owned(),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crds::{CollectionSpec, RepoItem},
        names,
    };

    fn collection(schedule: &str, items: &[(Option<&str>, &str)]) -> Collection {
        let mut coll = Collection::new(
            "coll",
            CollectionSpec {
                schedule: schedule.into(),
                time_zone: Some("Asia/Tokyo".into()),
                image: None,
                image_pull_secret_ref: None,
                git_config_ref: None,
                git_credentials_ref: Some(LocalRef::new("creds")),
                repos: items
                    .iter()
                    .map(|(name, src)| RepoItem {
                        name: name.map(str::to_owned),
                        src: (*src).to_owned(),
                        dst: format!("{src}-dst"),
                    })
                    .collect(),
            },
        );
        coll.metadata.namespace = Some("default".into());
        coll
    }

    #[test]
    fn staggers_schedules_in_list_order() {
        let coll = collection(
            "58 6 * * *",
            &[(Some("foo"), "http://x/foo"), (None, "http://x/Bar_1"), (None, "http://x/baz")],
        );
        let repos = desired_repositories(&coll);

        let got: Vec<(String, String)> = repos
            .iter()
            .map(|r| (r.name_any(), r.spec.schedule.clone()))
            .collect();
        assert_eq!(
            got,
            [
                ("coll-foo".to_owned(), "58 6 * * *".to_owned()),
                ("coll-bar-1".to_owned(), "59 6 * * *".to_owned()),
                ("coll-baz".to_owned(), "0 6 * * *".to_owned()),
            ]
        );
    }

    #[test]
    fn copies_shared_fields() {
        let coll = collection("0 6 * * *", &[(None, "http://x/foo")]);
        let repo = &desired_repositories(&coll)[0];

        assert_eq!(repo.namespace().as_deref(), Some("default"));
        assert_eq!(repo.spec.src, "http://x/foo");
        assert_eq!(repo.spec.dst, "http://x/foo-dst");
        assert_eq!(repo.spec.time_zone.as_deref(), Some("Asia/Tokyo"));
        assert_eq!(repo.spec.git_credentials_ref, Some(LocalRef::new("creds")));
        assert_eq!(
            repo.spec.git_config_ref,
            Some(LocalRef::new(names::collection_config_name("coll")))
        );
        assert!(!repo.uses_default_git_config());
        assert_eq!(repo.labels().get("app.kubernetes.io/part-of").map(String::as_str), Some("coll"));
    }

    #[test]
    fn empty_collection_has_no_repositories() {
        assert!(desired_repositories(&collection("0 6 * * *", &[])).is_empty());
    }
}
