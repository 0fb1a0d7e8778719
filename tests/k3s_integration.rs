//! Runs the controllers against a local cluster (`k3d`/`k3s`), e.g.
//! `cargo test --test k3s_integration -- --ignored`.

use std::time::Duration;

use gitbackup::{crds::*, names, settings::Settings};
use k8s_openapi::{
    api::{
        batch::v1::CronJob,
        core::v1::{ConfigMap, Namespace},
    },
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
};
use kube::{
    Api, Client, CustomResourceExt, Resource, ResourceExt,
    api::{DeleteParams, ObjectMeta, Patch, PatchParams},
    config::KubeConfigOptions,
};
use tokio::{sync::OnceCell, time::sleep};
use tokio_retry2::{Retry, RetryError, strategy::ExponentialBackoff};

const NS: &str = "gitbackup-test";

static ONCE_CLIENT: OnceCell<anyhow::Result<Client>> = OnceCell::const_new();

async fn init() -> &'static Client {
    async fn init_fun() -> anyhow::Result<Client> {
        tracing_subscriber::fmt().init();

        let options = KubeConfigOptions::default();
        let config = kube::Config::from_kubeconfig(&options).await?;

        let cluster_host = config.cluster_url.host().expect("Cluster URL has host");
        if !["localhost", "127.0.0.1"].contains(&cluster_host) {
            panic!("Danger! Cluster URL isn't local.");
        }

        let client = Client::try_from(config)?;

        let crd_api = Api::<CustomResourceDefinition>::all(client.clone());
        for crd in [Repository::crd(), Collection::crd()] {
            crd_api
                .patch(
                    &crd.name_any(),
                    &PatchParams::apply("test"),
                    &Patch::Apply(crd.clone()),
                )
                .await?;
        }

        let ns_api = Api::<Namespace>::all(client.clone());
        ns_api
            .patch(
                NS,
                &PatchParams::apply("test"),
                &Patch::Apply(Namespace {
                    metadata: ObjectMeta {
                        name: Some(NS.to_owned()),
                        ..ObjectMeta::default()
                    },
                    ..Namespace::default()
                }),
            )
            .await?;

        sleep(Duration::from_secs(5)).await;

        tokio::spawn(gitbackup::run(Settings {
            namespace: Some(NS.to_owned()),
            resync_secs: 5,
            error_backoff_secs: 1,
        }));

        Ok(client)
    }

    ONCE_CLIENT.get_or_init(init_fun).await.as_ref().unwrap()
}

fn retry_strategy() -> impl Iterator<Item = Duration> + Clone {
    ExponentialBackoff::from_millis(10)
        .map(tokio_retry2::strategy::jitter)
        .take(5)
}

async fn apply_manifest<K>(client: &Client, obj: &K)
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned,
{
    Api::<K>::namespaced(client.clone(), NS)
        .patch(
            &obj.name_any(),
            &PatchParams::apply("test"),
            &Patch::Apply(obj.clone()),
        )
        .await
        .expect("Unable to apply manifest");
}

async fn exists<K>(api: &Api<K>, name: &str) -> Result<K, RetryError<()>>
where
    K: Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
{
    match api.get(name).await {
        Ok(o) => Ok(o),
        Err(kube::Error::Api(e)) if e.code == 404 => Err(RetryError::transient(())),
        Err(e) => panic!("Unable to get {name}: {e}"),
    }
}

async fn gone<K>(api: &Api<K>, name: &str) -> Result<(), RetryError<()>>
where
    K: Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
{
    match api.get(name).await {
        Ok(_) => Err(RetryError::transient(())),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => panic!("Unable to get {name}: {e}"),
    }
}

#[tokio::test]
#[ignore = "needs a local k3s cluster"]
async fn repository_gets_cronjob() {
    let client = init().await;
    let repo = serde_yaml::from_str::<Repository>(include_str!("./manifests/repository.yaml"))
        .expect("Unable to deserialize Repository manifest");
    apply_manifest(client, &repo).await;

    let cronjobs = Api::<CronJob>::namespaced(client.clone(), NS);
    let config_maps = Api::<ConfigMap>::namespaced(client.clone(), NS);

    let cj = Retry::spawn(retry_strategy(), async || {
        exists(&cronjobs, &names::cronjob_name(&repo.name_any())).await
    })
    .await
    .expect("CronJob not created");
    let spec = cj.spec.expect("CronJob has spec");
    assert_eq!(spec.schedule, repo.spec.schedule);
    assert_eq!(spec.concurrency_policy.as_deref(), Some("Replace"));

    Retry::spawn(retry_strategy(), async || {
        exists(&config_maps, &names::repository_config_name(&repo.name_any())).await
    })
    .await
    .expect("Default gitconfig not created");

    Api::<Repository>::namespaced(client.clone(), NS)
        .delete(&repo.name_any(), &DeleteParams::foreground())
        .await
        .expect("Unable to delete Repository");
}

#[tokio::test]
#[ignore = "needs a local k3s cluster"]
async fn collection_expands_and_prunes() {
    let client = init().await;
    let mut coll = serde_yaml::from_str::<Collection>(include_str!("./manifests/collection.yaml"))
        .expect("Unable to deserialize Collection manifest");
    apply_manifest(client, &coll).await;

    let repos = Api::<Repository>::namespaced(client.clone(), NS);
    let expected = [
        ("test-coll-foo", "0 6 * * *"),
        ("test-coll-bar", "1 6 * * *"),
        ("test-coll-baz-2022", "2 6 * * *"),
    ];
    for (name, schedule) in expected {
        let repo = Retry::spawn(retry_strategy(), async || exists(&repos, name).await)
            .await
            .expect("Repository not created");
        assert_eq!(repo.spec.schedule, schedule);
        assert_eq!(repo.owner_references().len(), 1);
    }

    coll.spec.repos.remove(1);
    apply_manifest(client, &coll).await;
    Retry::spawn(retry_strategy(), async || gone(&repos, "test-coll-bar").await)
        .await
        .expect("Removed item not pruned");

    Api::<Collection>::namespaced(client.clone(), NS)
        .delete(&coll.name_any(), &DeleteParams::foreground())
        .await
        .expect("Unable to delete Collection");
    for name in ["test-coll-foo", "test-coll-baz-2022"] {
        Retry::spawn(retry_strategy(), async || gone(&repos, name).await)
            .await
            .expect("Owned repositories not deleted");
    }
}
