use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::{batch::v1::CronJob, core::v1::ConfigMap};
use kube::{
    Api, Client, Resource, ResourceExt,
    config::KubeConfigOptions,
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
        watcher,
    },
};
use tracing::{error, info};

pub mod apply;
pub mod collection;
pub mod cron;
pub mod crds;
pub mod error;
#[cfg(feature = "testing")]
pub mod memory;
pub mod names;
pub mod repository;
pub mod settings;
pub mod store;

use crds::*;
use error::Error;
use settings::Settings;
use store::{KubeStore, Object};

/// Shared state handed to every reconcile pass.
pub struct Context<S> {
    pub store: S,
    pub settings: Settings,
}

impl<S> Context<S> {
    pub fn new(store: S, settings: Settings) -> Self {
        Self { store, settings }
    }
}

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let options = KubeConfigOptions::default();

    // Load kubeconfig if it's present otherwise fall back to cluster config
    let config = kube::Config::from_kubeconfig(&options)
        .await
        .or_else(|_| kube::Config::incluster())?;
    let client = Client::try_from(config)?;

    let namespace = settings.namespace.clone();
    let ctx = Arc::new(Context::new(KubeStore::new(client.clone()), settings));

    info!(namespace = namespace.as_deref().unwrap_or("*"), "starting controllers");

    let repositories = Controller::new(
        api::<Repository>(&client, namespace.as_deref()),
        watcher::Config::default(),
    )
    .owns(
        api::<CronJob>(&client, namespace.as_deref()),
        watcher::Config::default(),
    )
    .owns(
        api::<ConfigMap>(&client, namespace.as_deref()),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(reconcile_repository, error_policy::<Repository>, ctx.clone())
    .for_each(|res| async move { log_result(res) });

    let collections = Controller::new(
        api::<Collection>(&client, namespace.as_deref()),
        watcher::Config::default(),
    )
    .owns(
        api::<Repository>(&client, namespace.as_deref()),
        watcher::Config::default(),
    )
    .owns(
        api::<ConfigMap>(&client, namespace.as_deref()),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(reconcile_collection, error_policy::<Collection>, ctx)
    .for_each(|res| async move { log_result(res) });

    futures::join!(repositories, collections);
    info!("controllers stopped");

    Ok(())
}

fn api<K: Object>(client: &Client, namespace: Option<&str>) -> Api<K> {
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn reconcile_repository(
    repo: Arc<Repository>,
    ctx: Arc<Context<KubeStore>>,
) -> Result<Action, Error> {
    let namespace = repo.namespace().unwrap_or_default();
    repository::reconcile(&ctx, &namespace, &repo.name_any()).await
}

async fn reconcile_collection(
    coll: Arc<Collection>,
    ctx: Arc<Context<KubeStore>>,
) -> Result<Action, Error> {
    let namespace = coll.namespace().unwrap_or_default();
    collection::reconcile(&ctx, &namespace, &coll.name_any()).await
}

/// Ownership conflicts wait for someone to change the object; everything
/// else is retried after a delay.
fn error_policy<K: Resource<DynamicType = ()>>(
    obj: Arc<K>,
    err: &Error,
    ctx: Arc<Context<KubeStore>>,
) -> Action {
    error!(
        kind = %K::kind(&()),
        name = obj.meta().name.as_deref().unwrap_or_default(),
        "reconcile failed: {err}"
    );
    if err.is_permanent() {
        Action::await_change()
    } else {
        Action::requeue(ctx.settings.error_backoff())
    }
}

fn log_result<K: Resource<DynamicType = ()>>(
    res: Result<(ObjectRef<K>, Action), controller::Error<Error, watcher::Error>>,
) {
    match res {
        Ok((obj, _)) => info!("reconciled {obj}"),
        Err(controller::Error::ReconcilerFailed(e, obj)) => {
            error!("reconcile of {obj} failed: {e}")
        }
        Err(e) => error!("controller error: {e}"),
    }
}
