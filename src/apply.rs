//! Owner-scoped, idempotent upsert of generated objects.
//!
//! A generated object is rewritten only when it differs from what its owner
//! wants. "Differs" means either the digest this controller stamped on its
//! last write no longer matches the desired object, or a field it writes has
//! been changed by someone else. Fields added by other writers (server
//! defaults, other field managers) are ignored.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::{
    error::{Error, Result},
    store::{Object, ObjectStore},
};

pub const DIGEST_ANNOTATION: &str = "gitbackup.ebiiim.com/applied-digest";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    Applied,
}

/// Controller reference to `owner` that also blocks the owner's foreground
/// deletion until the child is gone.
pub fn owner_reference<O>(owner: &O) -> Result<OwnerReference>
where
    O: Resource<DynamicType = ()>,
{
    let reference = owner
        .controller_owner_ref(&())
        .ok_or_else(|| Error::MissingUid {
            kind: O::kind(&()).into_owned(),
            name: owner.meta().name.clone().unwrap_or_default(),
        })?;
    Ok(OwnerReference {
        block_owner_deletion: Some(true),
        ..reference
    })
}

pub fn controller_of<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.meta()
        .owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true))
}

pub fn is_controlled_by<K: Resource>(obj: &K, owner_uid: &str) -> bool {
    controller_of(obj).is_some_and(|r| r.uid == owner_uid)
}

/// Decides whether `desired` has to be written over `current`. Returns the
/// object to apply, stamped with the owner reference and digest, or `None`
/// when nothing would change.
pub fn plan<K: Object>(
    mut desired: K,
    current: Option<&K>,
    owner: &OwnerReference,
) -> Result<Option<K>> {
    if let Some(controller) = current.and_then(controller_of) {
        if controller.uid != owner.uid {
            return Err(Error::OwnershipViolation {
                kind: K::kind(&()).into_owned(),
                namespace: desired.namespace().unwrap_or_default(),
                name: desired.name_any(),
                owner_uid: controller.uid.clone(),
            });
        }
    }

    desired.meta_mut().owner_references = Some(vec![owner.clone()]);
    let digest = digest(&desired)?;
    desired
        .annotations_mut()
        .insert(DIGEST_ANNOTATION.to_owned(), digest.clone());

    let Some(current) = current else {
        return Ok(Some(desired));
    };

    let unchanged = current.annotations().get(DIGEST_ANNOTATION) == Some(&digest)
        && is_subset(&serde_json::to_value(&desired)?, &serde_json::to_value(current)?);

    Ok((!unchanged).then_some(desired))
}

/// Fetches the current state of `desired` and applies it when [`plan`] says so.
pub async fn apply<K, S>(store: &S, desired: K, owner: &OwnerReference) -> Result<Outcome>
where
    K: Object,
    S: ObjectStore,
{
    let kind = K::kind(&()).into_owned();
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();

    let current = store
        .get::<K>(&namespace, &name)
        .await
        .inspect_err(|e| error!(%kind, %namespace, %name, "unable to get current object: {e}"))?;

    let Some(patch) = plan(desired, current.as_ref(), owner)
        .inspect_err(|e| error!(%kind, %namespace, %name, "refusing to apply: {e}"))?
    else {
        info!(%kind, %namespace, %name, "no changes are made");
        return Ok(Outcome::Unchanged);
    };

    store
        .apply(&namespace, &name, &patch)
        .await
        .inspect_err(|e| error!(%kind, %namespace, %name, "unable to apply: {e}"))?;
    info!(%kind, %namespace, %name, "applied");

    Ok(Outcome::Applied)
}

fn digest<K: Object>(obj: &K) -> Result<String> {
    let bytes = serde_json::to_vec(obj)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// True when every field set in `desired` holds the same value in `current`.
/// Objects are compared by key, arrays element-wise.
fn is_subset(desired: &Value, current: &Value) -> bool {
    match (desired, current) {
        (Value::Object(d), Value::Object(c)) => d
            .iter()
            .all(|(k, v)| c.get(k).map_or(v.is_null(), |cv| is_subset(v, cv))),
        (Value::Array(d), Value::Array(c)) => {
            d.len() == c.len() && d.iter().zip(c).all(|(dv, cv)| is_subset(dv, cv))
        }
        _ => desired == current,
    }
}
