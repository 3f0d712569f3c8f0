//! Get-or-create for objects owned by a pipeline or search.
use std::fmt::Debug;

use kube::{api::PostParams, Api, Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{is_conflict, Error, Result};

/// What [`reconcile_child`] found.
#[derive(Debug)]
pub enum Reconciled<K> {
    Created(K),
    Existing(K),
}

impl<K> Reconciled<K> {
    pub fn created(&self) -> bool {
        matches!(self, Reconciled::Created(_))
    }

    pub fn into_inner(self) -> K {
        match self {
            Reconciled::Created(k) | Reconciled::Existing(k) => k,
        }
    }
}

/// Make `owner` the controller of `desired` and make sure it exists.
///
/// An absent object is created from `desired`. A present one is handed to `merge`
/// together with `desired`, and whatever `merge` returns is passed back without
/// being written.
pub async fn reconcile_child<K, O, F>(api: &Api<K>, owner: &O, mut desired: K, merge: F) -> Result<Reconciled<K>>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
    O: Resource<DynamicType = ()>,
    F: FnOnce(K, K) -> K,
{
    let owner_ref = owner
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    desired.owner_references_mut().push(owner_ref);
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;

    if let Some(found) = api.get_opt(&name).await? {
        return Ok(Reconciled::Existing(merge(found, desired)));
    }
    match api.create(&PostParams::default(), &desired).await {
        Ok(created) => {
            tracing::info!(kind = %K::kind(&()), %name, "created child");
            Ok(Reconciled::Created(created))
        }
        // lost a race with a previous pass whose watch event has not arrived yet
        Err(err) if is_conflict(&err) => {
            let found = api.get(&name).await?;
            Ok(Reconciled::Existing(merge(found, desired)))
        }
        Err(err) => Err(err.into()),
    }
}

/// Merge strategy for children whose spec is never updated in place.
pub fn keep_existing<K>(found: K, _desired: K) -> K {
    found
}
