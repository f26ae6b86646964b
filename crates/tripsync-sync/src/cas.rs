//! Versioned resource coordinator.
//!
//! Writes to polls and tasks go through the store's compare-and-swap RPC with
//! the version the client last saw. The local cache shows the change right
//! away and drops it if the store rejects the write.
//!
//! A conflict is permanent as far as the retry policy is concerned: resending
//! the same expected version would conflict again. Callers either refetch
//! themselves ([`CasCoordinator::refresh`]) or use
//! [`CasCoordinator::mutate_with_refetch`].
//!
//! At most one write per resource is in flight. Newer copies arriving from the
//! bus or a refetch move the confirmed version forward but leave the pending
//! overlay alone; cached versions never go backwards.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tripsync_model::{Change, Version, VersionedResource};

use crate::error::{Error, Result};
use crate::lock;
use crate::optimistic::{Mutation, Optimistic, OptimisticExecutor};
use crate::retry::{Sleep, TokioSleep};

/// CAS write request, as sent to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CasWrite<C> {
    pub resource_id: String,
    pub expected_version: Version,
    #[serde(rename = "mutationPayload")]
    pub change: C,
}

/// What the store did with a CAS write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied { new_version: Version },
    Conflict { current_version: Version },
}

/// Wire form of [`CasOutcome`].
///
/// `{ "success": true, "newVersion": 2 }` or
/// `{ "success": false, "kind": "conflict", "currentVersion": 2 }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CasResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<Version>,
}

impl CasResponse {
    pub fn into_outcome(self) -> Result<CasOutcome> {
        match self {
            Self {
                success: true,
                new_version: Some(new_version),
                ..
            } => Ok(CasOutcome::Applied { new_version }),
            Self {
                success: false,
                current_version: Some(current_version),
                ref kind,
                ..
            } if kind.as_deref() == Some("conflict") => Ok(CasOutcome::Conflict { current_version }),
            other => Err(Error::Unknown(format!("unrecognized CAS response: {other:?}"))),
        }
    }
}

impl From<CasOutcome> for CasResponse {
    fn from(outcome: CasOutcome) -> Self {
        match outcome {
            CasOutcome::Applied { new_version } => Self {
                success: true,
                new_version: Some(new_version),
                kind: None,
                current_version: None,
            },
            CasOutcome::Conflict { current_version } => Self {
                success: false,
                new_version: None,
                kind: Some("conflict".into()),
                current_version: Some(current_version),
            },
        }
    }
}

/// Read side of the store.
pub trait ResourceSource<T>: Send + Sync {
    /// Current authoritative copy.
    fn fetch(&self, resource_id: &str) -> impl Future<Output = Result<VersionedResource<T>>> + Send;
}

/// The store side of versioned resources.
pub trait VersionedStore<T, C>: ResourceSource<T> {
    /// Apply `write.change` iff the stored version equals `write.expected_version`.
    fn compare_and_swap(&self, write: &CasWrite<C>) -> impl Future<Output = Result<CasOutcome>> + Send;
}

type Cache<T> = Mutex<HashMap<String, Optimistic<VersionedResource<T>>>>;

struct Inner<T, St> {
    store: St,
    cache: Cache<T>,
}

/// Coordinates optimistic CAS writes for one resource type.
pub struct CasCoordinator<T, St, S: Sleep = TokioSleep> {
    inner: Arc<Inner<T, St>>,
    executor: OptimisticExecutor<S>,
    max_conflict_retries: u32,
}

impl<T, St, S: Sleep> Clone for CasCoordinator<T, St, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            executor: self.executor.clone(),
            max_conflict_retries: self.max_conflict_retries,
        }
    }
}

impl<T, St, S> CasCoordinator<T, St, S>
where
    T: Clone + Send + Sync + 'static,
    S: Sleep,
{
    pub fn new(store: St, executor: OptimisticExecutor<S>, max_conflict_retries: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                cache: Mutex::new(HashMap::new()),
            }),
            executor,
            max_conflict_retries,
        }
    }

    pub fn store(&self) -> &St {
        &self.inner.store
    }

    /// Seed the cache with a confirmed copy.
    pub fn insert(&self, resource: VersionedResource<T>) {
        lock(&self.inner.cache).insert(resource.id.clone(), Optimistic::new(resource));
    }

    /// The copy to render, including any pending local change.
    pub fn view(&self, resource_id: &str) -> Option<VersionedResource<T>> {
        lock(&self.inner.cache)
            .get(resource_id)
            .map(|cell| cell.view().clone())
    }

    /// Last copy the store confirmed.
    pub fn confirmed(&self, resource_id: &str) -> Option<VersionedResource<T>> {
        lock(&self.inner.cache)
            .get(resource_id)
            .map(|cell| cell.confirmed().clone())
    }

    /// Take a newer copy seen on the change bus. Older or equal versions are ignored.
    pub fn observe(&self, resource: VersionedResource<T>) -> bool {
        debug!(resource_id = %resource.id, version = resource.version, "Remote update");
        self.install(resource)
    }

    fn install(&self, resource: VersionedResource<T>) -> bool {
        let mut cache = lock(&self.inner.cache);
        match cache.get_mut(&resource.id) {
            Some(cell) if cell.confirmed().version >= resource.version => false,
            Some(cell) => {
                cell.advance(resource);
                true
            }
            None => {
                cache.insert(resource.id.clone(), Optimistic::new(resource));
                true
            }
        }
    }
}

impl<T, St, S> CasCoordinator<T, St, S>
where
    T: Clone + Send + Sync + 'static,
    S: Sleep,
{
    /// Fetch the store's current copy and cache it if it is newer.
    ///
    /// A write still in flight keeps its overlay.
    pub async fn refresh(&self, resource_id: &str) -> Result<VersionedResource<T>>
    where
        St: ResourceSource<T>,
    {
        let fresh = self.inner.store.fetch(resource_id).await?;
        let installed = self.install(fresh.clone());
        debug!(resource_id, version = fresh.version, installed, "Refetched resource");
        Ok(fresh)
    }

    /// One CAS write against `expected_version`.
    ///
    /// The change is validated against the cached copy first; invalid changes
    /// never reach the store. A conflict rolls the local change back and
    /// returns [`Error::Conflict`] without retrying. While another write to
    /// the same resource is in flight this returns [`Error::WritePending`]
    /// and sends nothing.
    pub async fn mutate<C>(&self, resource_id: &str, expected_version: Version, change: C) -> Result<Version>
    where
        C: Change<T> + Send + Sync,
        St: VersionedStore<T, C>,
    {
        // Check and overlay under one lock so two callers cannot both pass.
        let next = {
            let mut cache = lock(&self.inner.cache);
            let cell = cache
                .get_mut(resource_id)
                .ok_or_else(|| Error::NotFound(format!("resource {resource_id} is not cached")))?;

            if cell.is_pending() {
                return Err(Error::WritePending {
                    resource_id: resource_id.to_string(),
                });
            }
            let next = cell.view().apply(&change)?;
            let overlay = next.clone();
            let _ = cell.apply(|_| Ok::<_, Infallible>(overlay));
            next
        };

        let input = CasInput {
            write: CasWrite {
                resource_id: resource_id.to_string(),
                expected_version,
                change,
            },
            next,
        };
        let mutation = CasMutation {
            inner: &*self.inner,
            _change: PhantomData,
        };
        self.executor.execute(&mutation, input).await
    }

    /// [`mutate`](Self::mutate) against the cached version, refetching and
    /// trying again after each conflict, up to `max_conflict_retries` times.
    pub async fn mutate_with_refetch<C>(&self, resource_id: &str, change: C) -> Result<Version>
    where
        C: Change<T> + Clone + Send + Sync,
        St: VersionedStore<T, C>,
    {
        let mut expected = match self.confirmed(resource_id) {
            Some(resource) => resource.version,
            None => self.refresh(resource_id).await?.version,
        };
        let mut rounds = 0;

        loop {
            match self.mutate(resource_id, expected, change.clone()).await {
                Err(Error::Conflict { current_version, .. }) if rounds < self.max_conflict_retries => {
                    rounds += 1;
                    info!(resource_id, expected, current_version, round = rounds, "Conflict, refetching");
                    expected = self.refresh(resource_id).await?.version;
                }
                result => return result,
            }
        }
    }
}

struct CasInput<T, C> {
    write: CasWrite<C>,
    next: VersionedResource<T>,
}

struct CasMutation<'a, T, C, St> {
    inner: &'a Inner<T, St>,
    _change: PhantomData<fn() -> C>,
}

impl<T, C, St> Mutation for CasMutation<'_, T, C, St>
where
    T: Clone + Send + Sync,
    C: Change<T> + Send + Sync,
    St: VersionedStore<T, C>,
{
    type Input = CasInput<T, C>;
    type Output = Version;
    type Snapshot = ();

    // The overlay is installed by `CasCoordinator::mutate`.
    fn on_mutate(&self, _input: &Self::Input) {}

    async fn mutate(&self, input: &Self::Input) -> Result<Version> {
        let write = &input.write;
        match self.inner.store.compare_and_swap(write).await? {
            CasOutcome::Applied { new_version } => Ok(new_version),
            CasOutcome::Conflict { current_version } => Err(Error::Conflict {
                resource_id: write.resource_id.clone(),
                expected_version: write.expected_version,
                current_version,
            }),
        }
    }

    fn on_success(&self, new_version: &Version, input: &Self::Input) {
        let mut cache = lock(&self.inner.cache);
        let Some(cell) = cache.get_mut(&input.write.resource_id) else {
            return;
        };
        if *new_version > cell.confirmed().version {
            let mut confirmed = input.next.clone();
            confirmed.version = *new_version;
            cell.confirm(confirmed);
        } else {
            // A newer copy already arrived and includes this write.
            debug!(
                resource_id = %input.write.resource_id,
                new_version,
                cached = cell.confirmed().version,
                "Write confirmed behind cache"
            );
            cell.supersede();
        }
    }

    fn on_error(&self, _error: &Error, input: &Self::Input, _snapshot: ()) {
        if let Some(cell) = lock(&self.inner.cache).get_mut(&input.write.resource_id) {
            cell.rollback();
        }
    }
}
