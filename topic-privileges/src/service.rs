// SPDX-License-Identifier: MIT OR Apache-2.0

//! Service routing privilege observations into per-transaction or debounced accumulators.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::accumulator::{Accumulated, PendingUpdate, UpdateAccumulator};
use crate::cache::GrantCache;
use crate::config::Config;
use crate::entity::Entity;
use crate::grant::{Grant, GrantError, GrantReplacement};
use crate::lineage::{GraphError, PrivilegeGraph};
use crate::traits::PrivilegeStore;
use crate::transaction::Transaction;
use crate::types::{EntityId, GrantId, UserId, VertexId};

#[derive(Debug, Error)]
pub enum AttachError<E> {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("failed to load grants of entity {0}: {1}")]
    Load(EntityId, #[source] E),
}

/// Accumulator shared between the service and the hooks of its transaction.
pub type SharedAccumulator = Arc<Mutex<UpdateAccumulator>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ServiceInner<S> {
    store: Arc<S>,
    config: Config,
    cache: GrantCache<S>,

    /// Accumulators of in-flight transactions, by transaction key.
    accumulators: Mutex<HashMap<String, SharedAccumulator>>,

    /// Accumulator collecting observations made outside of any transaction.
    fallback: Mutex<Option<SharedAccumulator>>,

    /// Scheduled flushes of fallback accumulators.
    flushes: Mutex<Vec<JoinHandle<()>>>,

    fallback_count: AtomicU64,
}

/// Keeps entity privilege records in line with the grants placed on the graph.
///
/// Observations made within a transaction are flushed into that same transaction right before it
/// commits, so privilege updates are atomic with the change causing them. Observations made
/// without a transaction are collected for a short debounce window and written in a transaction
/// of their own.
///
/// Debounced flushes are spawned on the current tokio runtime.
pub struct PrivilegeService<S> {
    inner: Arc<ServiceInner<S>>,
}

impl<S> Clone for PrivilegeService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> PrivilegeService<S>
where
    S: PrivilegeStore + Send + Sync + 'static,
{
    pub fn new(store: Arc<S>, config: Config) -> Self {
        let cache = GrantCache::new(store.clone(), config.current_user.clone());
        Self {
            inner: Arc::new(ServiceInner {
                store,
                config,
                cache,
                accumulators: Mutex::new(HashMap::new()),
                fallback: Mutex::new(None),
                flushes: Mutex::new(Vec::new()),
                fallback_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn cache(&self) -> &GrantCache<S> {
        &self.inner.cache
    }

    /// Resolve the grants referenced by an entity's current privilege record.
    pub async fn load_privileges(&self, entity: &Entity) -> Result<(), S::Error> {
        entity.privileges().load(&self.inner.cache).await
    }

    /// Resolve the entity's grants and attach it to `vertex`.
    ///
    /// Entities only take part in reconciliation once their grants are loaded, so a restored
    /// entity never holds back the updates of the others.
    pub async fn attach(
        &self,
        graph: &mut PrivilegeGraph,
        vertex: &VertexId,
        entity: Entity,
    ) -> Result<(), AttachError<S::Error>> {
        if !graph.contains(vertex) {
            return Err(GraphError::UnknownVertex(vertex.clone()).into());
        }

        self.load_privileges(&entity)
            .await
            .map_err(|err| AttachError::Load(entity.id().clone(), err))?;
        graph.attach_entity(vertex, entity)?;
        Ok(())
    }

    /// Archive a grant. Once committed, the grant is dropped from the cache.
    pub fn archive_grant(&self, tx: &mut Transaction, grant: &Grant) {
        grant.archive(tx);
        self.invalidate_on_commit(tx, grant.id());
    }

    /// Replace a grant, see [`Grant::replace`]. Once committed, the archived grant is dropped
    /// from the cache.
    pub fn replace_grant(
        &self,
        tx: &mut Transaction,
        grant: &Grant,
        replacement: GrantReplacement,
        author: &UserId,
    ) -> Result<Grant, GrantError> {
        let replaced = grant.replace(tx, replacement, author)?;
        self.invalidate_on_commit(tx, grant.id());
        Ok(replaced)
    }

    fn invalidate_on_commit(&self, tx: &mut Transaction, id: &GrantId) {
        let inner = self.inner.clone();
        let id = id.clone();
        tx.add_post_commit_hook(move || inner.cache.invalidate(&id));
    }

    /// Accumulator for the given transaction, or the debounced fallback if there is none.
    ///
    /// The first call for a transaction registers its hooks: the accumulator is flushed into the
    /// transaction when it commits and released after it committed or aborted. A fallback
    /// accumulator which already started flushing is replaced by a new one.
    pub fn accumulator_for(&self, tx: Option<&mut Transaction>) -> SharedAccumulator {
        match tx {
            Some(tx) => self.inner.bound_accumulator(tx),
            None => self.inner.fallback_accumulator(),
        }
    }

    /// Buffer the privileges of every entity at or below `vertex`.
    ///
    /// Returns the number of observations which were buffered, entities the current user may not
    /// change are skipped.
    pub fn observe(
        &self,
        graph: &PrivilegeGraph,
        vertex: &VertexId,
        mut tx: Option<&mut Transaction>,
    ) -> Result<usize, GraphError> {
        let observations = graph.observations(vertex)?;
        if observations.is_empty() {
            return Ok(0);
        }

        let mut buffered = 0;
        let mut accumulator = self.accumulator_for(tx.as_deref_mut());
        for (privs, entity) in &observations {
            loop {
                let outcome = lock(&accumulator).accumulate(privs, entity);
                match outcome {
                    Accumulated::Buffered => {
                        buffered += 1;
                        break;
                    }
                    Accumulated::Unauthorized => break,
                    Accumulated::Inactive => {
                        accumulator = self.accumulator_for(tx.as_deref_mut());
                    }
                }
            }
        }

        debug!(vertex = %vertex, buffered, "observe privileges");
        Ok(buffered)
    }

    /// Wait for all scheduled debounced flushes to finish.
    pub async fn settle(&self) {
        loop {
            let flushes = std::mem::take(&mut *lock(&self.inner.flushes));
            if flushes.is_empty() {
                break;
            }

            for flush in flushes {
                if let Err(err) = flush.await {
                    error!(%err, "privilege flush task failed");
                }
            }
        }
    }
}

impl<S> ServiceInner<S>
where
    S: PrivilegeStore + Send + Sync + 'static,
{
    fn new_accumulator(&self) -> SharedAccumulator {
        Arc::new(Mutex::new(UpdateAccumulator::new(
            self.config.current_user.clone(),
        )))
    }

    fn bound_accumulator(self: &Arc<Self>, tx: &mut Transaction) -> SharedAccumulator {
        let key = tx.key().to_owned();

        let accumulator = {
            let mut accumulators = lock(&self.accumulators);
            if let Some(accumulator) = accumulators.get(&key) {
                return accumulator.clone();
            }
            let accumulator = self.new_accumulator();
            accumulators.insert(key.clone(), accumulator.clone());
            accumulator
        };

        {
            let inner = self.clone();
            let key = key.clone();
            let accumulator = accumulator.clone();
            tx.add_pre_commit_hook(move |tx| inner.flush_bound(&key, &accumulator, tx));
        }

        {
            let inner = self.clone();
            let key = key.clone();
            let accumulator = accumulator.clone();
            tx.add_post_commit_hook(move || inner.release(&key, &accumulator));
        }

        {
            let inner = self.clone();
            let accumulator = accumulator.clone();
            tx.add_abort_hook(move || {
                lock(&accumulator).deactivate();
                inner.release(&key, &accumulator);
            });
        }

        accumulator
    }

    fn release(&self, key: &str, accumulator: &SharedAccumulator) {
        let mut accumulators = lock(&self.accumulators);
        if accumulators
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, accumulator))
        {
            accumulators.remove(key);
        }
    }

    fn flush_bound(
        self: &Arc<Self>,
        key: &str,
        accumulator: &SharedAccumulator,
        tx: &mut Transaction,
    ) {
        // Observations made after this point go into a fresh accumulator, flushed by its own hook.
        self.release(key, accumulator);

        let mut guard = lock(accumulator);
        match guard.flush() {
            Ok(Some(update)) => {
                debug!(tx = %key, entities = update.len(), "apply privilege updates");
                if let Err(err) = update.apply(tx) {
                    error!(tx = %key, %err, "failed to apply privilege updates");
                }
            }
            Ok(None) => {
                debug!(tx = %key, "privileges unchanged");
            }
            Err(err) => {
                let pending = guard.take_pending();
                drop(guard);

                if self.config.requeue_failed_flushes {
                    warn!(tx = %key, %err, "requeue privilege updates");
                    self.requeue(pending);
                } else {
                    error!(tx = %key, %err, "drop privilege updates");
                }
            }
        }
    }

    fn requeue(self: &Arc<Self>, pending: Vec<PendingUpdate>) {
        loop {
            let accumulator = self.fallback_accumulator();
            let mut accumulator = lock(&accumulator);
            if accumulator.is_active() {
                accumulator.requeue(pending);
                return;
            }
        }
    }

    fn fallback_accumulator(self: &Arc<Self>) -> SharedAccumulator {
        let mut slot = lock(&self.fallback);
        if let Some(accumulator) = slot.as_ref() {
            if lock(accumulator).is_active() {
                return accumulator.clone();
            }
        }

        let accumulator = self.new_accumulator();
        *slot = Some(accumulator.clone());
        drop(slot);

        match Handle::try_current() {
            Ok(handle) => {
                let flush = handle.spawn(self.clone().flush_fallback(accumulator.clone()));
                lock(&self.flushes).push(flush);
            }
            Err(_) => {
                error!("no runtime, privilege updates outside of transactions are not flushed");
            }
        }

        accumulator
    }

    async fn flush_fallback(self: Arc<Self>, accumulator: SharedAccumulator) {
        tokio::time::sleep(self.config.debounce).await;

        let entities = {
            let mut accumulator = lock(&accumulator);
            accumulator.deactivate();
            accumulator.entities()
        };
        if entities.is_empty() {
            return;
        }

        let count = self.fallback_count.fetch_add(1, Ordering::Relaxed);
        let key = format!("privileges-{count}");

        for entity in &entities {
            if let Err(err) = entity.privileges().load(&self.cache).await {
                error!(
                    tx = %key,
                    entity = %entity.id(),
                    %err,
                    "failed to load grants, drop privilege updates"
                );
                return;
            }
        }

        let result = lock(&accumulator).flush();
        let update = match result {
            Ok(Some(update)) => update,
            Ok(None) => {
                debug!(tx = %key, "privileges unchanged");
                return;
            }
            Err(err) => {
                error!(tx = %key, %err, "drop privilege updates");
                return;
            }
        };

        let mut tx = Transaction::new(key);
        if let Err(err) = update.apply(&mut tx) {
            error!(tx = %tx.key(), %err, "failed to apply privilege updates");
            return;
        }

        if let Err(err) = tx.commit(self.store.as_ref()).await {
            error!(%err, "failed to commit privilege updates");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use crate::config::Config;
    use crate::entity::{Entity, EntityKind};
    use crate::grant::{Grant, GrantInstruction, PermissionLevel};
    use crate::lineage::{GraphError, PrivilegeGraph};
    use crate::privileges::{PrivilegeData, PrivilegeRecord};
    use crate::test_utils::MemoryStore;
    use crate::transaction::Transaction;
    use crate::types::{EntityId, GrantId, UserId, VertexId};

    use super::{AttachError, PrivilegeService};

    fn service() -> PrivilegeService<MemoryStore> {
        PrivilegeService::new(
            Arc::new(MemoryStore::new()),
            Config::new(UserId::from("alice")),
        )
    }

    #[tokio::test]
    async fn one_accumulator_per_transaction() {
        let service = service();
        let mut tx_1 = Transaction::new("tx-1");
        let mut tx_2 = Transaction::new("tx-2");

        let a = service.accumulator_for(Some(&mut tx_1));
        let b = service.accumulator_for(Some(&mut tx_1));
        let c = service.accumulator_for(Some(&mut tx_2));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        tx_1.commit(service.store().as_ref()).await.unwrap();
        assert!(!a.lock().unwrap().is_active());

        // Released once committed.
        let mut tx_1 = Transaction::new("tx-1");
        let d = service.accumulator_for(Some(&mut tx_1));
        assert!(!Arc::ptr_eq(&a, &d));
    }

    #[tokio::test]
    async fn abort_releases_accumulator() {
        let service = service();
        let mut tx = Transaction::new("tx-1");
        let a = service.accumulator_for(Some(&mut tx));
        tx.abort();
        assert!(!a.lock().unwrap().is_active());

        let mut tx = Transaction::new("tx-1");
        let b = service.accumulator_for(Some(&mut tx));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(b.lock().unwrap().is_active());
    }

    #[tokio::test]
    async fn dropped_transaction_releases_accumulator() {
        let service = service();
        let mut tx = Transaction::new("tx-1");
        let a = service.accumulator_for(Some(&mut tx));
        drop(tx);
        assert!(!a.lock().unwrap().is_active());

        let mut tx = Transaction::new("tx-1");
        let b = service.accumulator_for(Some(&mut tx));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn archived_grants_leave_the_cache() {
        let service = service();
        let store = service.store().clone();
        store.detach_handles(true).await;

        let alice = UserId::from("alice");
        let mut tx = Transaction::new("share");
        let grant = Grant::create(
            &mut tx,
            &VertexId::from("doc"),
            GrantInstruction::allow(PermissionLevel::Read, "bob"),
            &alice,
        )
        .unwrap();
        tx.commit(store.as_ref()).await.unwrap();
        assert!(service.cache().get_by_id(grant.id()).await.unwrap().is_some());

        let mut tx = Transaction::new("unshare");
        service.archive_grant(&mut tx, &grant);
        tx.commit(store.as_ref()).await.unwrap();
        assert!(service.cache().get_by_id(grant.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn attach_loads_grants_first() {
        let service = service();
        let store = service.store().clone();
        let alice = UserId::from("alice");

        let mut graph = PrivilegeGraph::new();
        let doc = VertexId::from("doc");
        graph.add_vertex(doc.clone());

        let restored = Entity::new(
            EntityId::from("restored"),
            EntityKind::Property,
            alice.clone(),
            PrivilegeRecord::from_persisted(PrivilegeData {
                recipient_id: vec![alice.clone()],
                write_id: vec![alice.clone()],
                admin_id: vec![alice.clone()],
                share_id: vec![GrantId::from("unknown")],
            }),
        );

        assert_matches!(
            service
                .attach(&mut graph, &VertexId::from("nowhere"), restored.clone())
                .await,
            Err(AttachError::Graph(GraphError::UnknownVertex(_)))
        );

        store.fail_lookups(true).await;
        assert_matches!(
            service.attach(&mut graph, &doc, restored.clone()).await,
            Err(AttachError::Load(id, _)) if id == *restored.id()
        );
        assert!(graph.observations(&doc).unwrap().is_empty());

        store.fail_lookups(false).await;
        service.attach(&mut graph, &doc, restored.clone()).await.unwrap();
        assert!(restored.privileges().is_loaded());
        assert_eq!(graph.observations(&doc).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_is_replaced_once_flushed() {
        let service = service();
        let a = service.accumulator_for(None);
        let b = service.accumulator_for(None);
        assert!(Arc::ptr_eq(&a, &b));

        service.settle().await;
        assert!(!a.lock().unwrap().is_active());

        let c = service.accumulator_for(None);
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(c.lock().unwrap().is_active());
        service.settle().await;
    }
}
