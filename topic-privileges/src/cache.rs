// SPDX-License-Identifier: MIT OR Apache-2.0

//! Memoised lookup of grant records.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::try_join_all;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::grant::Grant;
use crate::traits::PrivilegeStore;
use crate::types::{GrantId, UserId};

type Entry = Arc<OnceCell<Option<Grant>>>;

/// Caches grant records by id on behalf of one viewer.
///
/// Concurrent lookups of the same id share a single request to the store. Failed lookups are not
/// cached and will be retried by the next caller.
#[derive(Debug)]
pub struct GrantCache<S> {
    store: Arc<S>,
    viewer: UserId,
    entries: Mutex<HashMap<GrantId, Entry>>,
}

impl<S> GrantCache<S>
where
    S: PrivilegeStore,
{
    pub fn new(store: Arc<S>, viewer: UserId) -> Self {
        Self {
            store,
            viewer,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, id: &GrantId) -> Entry {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.entry(id.clone()).or_default().clone()
    }

    /// Look up an active grant.
    ///
    /// Returns `None` if the grant does not exist, is not visible to the viewer or has been
    /// archived. None of these are errors.
    pub async fn get_by_id(&self, id: &GrantId) -> Result<Option<Grant>, S::Error> {
        let entry = self.entry(id);
        let grant = entry
            .get_or_try_init(|| async {
                debug!(grant = %id, "fetch grant");
                let grant = self.store.grant(id, &self.viewer).await?;
                if grant.is_none() {
                    warn!(grant = %id, "grant was not found");
                }
                Ok::<_, S::Error>(grant)
            })
            .await?;

        match grant {
            Some(grant) if grant.is_active() => Ok(Some(grant.clone())),
            Some(_) => {
                warn!(grant = %id, "grant is archived");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Resolve many grants in parallel, dropping missing and archived ones.
    ///
    /// A grant's status is checked again once all lookups resolved, it might have been archived
    /// in the meantime.
    pub async fn get_many(&self, ids: &[GrantId]) -> Result<Vec<Grant>, S::Error> {
        let grants = try_join_all(ids.iter().map(|id| self.get_by_id(id))).await?;
        Ok(grants
            .into_iter()
            .flatten()
            .filter(Grant::is_active)
            .collect())
    }

    /// Forget a cached grant, the next lookup goes to the store again.
    pub fn invalidate(&self, id: &GrantId) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(id);
    }
}
