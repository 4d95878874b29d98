//! Ticket registry over a shared [`StorageBackend`].
//!
//! [`StorageTicketRegistry`] stores one [`StoredRecord`] per ticket and
//! relies on the backend's versioned writes for atomicity:
//!
//! - `add` commits the new record (insert-if-absent) together with the
//!   parent's updated child set (conditioned on the parent's version) in a
//!   single [`WriteBatch`].
//! - `consume` replaces the live record, conditioned on the version it
//!   read, either with the used ticket or with a tombstone. Of concurrent
//!   consumers exactly one write matches.
//! - `delete_with_children` collects the subtree with its versions and
//!   deletes it in one batch; any concurrent change in the subtree makes
//!   the batch fail and the walk is repeated.
//! - `delete_if_expired` adds the version of whatever makes the ticket
//!   expired to that batch, so a refresh in between voids the removal.
//!
//! Removing a ticket unlinks it from its parent in a follow-up write. A
//! link left behind when that write fails is harmless to cascades and is
//! dropped by `prune_children`.
//!
//! Every backend call is bounded by the configured operation timeout.
//! Idempotent reads are retried with backoff; conditional writes only
//! re-run after losing a version race, never after a transient failure.
//!
//! Tombstones carry a backend TTL of `tombstone_ttl`. Live records carry
//! none; expired tickets are removed by reads and by the sweep.

use std::{collections::BTreeSet, future::Future, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sso_ticket_storage::{Precondition, StorageBackend, StorageError, StorageResult, WriteBatch};

use super::{
    TicketRegistry,
    codec::{self, StoredRecord, TICKET_PREFIX},
};
use crate::{
    clock::{Clock, SystemClock},
    config::RegistryConfig,
    error::{TicketError, TicketResult},
    retry::{with_cas_retry, with_retry},
    ticket::{Ticket, TicketId},
};

/// A record read from the backend together with its version.
type Read = Option<(StoredRecord, u64)>;

/// Why a ticket counts as expired through its ancestry.
enum Lapse {
    /// An ancestor is missing or consumed. Neither comes back.
    Gone,
    /// An ancestor is live but expired as of `version`.
    Expired { key: Vec<u8>, version: u64 },
}

/// Registry sharing tickets between nodes through a [`StorageBackend`].
pub struct StorageTicketRegistry<B> {
    backend: B,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
}

#[bon::bon]
impl<B: StorageBackend> StorageTicketRegistry<B> {
    /// Creates a registry over `backend`.
    ///
    /// # Example
    ///
    /// ```
    /// use sso_ticket_storage::MemoryBackend;
    /// use sso_tickets::StorageTicketRegistry;
    ///
    /// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
    /// let registry = StorageTicketRegistry::builder().backend(MemoryBackend::new()).build()?;
    /// # Ok::<(), sso_tickets::TicketError>(())
    /// # }).unwrap();
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::Config`] if `config` does not validate.
    #[builder]
    pub fn new(
        backend: B,
        #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)] clock: Arc<dyn Clock>,
        #[builder(default)] config: RegistryConfig,
    ) -> TicketResult<Self> {
        config.validate()?;
        Ok(Self { backend, clock, config })
    }
}

impl<B: StorageBackend> StorageTicketRegistry<B> {
    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Bounds a backend call by the operation timeout.
    async fn call<T>(
        &self,
        operation: &'static str,
        future: impl Future<Output = StorageResult<T>>,
    ) -> StorageResult<T> {
        match tokio::time::timeout(self.config.operation_timeout, future).await {
            Ok(result) => result,
            Err(_elapsed) => {
                tracing::warn!(
                    operation,
                    timeout_ms = self.config.operation_timeout.as_millis() as u64,
                    "backend call timed out"
                );
                Err(StorageError::timeout())
            },
        }
    }

    async fn read(&self, key: &[u8]) -> TicketResult<Read> {
        match self.call("get", self.backend.get(key)).await? {
            Some(stored) => Ok(Some((codec::decode(&stored.value)?, stored.version))),
            None => Ok(None),
        }
    }

    /// Reads with retry; only for paths that write nothing.
    async fn read_retrying(&self, key: &[u8]) -> TicketResult<Read> {
        with_retry(&self.config.retry, "get", || self.read(key)).await
    }

    /// Writes `record` if the key still carries `version`. `Ok(false)`
    /// reports a lost race.
    async fn replace(
        &self,
        id: &TicketId,
        version: u64,
        record: &StoredRecord,
        ttl: Option<std::time::Duration>,
    ) -> TicketResult<bool> {
        let value = codec::encode(record)?;
        let put = self.backend.put(codec::ticket_key(id), value, Precondition::Version(version), ttl);
        match self.call("put", put).await {
            Ok(_) => Ok(true),
            Err(StorageError::Conflict { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn tombstone(&self, id: &TicketId, version: u64, now: DateTime<Utc>) -> TicketResult<bool> {
        let record = StoredRecord::Consumed { id: id.clone(), consumed_at: now };
        self.replace(id, version, &record, Some(self.config.tombstone_ttl)).await
    }

    /// The first ancestor of `ticket` that is missing, consumed or expired.
    async fn ancestor_lapse(
        &self,
        ticket: &Ticket,
        now: DateTime<Utc>,
    ) -> TicketResult<Option<Lapse>> {
        let mut parent = ticket.parent().cloned();
        while let Some(parent_id) = parent {
            let key = codec::ticket_key(&parent_id);
            match self.read_retrying(&key).await? {
                Some((StoredRecord::Live { ticket: ancestor }, version)) => {
                    if ancestor.is_expired(now) {
                        return Ok(Some(Lapse::Expired { key, version }));
                    }
                    parent = ancestor.parent().cloned();
                },
                None | Some((StoredRecord::Consumed { .. }, _)) => return Ok(Some(Lapse::Gone)),
            }
        }
        Ok(None)
    }

    async fn effectively_expired(&self, ticket: &Ticket, now: DateTime<Utc>) -> TicketResult<bool> {
        Ok(ticket.is_expired(now) || self.ancestor_lapse(ticket, now).await?.is_some())
    }

    async fn purge(&self, id: &TicketId) -> TicketResult<()> {
        self.delete_if_expired(id).await?;
        Ok(())
    }

    /// Drops child ids of `parent_id` that `is_gone` reports. A missing or
    /// consumed parent has nothing to drop.
    async fn try_detach(
        &self,
        parent_id: &TicketId,
        is_gone: impl Fn(&TicketId) -> bool,
    ) -> TicketResult<Option<usize>> {
        let Some((StoredRecord::Live { ticket: mut parent }, version)) =
            self.read(&codec::ticket_key(parent_id)).await?
        else {
            return Ok(Some(0));
        };
        let pruned = parent.retain_children(&is_gone);
        if pruned == 0 {
            return Ok(Some(0));
        }
        let written = self.replace(parent_id, version, &StoredRecord::Live { ticket: parent }, None).await?;
        Ok(written.then_some(pruned))
    }

    /// Unlinks a removed ticket from its parent. A failure only leaves a
    /// stale link behind, so it is logged rather than returned.
    async fn unlink(&self, child: &Ticket) {
        let Some(parent_id) = child.parent() else {
            return;
        };
        let detached =
            with_cas_retry("unlink", || self.try_detach(parent_id, |id| id == child.id())).await;
        if let Err(err) = detached {
            tracing::warn!(
                ticket_id = %child.id(),
                parent_id = %parent_id,
                error = %err,
                "child link left in parent"
            );
        }
    }

    /// Adds `pending` and their descendants to `batch`, each deleted at its
    /// read version. Live tickets are appended to `removed` in walk order.
    async fn collect_subtree(
        &self,
        batch: &mut WriteBatch,
        mut pending: Vec<TicketId>,
        removed: &mut Vec<Ticket>,
    ) -> TicketResult<()> {
        while let Some(next) = pending.pop() {
            let key = codec::ticket_key(&next);
            let Some((record, version)) = self.read(&key).await? else {
                continue;
            };
            batch.delete(key, Precondition::Version(version));
            if let StoredRecord::Live { ticket } = record {
                if let Some(children) = ticket.child_tickets() {
                    pending.extend(children.iter().rev().cloned());
                }
                removed.push(ticket);
            }
        }
        Ok(())
    }

    async fn commit_removal(
        &self,
        batch: WriteBatch,
        removed: Vec<Ticket>,
    ) -> TicketResult<Option<Vec<Ticket>>> {
        if batch.is_empty() {
            return Ok(Some(removed));
        }
        match self.call("commit", self.backend.commit(batch)).await {
            Ok(()) => Ok(Some(removed)),
            Err(StorageError::Conflict { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn try_add(&self, ticket: &Ticket, now: DateTime<Utc>) -> TicketResult<Option<()>> {
        let id = ticket.id();
        let key = codec::ticket_key(id);
        let mut batch = WriteBatch::new();
        let record = codec::encode(&StoredRecord::Live { ticket: ticket.clone() })?;
        batch.put(key.clone(), record, Precondition::Absent);

        if let Some(parent_id) = ticket.parent() {
            let parent_key = codec::ticket_key(parent_id);
            let Some((StoredRecord::Live { ticket: mut parent }, version)) = self.read(&parent_key).await?
            else {
                return Err(TicketError::not_found(parent_id));
            };
            if !parent.kind().can_parent(ticket.kind()) {
                return Err(TicketError::invalid_kind(
                    parent_id,
                    parent.kind(),
                    ticket.kind().expected_parent(),
                ));
            }
            if self.effectively_expired(&parent, now).await? {
                return Err(TicketError::expired(parent_id));
            }
            parent.add_child(id.clone());
            batch.put(
                parent_key,
                codec::encode(&StoredRecord::Live { ticket: parent })?,
                Precondition::Version(version),
            );
        }

        match self.call("commit", self.backend.commit(batch)).await {
            Ok(()) => Ok(Some(())),
            Err(StorageError::Conflict { key: conflicting }) if conflicting.as_bytes() == key.as_slice() => {
                tracing::error!(ticket_id = %id, "duplicate ticket identifier rejected");
                Err(TicketError::duplicate(id))
            },
            Err(StorageError::Conflict { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn try_consume(
        &self,
        id: &TicketId,
        service: &str,
        now: DateTime<Utc>,
    ) -> TicketResult<Option<Ticket>> {
        let (mut ticket, version) = match self.read(&codec::ticket_key(id)).await? {
            None => return Err(TicketError::not_found(id)),
            Some((StoredRecord::Consumed { .. }, _)) => {
                tracing::warn!(ticket_id = %id, "replay of consumed ticket");
                return Err(TicketError::already_consumed(id));
            },
            Some((StoredRecord::Live { ticket }, version)) => (ticket, version),
        };

        if self.effectively_expired(&ticket, now).await? {
            self.purge(id).await?;
            return Err(TicketError::expired(id));
        }

        let bound = match ticket.service_id() {
            Some(bound) if ticket.kind().is_one_time() => bound.to_owned(),
            _ => return Err(TicketError::invalid_kind(id, ticket.kind(), "service or proxy")),
        };

        if bound != service {
            if !self.tombstone(id, version, now).await? {
                return Ok(None);
            }
            self.unlink(&ticket).await;
            tracing::warn!(
                ticket_id = %id,
                bound = %bound,
                presented = %service,
                "service mismatch, ticket burned"
            );
            return Err(TicketError::service_mismatch(id, bound, service));
        }

        ticket.record_use(now);
        if ticket.is_used_up(now) {
            if !self.tombstone(id, version, now).await? {
                return Ok(None);
            }
            self.unlink(&ticket).await;
            return Ok(Some(ticket));
        }
        let written = self.replace(id, version, &StoredRecord::Live { ticket: ticket.clone() }, None).await?;
        Ok(written.then_some(ticket))
    }

    async fn try_update(&self, incoming: &Ticket) -> TicketResult<Option<Ticket>> {
        let id = incoming.id();
        let Some((StoredRecord::Live { ticket: mut stored }, version)) =
            self.read(&codec::ticket_key(id)).await?
        else {
            return Err(TicketError::not_found(id));
        };
        stored.merge_from(incoming);
        let written = self.replace(id, version, &StoredRecord::Live { ticket: stored.clone() }, None).await?;
        Ok(written.then_some(stored))
    }

    /// Returns the removed live ticket, if the record was live.
    async fn try_delete(&self, id: &TicketId) -> TicketResult<Option<Option<Ticket>>> {
        let key = codec::ticket_key(id);
        let Some((record, version)) = self.read(&key).await? else {
            return Ok(Some(None));
        };
        match self.call("delete", self.backend.delete(&key, Precondition::Version(version))).await {
            Ok(_) => Ok(Some(record.into_live())),
            Err(StorageError::Conflict { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn try_delete_subtree(&self, id: &TicketId) -> TicketResult<Option<Vec<Ticket>>> {
        let mut removed = Vec::new();
        let mut batch = WriteBatch::new();
        self.collect_subtree(&mut batch, vec![id.clone()], &mut removed).await?;
        self.commit_removal(batch, removed).await
    }

    async fn try_delete_if_expired(
        &self,
        id: &TicketId,
        now: DateTime<Utc>,
    ) -> TicketResult<Option<Vec<Ticket>>> {
        let key = codec::ticket_key(id);
        let Some((StoredRecord::Live { ticket }, version)) = self.read(&key).await? else {
            return Ok(Some(Vec::new()));
        };

        let mut batch = WriteBatch::new();
        if !ticket.is_expired(now) {
            match self.ancestor_lapse(&ticket, now).await? {
                None => return Ok(Some(Vec::new())),
                Some(Lapse::Gone) => {},
                Some(Lapse::Expired { key: ancestor, version: seen }) => {
                    batch.check(ancestor, Precondition::Version(seen));
                },
            }
        }

        batch.delete(key, Precondition::Version(version));
        let children: Vec<TicketId> =
            ticket.child_tickets().map(|set| set.iter().rev().cloned().collect()).unwrap_or_default();
        let mut removed = vec![ticket];
        self.collect_subtree(&mut batch, children, &mut removed).await?;
        self.commit_removal(batch, removed).await
    }
}

#[async_trait]
impl<B: StorageBackend> TicketRegistry for StorageTicketRegistry<B> {
    #[tracing::instrument(skip(self, ticket), fields(ticket_id = %ticket.id(), kind = %ticket.kind()))]
    async fn add(&self, ticket: Ticket) -> TicketResult<()> {
        let now = self.clock.now();
        with_cas_retry("add", || self.try_add(&ticket, now)).await?;
        tracing::debug!("ticket added");
        Ok(())
    }

    #[tracing::instrument(skip(self, id), fields(ticket_id = %id))]
    async fn fetch(&self, id: &TicketId) -> TicketResult<Ticket> {
        let now = self.clock.now();
        let record = self.read_retrying(&codec::ticket_key(id)).await?;
        let Some(ticket) = record.and_then(|(record, _)| record.into_live()) else {
            return Err(TicketError::not_found(id));
        };

        if self.effectively_expired(&ticket, now).await? {
            self.purge(id).await?;
            return Err(TicketError::expired(id));
        }
        Ok(ticket)
    }

    #[tracing::instrument(skip(self, id), fields(ticket_id = %id))]
    async fn consume(&self, id: &TicketId, service: &str) -> TicketResult<Ticket> {
        let now = self.clock.now();
        let ticket = with_cas_retry("consume", || self.try_consume(id, service, now)).await?;
        tracing::debug!(usage_count = ticket.usage_count(), "ticket used");
        Ok(ticket)
    }

    #[tracing::instrument(skip(self, ticket), fields(ticket_id = %ticket.id()))]
    async fn update(&self, ticket: &Ticket) -> TicketResult<Ticket> {
        with_cas_retry("update", || self.try_update(ticket)).await
    }

    #[tracing::instrument(skip(self, id), fields(ticket_id = %id))]
    async fn delete(&self, id: &TicketId) -> TicketResult<bool> {
        let removed = with_cas_retry("delete", || self.try_delete(id)).await?;
        if let Some(ticket) = &removed {
            self.unlink(ticket).await;
        }
        Ok(removed.is_some())
    }

    #[tracing::instrument(skip(self, id), fields(ticket_id = %id))]
    async fn delete_with_children(&self, id: &TicketId) -> TicketResult<Vec<Ticket>> {
        let removed = with_cas_retry("delete_with_children", || self.try_delete_subtree(id)).await?;
        if let Some(root) = removed.first() {
            self.unlink(root).await;
        }
        tracing::debug!(removed = removed.len(), "ticket subtree deleted");
        Ok(removed)
    }

    #[tracing::instrument(skip(self, id), fields(ticket_id = %id))]
    async fn delete_if_expired(&self, id: &TicketId) -> TicketResult<Vec<Ticket>> {
        let now = self.clock.now();
        let removed = with_cas_retry("delete_if_expired", || self.try_delete_if_expired(id, now)).await?;
        if let Some(root) = removed.first() {
            self.unlink(root).await;
            tracing::debug!(removed = removed.len(), "purged expired ticket");
        }
        Ok(removed)
    }

    #[tracing::instrument(skip(self, id), fields(ticket_id = %id))]
    async fn prune_children(&self, id: &TicketId) -> TicketResult<usize> {
        let record = self.read_retrying(&codec::ticket_key(id)).await?;
        let Some(parent) = record.and_then(|(record, _)| record.into_live()) else {
            return Ok(0);
        };

        let mut stale = BTreeSet::new();
        for child in parent.child_tickets().into_iter().flatten() {
            let record = self.read_retrying(&codec::ticket_key(child)).await?;
            if record.and_then(|(record, _)| record.into_live()).is_none() {
                stale.insert(child.clone());
            }
        }
        if stale.is_empty() {
            return Ok(0);
        }

        // Removed ids never come back, so the set stays stale across retries.
        let pruned =
            with_cas_retry("prune_children", || self.try_detach(id, |child| stale.contains(child)))
                .await?;
        tracing::debug!(pruned, "pruned stale child links");
        Ok(pruned)
    }

    #[tracing::instrument(skip(self))]
    async fn get_all(&self) -> TicketResult<Vec<Ticket>> {
        let entries = with_retry(&self.config.retry, "scan_prefix", || async {
            self.call("scan_prefix", self.backend.scan_prefix(TICKET_PREFIX)).await.map_err(TicketError::from)
        })
        .await?;

        let mut tickets = Vec::with_capacity(entries.len());
        for entry in entries {
            match codec::decode(&entry.value) {
                Ok(record) => tickets.extend(record.into_live()),
                Err(err) => tracing::error!(
                    key = %String::from_utf8_lossy(&entry.key),
                    error = %err,
                    "skipping undecodable ticket record"
                ),
            }
        }
        Ok(tickets)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use sso_ticket_storage::MemoryBackend;

    use super::*;
    use crate::{clock::ManualClock, expiration::ExpirationPolicy, ticket::Authentication};

    fn registry() -> (Arc<ManualClock>, StorageTicketRegistry<MemoryBackend>) {
        let clock = Arc::new(ManualClock::starting_now());
        let registry = StorageTicketRegistry::builder()
            .backend(MemoryBackend::new())
            .clock(clock.clone())
            .build()
            .unwrap();
        (clock, registry)
    }

    fn tgt(id: &str, now: DateTime<Utc>) -> Ticket {
        Ticket::ticket_granting(
            TicketId::new(id),
            Authentication::builder().principal("casuser").build(),
            Arc::new(ExpirationPolicy::hard_timeout(Duration::from_secs(600))),
            now,
        )
    }

    fn st(id: &str, parent: &str, now: DateTime<Utc>) -> Ticket {
        Ticket::service(
            TicketId::new(id),
            TicketId::new(parent),
            "https://app.example",
            false,
            Arc::new(ExpirationPolicy::multi_use(1, Duration::from_secs(10))),
            now,
        )
    }

    #[tokio::test]
    async fn test_add_updates_parent_record() {
        let (clock, registry) = registry();
        registry.add(tgt("TGT-1", clock.now())).await.unwrap();
        registry.add(st("ST-1", "TGT-1", clock.now())).await.unwrap();

        let parent = registry.get(&TicketId::new("TGT-1")).await.unwrap();
        assert!(parent.child_tickets().unwrap().contains(&TicketId::new("ST-1")));
    }

    #[tokio::test]
    async fn test_consume_writes_tombstone_with_ttl() {
        let (clock, registry) = registry();
        registry.add(tgt("TGT-1", clock.now())).await.unwrap();
        registry.add(st("ST-1", "TGT-1", clock.now())).await.unwrap();
        registry.consume(&TicketId::new("ST-1"), "https://app.example").await.unwrap();

        let stored = registry.backend().get(&codec::ticket_key(&TicketId::new("ST-1"))).await.unwrap();
        let record = codec::decode(&stored.unwrap().value).unwrap();
        assert!(matches!(record, StoredRecord::Consumed { .. }));

        let replay = registry.consume(&TicketId::new("ST-1"), "https://app.example").await;
        assert!(matches!(replay, Err(TicketError::AlreadyConsumed { .. })));
    }

    #[tokio::test]
    async fn test_get_all_excludes_tombstones_and_skips_garbage() {
        let (clock, registry) = registry();
        registry.add(tgt("TGT-1", clock.now())).await.unwrap();
        registry.add(st("ST-1", "TGT-1", clock.now())).await.unwrap();
        registry.consume(&TicketId::new("ST-1"), "https://app.example").await.unwrap();

        let mut garbage = TICKET_PREFIX.to_vec();
        garbage.extend_from_slice(b"garbage");
        registry.backend().put(garbage, b"not json".to_vec(), Precondition::Any, None).await.unwrap();

        let all = registry.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id(), &TicketId::new("TGT-1"));
    }

    #[tokio::test]
    async fn test_fetch_reports_corrupt_record() {
        let (_clock, registry) = registry();
        let id = TicketId::new("TGT-9");
        registry
            .backend()
            .put(codec::ticket_key(&id), b"{}".to_vec(), Precondition::Any, None)
            .await
            .unwrap();

        let err = registry.fetch(&id).await.unwrap_err();
        assert!(err.is_integrity_fault());
    }

    /// Delegates to a [`MemoryBackend`] but never answers reads.
    struct StallingBackend(MemoryBackend);

    #[async_trait]
    impl StorageBackend for StallingBackend {
        async fn get(&self, _key: &[u8]) -> StorageResult<Option<sso_ticket_storage::Versioned>> {
            std::future::pending().await
        }

        async fn put(
            &self,
            key: Vec<u8>,
            value: Vec<u8>,
            precondition: Precondition,
            ttl: Option<Duration>,
        ) -> StorageResult<u64> {
            self.0.put(key, value, precondition, ttl).await
        }

        async fn delete(&self, key: &[u8], precondition: Precondition) -> StorageResult<bool> {
            self.0.delete(key, precondition).await
        }

        async fn scan_prefix(
            &self,
            prefix: &[u8],
        ) -> StorageResult<Vec<sso_ticket_storage::VersionedEntry>> {
            self.0.scan_prefix(prefix).await
        }

        async fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
            self.0.commit(batch).await
        }

        async fn health_check(&self) -> StorageResult<()> {
            self.0.health_check().await
        }
    }

    #[tokio::test]
    async fn test_stalled_backend_is_unavailable_not_missing() {
        let config = RegistryConfig::builder()
            .operation_timeout(Duration::from_millis(20))
            .retry(
                crate::config::RetryConfig::builder()
                    .max_retries(1)
                    .initial_backoff(Duration::from_millis(1))
                    .build(),
            )
            .build();
        let registry = StorageTicketRegistry::builder()
            .backend(StallingBackend(MemoryBackend::new()))
            .config(config)
            .build()
            .unwrap();

        let err = registry.get(&TicketId::new("TGT-1")).await.unwrap_err();
        assert!(matches!(err, TicketError::BackendUnavailable { .. }), "got {err:?}");
        assert!(err.is_transient());

        let err = registry.consume(&TicketId::new("ST-1"), "https://app.example").await.unwrap_err();
        assert!(err.is_transient(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_cascade_removes_subtree_in_one_batch() {
        let (clock, registry) = registry();
        registry.add(tgt("TGT-1", clock.now())).await.unwrap();
        registry.add(st("ST-1", "TGT-1", clock.now())).await.unwrap();
        registry.add(st("ST-2", "TGT-1", clock.now())).await.unwrap();
        registry.consume(&TicketId::new("ST-2"), "https://app.example").await.unwrap();

        let removed = registry.delete_with_children(&TicketId::new("TGT-1")).await.unwrap();
        let ids: Vec<_> = removed.iter().map(|t| t.id().as_str().to_owned()).collect();
        assert_eq!(ids, vec!["TGT-1", "ST-1"]);

        // Only the unlinked tombstone of ST-2 is left, until its TTL runs out.
        let left = registry.backend().scan_prefix(TICKET_PREFIX).await.unwrap();
        assert_eq!(left.len(), 1);
        assert!(matches!(codec::decode(&left[0].value).unwrap(), StoredRecord::Consumed { .. }));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = RegistryConfig::builder().operation_timeout(Duration::ZERO).build();
        let result =
            StorageTicketRegistry::builder().backend(MemoryBackend::new()).config(config).build();
        assert!(matches!(result, Err(TicketError::Config { .. })));
    }

    #[tokio::test]
    async fn test_consume_unlinks_child_from_parent_record() {
        let (clock, registry) = registry();
        registry.add(tgt("TGT-1", clock.now())).await.unwrap();
        registry.add(st("ST-1", "TGT-1", clock.now())).await.unwrap();
        registry.add(st("ST-2", "TGT-1", clock.now())).await.unwrap();

        registry.consume(&TicketId::new("ST-1"), "https://app.example").await.unwrap();
        registry.delete(&TicketId::new("ST-2")).await.unwrap();

        let parent = registry.get(&TicketId::new("TGT-1")).await.unwrap();
        assert!(parent.child_tickets().unwrap().is_empty());
        assert!(!registry.is_volatile());
    }

    #[tokio::test]
    async fn test_prune_drops_links_to_missing_records() {
        let (clock, registry) = registry();
        registry.add(tgt("TGT-1", clock.now())).await.unwrap();
        registry.add(st("ST-1", "TGT-1", clock.now())).await.unwrap();
        registry.add(st("ST-2", "TGT-1", clock.now())).await.unwrap();

        // Removed behind the registry's back: the parent keeps a stale link.
        let key = codec::ticket_key(&TicketId::new("ST-1"));
        registry.backend().delete(&key, Precondition::Any).await.unwrap();

        assert_eq!(registry.prune_children(&TicketId::new("TGT-1")).await.unwrap(), 1);
        assert_eq!(registry.prune_children(&TicketId::new("TGT-1")).await.unwrap(), 0);
        let parent = registry.get(&TicketId::new("TGT-1")).await.unwrap();
        let children: Vec<_> = parent.child_tickets().unwrap().iter().map(TicketId::as_str).collect();
        assert_eq!(children, vec!["ST-2"]);
    }

    #[tokio::test]
    async fn test_delete_if_expired_spares_refreshed_ancestor() {
        let clock = Arc::new(ManualClock::starting_now());
        let registry = StorageTicketRegistry::builder()
            .backend(MemoryBackend::new())
            .clock(clock.clone())
            .build()
            .unwrap();
        let idle = Ticket::ticket_granting(
            TicketId::new("TGT-1"),
            Authentication::builder().principal("casuser").build(),
            Arc::new(ExpirationPolicy::idle_timeout(Duration::from_secs(60))),
            clock.now(),
        );
        registry.add(idle.clone()).await.unwrap();
        let child = Ticket::service(
            TicketId::new("ST-1"),
            TicketId::new("TGT-1"),
            "https://app.example",
            false,
            Arc::new(ExpirationPolicy::NeverExpires),
            clock.now(),
        );
        registry.add(child).await.unwrap();

        clock.advance(Duration::from_secs(30));
        let mut refreshed = idle;
        refreshed.record_use(clock.now());
        clock.advance(Duration::from_secs(45));

        // Another node persists a use it made before the idle window closed.
        registry.update(&refreshed).await.unwrap();
        let removed = registry.delete_if_expired(&TicketId::new("ST-1")).await.unwrap();
        assert!(removed.is_empty());
        assert!(registry.get(&TicketId::new("ST-1")).await.is_ok());

        clock.advance(Duration::from_secs(61));
        let removed = registry.delete_if_expired(&TicketId::new("ST-1")).await.unwrap();
        let ids: Vec<_> = removed.iter().map(|t| t.id().as_str()).collect();
        assert_eq!(ids, vec!["ST-1"]);
    }
}
