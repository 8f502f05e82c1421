//! Host-keyed store of messages waiting for an open connection.
//!
//! After a delivery the transport asks here whether another spooled
//! message is waiting for the same host, so a hot connection can be
//! reused instead of torn down. Records overflow into continuation
//! records once full; corruption on the insert path purges the host's
//! whole chain, while implausible state on the lookup path is logged
//! and abandoned.

pub mod record;
pub mod store;

pub use record::{MAX_IDS_PER_RECORD, RecordCorruption, WaitingRecord};
pub use store::{FileRecordStore, MemoryRecordStore, RecordStore};

use std::collections::HashSet;

use crate::{error::StoreError, types::MessageId};

/// What a keyed read produced.
enum Loaded {
    Record(WaitingRecord),
    Missing,
    /// Undecodable bytes; carries the chain length when recoverable.
    Corrupt(Option<u16>),
}

/// The waiting store over some record backend.
#[derive(Debug)]
pub struct WaitingStore<S> {
    store: S,
}

impl<S: RecordStore> WaitingStore<S> {
    /// Wrap a backend handle.
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// Release the wrapped backend handle.
    pub fn into_inner(self) -> S {
        self.store
    }

    /// Record that `id` is waiting for each of `hosts`.
    ///
    /// Hosts repeated within one call are processed once. Inserting an
    /// id a host already holds is a no-op. A full primary record is
    /// persisted as the next continuation and a fresh primary started.
    /// A corrupt record purges the host's whole chain first.
    ///
    /// # Errors
    /// Backend read/write failures only; corruption is handled here.
    pub async fn register(&self, hosts: &[&str], id: &MessageId) -> Result<(), StoreError> {
        let mut seen = HashSet::new();
        for &host in hosts {
            if !seen.insert(host) {
                continue;
            }

            let mut record = match self.load(host).await? {
                Loaded::Record(record) => record,
                Loaded::Missing => WaitingRecord::empty(),
                Loaded::Corrupt(sequence) => {
                    self.purge(host, sequence).await?;
                    WaitingRecord::empty()
                }
            };

            if record.ids.contains(id) {
                continue;
            }

            if record.is_full() {
                let key = continuation_key(host, record.sequence);
                let overflowed = WaitingRecord {
                    sequence: record.sequence,
                    ids: std::mem::take(&mut record.ids),
                };
                self.store.put(&key, &overflowed.encode()).await?;
                record.sequence += 1;
            }

            record.ids.push(id.clone());
            self.store.put(host, &record.encode()).await?;
        }

        Ok(())
    }

    /// Pick the next message waiting for `host`, removing it from the
    /// record.
    ///
    /// Returns `None` without consulting the store once `reuse_count`
    /// has reached `max_reuse`. The currently delivering `current` id
    /// is always removed and never offered back. The winner is the
    /// first id whose spool data still exists (per `spool_exists`) and
    /// which `eligible` accepts; ids with missing spool data are
    /// dropped for good. When the primary empties, continuations are
    /// consulted newest first, each deleted as it is read.
    ///
    /// # Errors
    /// Backend failures only. An implausible stored count is logged
    /// and abandoned; undecodable records purge the chain. Neither
    /// fails the delivery.
    pub async fn claim_next(
        &self,
        host: &str,
        current: &MessageId,
        reuse_count: u32,
        max_reuse: Option<u32>,
        spool_exists: impl Fn(&MessageId) -> bool + Send,
        eligible: impl Fn(&MessageId) -> bool + Send,
    ) -> Result<Option<MessageId>, StoreError> {
        if let Some(max) = max_reuse
            && reuse_count >= max
        {
            return Ok(None);
        }

        let mut record = match self.load(host).await? {
            Loaded::Record(record) => record,
            Loaded::Missing => return Ok(None),
            Loaded::Corrupt(sequence) => {
                self.purge(host, sequence).await?;
                return Ok(None);
            }
        };

        if record.ids.len() > MAX_IDS_PER_RECORD {
            tracing::warn!(
                host,
                count = record.ids.len(),
                "implausible waiting record count, abandoning"
            );
            return Ok(None);
        }

        let chain_top = record.sequence;
        let mut selected = None;

        loop {
            record.ids.retain(|id| id != current);

            let mut survivors = Vec::with_capacity(record.ids.len());
            for id in record.ids.drain(..) {
                if selected.is_some() {
                    survivors.push(id);
                } else if !spool_exists(&id) {
                    // Spool data gone; never offer this id again.
                    tracing::debug!(host, %id, "dropping waiting id with no spool data");
                } else if eligible(&id) {
                    selected = Some(id);
                } else {
                    survivors.push(id);
                }
            }
            record.ids = survivors;

            if selected.is_some() || !record.ids.is_empty() || record.sequence == 0 {
                break;
            }

            // Pull in the newest continuation. It is deleted as soon
            // as it is consulted, so ids it holds survive only through
            // the rewritten primary below.
            let generation = record.sequence - 1;
            let key = continuation_key(host, generation);
            match self.load(&key).await? {
                Loaded::Record(next) => {
                    self.store.delete(&key).await?;
                    record = next;
                }
                Loaded::Missing => {
                    record = WaitingRecord {
                        sequence: generation,
                        ids: Vec::new(),
                    };
                }
                Loaded::Corrupt(_) => {
                    self.purge(host, Some(chain_top)).await?;
                    return Ok(None);
                }
            }
        }

        if record.ids.is_empty() && record.sequence == 0 {
            self.store.delete(host).await?;
        } else {
            self.store.put(host, &record.encode()).await?;
        }

        Ok(selected)
    }

    async fn load(&self, key: &str) -> Result<Loaded, StoreError> {
        Ok(match self.store.get(key).await? {
            None => Loaded::Missing,
            Some(bytes) => match WaitingRecord::decode(&bytes) {
                Ok(record) => Loaded::Record(record),
                Err(RecordCorruption { sequence }) => Loaded::Corrupt(sequence),
            },
        })
    }

    /// Delete a host's primary record and every continuation below
    /// `sequence`, leaving the host as if never seen.
    async fn purge(&self, host: &str, sequence: Option<u16>) -> Result<(), StoreError> {
        tracing::warn!(host, ?sequence, "purging corrupt waiting record chain");
        self.store.delete(host).await?;
        if let Some(sequence) = sequence {
            for generation in 0..sequence {
                self.store.delete(&continuation_key(host, generation)).await?;
            }
        }
        Ok(())
    }
}

fn continuation_key(host: &str, generation: u16) -> String {
    format!("{host}:{generation}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "mx.example.com";

    fn waiting() -> WaitingStore<MemoryRecordStore> {
        WaitingStore::new(MemoryRecordStore::new())
    }

    async fn stored(store: &WaitingStore<MemoryRecordStore>, key: &str) -> Option<WaitingRecord> {
        store
            .store
            .get(key)
            .await
            .expect("get")
            .map(|bytes| WaitingRecord::decode(&bytes).expect("decode"))
    }

    async fn claim_any(
        store: &WaitingStore<MemoryRecordStore>,
        current: &MessageId,
    ) -> Option<MessageId> {
        store
            .claim_next(HOST, current, 0, None, |_| true, |_| true)
            .await
            .expect("claim")
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let store = waiting();
        let id = MessageId::generate();

        store.register(&[HOST], &id).await.expect("register");
        store.register(&[HOST], &id).await.expect("register again");

        let record = stored(&store, HOST).await.expect("record");
        assert_eq!(record.ids, vec![id]);
    }

    #[tokio::test]
    async fn repeated_hosts_in_one_call_count_once() {
        let store = waiting();
        let id = MessageId::generate();

        store
            .register(&[HOST, "other.example.com", HOST], &id)
            .await
            .expect("register");

        let record = stored(&store, HOST).await.expect("record");
        assert_eq!(record.ids.len(), 1);
    }

    #[tokio::test]
    async fn overflow_spills_into_continuations_without_losing_ids() {
        let store = waiting();
        let ids: Vec<_> = (0..MAX_IDS_PER_RECORD * 2 + 5)
            .map(|_| MessageId::generate())
            .collect();
        for id in &ids {
            store.register(&[HOST], id).await.expect("register");
        }

        let primary = stored(&store, HOST).await.expect("primary");
        assert_eq!(primary.sequence, 2);
        assert_eq!(primary.ids.len(), 5);

        let mut union: HashSet<MessageId> = primary.ids.into_iter().collect();
        for generation in 0..2 {
            let block = stored(&store, &continuation_key(HOST, generation))
                .await
                .expect("continuation");
            assert_eq!(block.sequence, generation);
            assert_eq!(block.ids.len(), MAX_IDS_PER_RECORD);
            union.extend(block.ids);
        }

        assert_eq!(union, ids.into_iter().collect());
    }

    #[tokio::test]
    async fn own_id_is_never_offered() {
        let store = waiting();
        let current = MessageId::generate();
        store.register(&[HOST], &current).await.expect("register");

        assert_eq!(claim_any(&store, &current).await, None);
        // The sole id was the current one, so the record is gone.
        assert_eq!(stored(&store, HOST).await, None);
    }

    #[tokio::test]
    async fn claims_oldest_eligible_id() {
        let store = waiting();
        let current = MessageId::generate();
        let first = MessageId::generate();
        let second = MessageId::generate();
        for id in [&current, &first, &second] {
            store.register(&[HOST], id).await.expect("register");
        }

        assert_eq!(claim_any(&store, &current).await, Some(first));
        let record = stored(&store, HOST).await.expect("record");
        assert_eq!(record.ids, vec![second]);
    }

    #[tokio::test]
    async fn max_reuse_refuses_without_touching_the_store() {
        let store = waiting();
        let current = MessageId::generate();
        let other = MessageId::generate();
        store.register(&[HOST], &other).await.expect("register");

        let claimed = store
            .claim_next(HOST, &current, 3, Some(3), |_| true, |_| true)
            .await
            .expect("claim");
        assert_eq!(claimed, None);
        // The waiting id is still there for a fresh connection.
        assert_eq!(stored(&store, HOST).await.expect("record").ids, vec![other]);
    }

    #[tokio::test]
    async fn missing_spool_ids_are_dropped_for_good() {
        let store = waiting();
        let current = MessageId::generate();
        let gone = MessageId::generate();
        let good = MessageId::generate();
        store.register(&[HOST], &gone).await.expect("register");
        store.register(&[HOST], &good).await.expect("register");

        let claimed = store
            .claim_next(HOST, &current, 0, None, |id| *id != gone, |_| true)
            .await
            .expect("claim");
        assert_eq!(claimed, Some(good));
        // Nothing survives: the missing-spool id was removed, not kept.
        assert_eq!(stored(&store, HOST).await, None);
    }

    #[tokio::test]
    async fn ineligible_ids_survive_for_later_calls() {
        let store = waiting();
        let current = MessageId::generate();
        let skipped = MessageId::generate();
        store.register(&[HOST], &skipped).await.expect("register");

        let claimed = store
            .claim_next(HOST, &current, 0, None, |_| true, |_| false)
            .await
            .expect("claim");
        assert_eq!(claimed, None);
        assert_eq!(
            stored(&store, HOST).await.expect("record").ids,
            vec![skipped]
        );
    }

    #[tokio::test]
    async fn continuations_are_walked_newest_first() {
        let store = waiting();
        let current = MessageId::generate();
        let ids: Vec<_> = (0..MAX_IDS_PER_RECORD + 1)
            .map(|_| MessageId::generate())
            .collect();
        for id in &ids {
            store.register(&[HOST], id).await.expect("register");
        }

        // Claim the one id in the primary, then the next claim has to
        // fall back to the continuation block.
        let first = claim_any(&store, &current).await.expect("candidate");
        assert_eq!(first, ids[MAX_IDS_PER_RECORD]);

        let second = claim_any(&store, &current).await.expect("candidate");
        assert_eq!(second, ids[0]);

        // The continuation was consumed into the primary.
        assert_eq!(stored(&store, &continuation_key(HOST, 0)).await, None);
        let record = stored(&store, HOST).await.expect("record");
        assert_eq!(record.sequence, 0);
        assert_eq!(record.ids.len(), MAX_IDS_PER_RECORD - 1);
    }

    #[tokio::test]
    async fn corrupt_record_is_purged_on_insert() {
        let store = waiting();
        let survivor = MessageId::generate();

        // A chain whose primary claims one continuation, then garbage.
        store
            .store
            .put(&continuation_key(HOST, 0), &WaitingRecord::empty().encode())
            .await
            .expect("put continuation");
        let mut bytes = WaitingRecord {
            sequence: 1,
            ids: vec![MessageId::generate()],
        }
        .encode();
        for byte in &mut bytes[4..] {
            *byte = b'!';
        }
        store.store.put(HOST, &bytes).await.expect("put corrupt");

        store.register(&[HOST], &survivor).await.expect("register");

        let record = stored(&store, HOST).await.expect("record");
        assert_eq!(record.ids, vec![survivor]);
        assert_eq!(record.sequence, 0);
        assert_eq!(stored(&store, &continuation_key(HOST, 0)).await, None);
    }

    #[tokio::test]
    async fn implausible_count_is_abandoned_not_purged() {
        let store = waiting();
        let current = MessageId::generate();
        let bloated = WaitingRecord {
            sequence: 0,
            ids: (0..=MAX_IDS_PER_RECORD).map(|_| MessageId::generate()).collect(),
        };
        store
            .store
            .put(HOST, &bloated.encode())
            .await
            .expect("put bloated");

        assert_eq!(claim_any(&store, &current).await, None);
        // Abandoned in place: the record is untouched.
        assert_eq!(stored(&store, HOST).await, Some(bloated));
    }
}
