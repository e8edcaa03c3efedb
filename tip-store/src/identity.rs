//! Identity records: assignee/assignor pinning, sign-request counters and
//! watcher bindings.

use redb::ReadableTable;

use crate::{
    PREFIX_ASSIGNEE, PREFIX_ASSIGNOR, PREFIX_COUNTER, PREFIX_GENESIS, PREFIX_WATCHER, STATE,
    Storage, StoreError, compose, now_ns, u64_from_be,
};

/// The `(genesis, counter)` pair observed through a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchState {
    pub assignor: Vec<u8>,
    pub genesis_ns: u64,
    pub counter: u64,
}

impl Storage {
    /// The key currently representing `key` for signing, if any.
    pub fn read_assignee(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.read_value(PREFIX_ASSIGNEE, key)
    }

    /// The logical identity represented by `key`, if any.
    pub fn read_assignor(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.read_value(PREFIX_ASSIGNOR, key)
    }

    /// Rebinds `key`'s assignee to `assignee` and bumps `key`'s counter.
    ///
    /// The previous reverse mapping is removed first. Unless the identity
    /// binds to itself, an assignee that is already somebody's assignee or
    /// assignor is rejected with [`StoreError::AssignorIsAssignee`]: chains
    /// of bindings are never created. All steps are one transaction.
    pub fn write_assignee(&self, key: &[u8], assignee: &[u8]) -> Result<(), StoreError> {
        let txn = self.db().begin_write()?;
        {
            let mut table = txn.open_table(STATE)?;

            let old = table
                .get(compose(PREFIX_ASSIGNEE, key).as_slice())?
                .map(|guard| guard.value().to_vec());
            if let Some(old) = old {
                table.remove(compose(PREFIX_ASSIGNOR, &old).as_slice())?;
            }

            if key != assignee {
                let bound_as_assignor = table
                    .get(compose(PREFIX_ASSIGNEE, assignee).as_slice())?
                    .is_some();
                let bound_as_assignee = table
                    .get(compose(PREFIX_ASSIGNOR, assignee).as_slice())?
                    .is_some();
                if bound_as_assignor || bound_as_assignee {
                    return Err(StoreError::AssignorIsAssignee);
                }
            }

            table.insert(compose(PREFIX_ASSIGNEE, key).as_slice(), assignee)?;
            table.insert(compose(PREFIX_ASSIGNOR, assignee).as_slice(), key)?;

            let counter_key = compose(PREFIX_COUNTER, key);
            let counter = table
                .get(counter_key.as_slice())?
                .map(|guard| u64_from_be(guard.value()))
                .unwrap_or(0);
            table.insert(
                counter_key.as_slice(),
                (counter + 1).to_be_bytes().as_slice(),
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Records one successful sign for `assignor` under `watcher`.
    ///
    /// The genesis timestamp is written on first sight and never moves;
    /// the counter starts at 1 and is bumped on every later call. The
    /// watcher binds to the assignor on first use and may never rebind to
    /// a different one. Returns the resulting `(genesis_ns, counter)`.
    pub fn write_sign_request(
        &self,
        assignor: &[u8],
        watcher: &[u8],
    ) -> Result<(u64, u64), StoreError> {
        if assignor.is_empty() || watcher.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        let txn = self.db().begin_write()?;
        let (genesis, counter) = {
            let mut table = txn.open_table(STATE)?;

            let counter_key = compose(PREFIX_COUNTER, assignor);
            let counter = table
                .get(counter_key.as_slice())?
                .map(|guard| u64_from_be(guard.value()) + 1)
                .unwrap_or(1);

            let genesis_key = compose(PREFIX_GENESIS, assignor);
            let genesis = table
                .get(genesis_key.as_slice())?
                .map(|guard| u64_from_be(guard.value()))
                .unwrap_or_else(now_ns);

            table.insert(genesis_key.as_slice(), genesis.to_be_bytes().as_slice())?;
            table.insert(counter_key.as_slice(), counter.to_be_bytes().as_slice())?;

            let watcher_key = compose(PREFIX_WATCHER, watcher);
            let bound = table
                .get(watcher_key.as_slice())?
                .map(|guard| guard.value().to_vec());
            if let Some(bound) = bound {
                if bound != assignor {
                    return Err(StoreError::InvalidWatcher);
                }
            }
            table.insert(watcher_key.as_slice(), assignor)?;
            (genesis, counter)
        };
        txn.commit()?;
        Ok((genesis, counter))
    }

    /// Read-only view of the identity state bound to `watcher`.
    pub fn watch(&self, watcher: &[u8]) -> Result<Option<WatchState>, StoreError> {
        let Some(assignor) = self.read_value(PREFIX_WATCHER, watcher)? else {
            return Ok(None);
        };
        let genesis_ns = self
            .read_value(PREFIX_GENESIS, &assignor)?
            .map(|bytes| u64_from_be(&bytes))
            .unwrap_or(0);
        let counter = self
            .read_value(PREFIX_COUNTER, &assignor)?
            .map(|bytes| u64_from_be(&bytes))
            .unwrap_or(0);
        Ok(Some(WatchState {
            assignor,
            genesis_ns,
            counter,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_storage;

    #[test]
    fn assignee_bindings_never_chain() {
        let (storage, _dir) = test_storage();
        let (a, b, c) = (&[1u8][..], &[2u8][..], &[3u8][..]);

        storage.write_assignee(a, b).unwrap();
        assert_eq!(storage.read_assignee(a).unwrap().unwrap(), b);
        assert_eq!(storage.read_assignor(b).unwrap().unwrap(), a);
        assert!(storage.read_assignor(a).unwrap().is_none());

        // b is an assignee, so b may not become an assignor...
        assert!(matches!(
            storage.write_assignee(b, c),
            Err(StoreError::AssignorIsAssignee)
        ));
        // ...and may not become somebody else's assignee either
        assert!(matches!(
            storage.write_assignee(c, b),
            Err(StoreError::AssignorIsAssignee)
        ));

        // rebinding a to c releases b
        storage.write_assignee(a, c).unwrap();
        assert_eq!(storage.read_assignee(a).unwrap().unwrap(), c);
        assert!(storage.read_assignor(b).unwrap().is_none());
        assert_eq!(storage.read_assignor(c).unwrap().unwrap(), a);
        storage.write_assignee(b, b).unwrap();
    }

    #[test]
    fn self_binding_is_allowed() {
        let (storage, _dir) = test_storage();
        let a = &[7u8][..];
        storage.write_assignee(a, a).unwrap();
        assert_eq!(storage.read_assignee(a).unwrap().unwrap(), a);
        assert_eq!(storage.read_assignor(a).unwrap().unwrap(), a);
    }

    #[test]
    fn counters_increase_on_signs_and_rotations() {
        let (storage, _dir) = test_storage();
        let identity = &[9u8; 16][..];
        let watcher = &[1u8; 32][..];

        let (genesis, counter) = storage.write_sign_request(identity, watcher).unwrap();
        assert_eq!(counter, 1);
        assert!(genesis > 0);

        let (genesis_again, counter) = storage.write_sign_request(identity, watcher).unwrap();
        assert_eq!(counter, 2);
        assert_eq!(genesis_again, genesis);

        storage.write_assignee(identity, identity).unwrap();
        let state = storage.watch(watcher).unwrap().unwrap();
        assert_eq!(state.counter, 3);
        assert_eq!(state.genesis_ns, genesis);
        assert_eq!(state.assignor, identity);
    }

    #[test]
    fn watcher_never_rebinds() {
        let (storage, _dir) = test_storage();
        let watcher = &[2u8; 32][..];
        storage.write_sign_request(&[1u8; 16], watcher).unwrap();
        assert!(matches!(
            storage.write_sign_request(&[2u8; 16], watcher),
            Err(StoreError::InvalidWatcher)
        ));
        // the original binding survives the failed attempt
        let state = storage.watch(watcher).unwrap().unwrap();
        assert_eq!(state.assignor, [1u8; 16]);
        assert_eq!(state.counter, 1);
    }

    #[test]
    fn empty_keys_are_rejected() {
        let (storage, _dir) = test_storage();
        assert!(matches!(
            storage.write_sign_request(&[], &[1u8; 32]),
            Err(StoreError::EmptyKey)
        ));
        assert!(matches!(
            storage.write_sign_request(&[1u8; 16], &[]),
            Err(StoreError::EmptyKey)
        ));
    }

    #[test]
    fn unknown_watcher_reads_none() {
        let (storage, _dir) = test_storage();
        assert!(storage.watch(&[5u8; 32]).unwrap().is_none());
    }
}
