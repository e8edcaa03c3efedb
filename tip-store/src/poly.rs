//! Poly state written once by the DKG: the group identity pin, the public
//! commitments and this node's private share.

use redb::ReadableTable;

use crate::{KEY_POLY_GROUP, KEY_POLY_PUBLIC, KEY_POLY_SHARE, STATE, Storage, StoreError};

impl Storage {
    /// Pins the signer-group identity on first use. Returns `true` when the
    /// stored value matches (or was just written), `false` on any mismatch;
    /// a mismatch never overwrites the pin.
    pub fn check_poly_group(&self, group: &[u8]) -> Result<bool, StoreError> {
        let txn = self.db().begin_write()?;
        let valid = {
            let mut table = txn.open_table(STATE)?;
            let stored = table.get(KEY_POLY_GROUP)?.map(|guard| guard.value().to_vec());
            match stored {
                None => {
                    table.insert(KEY_POLY_GROUP, group)?;
                    true
                }
                Some(stored) => stored == group,
            }
        };
        txn.commit()?;
        Ok(valid)
    }

    pub fn read_poly_public(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.read_value(KEY_POLY_PUBLIC, &[])
    }

    pub fn read_poly_share(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.read_value(KEY_POLY_SHARE, &[])
    }

    /// Persists the DKG output atomically. The poly state is written
    /// exactly once; a later call finds it present and leaves it alone.
    pub fn write_poly(&self, public: &[u8], share: &[u8]) -> Result<(), StoreError> {
        let txn = self.db().begin_write()?;
        {
            let mut table = txn.open_table(STATE)?;
            let present = table.get(KEY_POLY_PUBLIC)?.is_some() || table.get(KEY_POLY_SHARE)?.is_some();
            if !present {
                table.insert(KEY_POLY_PUBLIC, public)?;
                table.insert(KEY_POLY_SHARE, share)?;
            }
        }
        txn.commit()?;
        Ok(())
    }
}
