//! Ephemeral nonce records guarding against request replay.
//!
//! The record value is `be64(ts) || ephemeral || be64(nonce)`. An incoming
//! pair is accepted when no record exists, when the stored record's grace
//! window has lapsed, or when the ephemeral matches and the nonce strictly
//! grows. A differing ephemeral inside the grace window is rejected
//! outright.

use std::time::Duration;

use redb::ReadableTable;

use crate::{PREFIX_NONCE, STATE, Storage, StoreError, compose, now_ns, u64_from_be};

impl Storage {
    /// Validates `(ephemeral, nonce)` for `key` and, on success, overwrites
    /// the record with the fresh timestamp and nonce.
    pub fn check_ephemeral_nonce(
        &self,
        key: &[u8],
        ephemeral: &[u8],
        nonce: u64,
        grace: Duration,
    ) -> Result<bool, StoreError> {
        let now = now_ns();
        let record = nonce_record(now, ephemeral, nonce);
        let composed = compose(PREFIX_NONCE, key);
        let grace_ns = grace.as_nanos().min(u128::from(u64::MAX)) as u64;

        let txn = self.db().begin_write()?;
        let valid = {
            let mut table = txn.open_table(STATE)?;
            let stored = table
                .get(composed.as_slice())?
                .map(|guard| guard.value().to_vec());
            let valid = match stored {
                None => true,
                Some(stored) => {
                    let stored_ts = u64_from_be(&stored[..8]);
                    if stored_ts.saturating_add(grace_ns) < now {
                        // grace lapsed, any fresh ephemeral may take over
                        true
                    } else if &stored[8..stored.len() - 8] != ephemeral {
                        false
                    } else {
                        u64_from_be(&stored[stored.len() - 8..]) < nonce
                    }
                }
            };
            if valid {
                table.insert(composed.as_slice(), record.as_slice())?;
            }
            valid
        };
        txn.commit()?;
        Ok(valid)
    }

    /// Unconditionally replaces the record; the caller has proven its
    /// authority to rotate.
    pub fn rotate_ephemeral_nonce(
        &self,
        key: &[u8],
        ephemeral: &[u8],
        nonce: u64,
    ) -> Result<(), StoreError> {
        let record = nonce_record(now_ns(), ephemeral, nonce);
        let composed = compose(PREFIX_NONCE, key);
        let txn = self.db().begin_write()?;
        {
            let mut table = txn.open_table(STATE)?;
            table.insert(composed.as_slice(), record.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }
}

fn nonce_record(ts: u64, ephemeral: &[u8], nonce: u64) -> Vec<u8> {
    let mut record = Vec::with_capacity(16 + ephemeral.len());
    record.extend_from_slice(&ts.to_be_bytes());
    record.extend_from_slice(ephemeral);
    record.extend_from_slice(&nonce.to_be_bytes());
    record
}
