//! Sliding-window rate limits.
//!
//! Each admitted event is one key `LIMIT#key||be64(MAX-ts)`, so a forward
//! scan over the prefix visits events newest first. The value holds the
//! event's expiry (`ts + 2·window`); expired events are pruned lazily from
//! the tail of the range inside the same transaction, standing in for the
//! per-key TTL of the storage contract.

use std::time::Duration;

use redb::ReadableTable;

use crate::{PREFIX_LIMIT, STATE, Storage, StoreError, compose, now_ns, prefix_bounds, range_of, u64_from_be};

impl Storage {
    /// Counts events younger than `window` under `key` and, when
    /// `increase` is set and the quota is not exhausted, records a new
    /// event. Returns how many events remain available after the call;
    /// with `increase` unset this is a pure peek.
    pub fn check_limit(
        &self,
        key: &[u8],
        window: Duration,
        quota: u32,
        increase: bool,
    ) -> Result<u32, StoreError> {
        let now = now_ns();
        let window_ns = window.as_nanos() as u64;
        assert!(
            now < u64::MAX / 2 && now > window_ns,
            "wall clock out of range"
        );
        let now_reverse = u64::MAX - now;
        // keys sort newest first, anything above this is older than the
        // window
        let threshold = now_reverse + window_ns;

        let prefix = compose(PREFIX_LIMIT, key);
        let (lower, upper) = prefix_bounds(&prefix);

        let txn = self.db().begin_write()?;
        let mut available = quota;
        {
            let mut table = txn.open_table(STATE)?;

            let mut expired = Vec::new();
            for entry in table.range::<&[u8]>(range_of(&lower, &upper))?.rev() {
                let (k, v) = entry?;
                if u64_from_be(v.value()) < now {
                    expired.push(k.value().to_vec());
                } else {
                    break;
                }
            }
            for k in &expired {
                table.remove(k.as_slice())?;
            }

            for entry in table.range::<&[u8]>(range_of(&lower, &upper))? {
                if available == 0 {
                    break;
                }
                let (k, _) = entry?;
                if u64_from_be(&k.value()[prefix.len()..]) > threshold {
                    break;
                }
                available -= 1;
            }

            if available > 0 && increase {
                available -= 1;
                let event_key = compose(&prefix, &now_reverse.to_be_bytes());
                let expiry = now + 2 * window_ns;
                table.insert(event_key.as_slice(), expiry.to_be_bytes().as_slice())?;
            }
        }
        txn.commit()?;
        Ok(available)
    }
}
