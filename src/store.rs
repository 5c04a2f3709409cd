//! Local mirror of device registers.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Last known state of one register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub address: u16,
    pub value: u16,
    /// Store version at which this value was written.
    pub sequence: u64,
    pub updated_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    registers: BTreeMap<u16, Register>,
    version: u64,
}

/// Thread-safe map of register address to last observed value.
///
/// Every mutation bumps the store version. A block update is applied as one
/// mutation, so a [`Snapshot`] never shows half of it.
#[derive(Debug, Default)]
pub struct RegisterStore {
    inner: Mutex<Inner>,
}

impl RegisterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set one register. Returns the new store version.
    pub fn update(&self, address: u16, value: u16) -> u64 {
        self.update_block(address, &[value])
    }

    /// Set consecutive registers starting at `start` in one step.
    pub fn update_block(&self, start: u16, values: &[u16]) -> u64 {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.version += 1;
        let sequence = inner.version;
        for (address, value) in (start..=u16::MAX).zip(values.iter().copied()) {
            inner.registers.insert(
                address,
                Register {
                    address,
                    value,
                    sequence,
                    updated_at: now,
                },
            );
        }
        sequence
    }

    /// Last value seen for `address`, `None` if it was never read or written.
    pub fn get(&self, address: u16) -> Option<u16> {
        self.lock().registers.get(&address).map(|r| r.value)
    }

    pub fn register(&self, address: u16) -> Option<Register> {
        self.lock().registers.get(&address).copied()
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.lock();
        Snapshot {
            version: inner.version,
            taken_at: Instant::now(),
            registers: inner.registers.clone(),
        }
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn len(&self) -> usize {
        self.lock().registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().registers.is_empty()
    }

    /// Forget every register. The version keeps counting.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.registers.clear();
        inner.version += 1;
    }
}

/// An owned, point-in-time copy of a [`RegisterStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    version: u64,
    taken_at: Instant,
    registers: BTreeMap<u16, Register>,
}

impl Snapshot {
    pub fn get(&self, address: u16) -> Option<u16> {
        self.registers.get(&address).map(|r| r.value)
    }

    pub fn register(&self, address: u16) -> Option<&Register> {
        self.registers.get(&address)
    }

    /// Store version this snapshot reflects.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }

    /// `(address, value)` pairs in address order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.registers.values().map(|r| (r.address, r.value))
    }

    pub fn values(&self) -> BTreeMap<u16, u16> {
        self.iter().collect()
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}

impl core::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{{")?;
        for (i, (address, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "0x{address:02X}: {value}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn absent_until_written() {
        let store = RegisterStore::new();
        assert_eq!(store.get(0x3a), None);
        assert!(store.is_empty());

        store.update(0x3a, 7);
        assert_eq!(store.get(0x3a), Some(7));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn updates_bump_version() {
        let store = RegisterStore::new();
        let v1 = store.update(0x3a, 7);
        let v2 = store.update(0x3a, 8);
        assert!(v2 > v1);
        assert_eq!(store.get(0x3a), Some(8));
        assert_eq!(store.register(0x3a).unwrap().sequence, v2);
        assert_eq!(store.version(), v2);
    }

    #[test]
    fn block_update_shares_sequence() {
        let store = RegisterStore::new();
        let version = store.update_block(0x34, &[1, 2, 3]);
        assert_eq!(store.get(0x34), Some(1));
        assert_eq!(store.get(0x36), Some(3));
        assert_eq!(store.get(0x37), None);
        for address in 0x34..=0x36 {
            assert_eq!(store.register(address).unwrap().sequence, version);
        }
    }

    #[test]
    fn block_update_stops_at_address_space_end() {
        let store = RegisterStore::new();
        store.update_block(0xFFFF, &[1, 2]);
        assert_eq!(store.get(0xFFFF), Some(1));
        assert_eq!(store.get(0x0000), None);
    }

    #[test]
    fn snapshot_is_detached_copy() {
        let store = RegisterStore::new();
        store.update(0x3a, 7);
        let snapshot = store.snapshot();
        store.update(0x3a, 9);

        assert_eq!(snapshot.get(0x3a), Some(7));
        assert_eq!(store.get(0x3a), Some(9));
        assert!(store.version() > snapshot.version());
    }

    #[test]
    fn snapshot_formatting() {
        let store = RegisterStore::new();
        store.update_block(0x3a, &[7, 8]);
        assert_eq!(store.snapshot().to_string(), "{0x3A: 7, 0x3B: 8}");
        assert_eq!(RegisterStore::new().snapshot().to_string(), "{}");
    }

    #[test]
    fn clear_forgets_registers() {
        let store = RegisterStore::new();
        store.update(0x3a, 7);
        let before = store.version();
        store.clear();
        assert!(store.is_empty());
        assert!(store.version() > before);
    }

    #[test]
    fn concurrent_snapshots_never_see_partial_blocks() {
        let store = Arc::new(RegisterStore::new());
        store.update_block(0, &[0; 8]);

        let writers: Vec<_> = (0..4)
            .map(|id| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for n in 0..500u16 {
                        store.update_block(0, &[id * 1000 + n; 8]);
                    }
                })
            })
            .collect();

        let reader = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..2000 {
                    let snapshot = store.snapshot();
                    let values: Vec<u16> = snapshot.iter().map(|(_, v)| v).collect();
                    assert_eq!(values.len(), 8);
                    assert!(values.iter().all(|v| *v == values[0]), "torn snapshot {values:?}");
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(store.version(), 1 + 4 * 500);
    }
}
