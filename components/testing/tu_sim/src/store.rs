use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thumbsup_core::hw::BlobStore;
use thumbsup_core::{ErrorKind, TuError, TuResult};

/// In-memory blob store. Clones share the same contents so a test can
/// corrupt what the code under test persisted.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_writes: Arc<Mutex<bool>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        let blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        blobs.get(key).cloned()
    }

    pub fn put_raw(&self, key: &str, blob: Vec<u8>) {
        let mut blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        blobs.insert(key.to_string(), blob);
    }

    pub fn corrupt_byte(&self, key: &str, index: usize) -> bool {
        let mut blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        match blobs.get_mut(key).and_then(|b| b.get_mut(index)) {
            Some(byte) => {
                *byte ^= 0xFF;
                true
            }
            None => false,
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap_or_else(PoisonError::into_inner) = fail;
    }
}

impl BlobStore for MemoryBlobStore {
    fn load(&self, key: &str) -> TuResult<Option<Vec<u8>>> {
        Ok(self.raw(key))
    }

    fn store(&mut self, key: &str, blob: &[u8]) -> TuResult<()> {
        if *self.fail_writes.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(TuError::new(
                ErrorKind::HardwareFault,
                format!("simulated flash write failure for {key}"),
            ));
        }
        self.put_raw(key, blob.to_vec());
        Ok(())
    }
}
