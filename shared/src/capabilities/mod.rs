//! Host-provided capabilities: key/value storage and the remote endpoint.
//!
//! The core never touches disk or network directly. Each concern sits
//! behind an async trait so hosts and tests can swap implementations.

mod http;
mod kv;
#[cfg(not(target_arch = "wasm32"))]
mod sqlite;

pub use self::http::{HttpRemote, RemoteEndpoint, RemoteError, ValidatedUrl};
pub use self::kv::{
    FileKvStore, KeyNamespace, KeyValueStore, KvError, KvKey, MemoryKvStore, StorageErrorCode,
    MAX_VALUE_SIZE,
};
#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteKvStore;

pub mod testing {
    //! Failure-injection wrappers for exercising storage error paths in
    //! host integration tests.

    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Wraps a store and fails reads or writes on demand.
    pub struct FailableKvStore {
        inner: Arc<dyn KeyValueStore>,
        fail_get: AtomicBool,
        fail_set: AtomicBool,
        sets: AtomicUsize,
    }

    impl FailableKvStore {
        pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
            Self {
                inner,
                fail_get: AtomicBool::new(false),
                fail_set: AtomicBool::new(false),
                sets: AtomicUsize::new(0),
            }
        }

        pub fn set_fail_get(&self, fail: bool) {
            self.fail_get.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_set(&self, fail: bool) {
            self.fail_set.store(fail, Ordering::SeqCst);
        }

        /// Number of successful writes that reached the inner store.
        pub fn successful_sets(&self) -> usize {
            self.sets.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeyValueStore for FailableKvStore {
        async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
            if self.fail_get.load(Ordering::SeqCst) {
                return Err(KvError::storage(StorageErrorCode::IoError, "injected read failure"));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
            if self.fail_set.load(Ordering::SeqCst) {
                return Err(KvError::storage(StorageErrorCode::DiskFull, "injected write failure"));
            }
            self.inner.set(key, value).await?;
            self.sets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
            self.inner.delete(key).await
        }
    }
}
