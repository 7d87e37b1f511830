//! Record store wrapper that can be told to fail reads or writes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use edgeward_server::{AdminId, DomainRecord, DomainRecordStore, RecordUpdate, StoreError};

pub struct FailingStore {
    inner: Arc<dyn DomainRecordStore>,
    fail_reads: AtomicBool,
    fail_upserts: AtomicBool,
}

impl FailingStore {
    pub fn wrap(inner: Arc<dyn DomainRecordStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_upserts: AtomicBool::new(false),
        })
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DomainRecordStore for FailingStore {
    async fn get(&self, admin_id: AdminId) -> Result<DomainRecord, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        self.inner.get(admin_id).await
    }

    async fn upsert(&self, admin_id: AdminId, update: RecordUpdate) -> Result<(), StoreError> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        self.inner.upsert(admin_id, update).await
    }

    async fn find_active_owner(&self, domain: &str) -> Result<Option<AdminId>, StoreError> {
        self.inner.find_active_owner(domain).await
    }
}
