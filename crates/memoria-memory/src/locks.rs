//! 项目级互斥锁
//!
//! 同一项目的维护和写入串行执行，不同项目互不影响。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct ProjectLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, project_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// 获取项目锁，守卫释放时解锁
    pub async fn acquire(&self, project_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(project_id).lock_owned().await
    }

    /// 非阻塞尝试，已被占用时返回 None
    pub fn try_acquire(&self, project_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(project_id).try_lock_owned().ok()
    }
}
