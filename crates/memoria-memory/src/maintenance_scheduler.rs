//! 记忆维护调度器
//!
//! 按固定间隔对所有项目执行一次保留维护，并累计统计。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration as TokioDuration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::manager::{MemoryEngine, SweepStatus};

const MAX_RECORDED_ERRORS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSchedule {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for MaintenanceSchedule {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintenanceStats {
    pub runs: u64,
    pub projects_maintained: u64,
    pub projects_failed: u64,
    pub memories_removed: u64,
    pub edges_pruned: u64,
    pub last_run: Option<DateTime<Utc>>,
    /// 最近的错误，最多保留 10 条
    pub errors: Vec<String>,
}

pub struct MemoryMaintenanceScheduler {
    schedule: MaintenanceSchedule,
    stats: Arc<RwLock<MaintenanceStats>>,
    is_running: Arc<RwLock<bool>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryMaintenanceScheduler {
    pub fn new(schedule: MaintenanceSchedule) -> Self {
        Self {
            schedule,
            stats: Arc::new(RwLock::new(MaintenanceStats::default())),
            is_running: Arc::new(RwLock::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn schedule(&self) -> &MaintenanceSchedule {
        &self.schedule
    }

    pub async fn start(&self, engine: Arc<MemoryEngine>) {
        if !self.schedule.enabled {
            info!("记忆维护调度已禁用");
            return;
        }

        let mut is_running = self.is_running.write().await;
        if *is_running {
            warn!("记忆维护调度器已在运行");
            return;
        }
        *is_running = true;
        drop(is_running);

        info!("启动记忆维护调度器, 间隔 {} 秒", self.schedule.interval_secs);

        let period = TokioDuration::from_secs(self.schedule.interval_secs.max(1));
        let stats = self.stats.clone();
        let is_running = self.is_running.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if !*is_running.read().await {
                    break;
                }
                Self::run_sweep(&engine, &stats).await;
            }
            info!("记忆维护调度器已停止");
        });

        *self.handle.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        *self.is_running.write().await = false;
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
        info!("停止记忆维护调度器");
    }

    /// 立即执行一次全量维护
    pub async fn run_once(&self, engine: &MemoryEngine) {
        Self::run_sweep(engine, &self.stats).await;
    }

    async fn run_sweep(engine: &MemoryEngine, stats: &Arc<RwLock<MaintenanceStats>>) {
        match engine.maintain_all().await {
            Ok(sweep) => {
                let mut stats_lock = stats.write().await;
                stats_lock.runs += 1;
                stats_lock.last_run = Some(Utc::now());
                stats_lock.memories_removed += sweep.memories_removed() as u64;
                stats_lock.edges_pruned += sweep.edges_pruned() as u64;
                for result in &sweep.results {
                    match &result.status {
                        SweepStatus::Completed(_) => stats_lock.projects_maintained += 1,
                        SweepStatus::Failed { message, .. } => {
                            stats_lock.projects_failed += 1;
                            Self::push_error(
                                &mut stats_lock,
                                format!("{}: {}", result.project_id, message),
                            );
                        }
                    }
                }
            }
            Err(e) => {
                error!("全量维护失败: {}", e);
                let mut stats_lock = stats.write().await;
                stats_lock.runs += 1;
                stats_lock.last_run = Some(Utc::now());
                Self::push_error(&mut stats_lock, e.to_string());
            }
        }
    }

    fn push_error(stats: &mut MaintenanceStats, error: String) {
        if stats.errors.len() >= MAX_RECORDED_ERRORS {
            stats.errors.remove(0);
        }
        stats.errors.push(error);
    }

    pub async fn get_stats(&self) -> MaintenanceStats {
        self.stats.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }
}
