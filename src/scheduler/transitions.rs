//! State transition implementations for the scheduler lifecycle.

use super::types::{Dead, Initializing, Running, SchedulerRecord, SchedulerStats};
use crate::error::Result;
use crate::storage::SchedulerStorage;

impl SchedulerRecord<Initializing> {
    /// Transition scheduler from Initializing to Running.
    pub async fn start<S: SchedulerStorage + ?Sized>(
        self,
        storage: &S,
    ) -> Result<SchedulerRecord<Running>> {
        let now = chrono::Utc::now();
        let record = SchedulerRecord {
            data: self.data,
            state: Running {
                started_at: self.state.started_at,
                last_heartbeat: now,
                stats: SchedulerStats::default(),
            },
        };
        storage.persist_scheduler(&record).await?;
        Ok(record)
    }
}

impl SchedulerRecord<Running> {
    /// Update heartbeat and stats.
    ///
    /// This should be called periodically from the scheduler loop to indicate
    /// the scheduler is still alive and to update processing statistics.
    pub async fn heartbeat<S: SchedulerStorage + ?Sized>(
        self,
        stats: SchedulerStats,
        storage: &S,
    ) -> Result<SchedulerRecord<Running>> {
        let record = SchedulerRecord {
            data: self.data,
            state: Running {
                started_at: self.state.started_at,
                last_heartbeat: chrono::Utc::now(),
                stats,
            },
        };
        storage.persist_scheduler(&record).await?;
        Ok(record)
    }

    /// Transition scheduler to Dead state (graceful shutdown).
    pub async fn shutdown<S: SchedulerStorage + ?Sized>(
        self,
        storage: &S,
    ) -> Result<SchedulerRecord<Dead>> {
        let record = SchedulerRecord {
            data: self.data,
            state: Dead {
                started_at: self.state.started_at,
                stopped_at: chrono::Utc::now(),
                final_stats: self.state.stats,
            },
        };
        storage.persist_scheduler(&record).await?;
        Ok(record)
    }
}
