//! Per-task exclusive locks held across a whole firing.
//!
//! SQLite has no `SELECT ... FOR UPDATE`, so the row lock is an async mutex
//! keyed by task id. Entries nobody holds or waits on are pruned on the next
//! acquisition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// Lock manager keyed by task id.
#[derive(Default)]
pub struct TaskLocks {
    slots: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held for the duration of one firing.
pub struct TaskLockGuard {
    task_id: i64,
    _guard: OwnedMutexGuard<()>,
}

impl TaskLockGuard {
    pub fn task_id(&self) -> i64 {
        self.task_id
    }
}

impl TaskLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other firing holds `task_id`, then hold it.
    pub async fn acquire(&self, task_id: i64) -> TaskLockGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots.retain(|id, slot| *id == task_id || Arc::strong_count(slot) > 1);
            slots.entry(task_id).or_default().clone()
        };
        TaskLockGuard {
            task_id,
            _guard: slot.lock_owned().await,
        }
    }

    /// Whether a firing currently holds `task_id`.
    pub fn is_locked(&self, task_id: i64) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.get(&task_id).is_some_and(|slot| slot.try_lock().is_err())
    }

    pub fn tracked(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_task_serialized() {
        let locks = Arc::new(TaskLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let (locks, active, peak) = (locks.clone(), active.clone(), peak.clone());
            handles.push(tokio::spawn(async move {
                let _g = locks.acquire(1).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_tasks_independent() {
        let locks = TaskLocks::new();
        let a = locks.acquire(1).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(2)).await;
        assert!(b.is_ok());
        assert!(locks.is_locked(1));
        drop(a);
        assert!(!locks.is_locked(1));
    }

    #[tokio::test]
    async fn test_released_slots_pruned() {
        let locks = TaskLocks::new();
        for id in 0..10 {
            let g = locks.acquire(id).await;
            assert_eq!(g.task_id(), id);
        }
        let _g = locks.acquire(100).await;
        assert_eq!(locks.tracked(), 1);
    }
}
