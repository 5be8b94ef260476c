//! Alert Evaluator: checks recent execution history against user rules.
//!
//! Never returns an error to the caller; it runs inside a firing's own
//! failure path.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use pushclock_core::error::{PushclockError, Result};
use pushclock_core::traits::Notifier;
use pushclock_core::types::{AlertRule, AlertType, ExecutionLogEntry, ExecutionStatus};

use crate::persistence::SchedulerDb;

pub struct AlertEvaluator {
    db: Arc<SchedulerDb>,
    notifier: Arc<dyn Notifier>,
}

impl AlertEvaluator {
    pub fn new(db: Arc<SchedulerDb>, notifier: Arc<dyn Notifier>) -> Self {
        Self { db, notifier }
    }

    /// Evaluate every enabled `alert_type` rule covering `task_id`.
    /// Returns the number of alerts delivered.
    pub async fn evaluate(&self, task_id: i64, alert_type: AlertType) -> usize {
        match self.try_evaluate(task_id, alert_type).await {
            Ok(sent) => sent,
            Err(e) => {
                tracing::error!("🚨 Alert evaluation ({alert_type}) for task {task_id} failed: {e}");
                0
            }
        }
    }

    async fn try_evaluate(&self, task_id: i64, alert_type: AlertType) -> Result<usize> {
        let Some(task) = self.db.get_task(task_id)? else {
            return Ok(0);
        };
        let rules = self.db.alert_rules_for(task.user_id, alert_type, task_id)?;
        let now = Utc::now();
        let mut sent = 0;

        for rule in rules {
            if !rule.can_fire(now) {
                tracing::debug!("🚨 Rule '{}' in cooldown", rule.name);
                continue;
            }
            let since = match window_start(&rule, now) {
                Ok(since) => since,
                Err(e) => {
                    tracing::error!("🚨 Rule '{}' skipped: {e}", rule.name);
                    continue;
                }
            };
            let entries = self.db.executions_since(task_id, since)?;
            let Some(detail) = breach(&rule, &entries) else {
                continue;
            };

            let title = format!("⚠️ 告警: {}", rule.name);
            let body = format!(
                "任务 #{} 「{}」{}（最近 {} 分钟）",
                task.id, task.title, detail, rule.params.time_window_minutes
            );
            match self.notifier.send(&rule.channel, &rule.channel_config, &title, &body).await {
                Ok(()) => {
                    tracing::warn!("🚨 Alert '{}' fired for task {}: {detail}", rule.name, task.id);
                    self.db.record_alert_trigger(rule.id, now)?;
                    sent += 1;
                }
                Err(e) => {
                    tracing::warn!("🚨 Alert '{}' could not be delivered via {}: {e}", rule.name, rule.channel);
                }
            }
        }
        Ok(sent)
    }
}

fn window_start(rule: &AlertRule, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    Duration::try_minutes(rule.params.time_window_minutes.max(1))
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| {
            PushclockError::Config(format!(
                "out-of-range time window: {} minutes",
                rule.params.time_window_minutes
            ))
        })
}

/// Describe how `entries` cross `rule`'s threshold, if they do.
fn breach(rule: &AlertRule, entries: &[ExecutionLogEntry]) -> Option<String> {
    let threshold = rule.params.threshold.max(1) as usize;
    let count = |pred: &dyn Fn(&ExecutionLogEntry) -> bool| entries.iter().filter(|e| pred(e)).count();

    match rule.rule_type {
        AlertType::DuplicateExecution => {
            let n = count(&|e| e.is_duplicate);
            (n >= threshold).then(|| format!("出现 {n} 次重复执行"))
        }
        AlertType::ExecutionFailure => {
            let n = count(&|e| e.status == ExecutionStatus::Failed);
            (n >= threshold).then(|| format!("执行失败 {n} 次"))
        }
        AlertType::LongRunning => {
            let limit_ms = rule.params.max_duration_secs.max(0) * 1000;
            let n = count(&|e| e.is_finished() && e.duration_ms.is_some_and(|d| d > limit_ms));
            (n >= threshold).then(|| format!("{n} 次执行超过 {} 秒", rule.params.max_duration_secs))
        }
        AlertType::HighFailureRate => {
            let finished = count(&|e| e.is_finished());
            let failed = count(&|e| e.status == ExecutionStatus::Failed);
            if finished == 0 || finished < rule.params.min_executions as usize {
                return None;
            }
            let rate = failed * 100 / finished;
            (rate >= rule.params.threshold as usize)
                .then(|| format!("失败率 {rate}%（{failed}/{finished}）"))
        }
    }
}

/// Alert kinds to evaluate after a finished firing.
pub fn after_firing(success: bool) -> &'static [AlertType] {
    if success {
        &[AlertType::LongRunning]
    } else {
        &[AlertType::ExecutionFailure, AlertType::HighFailureRate, AlertType::LongRunning]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pushclock_core::types::{ChannelConfig, Delivery, Task};
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn send(&self, channel: &str, _config: &ChannelConfig, title: &str, _body: &str) -> Result<()> {
            if self.fail {
                return Err(PushclockError::Delivery("alert channel down".into()));
            }
            self.sent.lock().unwrap().push((channel.to_string(), title.to_string()));
            Ok(())
        }
    }

    fn setup(fail: bool) -> (Arc<SchedulerDb>, Arc<Recorder>, AlertEvaluator, i64) {
        let db = Arc::new(SchedulerDb::open(&PathBuf::from(":memory:")).unwrap());
        let task = Task::once(3, "Report", "b", Delivery::single("webhook", ChannelConfig::new()), Utc::now());
        let task_id = db.insert_task(&task).unwrap();
        let recorder = Arc::new(Recorder { fail, ..Default::default() });
        let evaluator = AlertEvaluator::new(db.clone(), recorder.clone());
        (db, recorder, evaluator, task_id)
    }

    fn log(db: &SchedulerDb, task_id: i64, status: ExecutionStatus, duplicate: bool, duration_ms: i64) {
        let start = Utc::now() - Duration::seconds(5);
        let mut entry = ExecutionLogEntry::begin(task_id, "task_1", start, status, "w", "h");
        entry.is_duplicate = duplicate;
        if status != ExecutionStatus::Skipped {
            entry.finish(start + Duration::milliseconds(duration_ms), status);
        }
        db.insert_execution(&entry).unwrap();
    }

    fn rule(db: &SchedulerDb, rule_type: AlertType, threshold: u32) -> i64 {
        let mut rule = AlertRule::new(3, "watch", rule_type, "webhook", ChannelConfig::new());
        rule.params.threshold = threshold;
        rule.params.min_executions = 2;
        rule.params.max_duration_secs = 1;
        db.insert_alert_rule(&rule).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_threshold() {
        let (db, recorder, evaluator, task_id) = setup(false);
        let rule_id = rule(&db, AlertType::DuplicateExecution, 2);
        log(&db, task_id, ExecutionStatus::Skipped, true, 0);
        assert_eq!(evaluator.evaluate(task_id, AlertType::DuplicateExecution).await, 0);

        log(&db, task_id, ExecutionStatus::Skipped, true, 0);
        assert_eq!(evaluator.evaluate(task_id, AlertType::DuplicateExecution).await, 1);
        assert_eq!(recorder.sent.lock().unwrap()[0].1, "⚠️ 告警: watch");
        assert_eq!(db.get_alert_rule(rule_id).unwrap().unwrap().trigger_count, 1);

        // cooldown suppresses an immediate repeat
        assert_eq!(evaluator.evaluate(task_id, AlertType::DuplicateExecution).await, 0);
    }

    #[tokio::test]
    async fn test_failure_count() {
        let (db, _recorder, evaluator, task_id) = setup(false);
        rule(&db, AlertType::ExecutionFailure, 1);
        log(&db, task_id, ExecutionStatus::Success, false, 10);
        assert_eq!(evaluator.evaluate(task_id, AlertType::ExecutionFailure).await, 0);
        log(&db, task_id, ExecutionStatus::Failed, false, 10);
        assert_eq!(evaluator.evaluate(task_id, AlertType::ExecutionFailure).await, 1);
    }

    #[tokio::test]
    async fn test_alert_delivery_failure_swallowed() {
        let (db, _recorder, evaluator, task_id) = setup(true);
        let rule_id = rule(&db, AlertType::ExecutionFailure, 1);
        log(&db, task_id, ExecutionStatus::Failed, false, 10);
        assert_eq!(evaluator.evaluate(task_id, AlertType::ExecutionFailure).await, 0);
        assert_eq!(db.get_alert_rule(rule_id).unwrap().unwrap().trigger_count, 0);
    }

    #[tokio::test]
    async fn test_oversized_window_is_logged_not_raised() {
        let (db, recorder, evaluator, task_id) = setup(false);
        let mut huge = AlertRule::new(3, "forever", AlertType::ExecutionFailure, "webhook", ChannelConfig::new());
        huge.params.time_window_minutes = i64::MAX / 2;
        db.insert_alert_rule(&huge).unwrap();
        rule(&db, AlertType::ExecutionFailure, 1);
        log(&db, task_id, ExecutionStatus::Failed, false, 10);

        // the sane rule still fires
        assert_eq!(evaluator.evaluate(task_id, AlertType::ExecutionFailure).await, 1);
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_task_is_quiet() {
        let (_db, _recorder, evaluator, _task_id) = setup(false);
        assert_eq!(evaluator.evaluate(404, AlertType::ExecutionFailure).await, 0);
    }

    #[test]
    fn test_long_running_and_failure_rate() {
        let mut long = AlertRule::new(1, "slow", AlertType::LongRunning, "webhook", ChannelConfig::new());
        long.params.max_duration_secs = 1;
        let mut rate = AlertRule::new(1, "flaky", AlertType::HighFailureRate, "webhook", ChannelConfig::new());
        rate.params.threshold = 50;
        rate.params.min_executions = 2;

        let start = Utc::now();
        let mut entries = Vec::new();
        for (status, ms) in [(ExecutionStatus::Success, 200), (ExecutionStatus::Failed, 1500)] {
            let mut e = ExecutionLogEntry::begin(1, "task_1", start, status, "w", "h");
            e.finish(start + Duration::milliseconds(ms), status);
            entries.push(e);
        }
        assert!(breach(&long, &entries).is_some());
        assert_eq!(breach(&rate, &entries).as_deref(), Some("失败率 50%（1/2）"));
        assert!(breach(&rate, &entries[..1]).is_none());
    }

    #[test]
    fn test_alert_kinds_after_firing() {
        assert_eq!(after_firing(true), &[AlertType::LongRunning]);
        assert!(after_firing(false).contains(&AlertType::ExecutionFailure));
    }
}
