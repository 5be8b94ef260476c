//! Domain types shared by the dispatcher, hook runner and scheduler.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PushclockError;

/// Opaque per-channel configuration supplied by the task or rule owner.
pub type ChannelConfig = serde_json::Map<String, serde_json::Value>;

/// Per-channel outcomes of one multi-channel firing, keyed by channel name.
pub type SendResults = BTreeMap<String, ChannelOutcome>;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum
/// persisted as snake_case text.
macro_rules! text_enum {
    ($ty:ident, $label:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = PushclockError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(PushclockError::Other(format!(
                        "unknown {} '{other}'",
                        $label
                    ))),
                }
            }
        }
    };
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
    Paused,
}

text_enum!(TaskStatus, "task status" {
    Pending => "pending",
    Sent => "sent",
    Failed => "failed",
    Cancelled => "cancelled",
    Paused => "paused",
});

/// Where a task's message goes. Exactly one mode per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Delivery {
    /// One channel; failures mark the whole task failed.
    Single {
        channel: String,
        #[serde(default)]
        config: ChannelConfig,
    },
    /// Several channels, each delivered and accounted independently.
    Multi {
        channels: Vec<String>,
        #[serde(default)]
        configs: BTreeMap<String, ChannelConfig>,
    },
}

impl Delivery {
    pub fn single(channel: impl Into<String>, config: ChannelConfig) -> Self {
        Self::Single {
            channel: channel.into(),
            config,
        }
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, Self::Multi { .. })
    }

    /// Every (channel, config) pair to deliver to, in configured order.
    /// A multi-channel entry without a config gets an empty map so the
    /// dispatcher reports which key is missing.
    pub fn targets(&self) -> Vec<(String, ChannelConfig)> {
        match self {
            Self::Single { channel, config } => vec![(channel.clone(), config.clone())],
            Self::Multi { channels, configs } => channels
                .iter()
                .map(|c| (c.clone(), configs.get(c).cloned().unwrap_or_default()))
                .collect(),
        }
    }
}

/// Lifecycle point a hook script runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    BeforeExecute,
    AfterSuccess,
    AfterFailure,
}

text_enum!(HookType, "hook type" {
    BeforeExecute => "before_execute",
    AfterSuccess => "after_success",
    AfterFailure => "after_failure",
});

/// Interpreter used for a hook script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptLanguage {
    #[default]
    Python,
    Shell,
}

text_enum!(ScriptLanguage, "script language" {
    Python => "python",
    Shell => "shell",
});

/// One configured hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, alias = "script_type")]
    pub language: ScriptLanguage,
    #[serde(default)]
    pub script: String,
    /// Seconds; `None` falls back to the runner default.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Hook scripts keyed by lifecycle point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HooksConfig(pub BTreeMap<HookType, HookSpec>);

impl HooksConfig {
    /// The hook to run at `hook_type`, if one is enabled and non-empty.
    pub fn active(&self, hook_type: HookType) -> Option<&HookSpec> {
        self.0
            .get(&hook_type)
            .filter(|spec| spec.enabled && !spec.script.trim().is_empty())
    }

    pub fn insert(&mut self, hook_type: HookType, spec: HookSpec) {
        self.0.insert(hook_type, spec);
    }
}

/// A notification job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Assigned by the store; 0 until persisted.
    #[serde(default)]
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub body: String,
    pub delivery: Delivery,
    /// Instant of the next (or only) firing.
    pub scheduled_time: DateTime<Utc>,
    #[serde(default)]
    pub is_recurring: bool,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub sent_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_msg: Option<String>,
    #[serde(default)]
    pub send_results: Option<SendResults>,
    #[serde(default)]
    pub hooks_config: Option<HooksConfig>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

impl Task {
    /// Create a one-time task firing at `at`.
    pub fn once(user_id: i64, title: &str, body: &str, delivery: Delivery, at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            user_id,
            title: title.to_string(),
            body: body.to_string(),
            delivery,
            scheduled_time: at,
            is_recurring: false,
            cron_expression: None,
            status: TaskStatus::Pending,
            sent_time: None,
            error_msg: None,
            send_results: None,
            hooks_config: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a recurring task driven by a cron expression.
    pub fn recurring(user_id: i64, title: &str, body: &str, delivery: Delivery, expression: &str) -> Self {
        let mut task = Self::once(user_id, title, body, delivery, Utc::now());
        task.is_recurring = true;
        task.cron_expression = Some(expression.to_string());
        task
    }

    pub fn with_hooks(mut self, hooks: HooksConfig) -> Self {
        self.hooks_config = Some(hooks);
        self
    }

    /// Stable job identifier for the durable job table.
    pub fn job_id(&self) -> String {
        job_id_for(self.id, self.is_recurring)
    }

    pub fn hook(&self, hook_type: HookType) -> Option<&HookSpec> {
        self.hooks_config.as_ref().and_then(|h| h.active(hook_type))
    }
}

/// `task_{id}` for one-time tasks, `recurring_task_{id}` for recurring ones.
pub fn job_id_for(task_id: i64, is_recurring: bool) -> String {
    if is_recurring {
        format!("recurring_task_{task_id}")
    } else {
        format!("task_{task_id}")
    }
}

/// Result of one channel within a firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelOutcome {
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl ChannelOutcome {
    pub fn sent() -> Self {
        Self {
            status: DeliveryStatus::Sent,
            error: None,
            at: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            error: Some(error.into()),
            at: Utc::now(),
        }
    }

    pub fn is_sent(&self) -> bool {
        self.status == DeliveryStatus::Sent
    }
}

/// Status of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Started,
    Success,
    Failed,
    Skipped,
}

text_enum!(ExecutionStatus, "execution status" {
    Started => "started",
    Success => "success",
    Failed => "failed",
    Skipped => "skipped",
});

/// One record per attempted firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: i64,
    pub task_id: i64,
    pub job_id: String,
    pub execution_start: DateTime<Utc>,
    pub execution_end: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: ExecutionStatus,
    pub send_results: Option<SendResults>,
    pub success_count: u32,
    pub failure_count: u32,
    pub worker_id: String,
    pub host: String,
    pub is_duplicate: bool,
    pub duplicate_check_key: String,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
}

impl ExecutionLogEntry {
    /// A fresh entry for a firing starting at `start`.
    pub fn begin(
        task_id: i64,
        job_id: &str,
        start: DateTime<Utc>,
        status: ExecutionStatus,
        worker_id: &str,
        host: &str,
    ) -> Self {
        Self {
            id: 0,
            task_id,
            job_id: job_id.to_string(),
            execution_start: start,
            execution_end: None,
            duration_ms: None,
            status,
            send_results: None,
            success_count: 0,
            failure_count: 0,
            worker_id: worker_id.to_string(),
            host: host.to_string(),
            is_duplicate: false,
            duplicate_check_key: duplicate_check_key(task_id, start),
            error_message: None,
            error_trace: None,
        }
    }

    /// Fill in end time and duration.
    pub fn finish(&mut self, end: DateTime<Utc>, status: ExecutionStatus) {
        self.execution_end = Some(end);
        self.duration_ms = Some((end - self.execution_start).num_milliseconds().max(0));
        self.status = status;
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, ExecutionStatus::Success | ExecutionStatus::Failed)
    }
}

/// Task id plus start time truncated to the second.
pub fn duplicate_check_key(task_id: i64, start: DateTime<Utc>) -> String {
    format!("{task_id}_{}", start.format("%Y%m%d%H%M%S"))
}

/// Status of a hook invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookRunStatus {
    Started,
    Success,
    Failed,
    Timeout,
}

text_enum!(HookRunStatus, "hook status" {
    Started => "started",
    Success => "success",
    Failed => "failed",
    Timeout => "timeout",
});

/// One record per hook invocation, linked to its firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookExecutionLogEntry {
    pub id: i64,
    pub task_id: i64,
    pub execution_log_id: i64,
    pub hook_type: HookType,
    pub language: ScriptLanguage,
    pub script_snapshot: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: HookRunStatus,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub return_data: Option<serde_json::Value>,
}

/// Kind of anomaly an alert rule watches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    DuplicateExecution,
    ExecutionFailure,
    LongRunning,
    HighFailureRate,
}

text_enum!(AlertType, "alert type" {
    DuplicateExecution => "duplicate_execution",
    ExecutionFailure => "execution_failure",
    LongRunning => "long_running",
    HighFailureRate => "high_failure_rate",
});

/// Tunables of an alert rule, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertParams {
    #[serde(default = "default_window")]
    pub time_window_minutes: i64,
    /// Count for most rule types, percentage for `high_failure_rate`.
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: i64,
    #[serde(default = "default_min_executions")]
    pub min_executions: u32,
}

fn default_window() -> i64 { 60 }
fn default_threshold() -> u32 { 1 }
fn default_max_duration() -> i64 { 300 }
fn default_min_executions() -> u32 { 5 }

impl Default for AlertParams {
    fn default() -> Self {
        Self {
            time_window_minutes: default_window(),
            threshold: default_threshold(),
            max_duration_secs: default_max_duration(),
            min_executions: default_min_executions(),
        }
    }
}

/// A user-defined alert rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub user_id: i64,
    /// `None` watches every task of the owner.
    pub task_id: Option<i64>,
    pub name: String,
    pub rule_type: AlertType,
    pub params: AlertParams,
    pub channel: String,
    pub channel_config: ChannelConfig,
    pub enabled: bool,
    pub cooldown_secs: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub trigger_count: u32,
    pub created_at: DateTime<Utc>,
}

impl AlertRule {
    pub fn new(user_id: i64, name: &str, rule_type: AlertType, channel: &str, channel_config: ChannelConfig) -> Self {
        Self {
            id: 0,
            user_id,
            task_id: None,
            name: name.to_string(),
            rule_type,
            params: AlertParams::default(),
            channel: channel.to_string(),
            channel_config,
            enabled: true,
            cooldown_secs: 300,
            last_triggered_at: None,
            trigger_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Whether the cooldown since the last trigger has elapsed.
    pub fn can_fire(&self, now: DateTime<Utc>) -> bool {
        match self.last_triggered_at {
            Some(last) => (now - last).num_seconds() >= self.cooldown_secs as i64,
            None => true,
        }
    }

    pub fn applies_to(&self, task_id: i64) -> bool {
        self.task_id.is_none_or(|id| id == task_id)
    }
}

/// Outcome event published to live listeners of the task owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub task_id: i64,
    pub title: String,
    pub status: TaskStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn executed(task: &Task, message: impl Into<String>) -> Self {
        Self {
            kind: "task_executed".into(),
            task_id: task.id,
            title: task.title.clone(),
            status: task.status,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
