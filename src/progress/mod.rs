//! 进度追踪
//!
//! 每次运行一个 ProgressTracker，维护 ExecutionProgress 快照并通过 broadcast 发布 ProgressEvent。
//! 没有订阅者时发布是空操作。overall_progress 在一次运行内单调不减。

mod estimates;
mod events;

pub use estimates::{DurationEstimates, SYNTHETIC_PROGRESS_CAP};
pub use events::ProgressEvent;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::CallId;
use crate::workflow::CallStatus;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 单个工具调用的进度
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolProgress {
    pub call_id: CallId,
    pub tool_name: String,
    pub status: CallStatus,
    /// 0–100
    pub progress: f64,
    pub message: Option<String>,
    /// 工具是否显式上报过进度（显式上报后不再合成）
    pub explicit: bool,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// 整次运行的进度快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionProgress {
    pub total_tools: usize,
    pub completed_tools: usize,
    pub failed_tools: usize,
    pub skipped_tools: usize,
    /// 当前阶段（从 1 开始，0 表示尚未开始）
    pub current_phase: usize,
    pub total_phases: usize,
    pub overall_progress: f64,
    pub tools: BTreeMap<CallId, ToolProgress>,
    pub started_at: i64,
    pub estimated_time_remaining_ms: Option<u64>,
}

impl ExecutionProgress {
    fn new() -> Self {
        Self {
            total_tools: 0,
            completed_tools: 0,
            failed_tools: 0,
            skipped_tools: 0,
            current_phase: 0,
            total_phases: 0,
            overall_progress: 0.0,
            tools: BTreeMap::new(),
            started_at: chrono::Utc::now().timestamp_millis(),
            estimated_time_remaining_ms: None,
        }
    }

    pub fn processed_tools(&self) -> usize {
        self.completed_tools + self.failed_tools + self.skipped_tools
    }
}

struct TrackerState {
    progress: ExecutionProgress,
    running_since: HashMap<CallId, Instant>,
    announced: bool,
    finished: bool,
}

/// 运行级进度追踪器
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
    events: broadcast::Sender<ProgressEvent>,
    estimates: DurationEstimates,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("subscribers", &self.events.receiver_count())
            .finish_non_exhaustive()
    }
}

impl ProgressTracker {
    pub fn new(estimates: DurationEstimates) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(TrackerState {
                progress: ExecutionProgress::new(),
                running_since: HashMap::new(),
                announced: false,
                finished: false,
            }),
            events,
            estimates,
        }
    }

    /// 订阅进度事件
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: ProgressEvent) {
        // 无订阅者时 send 返回 Err，忽略即可
        let _ = self.events.send(event);
    }

    /// 登记工具调用（同一 call_id 只计一次）
    pub fn register_calls<I>(&self, calls: I)
    where
        I: IntoIterator<Item = (CallId, String)>,
    {
        let event = {
            let mut state = self.state();
            for (call_id, tool_name) in calls {
                if state.progress.tools.contains_key(&call_id) {
                    continue;
                }
                state.progress.tools.insert(
                    call_id.clone(),
                    ToolProgress {
                        call_id,
                        tool_name,
                        status: CallStatus::Pending,
                        progress: 0.0,
                        message: None,
                        explicit: false,
                        started_at: None,
                        completed_at: None,
                    },
                );
                state.progress.total_tools += 1;
            }
            if state.announced {
                None
            } else {
                state.announced = true;
                Some(ProgressEvent::ExecutionStarted {
                    total_tools: state.progress.total_tools,
                })
            }
        };
        if let Some(event) = event {
            self.publish(event);
        }
    }

    pub fn add_phases(&self, count: usize) {
        self.state().progress.total_phases += count;
    }

    pub fn phase_started(&self, call_ids: &[CallId]) {
        let event = {
            let mut state = self.state();
            state.progress.current_phase += 1;
            if state.progress.current_phase > state.progress.total_phases {
                state.progress.total_phases = state.progress.current_phase;
            }
            ProgressEvent::PhaseStarted {
                phase: state.progress.current_phase,
                total_phases: state.progress.total_phases,
                call_ids: call_ids.to_vec(),
            }
        };
        self.publish(event);
    }

    pub fn tool_started(&self, call_id: &str) {
        let event = {
            let mut state = self.state();
            let Some(tool) = state.progress.tools.get_mut(call_id) else {
                tracing::debug!(call_id, "Progress update for unregistered call ignored");
                return;
            };
            tool.status = CallStatus::Running;
            tool.started_at = Some(chrono::Utc::now().timestamp_millis());
            let tool_name = tool.tool_name.clone();
            state.running_since.insert(call_id.to_string(), Instant::now());
            Self::recompute_overall(&mut state.progress);
            ProgressEvent::ToolStarted {
                call_id: call_id.to_string(),
                tool_name,
            }
        };
        self.publish(event);
    }

    /// 工具显式上报进度或状态消息；percent 为 None 时只更新消息
    pub fn tool_progress(&self, call_id: &str, percent: Option<f64>, message: Option<String>) {
        let event = {
            let mut state = self.state();
            let Some(tool) = state.progress.tools.get_mut(call_id) else {
                return;
            };
            if tool.status.is_terminal() {
                return;
            }
            if let Some(percent) = percent {
                // 100% 只在真正完成时出现
                tool.progress = tool.progress.max(percent.clamp(0.0, 99.0));
                tool.explicit = true;
            }
            if message.is_some() {
                tool.message = message.clone();
            }
            let tool_name = tool.tool_name.clone();
            let progress = tool.progress;
            Self::recompute_overall(&mut state.progress);
            ProgressEvent::ToolProgress {
                call_id: call_id.to_string(),
                tool_name,
                progress,
                message,
                overall_progress: state.progress.overall_progress,
            }
        };
        self.publish(event);
    }

    pub fn tool_completed(&self, call_id: &str, from_cache: bool) {
        let duration_ms = self
            .state()
            .running_since
            .get(call_id)
            .map(|since| since.elapsed().as_millis() as u64);
        if let Some(tool_name) = self.settle(call_id, CallStatus::Completed, None) {
            self.publish(ProgressEvent::ToolCompleted {
                call_id: call_id.to_string(),
                tool_name,
                from_cache,
                duration_ms,
            });
        }
    }

    pub fn tool_failed(&self, call_id: &str, error: &str) {
        if let Some(tool_name) = self.settle(call_id, CallStatus::Failed, Some(error.to_string())) {
            self.publish(ProgressEvent::ToolFailed {
                call_id: call_id.to_string(),
                tool_name,
                error: error.to_string(),
            });
        }
    }

    pub fn tool_skipped(&self, call_id: &str, reason: &str) {
        if let Some(tool_name) = self.settle(call_id, CallStatus::Skipped, Some(reason.to_string())) {
            self.publish(ProgressEvent::ToolSkipped {
                call_id: call_id.to_string(),
                tool_name,
                reason: reason.to_string(),
            });
        }
    }

    /// 进入终态；已是终态或未登记时返回 None
    fn settle(&self, call_id: &str, status: CallStatus, message: Option<String>) -> Option<String> {
        let mut state = self.state();
        let tool = state.progress.tools.get_mut(call_id)?;
        if tool.status.is_terminal() {
            return None;
        }
        tool.status = status;
        tool.completed_at = Some(chrono::Utc::now().timestamp_millis());
        if status == CallStatus::Completed {
            tool.progress = 100.0;
        }
        if message.is_some() {
            tool.message = message;
        }
        let tool_name = tool.tool_name.clone();
        match status {
            CallStatus::Completed => state.progress.completed_tools += 1,
            CallStatus::Failed => state.progress.failed_tools += 1,
            CallStatus::Skipped => state.progress.skipped_tools += 1,
            CallStatus::Pending | CallStatus::Running => {}
        }
        state.running_since.remove(call_id);
        Self::recompute_overall(&mut state.progress);
        Some(tool_name)
    }

    /// 刷新运行中工具的合成进度，有变化的发布 tool-progress
    pub fn tick(&self) {
        let events = {
            let mut state = self.state();
            let changed = self.refresh_synthetic(&mut state);
            Self::recompute_overall(&mut state.progress);
            let overall = state.progress.overall_progress;
            changed
                .into_iter()
                .filter_map(|call_id| {
                    state.progress.tools.get(&call_id).map(|tool| ProgressEvent::ToolProgress {
                        call_id: call_id.clone(),
                        tool_name: tool.tool_name.clone(),
                        progress: tool.progress,
                        message: tool.message.clone(),
                        overall_progress: overall,
                    })
                })
                .collect::<Vec<_>>()
        };
        for event in events {
            self.publish(event);
        }
    }

    fn refresh_synthetic(&self, state: &mut TrackerState) -> Vec<CallId> {
        let mut changed = Vec::new();
        for (call_id, since) in &state.running_since {
            let Some(tool) = state.progress.tools.get_mut(call_id) else {
                continue;
            };
            if tool.explicit || tool.status != CallStatus::Running {
                continue;
            }
            let synthetic = self
                .estimates
                .synthetic_progress(&tool.tool_name, since.elapsed());
            if synthetic > tool.progress {
                tool.progress = synthetic;
                changed.push(call_id.clone());
            }
        }
        changed
    }

    /// overall = processed/total × 100 + Σ(运行中进度)/total，封顶 100 且不回退
    fn recompute_overall(progress: &mut ExecutionProgress) {
        let total = progress.total_tools;
        if total == 0 {
            return;
        }
        let in_flight: f64 = progress
            .tools
            .values()
            .filter(|t| t.status == CallStatus::Running)
            .map(|t| t.progress)
            .sum();
        let raw = progress.processed_tools() as f64 / total as f64 * 100.0 + in_flight / total as f64;
        progress.overall_progress = progress.overall_progress.max(raw.min(100.0));
    }

    fn estimate_remaining(&self, state: &TrackerState) -> u64 {
        state
            .progress
            .tools
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| {
                let estimate = self.estimates.estimate_for(&t.tool_name);
                let elapsed = state
                    .running_since
                    .get(&t.call_id)
                    .map(|since| since.elapsed())
                    .unwrap_or(Duration::ZERO);
                estimate.saturating_sub(elapsed).as_millis() as u64
            })
            .sum()
    }

    /// 当前快照（含最新合成进度与剩余时间估算）
    pub fn snapshot(&self) -> ExecutionProgress {
        let mut state = self.state();
        self.refresh_synthetic(&mut state);
        Self::recompute_overall(&mut state.progress);
        let remaining = self.estimate_remaining(&state);
        state.progress.estimated_time_remaining_ms = Some(remaining);
        state.progress.clone()
    }

    pub fn overall_progress(&self) -> f64 {
        self.state().progress.overall_progress
    }

    pub fn is_finished(&self) -> bool {
        self.state().finished
    }

    /// 结束运行，发布 execution-complete（只发布一次）
    pub fn finish(&self) {
        let event = {
            let mut state = self.state();
            if state.finished {
                return;
            }
            state.finished = true;
            Self::recompute_overall(&mut state.progress);
            if state.progress.processed_tools() == state.progress.total_tools {
                state.progress.overall_progress = 100.0;
            }
            let remaining = self.estimate_remaining(&state);
            state.progress.estimated_time_remaining_ms = Some(remaining);
            ProgressEvent::ExecutionComplete {
                progress: state.progress.clone(),
            }
        };
        self.publish(event);
    }

    /// 后台定时 tick，直到 cancel 或运行结束
    pub fn spawn_ticker(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if tracker.is_finished() {
                            break;
                        }
                        tracker.tick();
                    }
                }
            }
        })
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DurationEstimates::default())
    }
}
