// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/counters.rs - 诊断计数器
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

/// 诊断计数器
///
/// 流水线各任务无锁写入，UI 侧只读快照。
/// `last_fps` 以位模式存入 `AtomicU32`。
#[derive(Debug, Default)]
pub struct Counters {
  pub trigger_count: AtomicU64,
  pub triggers_dropped: AtomicU64,
  pub jobs_executed: AtomicU64,
  pub jobs_throttled: AtomicU64,
  pub sync_retries: AtomicU64,
  pub sync_timeouts: AtomicU64,
  last_fps_bits: AtomicU32,
  last_stage_latencies: Mutex<Vec<(String, f64)>>,
}

/// 计数器只读快照（序列化后交给 UI 壳）
#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
  pub trigger_count: u64,
  pub triggers_dropped: u64,
  pub jobs_executed: u64,
  pub jobs_throttled: u64,
  pub sync_retries: u64,
  pub sync_timeouts: u64,
  pub last_fps: f32,
  pub last_stage_latencies_ms: Vec<(String, f64)>,
}

impl Counters {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_last_fps(&self, fps: f32) {
    self.last_fps_bits.store(fps.to_bits(), Ordering::Relaxed);
  }

  pub fn last_fps(&self) -> f32 {
    f32::from_bits(self.last_fps_bits.load(Ordering::Relaxed))
  }

  /// 记录一次工具链运行的分段耗时
  pub fn set_stage_latencies(&self, latencies: Vec<(String, f64)>) {
    let mut guard = self.last_stage_latencies.lock().expect("计数器锁中毒");
    *guard = latencies;
  }

  pub fn snapshot(&self) -> CounterSnapshot {
    CounterSnapshot {
      trigger_count: self.trigger_count.load(Ordering::Relaxed),
      triggers_dropped: self.triggers_dropped.load(Ordering::Relaxed),
      jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
      jobs_throttled: self.jobs_throttled.load(Ordering::Relaxed),
      sync_retries: self.sync_retries.load(Ordering::Relaxed),
      sync_timeouts: self.sync_timeouts.load(Ordering::Relaxed),
      last_fps: self.last_fps(),
      last_stage_latencies_ms: self
        .last_stage_latencies
        .lock()
        .expect("计数器锁中毒")
        .clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn snapshot_reflects_counts() {
    let counters = Counters::new();
    counters.trigger_count.fetch_add(3, Ordering::Relaxed);
    counters.jobs_throttled.fetch_add(2, Ordering::Relaxed);
    counters.set_last_fps(29.5);
    counters.set_stage_latencies(vec![("detect".into(), 12.5)]);

    let snap = counters.snapshot();
    assert_eq!(snap.trigger_count, 3);
    assert_eq!(snap.jobs_throttled, 2);
    assert_eq!(snap.last_fps, 29.5);
    assert_eq!(snap.last_stage_latencies_ms[0].0, "detect");
  }

  #[test]
  fn snapshot_serializes_to_json() {
    let counters = Counters::new();
    let json = serde_json::to_string(&counters.snapshot()).unwrap();
    assert!(json.contains("\"trigger_count\":0"));
    assert!(json.contains("last_fps"));
  }
}
