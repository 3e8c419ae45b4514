// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/ring.rs - 预览帧环形缓冲
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

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::frame::Frame;

/// 默认保留帧数
pub const DEFAULT_RING_CAPACITY: usize = 3;

struct RingInner {
  frames: VecDeque<Arc<Frame>>,
  /// 累计入环帧数，消费者以此识别"新帧"边沿
  pushed: u64,
}

/// 帧环形缓冲
///
/// 单生产者（预览泵）、多消费者。写侧临界区只做追加与淘汰；
/// 读侧取快照或最新帧的 `Arc` 引用。满员时淘汰最旧帧。
pub struct FrameRing {
  capacity: usize,
  inner: Mutex<RingInner>,
  edge: Condvar,
}

impl FrameRing {
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity: capacity.max(1),
      inner: Mutex::new(RingInner {
        frames: VecDeque::with_capacity(capacity),
        pushed: 0,
      }),
      edge: Condvar::new(),
    }
  }

  pub fn push(&self, frame: Arc<Frame>) {
    let mut inner = self.inner.lock().expect("环形缓冲锁中毒");
    if inner.frames.len() == self.capacity {
      inner.frames.pop_front();
    }
    inner.frames.push_back(frame);
    inner.pushed += 1;
    drop(inner);
    self.edge.notify_all();
  }

  pub fn latest(&self) -> Option<Arc<Frame>> {
    let inner = self.inner.lock().expect("环形缓冲锁中毒");
    inner.frames.back().cloned()
  }

  /// 当前保留帧的快照
  pub fn snapshot(&self) -> Vec<Arc<Frame>> {
    let inner = self.inner.lock().expect("环形缓冲锁中毒");
    inner.frames.iter().cloned().collect()
  }

  pub fn pushed(&self) -> u64 {
    let inner = self.inner.lock().expect("环形缓冲锁中毒");
    inner.pushed
  }

  /// 等待 `seen` 之后的新帧边沿
  ///
  /// 返回新的累计计数与最新帧；超时返回 `None`。
  pub fn wait_for_frame(&self, seen: u64, timeout: Duration) -> Option<(u64, Arc<Frame>)> {
    let mut inner = self.inner.lock().expect("环形缓冲锁中毒");
    while inner.pushed <= seen {
      let (guard, result) = self
        .edge
        .wait_timeout(inner, timeout)
        .expect("环形缓冲锁中毒");
      inner = guard;
      if result.timed_out() && inner.pushed <= seen {
        return None;
      }
    }
    let frame = inner.frames.back().cloned()?;
    Some((inner.pushed, frame))
  }

  pub fn clear(&self) {
    let mut inner = self.inner.lock().expect("环形缓冲锁中毒");
    inner.frames.clear();
  }
}
