// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/trigger.rs - 触发调度器
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

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::camera::{CameraDevice, CameraError};
use crate::counters::Counters;
use crate::frame::{Frame, MonoClock};
use crate::preview::PreviewPump;
use crate::strobe::{Strobe, StrobeError, StrobeWrapper};

/// 运行模式（作业启动时设定，整个运行期不变）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  /// 无外部触发，以节流速率对预览帧连续运行工具链
  Live,
  /// 每个外部事件至多产生一次采集
  Trigger,
}

/// 触发调度配置
#[derive(Debug, Clone)]
pub struct TriggerConfig {
  /// 频闪脉宽（微秒）
  pub pulse_width_us: u32,
  /// 频闪后到采集前的延时（毫秒）
  pub delay_before_capture_ms: u64,
  /// 同步窗：采集延时之外允许的正向偏差（默认一个预览帧周期）
  pub max_sync_window: Duration,
  /// 失步重采次数上限
  pub max_resync_retries: u32,
  /// LIVE 模式的最小派发间隔
  pub min_gap: Duration,
  /// 单次采集调用的限时
  pub capture_deadline: Duration,
  /// 等待预览泵停靠的限时
  pub pause_timeout: Duration,
}

impl Default for TriggerConfig {
  fn default() -> Self {
    Self {
      pulse_width_us: 1000,
      delay_before_capture_ms: 0,
      max_sync_window: Duration::from_millis(33),
      max_resync_retries: 3,
      min_gap: Duration::from_millis(200),
      capture_deadline: Duration::from_secs(1),
      pause_timeout: Duration::from_secs(1),
    }
  }
}

/// 采集请求状态机
///
/// ```text
///     created → strobe_sent → frame_acquired → validated → delivered
///                      ↓             ↓             ↓
///                    error       discarded    sync_timeout
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
  Created,
  StrobeSent,
  FrameAcquired,
  /// 帧未落入同步窗被丢弃（瞬态，随后重采或失步终止）
  Discarded,
  Validated,
  Delivered,
  Error,
  SyncTimeout,
  Aborted,
}

impl RequestState {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      RequestState::Delivered
        | RequestState::Error
        | RequestState::SyncTimeout
        | RequestState::Aborted
    )
  }
}

/// 一次操作员采集意图
#[derive(Debug)]
pub struct CaptureRequest {
  /// 单调递增的请求号
  pub id: u64,
  /// 挂钟签发时刻
  pub issued_at: DateTime<Utc>,
  /// 触发送出时刻（单调时钟，纳秒），脉冲前一刻填入
  pub t_sent_ns: Option<u64>,
  pub delay_before_capture_ms: u64,
  pub cancelled: bool,
  state: RequestState,
}

impl CaptureRequest {
  fn new(id: u64, delay_before_capture_ms: u64) -> Self {
    Self {
      id,
      issued_at: Utc::now(),
      t_sent_ns: None,
      delay_before_capture_ms,
      cancelled: false,
      state: RequestState::Created,
    }
  }

  pub fn state(&self) -> RequestState {
    self.state
  }

  fn transition(&mut self, next: RequestState) {
    debug!("请求 {}: {:?} -> {:?}", self.id, self.state, next);
    self.state = next;
  }
}

#[derive(Error, Debug)]
pub enum TriggerError {
  #[error("同步超时: 重采 {0} 次后仍无帧落入同步窗")]
  SyncTimeout(u32),
  #[error("请求已中止")]
  Aborted,
  #[error("频闪错误: {0}")]
  Strobe(#[from] StrobeError),
  #[error("摄像头错误: {0}")]
  Camera(#[from] CameraError),
}

/// 触发调度器
///
/// 把异步外部事件变成一帧与频闪脉冲确定关联的采集。
/// 单飞不变式：任何时刻至多一个非终态请求；
/// 飞行中到达的事件被计为丢弃。
pub struct TriggerScheduler {
  camera: Arc<Mutex<CameraDevice>>,
  strobe: Arc<Mutex<StrobeWrapper>>,
  clock: Arc<MonoClock>,
  counters: Arc<Counters>,
  config: TriggerConfig,
  in_flight: AtomicBool,
  next_id: AtomicU64,
  last_dispatch: Mutex<Option<Instant>>,
}

impl TriggerScheduler {
  pub fn new(
    camera: Arc<Mutex<CameraDevice>>,
    strobe: Arc<Mutex<StrobeWrapper>>,
    clock: Arc<MonoClock>,
    counters: Arc<Counters>,
    config: TriggerConfig,
  ) -> Self {
    Self {
      camera,
      strobe,
      clock,
      counters,
      config,
      in_flight: AtomicBool::new(false),
      next_id: AtomicU64::new(1),
      last_dispatch: Mutex::new(None),
    }
  }

  pub fn config(&self) -> &TriggerConfig {
    &self.config
  }

  /// 去抖入口: 预订单飞名额
  ///
  /// 采集在飞行中时事件被丢弃（计入计数器, 返回 `None`）。
  /// 预订成功后必须以 [`TriggerScheduler::execute`] 完成周期,
  /// 名额在周期结束时释放。
  pub fn try_begin(&self) -> Option<CaptureRequest> {
    if self
      .in_flight
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      self.counters.triggers_dropped.fetch_add(1, Ordering::Relaxed);
      debug!("采集在飞行中, 触发事件丢弃");
      return None;
    }
    self.counters.trigger_count.fetch_add(1, Ordering::Relaxed);
    Some(CaptureRequest::new(
      self.next_id.fetch_add(1, Ordering::Relaxed),
      self.config.delay_before_capture_ms,
    ))
  }

  pub fn is_in_flight(&self) -> bool {
    self.in_flight.load(Ordering::SeqCst)
  }

  /// 完整执行一个触发周期（便捷入口, 含去抖）
  pub fn fire(
    &self,
    preview: Option<&PreviewPump>,
  ) -> Option<(CaptureRequest, Result<Frame, TriggerError>)> {
    let mut request = self.try_begin()?;
    let result = self.execute(&mut request, preview);
    Some((request, result))
  }

  /// 对已预订的请求执行周期: 预览停靠、冷却清零、记录触发时刻、
  /// 频闪、延时、采集、同步校验（限次重采）、清理恢复。
  /// 帧交付由调用方完成后以 [`TriggerScheduler::mark_delivered`] 收尾。
  pub fn execute(
    &self,
    request: &mut CaptureRequest,
    preview: Option<&PreviewPump>,
  ) -> Result<Frame, TriggerError> {
    // 预览让路（合作式）
    let was_running = preview.map(|p| !p.is_paused()).unwrap_or(false);
    if let Some(pump) = preview {
      if !pump.pause(self.config.pause_timeout) {
        warn!("预览泵未在限时内停靠, 继续采集 (依赖摄像头互斥锁)");
      }
    }

    // 冷却清零, 避免采集后的节流误判
    *self.last_dispatch.lock().expect("调度器锁中毒") = None;

    let result = self.cycle(request);

    // 清理: 恢复预览, 重新放开触发入口
    if was_running {
      if let Some(pump) = preview {
        pump.resume();
      }
    }
    self.in_flight.store(false, Ordering::SeqCst);

    result
  }

  fn cycle(&self, request: &mut CaptureRequest) -> Result<Frame, TriggerError> {
    if request.cancelled {
      request.transition(RequestState::Aborted);
      return Err(TriggerError::Aborted);
    }

    // 记录触发送出时刻
    let t_sent_ns = self.clock.now_ns();
    request.t_sent_ns = Some(t_sent_ns);

    // 频闪
    {
      let mut strobe = self.strobe.lock().expect("频闪锁中毒");
      if let Err(e) = strobe.pulse(self.config.pulse_width_us) {
        request.transition(RequestState::Error);
        return Err(e.into());
      }
    }
    request.transition(RequestState::StrobeSent);

    // 延时
    if request.delay_before_capture_ms > 0 {
      std::thread::sleep(Duration::from_millis(request.delay_before_capture_ms));
    }

    // 采集与同步校验
    let delay_ns = request.delay_before_capture_ms * 1_000_000;
    let window_ns = self.config.max_sync_window.as_nanos() as u64;
    let mut retries = 0u32;
    loop {
      let frame = {
        let mut device = self.camera.lock().expect("摄像头锁中毒");
        match device.capture_request(self.config.capture_deadline) {
          Ok(frame) => frame,
          Err(e) => {
            request.transition(RequestState::Error);
            return Err(e.into());
          }
        }
      };
      request.transition(RequestState::FrameAcquired);

      let ts = frame.metadata.sensor_timestamp_ns;
      let accepted = ts >= t_sent_ns && ts - t_sent_ns <= delay_ns + window_ns;
      if accepted {
        request.transition(RequestState::Validated);
        return Ok(frame);
      }

      request.transition(RequestState::Discarded);
      if retries >= self.config.max_resync_retries {
        request.transition(RequestState::SyncTimeout);
        self.counters.sync_timeouts.fetch_add(1, Ordering::Relaxed);
        warn!(
          "请求 {} 失步: 传感器时间戳与触发时刻相差 {} 纳秒",
          request.id,
          ts as i64 - t_sent_ns as i64
        );
        return Err(TriggerError::SyncTimeout(retries));
      }
      retries += 1;
      self.counters.sync_retries.fetch_add(1, Ordering::Relaxed);
      debug!("请求 {} 第 {} 次重采", request.id, retries);
    }
  }

  /// 帧已交付工具链, 请求收尾
  pub fn mark_delivered(&self, request: &mut CaptureRequest) {
    request.transition(RequestState::Delivered);
    info!("请求 {} 已交付", request.id);
  }

  /// LIVE 模式派发闸: 距上次派发不足最小间隔的帧计为节流
  pub fn live_gate(&self) -> bool {
    let mut last = self.last_dispatch.lock().expect("调度器锁中毒");
    let now = Instant::now();
    match *last {
      Some(at) if now.duration_since(at) < self.config.min_gap => {
        self.counters.jobs_throttled.fetch_add(1, Ordering::Relaxed);
        false
      }
      _ => {
        *last = Some(now);
        true
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::camera::{CameraConfig, CameraWrapper, SimCamera, TestPattern};
  use crate::strobe::SimStrobe;
  use std::sync::Barrier;

  fn rig(config: TriggerConfig) -> (Arc<TriggerScheduler>, Arc<Counters>) {
    let clock = Arc::new(MonoClock::new());
    let mut device = CameraDevice::with_backend(
      CameraWrapper::Sim(SimCamera::new(TestPattern::Blob)),
      Arc::clone(&clock),
    );
    let mut camera_config = CameraConfig::preview();
    camera_config.width = 16;
    camera_config.height = 12;
    camera_config.target_fps = 2000.0;
    device.configure(&camera_config).unwrap();
    device.start().unwrap();

    let counters = Arc::new(Counters::new());
    let scheduler = TriggerScheduler::new(
      Arc::new(Mutex::new(device)),
      Arc::new(Mutex::new(StrobeWrapper::Sim(SimStrobe::new()))),
      clock,
      Arc::clone(&counters),
      config,
    );
    (Arc::new(scheduler), counters)
  }

  fn fast_config() -> TriggerConfig {
    TriggerConfig {
      pulse_width_us: 100,
      ..TriggerConfig::default()
    }
  }

  #[test]
  fn basic_trigger_delivers_one_frame_without_retries() {
    let (scheduler, counters) = rig(TriggerConfig {
      pulse_width_us: 1000,
      ..fast_config()
    });
    let (mut request, result) = scheduler.fire(None).expect("入口空闲");
    let frame = result.expect("应交付一帧");
    assert_eq!(request.state(), RequestState::Validated);
    scheduler.mark_delivered(&mut request);
    assert_eq!(request.state(), RequestState::Delivered);
    assert!(frame.seq > 0);
    assert_eq!(counters.sync_retries.load(Ordering::Relaxed), 0);
    assert_eq!(counters.trigger_count.load(Ordering::Relaxed), 1);
  }

  #[test]
  fn sync_window_holds_for_delivered_frames() {
    let (scheduler, _) = rig(fast_config());
    let (request, result) = scheduler.fire(None).unwrap();
    let frame = result.unwrap();
    let t_sent = request.t_sent_ns.unwrap();
    let ts = frame.metadata.sensor_timestamp_ns;
    assert!(ts >= t_sent);
    assert!(ts - t_sent <= 33_000_000);
  }

  #[test]
  fn double_click_drops_second_event() {
    let (scheduler, counters) = rig(TriggerConfig {
      delay_before_capture_ms: 50,
      ..fast_config()
    });
    let other = Arc::clone(&scheduler);
    let barrier = Arc::new(Barrier::new(2));
    let barrier2 = Arc::clone(&barrier);
    let handle = std::thread::spawn(move || {
      barrier2.wait();
      other.fire(None)
    });
    barrier.wait();
    let mine = scheduler.fire(None);
    let theirs = handle.join().unwrap();
    // 两个事件相隔远小于周期时长: 一个交付一个丢弃
    assert_eq!(mine.is_some() as u8 + theirs.is_some() as u8, 1);
    assert_eq!(counters.trigger_count.load(Ordering::Relaxed), 1);
    assert_eq!(counters.triggers_dropped.load(Ordering::Relaxed), 1);
  }

  #[test]
  fn trigger_storm_keeps_single_flight() {
    let (scheduler, counters) = rig(TriggerConfig {
      delay_before_capture_ms: 60,
      ..fast_config()
    });
    let n = 8;
    let barrier = Arc::new(Barrier::new(n));
    let mut handles = Vec::new();
    for _ in 0..n {
      let scheduler = Arc::clone(&scheduler);
      let barrier = Arc::clone(&barrier);
      handles.push(std::thread::spawn(move || {
        barrier.wait();
        scheduler.fire(None).is_some()
      }));
    }
    let fired: usize = handles
      .into_iter()
      .map(|h| h.join().unwrap() as usize)
      .sum();
    assert_eq!(fired, 1);
    assert_eq!(counters.trigger_count.load(Ordering::Relaxed), 1);
    assert_eq!(
      counters.triggers_dropped.load(Ordering::Relaxed),
      (n - 1) as u64
    );
  }

  #[test]
  fn delayed_capture_lands_inside_shifted_window() {
    let (scheduler, _) = rig(TriggerConfig {
      delay_before_capture_ms: 50,
      ..fast_config()
    });
    let (request, result) = scheduler.fire(None).unwrap();
    let frame = result.unwrap();
    let delta_ms =
      (frame.metadata.sensor_timestamp_ns - request.t_sent_ns.unwrap()) as f64 / 1e6;
    assert!(delta_ms >= 50.0, "延时 {} 毫秒", delta_ms);
    assert!(delta_ms <= 50.0 + 33.0 + 5.0, "延时 {} 毫秒", delta_ms);
  }

  #[test]
  fn stale_timestamps_end_in_sync_timeout() {
    let (scheduler, counters) = rig(fast_config());
    {
      let mut device = scheduler.camera.lock().unwrap();
      device
        .sim_backend_mut()
        .unwrap()
        .set_timestamp_skew_ns(-3_600_000_000_000);
    }
    let (request, result) = scheduler.fire(None).unwrap();
    assert!(matches!(result, Err(TriggerError::SyncTimeout(_))));
    assert_eq!(request.state(), RequestState::SyncTimeout);
    assert_eq!(counters.sync_timeouts.load(Ordering::Relaxed), 1);
    assert_eq!(
      counters.sync_retries.load(Ordering::Relaxed),
      fast_config().max_resync_retries as u64
    );
    // 失步终止后入口重新放开
    assert!(scheduler.fire(None).is_some());
  }

  #[test]
  fn live_gate_throttles_to_min_gap() {
    let (scheduler, counters) = rig(TriggerConfig {
      min_gap: Duration::from_millis(50),
      ..fast_config()
    });
    assert!(scheduler.live_gate());
    let mut throttled = 0;
    for _ in 0..5 {
      if !scheduler.live_gate() {
        throttled += 1;
      }
      std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(throttled, 5);
    std::thread::sleep(Duration::from_millis(60));
    assert!(scheduler.live_gate());
    assert_eq!(counters.jobs_throttled.load(Ordering::Relaxed), 5);
  }

  #[test]
  fn terminal_states_are_terminal() {
    assert!(RequestState::Delivered.is_terminal());
    assert!(RequestState::SyncTimeout.is_terminal());
    assert!(RequestState::Aborted.is_terminal());
    assert!(!RequestState::FrameAcquired.is_terminal());
    assert!(!RequestState::Discarded.is_terminal());
  }
}
