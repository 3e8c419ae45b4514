// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/station.rs - 工位命令面与任务编排
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
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::camera::{CameraConfig, CameraDevice};
use crate::counters::{CounterSnapshot, Counters};
use crate::frame::MonoClock;
use crate::job::{Job, JobDoc, JobError};
use crate::preview::PreviewPump;
use crate::ring::{DEFAULT_RING_CAPACITY, FrameRing};
use crate::strobe::{Strobe, StrobeWrapper};
use crate::tool::{ChainRunner, DEFAULT_STAGE_BUDGET, Verdict};
use crate::trigger::{CaptureRequest, Mode, TriggerConfig, TriggerError, TriggerScheduler};
use crate::FromUrl;

/// 关站时等待预览泵退出的限时
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 错误类别（§错误处理分类法, 对 UI 壳保持封闭）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  HwUnavailable,
  ConfigRejected,
  SyncTimeout,
  StageTimeout,
  StageError,
  InvalidJob,
  Shutdown,
}

impl ErrorKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorKind::HwUnavailable => "HW_UNAVAILABLE",
      ErrorKind::ConfigRejected => "CONFIG_REJECTED",
      ErrorKind::SyncTimeout => "SYNC_TIMEOUT",
      ErrorKind::StageTimeout => "STAGE_TIMEOUT",
      ErrorKind::StageError => "STAGE_ERROR",
      ErrorKind::InvalidJob => "INVALID_JOB",
      ErrorKind::Shutdown => "SHUTDOWN",
    }
  }
}

#[derive(Error, Debug)]
#[error("{}: {message}", kind.as_str())]
pub struct StationError {
  pub kind: ErrorKind,
  pub message: String,
}

impl StationError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }

  /// UI 壳使用的 `(类别, 消息)` 元组
  pub fn as_tuple(&self) -> (&'static str, String) {
    (self.kind.as_str(), self.message.clone())
  }
}

impl From<JobError> for StationError {
  fn from(e: JobError) -> Self {
    StationError::new(ErrorKind::InvalidJob, e.to_string())
  }
}

/// 事件出口
///
/// 流水线只向该接口发事件；是否转投自家线程由 UI 壳自行决定。
pub trait EventSink: Send + Sync {
  fn on_verdict(&self, verdict: &Verdict);
  fn on_error(&self, kind: ErrorKind, message: &str) {
    let _ = (kind, message);
  }
}

/// 控制台事件出口（运行器与测试用）
pub struct ConsoleSink;

impl EventSink for ConsoleSink {
  fn on_verdict(&self, verdict: &Verdict) {
    match verdict.kind {
      crate::tool::VerdictKind::Ok => {
        info!("判定 OK (帧 {})", verdict.frame_seq)
      }
      _ => info!(
        "判定 {:?} (帧 {}): {}",
        verdict.kind,
        verdict.frame_seq,
        verdict.reason.as_deref().unwrap_or("-")
      ),
    }
  }

  fn on_error(&self, kind: ErrorKind, message: &str) {
    warn!("工位错误 {}: {}", kind.as_str(), message);
  }
}

/// 工位配置
#[derive(Debug, Clone)]
pub struct StationConfig {
  pub ring_capacity: usize,
  pub stage_budget: Duration,
  pub trigger: TriggerConfig,
}

impl Default for StationConfig {
  fn default() -> Self {
    Self {
      ring_capacity: DEFAULT_RING_CAPACITY,
      stage_budget: DEFAULT_STAGE_BUDGET,
      trigger: TriggerConfig::default(),
    }
  }
}

enum PipelineEvent {
  /// 已通过去抖预订的采集请求
  Run(Box<CaptureRequest>),
  Shutdown,
}

struct PipelineWorker {
  handle: JoinHandle<()>,
  tx: Sender<PipelineEvent>,
}

/// 检查工位
///
/// 持有摄像头互斥、频闪、帧环与各任务；对 UI 壳暴露小命令面。
/// 三个长寿任务：UI/事件（外部）、预览泵、流水线，
/// 外加一个短寿的自动触发定时器。
pub struct Station {
  camera: Arc<Mutex<CameraDevice>>,
  strobe: Arc<Mutex<StrobeWrapper>>,
  ring: Arc<FrameRing>,
  counters: Arc<Counters>,
  scheduler: Arc<TriggerScheduler>,
  sink: Arc<dyn EventSink>,
  config: StationConfig,
  mode: Mode,
  /// 自动触发频率（毫赫兹存放, 0 表示关）
  auto_trigger_mhz: Arc<AtomicU64>,
  shutdown: Arc<AtomicBool>,
  runner: Arc<Mutex<Option<Arc<ChainRunner>>>>,
  preview: Option<Arc<PreviewPump>>,
  pipeline: Option<PipelineWorker>,
  auto_trigger: Option<JoinHandle<()>>,
  running: bool,
}

impl Station {
  /// 按 URL 打开摄像头与频闪；硬件缺失降级为模拟件
  pub fn open(
    camera_url: &url::Url,
    strobe_url: &url::Url,
    config: StationConfig,
    sink: Arc<dyn EventSink>,
  ) -> Self {
    let clock = Arc::new(MonoClock::new());
    let camera = CameraDevice::open(camera_url, Arc::clone(&clock));
    if camera.is_degraded() {
      sink.on_error(ErrorKind::HwUnavailable, "摄像头缺失, 以模拟黑帧设备运行");
    }

    let strobe = match StrobeWrapper::from_url(strobe_url) {
      Ok(strobe) => strobe,
      Err(e) => {
        warn!("频闪不可用 ({}), 降级为模拟脉冲", e);
        sink.on_error(ErrorKind::HwUnavailable, "频闪缺失, 以模拟脉冲运行");
        StrobeWrapper::Sim(crate::strobe::SimStrobe::new())
      }
    };

    let camera = Arc::new(Mutex::new(camera));
    let strobe = Arc::new(Mutex::new(strobe));
    let counters = Arc::new(Counters::new());
    let scheduler = Arc::new(TriggerScheduler::new(
      Arc::clone(&camera),
      Arc::clone(&strobe),
      Arc::clone(&clock),
      Arc::clone(&counters),
      config.trigger.clone(),
    ));

    Self {
      camera,
      strobe,
      ring: Arc::new(FrameRing::new(config.ring_capacity)),
      counters,
      scheduler,
      sink,
      config,
      mode: Mode::Trigger,
      auto_trigger_mhz: Arc::new(AtomicU64::new(0)),
      shutdown: Arc::new(AtomicBool::new(false)),
      runner: Arc::new(Mutex::new(None)),
      preview: None,
      pipeline: None,
      auto_trigger: None,
      running: false,
    }
  }

  pub fn counters(&self) -> CounterSnapshot {
    self.counters.snapshot()
  }

  pub fn mode(&self) -> Mode {
    self.mode
  }

  pub fn is_running(&self) -> bool {
    self.running
  }

  pub fn ring(&self) -> &Arc<FrameRing> {
    &self.ring
  }

  /// 加载作业（运行中拒绝）
  pub fn load_job(&mut self, doc: JobDoc) -> Result<(), StationError> {
    if self.running {
      return Err(StationError::new(ErrorKind::ConfigRejected, "工位运行中"));
    }
    let job = Job::load(doc)?;
    let runner = ChainRunner::compile(&job, self.config.stage_budget)?;
    info!("作业 {} 已加载", job.name());
    *self.runner.lock().expect("工位锁中毒") = Some(Arc::new(runner));
    Ok(())
  }

  /// 设定运行模式（运行中拒绝）
  pub fn set_mode(&mut self, mode: Mode) -> Result<(), StationError> {
    if self.running {
      return Err(StationError::new(ErrorKind::ConfigRejected, "工位运行中"));
    }
    self.mode = mode;
    Ok(())
  }

  /// 自动触发频率（0 为关）；运行中即时生效
  pub fn set_auto_trigger_hz(&mut self, hz: f64) -> Result<(), StationError> {
    if !(0.0..=1000.0).contains(&hz) {
      return Err(StationError::new(
        ErrorKind::ConfigRejected,
        format!("自动触发频率越界: {}", hz),
      ));
    }
    self
      .auto_trigger_mhz
      .store((hz * 1000.0) as u64, Ordering::Relaxed);
    Ok(())
  }

  /// 启动工位（幂等）
  pub fn start_live(&mut self) -> Result<(), StationError> {
    if self.running {
      return Ok(());
    }
    self.shutdown.store(false, Ordering::SeqCst);

    {
      let mut device = self.camera.lock().expect("摄像头锁中毒");
      device
        .configure(&CameraConfig::preview())
        .map_err(|e| StationError::new(ErrorKind::ConfigRejected, e.to_string()))?;
      device
        .start()
        .map_err(|e| StationError::new(ErrorKind::ConfigRejected, e.to_string()))?;
    }

    let pump = Arc::new(
      PreviewPump::spawn(
        Arc::clone(&self.camera),
        Arc::clone(&self.ring),
        Arc::clone(&self.counters),
      )
      .map_err(|e| StationError::new(ErrorKind::ConfigRejected, e.to_string()))?,
    );

    let worker = self.spawn_pipeline(Arc::clone(&pump));
    self.preview = Some(pump);
    self.pipeline = Some(worker);
    if self.mode == Mode::Trigger {
      self.auto_trigger = Some(self.spawn_auto_trigger());
    }
    self.running = true;
    info!("工位已启动 ({:?} 模式)", self.mode);
    Ok(())
  }

  /// 外部触发事件入口
  ///
  /// 非 TRIGGER 模式或采集在飞行中的事件计为丢弃，不算错误。
  pub fn trigger_now(&self) -> Result<(), StationError> {
    if !self.running || self.mode != Mode::Trigger {
      self.counters.triggers_dropped.fetch_add(1, Ordering::Relaxed);
      return Ok(());
    }
    // 去抖在提交时刻发生: 飞行中的事件此处即被吃掉,
    // 不会排队等上一个周期结束
    let Some(request) = self.scheduler.try_begin() else {
      return Ok(());
    };
    if let Some(worker) = &self.pipeline {
      if worker.tx.send(PipelineEvent::Run(Box::new(request))).is_err() {
        return Err(StationError::new(ErrorKind::Shutdown, "流水线已关闭"));
      }
    }
    Ok(())
  }

  /// 关站
  ///
  /// 置关断旗、停自动触发、限时合流预览泵（超时弃管）、
  /// 撤流水线、释放摄像头、复位频闪线。
  pub fn stop(&mut self) -> Result<(), StationError> {
    if !self.running {
      return Ok(());
    }
    self.shutdown.store(true, Ordering::SeqCst);

    if let Some(handle) = self.auto_trigger.take() {
      let _ = handle.join();
    }
    if let Some(worker) = self.pipeline.take() {
      let _ = worker.tx.send(PipelineEvent::Shutdown);
      let _ = worker.handle.join();
    }
    if let Some(pump) = self.preview.take() {
      pump.stop(SHUTDOWN_JOIN_TIMEOUT);
    }
    {
      let mut device = self.camera.lock().expect("摄像头锁中毒");
      device.stop();
    }
    {
      let mut strobe = self.strobe.lock().expect("频闪锁中毒");
      strobe.close();
    }
    self.running = false;
    info!("工位已停止");
    Ok(())
  }

  fn spawn_pipeline(&self, pump: Arc<PreviewPump>) -> PipelineWorker {
    let (tx, rx) = std::sync::mpsc::channel::<PipelineEvent>();
    let mode = self.mode;
    let scheduler = Arc::clone(&self.scheduler);
    let runner = Arc::clone(&self.runner);
    let ring = Arc::clone(&self.ring);
    let counters = Arc::clone(&self.counters);
    let sink = Arc::clone(&self.sink);
    let shutdown = Arc::clone(&self.shutdown);

    let handle = std::thread::Builder::new()
      .name("mingcha-pipeline".into())
      .spawn(move || match mode {
        Mode::Trigger => {
          trigger_loop(rx, scheduler, pump, runner, counters, sink, shutdown)
        }
        Mode::Live => live_loop(rx, scheduler, ring, runner, counters, sink, shutdown),
      })
      .expect("流水线线程启动失败");
    PipelineWorker { handle, tx }
  }

  fn spawn_auto_trigger(&self) -> JoinHandle<()> {
    let mhz = Arc::clone(&self.auto_trigger_mhz);
    let shutdown = Arc::clone(&self.shutdown);
    let scheduler = Arc::clone(&self.scheduler);
    let tx = self
      .pipeline
      .as_ref()
      .map(|worker| worker.tx.clone());
    std::thread::Builder::new()
      .name("mingcha-autotrigger".into())
      .spawn(move || {
        let mut since_last = Duration::ZERO;
        const TICK: Duration = Duration::from_millis(10);
        while !shutdown.load(Ordering::SeqCst) {
          std::thread::sleep(TICK);
          since_last += TICK;
          let mhz_now = mhz.load(Ordering::Relaxed);
          if mhz_now == 0 {
            since_last = Duration::ZERO;
            continue;
          }
          let period = Duration::from_secs_f64(1000.0 / mhz_now as f64);
          if since_last >= period {
            since_last = Duration::ZERO;
            // 与外部事件走同一条去抖路径
            if let (Some(request), Some(tx)) = (scheduler.try_begin(), tx.as_ref()) {
              let _ = tx.send(PipelineEvent::Run(Box::new(request)));
            }
          }
        }
      })
      .expect("自动触发线程启动失败")
  }
}

impl Drop for Station {
  fn drop(&mut self) {
    let _ = self.stop();
  }
}

/// TRIGGER 模式流水线: 逐事件执行触发周期并运行工具链
fn trigger_loop(
  rx: Receiver<PipelineEvent>,
  scheduler: Arc<TriggerScheduler>,
  pump: Arc<PreviewPump>,
  runner: Arc<Mutex<Option<Arc<ChainRunner>>>>,
  counters: Arc<Counters>,
  sink: Arc<dyn EventSink>,
  shutdown: Arc<AtomicBool>,
) {
  loop {
    match rx.recv_timeout(Duration::from_millis(100)) {
      Ok(PipelineEvent::Run(mut request)) => {
        let result = scheduler.execute(&mut request, Some(pump.as_ref()));
        if shutdown.load(Ordering::SeqCst) {
          // 关断中: 当前硬件调用已完成, 帧按规丢弃
          continue;
        }
        match result {
          Ok(frame) => {
            let chain = runner.lock().expect("工位锁中毒").clone();
            if let Some(chain) = chain {
              let verdict = chain.run(frame, &counters);
              scheduler.mark_delivered(&mut request);
              sink.on_verdict(&verdict);
            } else {
              scheduler.mark_delivered(&mut request);
            }
          }
          Err(TriggerError::SyncTimeout(_)) => {
            sink.on_error(ErrorKind::SyncTimeout, "采集与触发失步");
          }
          Err(e) => {
            sink.on_error(ErrorKind::StageError, &e.to_string());
          }
        }
      }
      Ok(PipelineEvent::Shutdown) => break,
      Err(RecvTimeoutError::Timeout) => {
        if shutdown.load(Ordering::SeqCst) {
          break;
        }
      }
      Err(RecvTimeoutError::Disconnected) => break,
    }
  }
}

/// LIVE 模式流水线: 跟随帧环边沿, 按最小间隔节流派发
fn live_loop(
  rx: Receiver<PipelineEvent>,
  scheduler: Arc<TriggerScheduler>,
  ring: Arc<FrameRing>,
  runner: Arc<Mutex<Option<Arc<ChainRunner>>>>,
  counters: Arc<Counters>,
  sink: Arc<dyn EventSink>,
  shutdown: Arc<AtomicBool>,
) {
  let mut seen = 0u64;
  while !shutdown.load(Ordering::SeqCst) {
    if let Ok(PipelineEvent::Shutdown) = rx.try_recv() {
      break;
    }
    let Some((pushed, frame)) = ring.wait_for_frame(seen, Duration::from_millis(100)) else {
      continue;
    };
    seen = pushed;
    if !scheduler.live_gate() {
      continue;
    }
    let chain = runner.lock().expect("工位锁中毒").clone();
    if let Some(chain) = chain {
      let verdict = chain.run((*frame).clone(), &counters);
      sink.on_verdict(&verdict);
    }
  }
}
