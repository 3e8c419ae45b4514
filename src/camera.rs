// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/camera.rs - 摄像头设备抽象
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

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::FromUrl;
use crate::frame::{ChannelLayout, Frame, MonoClock};

mod sim;
pub use self::sim::{ConfigureFault, SimCamera, TestPattern};

#[cfg(feature = "v4l2_capture")]
mod v4l2;
#[cfg(feature = "v4l2_capture")]
pub use self::v4l2::V4l2Camera;

/// 预览分辨率
pub const PREVIEW_SIZE: (u32, u32) = (640, 480);
/// 传感器原生分辨率
pub const STILL_SIZE: (u32, u32) = (1456, 1088);

/// 换控制参数后丢弃的在途帧数
const CONTROL_SETTLE_FRAMES: u32 = 2;
/// `capture_request` 允许排空的陈旧硬件缓冲数
const STALE_DRAIN_LIMIT: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
  #[error("设备未找到: {0}")]
  NotFound(String),
  #[error("配置被拒绝: {0}")]
  ConfigRejected(String),
  #[error("初始化序列未完成: {0}")]
  InitIncomplete(String),
  #[error("采集超时")]
  CaptureTimeout,
  #[error("设备未启动")]
  NotRunning,
  #[error("后端错误: {0}")]
  Backend(String),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("URI 参数错误: {0}")]
  BadParameter(String),
  #[error("帧错误: {0}")]
  Frame(#[from] crate::frame::FrameError),
}

/// 降噪档位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseReduction {
  Off,
  Minimal,
  HighQuality,
}

/// 摄像头配置
///
/// 设备只认两份预制配置：连续取流的 `preview` 与单张采集的 `still`。
/// 切换配置前必须先停止设备。
#[derive(Debug, Clone)]
pub struct CameraConfig {
  pub name: &'static str,
  pub width: u32,
  pub height: u32,
  pub layout: ChannelLayout,
  pub auto_exposure: bool,
  pub auto_white_balance: bool,
  /// 手动曝光（微秒），`auto_exposure` 为假时有效
  pub exposure_us: u32,
  pub analogue_gain: f32,
  pub target_fps: f64,
  /// 帧周期上下限（微秒）
  pub frame_duration_limits_us: Option<(u64, u64)>,
  pub noise_reduction: NoiseReduction,
}

impl CameraConfig {
  /// 预览配置: 640x480 彩色, 自动曝光/白平衡, 目标 30 fps
  pub fn preview() -> Self {
    Self {
      name: "preview",
      width: PREVIEW_SIZE.0,
      height: PREVIEW_SIZE.1,
      layout: ChannelLayout::Rgb,
      auto_exposure: true,
      auto_white_balance: true,
      exposure_us: 0,
      analogue_gain: 1.0,
      target_fps: 30.0,
      frame_duration_limits_us: None,
      noise_reduction: NoiseReduction::HighQuality,
    }
  }

  /// 单张采集配置: 传感器原生分辨率, 手动曝光
  pub fn still(exposure_us: u32, analogue_gain: f32) -> Self {
    Self {
      name: "still",
      width: STILL_SIZE.0,
      height: STILL_SIZE.1,
      layout: ChannelLayout::Rgb,
      auto_exposure: false,
      auto_white_balance: false,
      exposure_us,
      analogue_gain,
      target_fps: 30.0,
      frame_duration_limits_us: Some((
        (exposure_us as u64 + 1000).max(100),
        1_000_000_000,
      )),
      noise_reduction: NoiseReduction::HighQuality,
    }
  }

  /// 一个帧周期
  pub fn frame_period(&self) -> Duration {
    Duration::from_secs_f64(1.0 / self.target_fps.max(1.0))
  }
}

/// 运行期可调的控制参数（`None` 表示保持不变）
#[derive(Debug, Clone, Copy, Default)]
pub struct CameraControls {
  pub exposure_us: Option<u32>,
  pub analogue_gain: Option<f32>,
  pub auto_white_balance: Option<bool>,
  pub noise_reduction: Option<NoiseReduction>,
}

/// 单张采集能力（必备）
///
/// 后端交出的是"生"帧：可能带填充通道，序号未分配。
/// 归一化由 [`CameraDevice`] 统一完成。
pub trait Capture: Send {
  fn configure(&mut self, config: &CameraConfig) -> Result<(), CameraError>;
  fn start(&mut self) -> Result<(), CameraError>;
  fn stop(&mut self);
  fn is_running(&self) -> bool;
  fn next_raw_frame(&mut self, clock: &MonoClock, deadline: Duration)
  -> Result<Frame, CameraError>;
  fn set_controls(&mut self, controls: &CameraControls) -> Result<(), CameraError>;
}

/// 连续取流能力（可选，预览泵需要）
pub trait Live: Capture {}

pub enum CameraWrapper {
  Sim(SimCamera),
  #[cfg(feature = "v4l2_capture")]
  V4l2(V4l2Camera),
}

impl Capture for CameraWrapper {
  fn configure(&mut self, config: &CameraConfig) -> Result<(), CameraError> {
    match self {
      CameraWrapper::Sim(c) => c.configure(config),
      #[cfg(feature = "v4l2_capture")]
      CameraWrapper::V4l2(c) => c.configure(config),
    }
  }

  fn start(&mut self) -> Result<(), CameraError> {
    match self {
      CameraWrapper::Sim(c) => c.start(),
      #[cfg(feature = "v4l2_capture")]
      CameraWrapper::V4l2(c) => c.start(),
    }
  }

  fn stop(&mut self) {
    match self {
      CameraWrapper::Sim(c) => c.stop(),
      #[cfg(feature = "v4l2_capture")]
      CameraWrapper::V4l2(c) => c.stop(),
    }
  }

  fn is_running(&self) -> bool {
    match self {
      CameraWrapper::Sim(c) => c.is_running(),
      #[cfg(feature = "v4l2_capture")]
      CameraWrapper::V4l2(c) => c.is_running(),
    }
  }

  fn next_raw_frame(
    &mut self,
    clock: &MonoClock,
    deadline: Duration,
  ) -> Result<Frame, CameraError> {
    match self {
      CameraWrapper::Sim(c) => c.next_raw_frame(clock, deadline),
      #[cfg(feature = "v4l2_capture")]
      CameraWrapper::V4l2(c) => c.next_raw_frame(clock, deadline),
    }
  }

  fn set_controls(&mut self, controls: &CameraControls) -> Result<(), CameraError> {
    match self {
      CameraWrapper::Sim(c) => c.set_controls(controls),
      #[cfg(feature = "v4l2_capture")]
      CameraWrapper::V4l2(c) => c.set_controls(controls),
    }
  }
}

impl Live for CameraWrapper {}

impl FromUrl for CameraWrapper {
  type Error = CameraError;

  /// `sim://` 或 `v4l2:///dev/video0`
  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      "sim" => Ok(CameraWrapper::Sim(SimCamera::from_url(url)?)),
      #[cfg(feature = "v4l2_capture")]
      "v4l2" => Ok(CameraWrapper::V4l2(V4l2Camera::from_url(url)?)),
      _ => Err(CameraError::SchemeMismatch),
    }
  }
}

/// 摄像头设备
///
/// 包装具体后端，负责三件事：配置重试阶梯、陈旧缓冲排空、
/// 出帧归一化（剥除填充通道并分配帧序号）。
/// 任何时刻只有持有设备互斥锁的任务可以调用硬件。
pub struct CameraDevice {
  inner: CameraWrapper,
  config: CameraConfig,
  clock: Arc<MonoClock>,
  degraded: bool,
  seq: u64,
}

impl CameraDevice {
  /// 按 URL 打开后端；设备缺失时降级为全黑模拟摄像头
  pub fn open(url: &url::Url, clock: Arc<MonoClock>) -> Self {
    let (inner, degraded) = match CameraWrapper::from_url(url) {
      Ok(inner) => (inner, false),
      Err(e) => {
        warn!("摄像头不可用 ({}), 降级为模拟黑帧设备", e);
        (
          CameraWrapper::Sim(SimCamera::new(TestPattern::Black)),
          true,
        )
      }
    };
    Self {
      inner,
      config: CameraConfig::preview(),
      clock,
      degraded,
      seq: 0,
    }
  }

  /// 直接以给定后端构造（测试用）
  pub fn with_backend(inner: CameraWrapper, clock: Arc<MonoClock>) -> Self {
    Self {
      inner,
      config: CameraConfig::preview(),
      clock,
      degraded: false,
      seq: 0,
    }
  }

  pub fn is_degraded(&self) -> bool {
    self.degraded
  }

  pub fn config(&self) -> &CameraConfig {
    &self.config
  }

  pub fn clock(&self) -> &Arc<MonoClock> {
    &self.clock
  }

  /// 应用配置
  ///
  /// 先停止设备。瞬态初始化失败（"序列未完成"一类）原样重试一次；
  /// 配置被拒（TDN 一类）以最低降噪档重试一次；仍失败则上报。
  pub fn configure(&mut self, config: &CameraConfig) -> Result<(), CameraError> {
    self.inner.stop();
    match self.inner.configure(config) {
      Ok(()) => {}
      Err(CameraError::InitIncomplete(msg)) => {
        warn!("初始化序列未完成 ({}), 以同一配置重试一次", msg);
        self.inner.configure(config)?;
      }
      Err(CameraError::ConfigRejected(msg)) => {
        warn!("配置被拒绝 ({}), 以最低降噪档重试一次", msg);
        let mut conservative = config.clone();
        conservative.noise_reduction = NoiseReduction::Minimal;
        self.inner.configure(&conservative)?;
        self.config = conservative;
        info!("配置 {} 已生效 (降噪档已降低)", config.name);
        return Ok(());
      }
      Err(e) => return Err(e),
    }
    self.config = config.clone();
    info!("配置 {} 已生效", config.name);
    Ok(())
  }

  pub fn start(&mut self) -> Result<(), CameraError> {
    self.inner.start()
  }

  pub fn stop(&mut self) {
    self.inner.stop();
  }

  pub fn is_running(&self) -> bool {
    self.inner.is_running()
  }

  /// 取下一帧（预览泵用），出帧已归一化
  pub fn next_frame(&mut self, deadline: Duration) -> Result<Frame, CameraError> {
    let frame = self.inner.next_raw_frame(&self.clock, deadline)?;
    Ok(self.normalize(frame))
  }

  /// 采集一帧
  ///
  /// 不得返回调用时刻之前曝光的硬件缓冲：时间戳早于调用时刻的帧
  /// 被有限度排空（硬件时钟本身漂移与否由触发调度器的同步校验裁决）。
  pub fn capture_request(&mut self, deadline: Duration) -> Result<Frame, CameraError> {
    let issued_ns = self.clock.now_ns();
    let start = std::time::Instant::now();
    let mut drained = 0u32;
    loop {
      let remaining = deadline
        .checked_sub(start.elapsed())
        .ok_or(CameraError::CaptureTimeout)?;
      let frame = self.inner.next_raw_frame(&self.clock, remaining)?;
      if frame.metadata.sensor_timestamp_ns >= issued_ns || drained >= STALE_DRAIN_LIMIT {
        if drained > 0 {
          debug!("已排空 {} 个陈旧缓冲", drained);
        }
        return Ok(self.normalize(frame));
      }
      drained += 1;
    }
  }

  /// 应用控制参数；返回时参数已在后续帧上生效
  pub fn set_controls(&mut self, controls: &CameraControls) -> Result<(), CameraError> {
    self.inner.set_controls(controls)?;
    if let Some(exposure_us) = controls.exposure_us {
      self.config.exposure_us = exposure_us;
      self.config.auto_exposure = false;
    }
    if let Some(gain) = controls.analogue_gain {
      self.config.analogue_gain = gain;
    }
    if let Some(awb) = controls.auto_white_balance {
      self.config.auto_white_balance = awb;
    }
    if let Some(nr) = controls.noise_reduction {
      self.config.noise_reduction = nr;
    }
    // 丢弃控制生效前的在途帧
    if self.inner.is_running() {
      for _ in 0..CONTROL_SETTLE_FRAMES {
        let period = self.config.frame_period() * 2;
        if self.inner.next_raw_frame(&self.clock, period).is_err() {
          break;
        }
      }
    }
    Ok(())
  }

  /// 测试钩子：访问底层模拟后端
  pub fn sim_backend_mut(&mut self) -> Option<&mut SimCamera> {
    match &mut self.inner {
      CameraWrapper::Sim(c) => Some(c),
      #[cfg(feature = "v4l2_capture")]
      _ => None,
    }
  }

  fn normalize(&mut self, frame: Frame) -> Frame {
    let mut frame = frame.strip_padding();
    self.seq += 1;
    frame.seq = self.seq;
    frame
  }
}
