// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/camera/sim.rs - 模拟摄像头后端
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

use std::time::{Duration, Instant};

use tracing::debug;

use crate::camera::{CameraConfig, CameraControls, CameraError, Capture, Live, NoiseReduction};
use crate::frame::{ChannelLayout, Frame, FrameMetadata, MonoClock};
use crate::{FromUrl, FromUrlWithScheme};

/// 亮斑背景灰度
const BLOB_BACKGROUND: u8 = 16;
/// 亮斑灰度
const BLOB_VALUE: u8 = 230;
/// 填充通道的标记值（测试校验剥除用）
const PADDING_MARKER: u8 = 0x55;

/// 测试图案
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
  /// 暗背景 + 中央亮斑（内建斑点检测器可命中）
  Blob,
  /// 全黑（设备缺失时的降级输出）
  Black,
  /// 水平灰度渐变
  Gradient,
}

/// 可注入的配置故障
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureFault {
  /// 瞬态初始化失败（"序列未完成"一类），触发一次原样重试
  InitIncomplete,
  /// TDN 类拒绝，降噪档降到最低才接受
  TdnRejected,
}

/// 模拟摄像头
///
/// 确定性测试图案，帧速按配置节拍；支持故障注入：
/// 填充通道发射、传感器时间戳偏移、配置失败。
pub struct SimCamera {
  config: CameraConfig,
  pattern: TestPattern,
  running: bool,
  emit_padded: bool,
  timestamp_skew_ns: i64,
  configure_fault: Option<ConfigureFault>,
  last_frame_at: Option<Instant>,
}

impl SimCamera {
  pub fn new(pattern: TestPattern) -> Self {
    Self {
      config: CameraConfig::preview(),
      pattern,
      running: false,
      emit_padded: false,
      timestamp_skew_ns: 0,
      configure_fault: None,
      last_frame_at: None,
    }
  }

  /// 发射带填充通道的四通道帧
  pub fn set_emit_padded(&mut self, padded: bool) {
    self.emit_padded = padded;
  }

  /// 给传感器时间戳加一个有符号偏移（纳秒）
  ///
  /// 负偏移可以制造"帧早于触发时刻"的失步场景。
  pub fn set_timestamp_skew_ns(&mut self, skew_ns: i64) {
    self.timestamp_skew_ns = skew_ns;
  }

  /// 注入一次配置故障
  pub fn inject_configure_fault(&mut self, fault: ConfigureFault) {
    self.configure_fault = Some(fault);
  }

  fn render(&self, clock: &MonoClock) -> Frame {
    let layout = if self.emit_padded {
      ChannelLayout::Rgbx
    } else {
      self.config.layout
    };
    let (w, h) = (self.config.width, self.config.height);
    let ch = layout.channels();
    let mut data = vec![0u8; w as usize * h as usize * ch];

    match self.pattern {
      TestPattern::Black => {}
      TestPattern::Gradient => {
        for y in 0..h {
          for x in 0..w {
            let v = (x * 255 / w.max(1)) as u8;
            let base = (y as usize * w as usize + x as usize) * ch;
            for c in 0..ch.min(3) {
              data[base + c] = v;
            }
          }
        }
      }
      TestPattern::Blob => {
        let (bx0, bx1) = (w / 4, w / 2);
        let (by0, by1) = (h / 4, h / 2);
        for y in 0..h {
          for x in 0..w {
            let v = if x >= bx0 && x < bx1 && y >= by0 && y < by1 {
              BLOB_VALUE
            } else {
              BLOB_BACKGROUND
            };
            let base = (y as usize * w as usize + x as usize) * ch;
            for c in 0..ch.min(3) {
              data[base + c] = v;
            }
          }
        }
      }
    }
    if layout == ChannelLayout::Rgbx {
      for px in data.chunks_exact_mut(4) {
        px[3] = PADDING_MARKER;
      }
    }

    let now = clock.now_ns();
    let sensor_timestamp_ns = if self.timestamp_skew_ns >= 0 {
      now.saturating_add(self.timestamp_skew_ns as u64)
    } else {
      now.saturating_sub(self.timestamp_skew_ns.unsigned_abs())
    };
    let metadata = FrameMetadata {
      sensor_timestamp_ns,
      exposure_us: if self.config.auto_exposure {
        10_000
      } else {
        self.config.exposure_us
      },
      analogue_gain: self.config.analogue_gain,
    };
    Frame::new(w, h, layout, data, metadata).expect("模拟帧尺寸恒定")
  }
}

impl Capture for SimCamera {
  fn configure(&mut self, config: &CameraConfig) -> Result<(), CameraError> {
    if self.running {
      return Err(CameraError::Backend("配置前必须停止设备".into()));
    }
    match self.configure_fault {
      Some(ConfigureFault::InitIncomplete) => {
        // 瞬态故障只发作一次
        self.configure_fault = None;
        return Err(CameraError::InitIncomplete("sequence did not complete".into()));
      }
      Some(ConfigureFault::TdnRejected) => {
        if config.noise_reduction != NoiseReduction::Minimal {
          return Err(CameraError::ConfigRejected("TDN error".into()));
        }
        self.configure_fault = None;
      }
      None => {}
    }
    self.config = config.clone();
    debug!("模拟摄像头采用配置 {}", config.name);
    Ok(())
  }

  fn start(&mut self) -> Result<(), CameraError> {
    self.running = true;
    self.last_frame_at = None;
    Ok(())
  }

  fn stop(&mut self) {
    self.running = false;
  }

  fn is_running(&self) -> bool {
    self.running
  }

  fn next_raw_frame(
    &mut self,
    clock: &MonoClock,
    deadline: Duration,
  ) -> Result<Frame, CameraError> {
    if !self.running {
      return Err(CameraError::NotRunning);
    }
    // 按目标帧率节拍出帧
    let period = self.config.frame_period();
    if let Some(last) = self.last_frame_at {
      let due = last + period;
      let now = Instant::now();
      if due > now {
        let wait = due - now;
        if wait > deadline {
          return Err(CameraError::CaptureTimeout);
        }
        std::thread::sleep(wait);
      }
    }
    self.last_frame_at = Some(Instant::now());
    Ok(self.render(clock))
  }

  fn set_controls(&mut self, controls: &CameraControls) -> Result<(), CameraError> {
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
    Ok(())
  }
}

impl Live for SimCamera {}

impl FromUrlWithScheme for SimCamera {
  const SCHEME: &'static str = "sim";
}

impl FromUrl for SimCamera {
  type Error = CameraError;

  /// `sim://?pattern=blob|black|gradient&padded=1&skew_ns=-40000000`
  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(CameraError::SchemeMismatch);
    }
    let mut camera = SimCamera::new(TestPattern::Blob);
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "pattern" => {
          camera.pattern = match v.as_ref() {
            "blob" => TestPattern::Blob,
            "black" => TestPattern::Black,
            "gradient" => TestPattern::Gradient,
            other => {
              return Err(CameraError::BadParameter(format!("pattern={}", other)));
            }
          };
        }
        "padded" => camera.emit_padded = v == "1" || v == "true",
        "skew_ns" => {
          camera.timestamp_skew_ns = v
            .parse::<i64>()
            .map_err(|_| CameraError::BadParameter(format!("skew_ns={}", v)))?;
        }
        _ => {}
      }
    }
    Ok(camera)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn running_camera(pattern: TestPattern) -> (SimCamera, MonoClock) {
    let mut camera = SimCamera::new(pattern);
    let mut config = CameraConfig::preview();
    config.width = 16;
    config.height = 12;
    config.target_fps = 5000.0;
    camera.configure(&config).unwrap();
    camera.start().unwrap();
    (camera, MonoClock::new())
  }

  #[test]
  fn blob_pattern_has_bright_region() {
    let (mut camera, clock) = running_camera(TestPattern::Blob);
    let frame = camera.next_raw_frame(&clock, Duration::from_secs(1)).unwrap();
    // 亮斑内部
    let inside = ((12 / 4 + 1) * 16 + 16 / 4 + 1) * 3;
    assert_eq!(frame.data()[inside], BLOB_VALUE);
    assert_eq!(frame.data()[0], BLOB_BACKGROUND);
  }

  #[test]
  fn padded_frames_carry_marker_channel() {
    let (mut camera, clock) = running_camera(TestPattern::Blob);
    camera.set_emit_padded(true);
    let frame = camera.next_raw_frame(&clock, Duration::from_secs(1)).unwrap();
    assert_eq!(frame.layout(), ChannelLayout::Rgbx);
    assert_eq!(frame.data()[3], PADDING_MARKER);
  }

  #[test]
  fn negative_skew_backdates_timestamps() {
    let (mut camera, clock) = running_camera(TestPattern::Blob);
    std::thread::sleep(Duration::from_millis(5));
    camera.set_timestamp_skew_ns(-1_000_000);
    let before = clock.now_ns();
    let frame = camera.next_raw_frame(&clock, Duration::from_secs(1)).unwrap();
    assert!(frame.metadata.sensor_timestamp_ns < before);
  }

  #[test]
  fn next_frame_requires_start() {
    let mut camera = SimCamera::new(TestPattern::Blob);
    let clock = MonoClock::new();
    assert!(matches!(
      camera.next_raw_frame(&clock, Duration::from_millis(10)),
      Err(CameraError::NotRunning)
    ));
  }

  #[test]
  fn url_parameters_are_applied() {
    let url = url::Url::parse("sim://?pattern=gradient&padded=1&skew_ns=500").unwrap();
    let camera = SimCamera::from_url(&url).unwrap();
    assert_eq!(camera.pattern, TestPattern::Gradient);
    assert!(camera.emit_padded);
    assert_eq!(camera.timestamp_skew_ns, 500);
  }
}
