// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/camera/v4l2.rs - V4L2 摄像头后端
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

use std::pin::Pin;
use std::time::Duration;

use tracing::{info, warn};
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture as V4lCapture;

use crate::camera::{CameraConfig, CameraControls, CameraError, Capture, Live};
use crate::frame::{ChannelLayout, Frame, FrameMetadata, MonoClock};
use crate::{FromUrl, FromUrlWithScheme};

/// V4L2 摄像头后端
///
/// 由于 v4l 库的 Stream 需要引用 Device，这里使用 Pin<Box<Device>>
/// 固定设备的内存地址，从而可以安全地创建引用它的 Stream。
pub struct V4l2Camera {
  /// V4L2 设备（Pin<Box> 固定内存位置）
  device: Pin<Box<Device>>,
  /// 捕获流（生命周期与 device 关联）
  stream: Option<Stream<'static>>,
  config: CameraConfig,
  width: u32,
  height: u32,
}

impl V4l2Camera {
  pub fn open(device_path: &str) -> Result<Self, CameraError> {
    let device = Box::pin(
      Device::with_path(device_path)
        .map_err(|e| CameraError::NotFound(format!("{}: {}", device_path, e)))?,
    );
    info!("V4L2 设备已打开: {}", device_path);
    Ok(Self {
      device,
      stream: None,
      config: CameraConfig::preview(),
      width: 0,
      height: 0,
    })
  }

  /// 将 YUYV 格式转换为 RGB
  fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);

    for chunk in yuyv.chunks(4) {
      if chunk.len() < 4 {
        break;
      }

      let y0 = chunk[0] as f32;
      let u = chunk[1] as f32 - 128.0;
      let y1 = chunk[2] as f32;
      let v = chunk[3] as f32 - 128.0;

      // 第一个像素
      let r = (y0 + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y0 - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y0 + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);

      // 第二个像素
      let r = (y1 + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y1 - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y1 + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }

    rgb
  }
}

impl Drop for V4l2Camera {
  fn drop(&mut self) {
    // 确保 stream 在 device 之前被 drop
    self.stream.take();
  }
}

impl Capture for V4l2Camera {
  fn configure(&mut self, config: &CameraConfig) -> Result<(), CameraError> {
    if self.stream.is_some() {
      return Err(CameraError::Backend("配置前必须停止设备".into()));
    }
    let mut format = self
      .device
      .format()
      .map_err(|e| CameraError::ConfigRejected(e.to_string()))?;
    format.width = config.width;
    format.height = config.height;
    format.fourcc = FourCC::new(b"YUYV");
    let format = self
      .device
      .set_format(&format)
      .map_err(|e| CameraError::ConfigRejected(e.to_string()))?;

    // 驱动可能收紧分辨率，以实际值为准
    self.width = format.width;
    self.height = format.height;
    self.config = config.clone();
    info!(
      "V4L2 配置 {} 已生效: {}x{}",
      config.name, self.width, self.height
    );
    Ok(())
  }

  fn start(&mut self) -> Result<(), CameraError> {
    if self.stream.is_some() {
      return Ok(());
    }
    let device_ref: &Device = &self.device;
    let stream = unsafe {
      // SAFETY: device 被 Pin<Box> 固定，不会移动，引用始终有效:
      // 1. stream 存储在同一个结构体中，会在 device 之前被 drop
      // 2. Drop 顺序由 Option::take 保证
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, 4)
        .map_err(|e| CameraError::InitIncomplete(e.to_string()))?
    };
    self.stream = Some(stream);
    Ok(())
  }

  fn stop(&mut self) {
    self.stream.take();
  }

  fn is_running(&self) -> bool {
    self.stream.is_some()
  }

  fn next_raw_frame(
    &mut self,
    clock: &MonoClock,
    _deadline: Duration,
  ) -> Result<Frame, CameraError> {
    let stream = self.stream.as_mut().ok_or(CameraError::NotRunning)?;
    let (buffer, _meta) = stream
      .next()
      .map_err(|e| CameraError::Backend(e.to_string()))?;
    // 出队即曝光结束，以出队时刻作为传感器时间戳
    let sensor_timestamp_ns = clock.now_ns();
    let rgb = Self::yuyv_to_rgb(buffer, self.width, self.height);
    let metadata = FrameMetadata {
      sensor_timestamp_ns,
      exposure_us: self.config.exposure_us,
      analogue_gain: self.config.analogue_gain,
    };
    Ok(Frame::new(
      self.width,
      self.height,
      ChannelLayout::Rgb,
      rgb,
      metadata,
    )?)
  }

  fn set_controls(&mut self, controls: &CameraControls) -> Result<(), CameraError> {
    // V4L2 通用驱动的控制 id 因设备而异，这里只更新本地配置，
    // 曝光/增益的硬件下发留给具体机型的调优脚本。
    if controls.exposure_us.is_some() || controls.analogue_gain.is_some() {
      warn!("V4L2 后端不下发曝光/增益控制，仅记录到配置");
    }
    if let Some(exposure_us) = controls.exposure_us {
      self.config.exposure_us = exposure_us;
    }
    if let Some(gain) = controls.analogue_gain {
      self.config.analogue_gain = gain;
    }
    Ok(())
  }
}

impl Live for V4l2Camera {}

impl FromUrlWithScheme for V4l2Camera {
  const SCHEME: &'static str = "v4l2";
}

impl FromUrl for V4l2Camera {
  type Error = CameraError;

  /// `v4l2:///dev/video0`
  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(CameraError::SchemeMismatch);
    }
    V4l2Camera::open(url.path())
  }
}
