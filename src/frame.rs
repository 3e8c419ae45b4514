// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/frame.rs - 帧与传感器元数据
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

use std::time::Instant;

use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("裁剪区域为空: ({0}, {1}) - ({2}, {3})")]
  EmptyCrop(u32, u32, u32, u32),
}

/// 像素通道布局
///
/// `Rgbx` 为四通道填充布局，第四通道是硬件对齐用的填充，
/// 离开摄像头层之前必须剥除。工具链阶段只会见到 `Mono` 或 `Rgb`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
  /// 单通道灰度
  Mono,
  /// 三通道彩色
  Rgb,
  /// 三通道彩色 + 一通道填充
  Rgbx,
}

impl ChannelLayout {
  pub fn channels(&self) -> usize {
    match self {
      ChannelLayout::Mono => 1,
      ChannelLayout::Rgb => 3,
      ChannelLayout::Rgbx => 4,
    }
  }
}

/// 每帧的传感器元数据
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameMetadata {
  /// 曝光开始时刻（单调时钟，纳秒）
  pub sensor_timestamp_ns: u64,
  /// 曝光时间（微秒）
  pub exposure_us: u32,
  /// 模拟增益
  pub analogue_gain: f32,
}

/// 帧数据
///
/// 像素缓冲为独占所有权，发射即转移；环形缓冲以 `Arc<Frame>` 保存快照。
#[derive(Debug, Clone)]
pub struct Frame {
  width: u32,
  height: u32,
  layout: ChannelLayout,
  data: Vec<u8>,
  /// 帧序号（摄像头层单调递增）
  pub seq: u64,
  pub metadata: FrameMetadata,
}

impl Frame {
  pub fn new(
    width: u32,
    height: u32,
    layout: ChannelLayout,
    data: Vec<u8>,
    metadata: FrameMetadata,
  ) -> Result<Self, FrameError> {
    let expected = width as usize * height as usize * layout.channels();
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }
    Ok(Self {
      width,
      height,
      layout,
      data,
      seq: 0,
      metadata,
    })
  }

  /// 构造全黑帧（摄像头缺失时的降级输出）
  pub fn black(width: u32, height: u32, layout: ChannelLayout, metadata: FrameMetadata) -> Self {
    let len = width as usize * height as usize * layout.channels();
    Self {
      width,
      height,
      layout,
      data: vec![0u8; len],
      seq: 0,
      metadata,
    }
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn layout(&self) -> ChannelLayout {
    self.layout
  }

  pub fn data(&self) -> &[u8] {
    &self.data
  }

  /// 剥除四通道布局的填充通道
  ///
  /// `Mono` 与 `Rgb` 帧原样返回。
  pub fn strip_padding(self) -> Self {
    if self.layout != ChannelLayout::Rgbx {
      return self;
    }
    let pixels = self.width as usize * self.height as usize;
    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in self.data.chunks_exact(4) {
      rgb.extend_from_slice(&chunk[..3]);
    }
    Self {
      width: self.width,
      height: self.height,
      layout: ChannelLayout::Rgb,
      data: rgb,
      seq: self.seq,
      metadata: self.metadata,
    }
  }

  /// 转换为 RGB 图像（灰度帧展开为三通道）
  pub fn to_rgb_image(&self) -> RgbImage {
    match self.layout {
      ChannelLayout::Rgb => RgbImage::from_raw(self.width, self.height, self.data.clone())
        .unwrap_or_else(|| RgbImage::new(self.width, self.height)),
      ChannelLayout::Mono => {
        let mut rgb = Vec::with_capacity(self.data.len() * 3);
        for &v in &self.data {
          rgb.extend_from_slice(&[v, v, v]);
        }
        RgbImage::from_raw(self.width, self.height, rgb)
          .unwrap_or_else(|| RgbImage::new(self.width, self.height))
      }
      ChannelLayout::Rgbx => {
        let mut rgb = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for chunk in self.data.chunks_exact(4) {
          rgb.extend_from_slice(&chunk[..3]);
        }
        RgbImage::from_raw(self.width, self.height, rgb)
          .unwrap_or_else(|| RgbImage::new(self.width, self.height))
      }
    }
  }

  /// 按像素坐标裁剪（闭开区间，越界自动收紧）
  pub fn crop(&self, x0: u32, y0: u32, x1: u32, y1: u32) -> Result<Frame, FrameError> {
    let x1 = x1.min(self.width);
    let y1 = y1.min(self.height);
    if x0 >= x1 || y0 >= y1 {
      return Err(FrameError::EmptyCrop(x0, y0, x1, y1));
    }
    let ch = self.layout.channels();
    let (w, h) = (x1 - x0, y1 - y0);
    let mut data = Vec::with_capacity(w as usize * h as usize * ch);
    for y in y0..y1 {
      let row = (y as usize * self.width as usize + x0 as usize) * ch;
      data.extend_from_slice(&self.data[row..row + w as usize * ch]);
    }
    let mut frame = Frame::new(w, h, self.layout, data, self.metadata)?;
    frame.seq = self.seq;
    Ok(frame)
  }
}

/// 工位单调时钟
///
/// 以工位启动时刻为原点，全站共用一个实例；
/// 触发时刻与传感器时间戳都以它为基准，差值才有意义。
#[derive(Debug)]
pub struct MonoClock {
  origin: Instant,
}

impl MonoClock {
  pub fn new() -> Self {
    Self {
      origin: Instant::now(),
    }
  }

  /// 自工位启动以来的纳秒数
  pub fn now_ns(&self) -> u64 {
    self.origin.elapsed().as_nanos() as u64
  }
}

impl Default for MonoClock {
  fn default() -> Self {
    Self::new()
  }
}
