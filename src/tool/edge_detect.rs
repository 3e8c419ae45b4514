// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/tool/edge_detect.rs - 边缘检测阶段
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

use image::GrayImage;

use crate::job::EdgeDetectParams;
use crate::tool::{KEY_EDGE_DENSITY, StageContext, StageError, StageValue, Tool};

/// 边缘检测阶段
///
/// Sobel 梯度幅值超过阈值的像素占比作为边缘密度，
/// 写入 `edge_density` 供判定规则使用。
pub struct EdgeDetectTool {
  params: EdgeDetectParams,
}

impl EdgeDetectTool {
  pub fn new(params: EdgeDetectParams) -> Self {
    Self { params }
  }
}

impl Tool for EdgeDetectTool {
  fn run(&self, ctx: &mut StageContext) -> Result<(), StageError> {
    let image = ctx.frame().to_rgb_image();
    let gray: GrayImage = image::imageops::grayscale(&image);
    let density = edge_density(&gray, self.params.threshold);
    ctx.put(KEY_EDGE_DENSITY, StageValue::Scalar(density));
    Ok(())
  }
}

/// 3x3 Sobel 梯度幅值密度
fn edge_density(gray: &GrayImage, threshold: u32) -> f64 {
  let (w, h) = (gray.width() as i64, gray.height() as i64);
  if w < 3 || h < 3 {
    return 0.0;
  }
  let px = |x: i64, y: i64| gray.get_pixel(x as u32, y as u32).0[0] as i64;
  let mut hits = 0u64;
  for y in 1..h - 1 {
    for x in 1..w - 1 {
      let gx = px(x + 1, y - 1) + 2 * px(x + 1, y) + px(x + 1, y + 1)
        - px(x - 1, y - 1)
        - 2 * px(x - 1, y)
        - px(x - 1, y + 1);
      let gy = px(x - 1, y + 1) + 2 * px(x, y + 1) + px(x + 1, y + 1)
        - px(x - 1, y - 1)
        - 2 * px(x, y - 1)
        - px(x + 1, y - 1);
      let magnitude = ((gx * gx + gy * gy) as f64).sqrt() as u32;
      if magnitude > threshold {
        hits += 1;
      }
    }
  }
  hits as f64 / ((w - 2) * (h - 2)) as f64
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{ChannelLayout, Frame, FrameMetadata};

  #[test]
  fn flat_frame_has_zero_density() {
    let frame = Frame::black(16, 16, ChannelLayout::Rgb, FrameMetadata::default());
    let mut ctx = StageContext::new(frame);
    EdgeDetectTool::new(EdgeDetectParams { threshold: 160 })
      .run(&mut ctx)
      .unwrap();
    assert_eq!(ctx.scalar(KEY_EDGE_DENSITY).unwrap(), 0.0);
  }

  #[test]
  fn vertical_step_produces_edges() {
    let (w, h) = (16u32, 16u32);
    let mut data = vec![0u8; (w * h * 3) as usize];
    for y in 0..h {
      for x in w / 2..w {
        let base = ((y * w + x) * 3) as usize;
        data[base..base + 3].copy_from_slice(&[255, 255, 255]);
      }
    }
    let frame =
      Frame::new(w, h, ChannelLayout::Rgb, data, FrameMetadata::default()).unwrap();
    let mut ctx = StageContext::new(frame);
    EdgeDetectTool::new(EdgeDetectParams { threshold: 160 })
      .run(&mut ctx)
      .unwrap();
    let density = ctx.scalar(KEY_EDGE_DENSITY).unwrap();
    assert!(density > 0.05, "密度 {}", density);
  }
}
