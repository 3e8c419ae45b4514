// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/tool/save_image.rs - 图像落盘阶段
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

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{Datelike, Timelike, Utc};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use tracing::debug;

use crate::engine::Detection;
use crate::job::SaveImageParams;
use crate::tool::{StageContext, StageError, Tool};

/// 检测框颜色
const BBOX_COLOR: [u8; 3] = [0, 0, 255];

/// 图像落盘阶段
///
/// 只写旁路输出，从不改动上下文。目录按日期分层:
/// `<root>/YYYY/MM/DD/HH-MM-SS-XXXX.png`。
pub struct SaveImageTool {
  params: SaveImageParams,
  frame_counter: Mutex<u16>,
}

impl SaveImageTool {
  pub fn new(params: SaveImageParams) -> Self {
    Self {
      params,
      frame_counter: Mutex::new(0),
    }
  }

  fn next_path(&self) -> PathBuf {
    let now = Utc::now();
    let counter = {
      let mut guard = self.frame_counter.lock().expect("计数器锁中毒");
      *guard = guard.wrapping_add(1);
      *guard
    };
    PathBuf::from(&self.params.directory)
      .join(format!("{:04}", now.year()))
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()))
      .join(format!(
        "{:02}-{:02}-{:02}-{:04}.png",
        now.hour(),
        now.minute(),
        now.second(),
        counter
      ))
  }
}

impl Tool for SaveImageTool {
  fn run(&self, ctx: &mut StageContext) -> Result<(), StageError> {
    let detections = ctx.detections_or_empty();
    if self.params.only_detections && detections.is_empty() {
      return Ok(());
    }

    let mut image = ctx.frame().to_rgb_image();
    if self.params.draw_overlay {
      draw_detections(&mut image, detections);
    }

    let path = self.next_path();
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    image.save(&path)?;
    debug!("图像已落盘: {}", path.display());
    Ok(())
  }
}

/// 在图像上叠画检测框
fn draw_detections(image: &mut RgbImage, detections: &[Detection]) {
  let (w, h) = (image.width() as f32, image.height() as f32);
  for det in detections {
    let x0 = det.bbox[0].clamp(0.0, w - 1.0) as i32;
    let y0 = det.bbox[1].clamp(0.0, h - 1.0) as i32;
    let x1 = det.bbox[2].clamp(0.0, w) as i32;
    let y1 = det.bbox[3].clamp(0.0, h) as i32;
    if x1 <= x0 || y1 <= y0 {
      continue;
    }
    let rect = Rect::at(x0, y0).of_size((x1 - x0) as u32, (y1 - y0) as u32);
    // 加粗为 2 像素
    draw_hollow_rect_mut(image, rect, Rgb(BBOX_COLOR));
    if x1 - x0 > 2 && y1 - y0 > 2 {
      let inner = Rect::at(x0 + 1, y0 + 1).of_size((x1 - x0 - 2) as u32, (y1 - y0 - 2) as u32);
      draw_hollow_rect_mut(image, inner, Rgb(BBOX_COLOR));
    }
  }
}
