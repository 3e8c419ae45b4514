// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/tool/classify.rs - 分类阶段
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

use crate::engine::{self, Classifier, EngineError};
use crate::job::ClassifyParams;
use crate::tool::{KEY_CLASSIFICATIONS, StageContext, StageError, StageValue, Tool};

/// 分类阶段
///
/// 对每个检测框的裁剪图运行分类引擎；没有检测结果时
/// 退化为整帧分类。结果写入 `classifications`。
pub struct ClassifyTool {
  engine: Box<dyn Classifier>,
}

impl ClassifyTool {
  pub fn new(params: ClassifyParams) -> Result<Self, EngineError> {
    let url = url::Url::parse(&params.model)
      .map_err(|_| EngineError::BadParameter(params.model.clone()))?;
    Ok(Self {
      engine: engine::classifier_from_url(&url)?,
    })
  }
}

impl Tool for ClassifyTool {
  fn run(&self, ctx: &mut StageContext) -> Result<(), StageError> {
    let crops: Vec<[f32; 4]> = ctx
      .detections_or_empty()
      .iter()
      .map(|det| det.bbox)
      .collect();

    let mut classifications = Vec::new();
    if crops.is_empty() {
      classifications.push(self.engine.classify(&ctx.frame().to_rgb_image())?);
    } else {
      for bbox in crops {
        let crop = ctx.frame().crop(
          bbox[0].max(0.0) as u32,
          bbox[1].max(0.0) as u32,
          bbox[2].max(0.0).ceil() as u32,
          bbox[3].max(0.0).ceil() as u32,
        )?;
        classifications.push(self.engine.classify(&crop.to_rgb_image())?);
      }
    }
    ctx.put(
      KEY_CLASSIFICATIONS,
      StageValue::Classifications(classifications),
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::Detection;
  use crate::frame::{ChannelLayout, Frame, FrameMetadata};
  use crate::tool::KEY_DETECTIONS;

  fn tool() -> ClassifyTool {
    ClassifyTool::new(ClassifyParams {
      model: "brightness://?cutoff=128".into(),
    })
    .unwrap()
  }

  fn half_bright_frame() -> Frame {
    // 左半暗右半亮
    let (w, h) = (16u32, 8u32);
    let mut data = vec![10u8; (w * h * 3) as usize];
    for y in 0..h {
      for x in w / 2..w {
        let base = ((y * w + x) * 3) as usize;
        data[base..base + 3].copy_from_slice(&[240, 240, 240]);
      }
    }
    Frame::new(w, h, ChannelLayout::Rgb, data, FrameMetadata::default()).unwrap()
  }

  #[test]
  fn classifies_each_detection_crop() {
    let mut ctx = StageContext::new(half_bright_frame());
    ctx.put(
      KEY_DETECTIONS,
      StageValue::Detections(vec![
        Detection {
          class_id: 0,
          label: "blob".into(),
          confidence: 1.0,
          bbox: [0.0, 0.0, 8.0, 8.0],
        },
        Detection {
          class_id: 0,
          label: "blob".into(),
          confidence: 1.0,
          bbox: [8.0, 0.0, 16.0, 8.0],
        },
      ]),
    );
    tool().run(&mut ctx).unwrap();
    let labels: Vec<_> = ctx
      .classifications()
      .unwrap()
      .iter()
      .map(|c| c.label.clone())
      .collect();
    assert_eq!(labels, vec!["dark", "bright"]);
  }

  #[test]
  fn falls_back_to_whole_frame_without_detections() {
    let mut ctx = StageContext::new(half_bright_frame());
    tool().run(&mut ctx).unwrap();
    assert_eq!(ctx.classifications().unwrap().len(), 1);
  }
}
