// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/tool/detect.rs - 检测阶段
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

use tracing::debug;

use crate::engine::{self, Detection, Detector, EngineError};
use crate::job::DetectParams;
use crate::tool::{KEY_DETECTIONS, KEY_ROI, StageContext, StageError, StageValue, Tool};

/// 检测阶段
///
/// 对当前帧（或操作员圈定的检测区域）运行检测引擎，
/// 按置信度阈值与类别白名单过滤，再做非极大值抑制，
/// 结果写入 `detections`。
pub struct DetectTool {
  params: DetectParams,
  engine: Box<dyn Detector>,
}

impl DetectTool {
  pub fn new(params: DetectParams) -> Result<Self, EngineError> {
    let url = url::Url::parse(&params.model)
      .map_err(|_| EngineError::BadParameter(params.model.clone()))?;
    let engine = engine::detector_from_url(&url)?;
    Ok(Self { params, engine })
  }
}

impl Tool for DetectTool {
  fn run(&self, ctx: &mut StageContext) -> Result<(), StageError> {
    // 参数里的检测区域优先于上下文里的
    let roi = self.params.roi_xyxy.or_else(|| ctx.region_opt(KEY_ROI));

    let (image, offset) = match roi {
      Some([x0, y0, x1, y1]) => {
        let crop = ctx.frame().crop(
          x0.max(0.0) as u32,
          y0.max(0.0) as u32,
          x1.max(0.0) as u32,
          y1.max(0.0) as u32,
        )?;
        let offset = (x0.max(0.0), y0.max(0.0));
        (crop.to_rgb_image(), offset)
      }
      None => (ctx.frame().to_rgb_image(), (0.0, 0.0)),
    };

    let mut detections = self.engine.detect(&image)?;
    for det in &mut detections {
      det.bbox[0] += offset.0;
      det.bbox[1] += offset.1;
      det.bbox[2] += offset.0;
      det.bbox[3] += offset.1;
    }

    detections.retain(|det| {
      det.confidence >= self.params.conf_threshold
        && (self.params.classes_allowed.is_empty()
          || self.params.classes_allowed.contains(&det.label))
    });
    let detections = non_max_suppression(detections, self.params.iou_threshold);
    debug!("检测阶段得到 {} 个结果", detections.len());
    ctx.put(KEY_DETECTIONS, StageValue::Detections(detections));
    Ok(())
  }
}

/// 非极大值抑制
///
/// 先按置信度降序排序，同分时类别索引小者优先；
/// 与已保留框交并比超过阈值的候选被抑制。
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
  detections.sort_by(|a, b| {
    b.confidence
      .partial_cmp(&a.confidence)
      .unwrap_or(std::cmp::Ordering::Equal)
      .then(a.class_id.cmp(&b.class_id))
  });
  let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
  for det in detections {
    if kept
      .iter()
      .all(|k| Detection::iou(&k.bbox, &det.bbox) <= iou_threshold)
    {
      kept.push(det);
    }
  }
  kept
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{ChannelLayout, Frame, FrameMetadata};

  fn det(class_id: u32, confidence: f32, bbox: [f32; 4]) -> Detection {
    Detection {
      class_id,
      label: format!("c{}", class_id),
      confidence,
      bbox,
    }
  }

  fn params(model: &str) -> DetectParams {
    serde_json::from_value(serde_json::json!({ "model": model })).unwrap()
  }

  fn blob_frame() -> Frame {
    let (w, h) = (32u32, 24u32);
    let mut data = vec![16u8; (w * h * 3) as usize];
    for y in 6..12u32 {
      for x in 8..16u32 {
        let base = ((y * w + x) * 3) as usize;
        data[base..base + 3].copy_from_slice(&[230, 230, 230]);
      }
    }
    Frame::new(w, h, ChannelLayout::Rgb, data, FrameMetadata::default()).unwrap()
  }

  #[test]
  fn nms_suppresses_overlapping_lower_score() {
    let kept = non_max_suppression(
      vec![
        det(0, 0.9, [0.0, 0.0, 10.0, 10.0]),
        det(0, 0.8, [1.0, 1.0, 11.0, 11.0]),
        det(0, 0.7, [50.0, 50.0, 60.0, 60.0]),
      ],
      0.45,
    );
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0].confidence, 0.9);
    assert_eq!(kept[1].bbox[0], 50.0);
  }

  #[test]
  fn nms_ties_favour_lower_class_id() {
    let kept = non_max_suppression(
      vec![
        det(3, 0.8, [0.0, 0.0, 10.0, 10.0]),
        det(1, 0.8, [0.0, 0.0, 10.0, 10.0]),
      ],
      0.45,
    );
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].class_id, 1);
  }

  #[test]
  fn detect_tool_writes_detections() {
    let tool = DetectTool::new(params("blob://?threshold=128&min_area=16")).unwrap();
    let mut ctx = StageContext::new(blob_frame());
    tool.run(&mut ctx).unwrap();
    let detections = ctx.detections().unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].bbox, [8.0, 6.0, 16.0, 12.0]);
  }

  #[test]
  fn roi_limits_detection_and_offsets_boxes() {
    let tool = DetectTool::new(DetectParams {
      roi_xyxy: Some([4.0, 2.0, 32.0, 24.0]),
      ..params("blob://?threshold=128&min_area=16")
    })
    .unwrap();
    let mut ctx = StageContext::new(blob_frame());
    tool.run(&mut ctx).unwrap();
    let detections = ctx.detections().unwrap();
    assert_eq!(detections.len(), 1);
    // 框坐标回到全帧坐标系
    assert_eq!(detections[0].bbox, [8.0, 6.0, 16.0, 12.0]);
  }

  #[test]
  fn roi_excluding_blob_yields_nothing() {
    let tool = DetectTool::new(DetectParams {
      roi_xyxy: Some([20.0, 14.0, 32.0, 24.0]),
      ..params("blob://?threshold=128&min_area=4")
    })
    .unwrap();
    let mut ctx = StageContext::new(blob_frame());
    tool.run(&mut ctx).unwrap();
    assert!(ctx.detections().unwrap().is_empty());
  }

  #[test]
  fn allowlist_filters_other_classes() {
    let tool = DetectTool::new(DetectParams {
      classes_allowed: vec!["rivet".into()],
      ..params("blob://?threshold=128&min_area=16")
    })
    .unwrap();
    let mut ctx = StageContext::new(blob_frame());
    tool.run(&mut ctx).unwrap();
    assert!(ctx.detections().unwrap().is_empty());
  }
}
