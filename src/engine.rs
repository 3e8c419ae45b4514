// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/engine.rs - 推理引擎接缝与内建参考引擎
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

use image::RgbImage;
use thiserror::Error;

use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("URI 方案不可识别: {0}")]
  UnknownScheme(String),
  #[error("URI 参数错误: {0}")]
  BadParameter(String),
  #[error("推理失败: {0}")]
  InferenceFailed(String),
}

/// 检测结果
#[derive(Debug, Clone)]
pub struct Detection {
  /// 类别索引
  pub class_id: u32,
  /// 类别名称
  pub label: String,
  /// 置信度
  pub confidence: f32,
  /// 边界框 [x_min, y_min, x_max, y_max]（像素坐标）
  pub bbox: [f32; 4],
}

impl Detection {
  /// 两个边界框的交并比
  pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x0 = a[0].max(b[0]);
    let y0 = a[1].max(b[1]);
    let x1 = a[2].min(b[2]);
    let y1 = a[3].min(b[3]);
    let inter = (x1 - x0).max(0.0) * (y1 - y0).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
  }
}

/// 分类结果
#[derive(Debug, Clone)]
pub struct Classification {
  pub label: String,
  pub confidence: f32,
}

/// 目标检测引擎（外部推理运行时的接缝）
pub trait Detector: Send + Sync {
  fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, EngineError>;
}

/// 分类引擎
pub trait Classifier: Send + Sync {
  fn classify(&self, image: &RgbImage) -> Result<Classification, EngineError>;
}

/// 字符识别引擎
pub trait OcrEngine: Send + Sync {
  fn recognize(&self, image: &RgbImage) -> Result<String, EngineError>;
}

/// 亮度阈值斑点检测器（内建参考实现）
///
/// 对灰度化图像做两遍连通域标记，每个连通域给出一个检测框；
/// 置信度取连通域面积与其外接框面积之比。类别恒为 0/"blob"。
pub struct BlobDetector {
  /// 灰度阈值
  threshold: u8,
  /// 最小连通域面积（像素）
  min_area: u32,
}

impl BlobDetector {
  pub fn new(threshold: u8, min_area: u32) -> Self {
    Self {
      threshold,
      min_area,
    }
  }
}

impl Default for BlobDetector {
  fn default() -> Self {
    Self::new(128, 16)
  }
}

impl Detector for BlobDetector {
  fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, EngineError> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    if w == 0 || h == 0 {
      return Ok(Vec::new());
    }

    // 第一遍：阈值化
    let mut mask = vec![false; w * h];
    for (x, y, px) in image.enumerate_pixels() {
      let luma =
        (px.0[0] as u32 * 299 + px.0[1] as u32 * 587 + px.0[2] as u32 * 114) / 1000;
      mask[y as usize * w + x as usize] = luma as u8 >= self.threshold;
    }

    // 第二遍：洪泛标记连通域（四邻域）
    let mut visited = vec![false; w * h];
    let mut detections = Vec::new();
    let mut stack = Vec::new();
    for start in 0..w * h {
      if !mask[start] || visited[start] {
        continue;
      }
      let mut area = 0u32;
      let (mut x0, mut y0, mut x1, mut y1) = (w, h, 0usize, 0usize);
      stack.push(start);
      visited[start] = true;
      while let Some(idx) = stack.pop() {
        let (x, y) = (idx % w, idx / w);
        area += 1;
        x0 = x0.min(x);
        y0 = y0.min(y);
        x1 = x1.max(x);
        y1 = y1.max(y);
        let mut push = |nidx: usize| {
          if mask[nidx] && !visited[nidx] {
            visited[nidx] = true;
            stack.push(nidx);
          }
        };
        if x > 0 {
          push(idx - 1);
        }
        if x + 1 < w {
          push(idx + 1);
        }
        if y > 0 {
          push(idx - w);
        }
        if y + 1 < h {
          push(idx + w);
        }
      }
      if area < self.min_area {
        continue;
      }
      let bbox_area = ((x1 - x0 + 1) * (y1 - y0 + 1)) as f32;
      detections.push(Detection {
        class_id: 0,
        label: "blob".into(),
        confidence: (area as f32 / bbox_area).clamp(0.0, 1.0),
        bbox: [x0 as f32, y0 as f32, (x1 + 1) as f32, (y1 + 1) as f32],
      });
    }
    Ok(detections)
  }
}

/// 平均亮度分类器（内建参考实现）
pub struct BrightnessClassifier {
  cutoff: u8,
}

impl BrightnessClassifier {
  pub fn new(cutoff: u8) -> Self {
    Self { cutoff }
  }
}

impl Default for BrightnessClassifier {
  fn default() -> Self {
    Self::new(128)
  }
}

impl Classifier for BrightnessClassifier {
  fn classify(&self, image: &RgbImage) -> Result<Classification, EngineError> {
    let pixels = (image.width() * image.height()).max(1) as u64;
    let sum: u64 = image
      .pixels()
      .map(|px| (px.0[0] as u64 + px.0[1] as u64 + px.0[2] as u64) / 3)
      .sum();
    let mean = (sum / pixels) as u8;
    let (label, distance) = if mean >= self.cutoff {
      ("bright", mean - self.cutoff)
    } else {
      ("dark", self.cutoff - mean)
    };
    Ok(Classification {
      label: label.into(),
      confidence: 0.5 + (distance as f32 / 255.0).min(0.5),
    })
  }
}

/// 固定文本识别引擎（测试与联调用）
pub struct FixedOcr {
  text: String,
}

impl FixedOcr {
  pub fn new(text: impl Into<String>) -> Self {
    Self { text: text.into() }
  }
}

impl OcrEngine for FixedOcr {
  fn recognize(&self, _image: &RgbImage) -> Result<String, EngineError> {
    Ok(self.text.clone())
  }
}

impl FromUrlWithScheme for BlobDetector {
  const SCHEME: &'static str = "blob";
}

impl FromUrl for BlobDetector {
  type Error = EngineError;

  /// `blob://?threshold=128&min_area=16`
  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(EngineError::UnknownScheme(url.scheme().into()));
    }
    let mut detector = BlobDetector::default();
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "threshold" => {
          detector.threshold = v
            .parse()
            .map_err(|_| EngineError::BadParameter(format!("threshold={}", v)))?;
        }
        "min_area" => {
          detector.min_area = v
            .parse()
            .map_err(|_| EngineError::BadParameter(format!("min_area={}", v)))?;
        }
        _ => {}
      }
    }
    Ok(detector)
  }
}

impl FromUrlWithScheme for BrightnessClassifier {
  const SCHEME: &'static str = "brightness";
}

impl FromUrl for BrightnessClassifier {
  type Error = EngineError;

  /// `brightness://?cutoff=128`
  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(EngineError::UnknownScheme(url.scheme().into()));
    }
    let mut classifier = BrightnessClassifier::default();
    for (k, v) in url.query_pairs() {
      if k == "cutoff" {
        classifier.cutoff = v
          .parse()
          .map_err(|_| EngineError::BadParameter(format!("cutoff={}", v)))?;
      }
    }
    Ok(classifier)
  }
}

impl FromUrlWithScheme for FixedOcr {
  const SCHEME: &'static str = "fixed";
}

impl FromUrl for FixedOcr {
  type Error = EngineError;

  /// `fixed://?text=LOT-042`
  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(EngineError::UnknownScheme(url.scheme().into()));
    }
    let text = url
      .query_pairs()
      .find(|(k, _)| k == "text")
      .map(|(_, v)| v.into_owned())
      .unwrap_or_default();
    Ok(FixedOcr::new(text))
  }
}

/// 按 URL 方案构造检测引擎
pub fn detector_from_url(url: &url::Url) -> Result<Box<dyn Detector>, EngineError> {
  match url.scheme() {
    BlobDetector::SCHEME => Ok(Box::new(BlobDetector::from_url(url)?)),
    other => Err(EngineError::UnknownScheme(other.into())),
  }
}

/// 按 URL 方案构造分类引擎
pub fn classifier_from_url(url: &url::Url) -> Result<Box<dyn Classifier>, EngineError> {
  match url.scheme() {
    BrightnessClassifier::SCHEME => Ok(Box::new(BrightnessClassifier::from_url(url)?)),
    other => Err(EngineError::UnknownScheme(other.into())),
  }
}

/// 按 URL 方案构造识别引擎
pub fn ocr_from_url(url: &url::Url) -> Result<Box<dyn OcrEngine>, EngineError> {
  match url.scheme() {
    FixedOcr::SCHEME => Ok(Box::new(FixedOcr::from_url(url)?)),
    other => Err(EngineError::UnknownScheme(other.into())),
  }
}

/// 校验引擎 URL 方案可解析（作业加载时用，不实际构造）
pub fn scheme_is_known(url: &url::Url, kind: EngineKind) -> bool {
  match kind {
    EngineKind::Detector => url.scheme() == BlobDetector::SCHEME,
    EngineKind::Classifier => url.scheme() == BrightnessClassifier::SCHEME,
    EngineKind::Ocr => url.scheme() == FixedOcr::SCHEME,
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
  Detector,
  Classifier,
  Ocr,
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  fn blob_image() -> RgbImage {
    let mut image = RgbImage::from_pixel(32, 24, Rgb([16, 16, 16]));
    for y in 6..12 {
      for x in 8..16 {
        image.put_pixel(x, y, Rgb([230, 230, 230]));
      }
    }
    image
  }

  #[test]
  fn blob_detector_finds_bright_region() {
    let detections = BlobDetector::default().detect(&blob_image()).unwrap();
    assert_eq!(detections.len(), 1);
    let det = &detections[0];
    assert_eq!(det.label, "blob");
    assert_eq!(det.bbox, [8.0, 6.0, 16.0, 12.0]);
    // 矩形斑点填满外接框
    assert!((det.confidence - 1.0).abs() < 1e-6);
  }

  #[test]
  fn blob_detector_ignores_small_specks() {
    let mut image = RgbImage::from_pixel(16, 16, Rgb([0, 0, 0]));
    image.put_pixel(3, 3, Rgb([255, 255, 255]));
    let detections = BlobDetector::new(128, 4).detect(&image).unwrap();
    assert!(detections.is_empty());
  }

  #[test]
  fn iou_of_disjoint_boxes_is_zero() {
    let a = [0.0, 0.0, 10.0, 10.0];
    let b = [20.0, 20.0, 30.0, 30.0];
    assert_eq!(Detection::iou(&a, &b), 0.0);
  }

  #[test]
  fn iou_of_identical_boxes_is_one() {
    let a = [5.0, 5.0, 15.0, 15.0];
    assert!((Detection::iou(&a, &a) - 1.0).abs() < 1e-6);
  }

  #[test]
  fn brightness_classifier_labels_sides_of_cutoff() {
    let bright = RgbImage::from_pixel(4, 4, Rgb([200, 200, 200]));
    let dark = RgbImage::from_pixel(4, 4, Rgb([20, 20, 20]));
    let classifier = BrightnessClassifier::default();
    assert_eq!(classifier.classify(&bright).unwrap().label, "bright");
    assert_eq!(classifier.classify(&dark).unwrap().label, "dark");
  }

  #[test]
  fn fixed_ocr_echoes_configured_text() {
    let url = url::Url::parse("fixed://?text=LOT-042").unwrap();
    let ocr = FixedOcr::from_url(&url).unwrap();
    let image = RgbImage::new(2, 2);
    assert_eq!(ocr.recognize(&image).unwrap(), "LOT-042");
  }

  #[test]
  fn registry_rejects_unknown_scheme() {
    let url = url::Url::parse("yolo26://model.rknn").unwrap();
    assert!(detector_from_url(&url).is_err());
  }
}
