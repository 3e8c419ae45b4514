// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/job.rs - 作业（工具链）模型
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

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{self, EngineKind};

#[derive(Error, Debug)]
pub enum JobError {
  #[error("作业文档解析失败: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("作业没有任何阶段")]
  EmptyChain,
  #[error("阶段名称重复: {0}")]
  DuplicateStageName(String),
  #[error("阶段 {stage} 的种类不可识别: {kind}")]
  UnknownKind { stage: String, kind: String },
  #[error("首个阶段必须是 camera_source")]
  FirstStageNotCameraSource,
  #[error("末个阶段必须是 result")]
  LastStageNotResult,
  #[error("终点 result 阶段不可禁用")]
  ResultStageDisabled,
  #[error("阶段 {stage} 参数无效: {message}")]
  BadParams { stage: String, message: String },
  #[error("阶段 {stage} 的引擎地址无效: {url}")]
  BadEngineUrl { stage: String, url: String },
}

/// 阶段种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
  CameraSource,
  Detect,
  Classify,
  SaveImage,
  EdgeDetect,
  Ocr,
  Result,
}

impl StageKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      StageKind::CameraSource => "camera_source",
      StageKind::Detect => "detect",
      StageKind::Classify => "classify",
      StageKind::SaveImage => "save_image",
      StageKind::EdgeDetect => "edge_detect",
      StageKind::Ocr => "ocr",
      StageKind::Result => "result",
    }
  }

  pub fn parse(kind: &str) -> Option<Self> {
    match kind {
      "camera_source" => Some(StageKind::CameraSource),
      "detect" => Some(StageKind::Detect),
      "classify" => Some(StageKind::Classify),
      "save_image" => Some(StageKind::SaveImage),
      "edge_detect" => Some(StageKind::EdgeDetect),
      "ocr" => Some(StageKind::Ocr),
      "result" => Some(StageKind::Result),
      _ => None,
    }
  }
}

fn default_enabled() -> bool {
  true
}

fn default_conf() -> f32 {
  0.5
}

fn default_iou() -> f32 {
  0.45
}

/// 作业文档（持久化形态）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDoc {
  pub name: String,
  pub stages: Vec<StageDoc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDoc {
  pub kind: String,
  pub name: String,
  #[serde(default = "default_enabled")]
  pub enabled: bool,
  #[serde(default)]
  pub params: serde_json::Value,
}

/// 检测阶段参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectParams {
  /// 检测引擎地址, 如 `blob://?threshold=128`
  pub model: String,
  /// 类别白名单（空表示不过滤）
  #[serde(default)]
  pub classes_allowed: Vec<String>,
  #[serde(default = "default_conf")]
  pub conf_threshold: f32,
  #[serde(default = "default_iou")]
  pub iou_threshold: f32,
  /// 操作员圈定的检测区域 [x_min, y_min, x_max, y_max]（像素）
  #[serde(default)]
  pub roi_xyxy: Option<[f32; 4]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifyParams {
  pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrParams {
  pub model: String,
}

fn default_edge_threshold() -> u32 {
  160
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDetectParams {
  /// 梯度幅值阈值
  #[serde(default = "default_edge_threshold")]
  pub threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveImageParams {
  pub directory: String,
  /// 只在有检测结果时落盘
  #[serde(default)]
  pub only_detections: bool,
  /// 叠画检测框
  #[serde(default = "default_enabled")]
  pub draw_overlay: bool,
}

/// 判定规则（声明式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
  /// 必须存在指定类别的检测
  RequireClass {
    class: String,
    #[serde(default = "default_conf")]
    min_conf: f32,
  },
  /// 不得存在指定类别的检测
  ForbidClass {
    class: String,
    #[serde(default = "default_conf")]
    min_conf: f32,
  },
  /// 检测数下限
  MinDetections { count: usize },
  /// 分类结果必须含指定标签
  RequireLabel {
    label: String,
    #[serde(default = "default_conf")]
    min_conf: f32,
  },
  /// 识别文本必须包含指定子串
  RequireText { text: String },
  /// 边缘密度下限
  MinEdgeDensity { min: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultParams {
  pub rules: Vec<Rule>,
}

/// 校验后的阶段
#[derive(Debug, Clone)]
pub struct ToolStage {
  pub name: String,
  pub enabled: bool,
  pub spec: StageSpec,
}

#[derive(Debug, Clone)]
pub enum StageSpec {
  /// 帧由触发调度器装入，本阶段不执行
  CameraSource,
  Detect(DetectParams),
  Classify(ClassifyParams),
  SaveImage(SaveImageParams),
  EdgeDetect(EdgeDetectParams),
  Ocr(OcrParams),
  Result(ResultParams),
}

/// 校验通过的作业
///
/// 不可变；校验失败的作业不会暴露任何部分构造。
#[derive(Debug, Clone)]
pub struct Job {
  name: String,
  stages: Vec<ToolStage>,
  doc: JobDoc,
}

impl Job {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn stages(&self) -> &[ToolStage] {
    &self.stages
  }

  /// 终点阶段的判定规则
  pub fn result_params(&self) -> &ResultParams {
    match &self.stages.last().expect("校验保证非空").spec {
      StageSpec::Result(params) => params,
      _ => unreachable!("校验保证末阶段为 result"),
    }
  }

  pub fn from_json(json: &str) -> Result<Self, JobError> {
    let doc: JobDoc = serde_json::from_str(json)?;
    Self::load(doc)
  }

  pub fn to_json(&self) -> String {
    serde_json::to_string_pretty(&self.doc).expect("作业文档可序列化")
  }

  pub fn doc(&self) -> &JobDoc {
    &self.doc
  }

  /// 加载并校验作业文档
  pub fn load(doc: JobDoc) -> Result<Self, JobError> {
    if doc.stages.is_empty() {
      return Err(JobError::EmptyChain);
    }

    let mut names = HashSet::new();
    for stage in &doc.stages {
      if !names.insert(stage.name.as_str()) {
        return Err(JobError::DuplicateStageName(stage.name.clone()));
      }
    }

    let mut stages = Vec::with_capacity(doc.stages.len());
    for (index, stage) in doc.stages.iter().enumerate() {
      let kind = StageKind::parse(&stage.kind).ok_or_else(|| JobError::UnknownKind {
        stage: stage.name.clone(),
        kind: stage.kind.clone(),
      })?;
      if index == 0 && kind != StageKind::CameraSource {
        return Err(JobError::FirstStageNotCameraSource);
      }
      if index + 1 == doc.stages.len() {
        if kind != StageKind::Result {
          return Err(JobError::LastStageNotResult);
        }
        if !stage.enabled {
          return Err(JobError::ResultStageDisabled);
        }
      }

      let spec = match kind {
        StageKind::CameraSource => StageSpec::CameraSource,
        StageKind::Detect => {
          let params: DetectParams = parse_params(stage)?;
          check_engine_url(stage, &params.model, EngineKind::Detector)?;
          StageSpec::Detect(params)
        }
        StageKind::Classify => {
          let params: ClassifyParams = parse_params(stage)?;
          check_engine_url(stage, &params.model, EngineKind::Classifier)?;
          StageSpec::Classify(params)
        }
        StageKind::Ocr => {
          let params: OcrParams = parse_params(stage)?;
          check_engine_url(stage, &params.model, EngineKind::Ocr)?;
          StageSpec::Ocr(params)
        }
        StageKind::SaveImage => StageSpec::SaveImage(parse_params(stage)?),
        StageKind::EdgeDetect => StageSpec::EdgeDetect(parse_params(stage)?),
        StageKind::Result => StageSpec::Result(parse_params(stage)?),
      };
      stages.push(ToolStage {
        name: stage.name.clone(),
        enabled: stage.enabled,
        spec,
      });
    }

    Ok(Self {
      name: doc.name.clone(),
      stages,
      doc,
    })
  }
}

fn parse_params<T: serde::de::DeserializeOwned>(stage: &StageDoc) -> Result<T, JobError> {
  serde_json::from_value(stage.params.clone()).map_err(|e| JobError::BadParams {
    stage: stage.name.clone(),
    message: e.to_string(),
  })
}

fn check_engine_url(stage: &StageDoc, model: &str, kind: EngineKind) -> Result<(), JobError> {
  let url = url::Url::parse(model).map_err(|_| JobError::BadEngineUrl {
    stage: stage.name.clone(),
    url: model.to_string(),
  })?;
  if !engine::scheme_is_known(&url, kind) {
    return Err(JobError::BadEngineUrl {
      stage: stage.name.clone(),
      url: model.to_string(),
    });
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  pub(crate) fn sample_json() -> String {
    serde_json::json!({
      "name": "瓶盖检查",
      "stages": [
        {"kind": "camera_source", "name": "camera", "enabled": true, "params": {}},
        {"kind": "detect", "name": "find_caps", "enabled": true, "params": {
          "model": "blob://?threshold=128&min_area=16",
          "classes_allowed": ["blob"],
          "conf_threshold": 0.5,
          "iou_threshold": 0.45
        }},
        {"kind": "result", "name": "verdict", "enabled": true, "params": {
          "rules": [{"kind": "require_class", "class": "blob", "min_conf": 0.5}]
        }}
      ]
    })
    .to_string()
  }

  #[test]
  fn valid_job_loads() {
    let job = Job::from_json(&sample_json()).unwrap();
    assert_eq!(job.name(), "瓶盖检查");
    assert_eq!(job.stages().len(), 3);
    assert_eq!(job.result_params().rules.len(), 1);
  }

  #[test]
  fn job_round_trips_unchanged() {
    let job = Job::from_json(&sample_json()).unwrap();
    let reloaded = Job::from_json(&job.to_json()).unwrap();
    assert_eq!(job.doc(), reloaded.doc());
  }

  #[test]
  fn missing_result_stage_is_refused() {
    let json = serde_json::json!({
      "name": "bad",
      "stages": [
        {"kind": "camera_source", "name": "camera"},
        {"kind": "detect", "name": "d", "params": {"model": "blob://"}}
      ]
    })
    .to_string();
    assert!(matches!(
      Job::from_json(&json),
      Err(JobError::LastStageNotResult)
    ));
  }

  #[test]
  fn first_stage_must_be_camera_source() {
    let json = serde_json::json!({
      "name": "bad",
      "stages": [
        {"kind": "detect", "name": "d", "params": {"model": "blob://"}},
        {"kind": "result", "name": "r", "params": {"rules": []}}
      ]
    })
    .to_string();
    assert!(matches!(
      Job::from_json(&json),
      Err(JobError::FirstStageNotCameraSource)
    ));
  }

  #[test]
  fn duplicate_stage_names_are_refused() {
    let json = serde_json::json!({
      "name": "bad",
      "stages": [
        {"kind": "camera_source", "name": "same"},
        {"kind": "result", "name": "same", "params": {"rules": []}}
      ]
    })
    .to_string();
    assert!(matches!(
      Job::from_json(&json),
      Err(JobError::DuplicateStageName(_))
    ));
  }

  #[test]
  fn unknown_kind_is_refused() {
    let json = serde_json::json!({
      "name": "bad",
      "stages": [
        {"kind": "camera_source", "name": "camera"},
        {"kind": "teleport", "name": "t"},
        {"kind": "result", "name": "r", "params": {"rules": []}}
      ]
    })
    .to_string();
    assert!(matches!(Job::from_json(&json), Err(JobError::UnknownKind { .. })));
  }

  #[test]
  fn unresolvable_engine_scheme_is_refused() {
    let json = serde_json::json!({
      "name": "bad",
      "stages": [
        {"kind": "camera_source", "name": "camera"},
        {"kind": "detect", "name": "d", "params": {"model": "yolo26://model.rknn"}},
        {"kind": "result", "name": "r", "params": {"rules": []}}
      ]
    })
    .to_string();
    assert!(matches!(Job::from_json(&json), Err(JobError::BadEngineUrl { .. })));
  }

  #[test]
  fn disabled_result_stage_is_refused() {
    let json = serde_json::json!({
      "name": "bad",
      "stages": [
        {"kind": "camera_source", "name": "camera"},
        {"kind": "result", "name": "r", "enabled": false, "params": {"rules": []}}
      ]
    })
    .to_string();
    assert!(matches!(
      Job::from_json(&json),
      Err(JobError::ResultStageDisabled)
    ));
  }

  #[test]
  fn rule_document_round_trips() {
    let rule: Rule = serde_json::from_str(
      r#"{"kind": "require_class", "class": "blob", "min_conf": 0.6}"#,
    )
    .unwrap();
    assert_eq!(
      rule,
      Rule::RequireClass {
        class: "blob".into(),
        min_conf: 0.6
      }
    );
  }
}
