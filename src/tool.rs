// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/tool.rs - 工具链执行器
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

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::counters::Counters;
use crate::engine::{Classification, Detection, EngineError};
use crate::frame::{Frame, FrameError};
use crate::job::{Job, JobError, StageSpec};

mod classify;
mod detect;
mod edge_detect;
mod ocr;
mod result;
mod save_image;

pub use self::classify::ClassifyTool;
pub use self::detect::DetectTool;
pub use self::edge_detect::EdgeDetectTool;
pub use self::ocr::OcrTool;
pub use self::save_image::SaveImageTool;

/// 上下文键：检测结果
pub const KEY_DETECTIONS: &str = "detections";
/// 上下文键：分类结果
pub const KEY_CLASSIFICATIONS: &str = "classifications";
/// 上下文键：操作员圈定的检测区域
pub const KEY_ROI: &str = "roi";
/// 上下文键：识别文本
pub const KEY_OCR_TEXT: &str = "ocr_text";
/// 上下文键：边缘密度
pub const KEY_EDGE_DENSITY: &str = "edge_density";

/// 默认单阶段耗时预算
pub const DEFAULT_STAGE_BUDGET: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum StageError {
  #[error("上下文缺少键: {0}")]
  MissingKey(String),
  #[error("上下文键 {key} 类型不符: 期望 {expected}")]
  WrongKind { key: String, expected: &'static str },
  #[error("引擎错误: {0}")]
  Engine(#[from] EngineError),
  #[error("帧错误: {0}")]
  Frame(#[from] FrameError),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  Image(#[from] image::ImageError),
  #[error("{0}")]
  Failed(String),
}

/// 阶段输出值（带类型的上下文条目）
#[derive(Debug, Clone)]
pub enum StageValue {
  Detections(Vec<Detection>),
  Classifications(Vec<Classification>),
  Text(String),
  Scalar(f64),
  Region([f32; 4]),
}

/// 阶段上下文
///
/// 单次链运行独占的可变包。当前帧恒在；后续阶段可整帧替换，
/// 替换以阶段边界为原子单位。读取方按期望类型取值，
/// 缺失或类型不符即错。
pub struct StageContext {
  frame: Frame,
  values: HashMap<String, StageValue>,
}

impl StageContext {
  pub fn new(frame: Frame) -> Self {
    Self {
      frame,
      values: HashMap::new(),
    }
  }

  pub fn frame(&self) -> &Frame {
    &self.frame
  }

  /// 整帧替换（裁剪类阶段用）
  pub fn replace_frame(&mut self, frame: Frame) {
    self.frame = frame;
  }

  pub fn put(&mut self, key: &str, value: StageValue) {
    self.values.insert(key.to_string(), value);
  }

  pub fn contains(&self, key: &str) -> bool {
    self.values.contains_key(key)
  }

  pub fn detections(&self) -> Result<&[Detection], StageError> {
    match self.values.get(KEY_DETECTIONS) {
      Some(StageValue::Detections(d)) => Ok(d),
      Some(_) => Err(StageError::WrongKind {
        key: KEY_DETECTIONS.into(),
        expected: "detections",
      }),
      None => Err(StageError::MissingKey(KEY_DETECTIONS.into())),
    }
  }

  /// 检测结果（未写入视作空）
  pub fn detections_or_empty(&self) -> &[Detection] {
    match self.values.get(KEY_DETECTIONS) {
      Some(StageValue::Detections(d)) => d,
      _ => &[],
    }
  }

  pub fn classifications(&self) -> Result<&[Classification], StageError> {
    match self.values.get(KEY_CLASSIFICATIONS) {
      Some(StageValue::Classifications(c)) => Ok(c),
      Some(_) => Err(StageError::WrongKind {
        key: KEY_CLASSIFICATIONS.into(),
        expected: "classifications",
      }),
      None => Err(StageError::MissingKey(KEY_CLASSIFICATIONS.into())),
    }
  }

  pub fn text(&self, key: &str) -> Result<&str, StageError> {
    match self.values.get(key) {
      Some(StageValue::Text(t)) => Ok(t),
      Some(_) => Err(StageError::WrongKind {
        key: key.into(),
        expected: "text",
      }),
      None => Err(StageError::MissingKey(key.into())),
    }
  }

  pub fn scalar(&self, key: &str) -> Result<f64, StageError> {
    match self.values.get(key) {
      Some(StageValue::Scalar(v)) => Ok(*v),
      Some(_) => Err(StageError::WrongKind {
        key: key.into(),
        expected: "scalar",
      }),
      None => Err(StageError::MissingKey(key.into())),
    }
  }

  /// 可选的区域键
  pub fn region_opt(&self, key: &str) -> Option<[f32; 4]> {
    match self.values.get(key) {
      Some(StageValue::Region(r)) => Some(*r),
      _ => None,
    }
  }
}

/// 工具阶段
pub trait Tool: Send + Sync {
  fn run(&self, ctx: &mut StageContext) -> Result<(), StageError>;
}

/// 判定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerdictKind {
  Ok,
  Ng,
  Error,
}

#[derive(Debug, Clone)]
pub struct Verdict {
  pub kind: VerdictKind,
  pub reason: Option<String>,
  /// 产生该判定的帧序号
  pub frame_seq: u64,
}

impl Verdict {
  pub fn ok(frame_seq: u64) -> Self {
    Self {
      kind: VerdictKind::Ok,
      reason: None,
      frame_seq,
    }
  }

  pub fn ng(reason: impl Into<String>, frame_seq: u64) -> Self {
    Self {
      kind: VerdictKind::Ng,
      reason: Some(reason.into()),
      frame_seq,
    }
  }

  pub fn error(reason: impl Into<String>, frame_seq: u64) -> Self {
    Self {
      kind: VerdictKind::Error,
      reason: Some(reason.into()),
      frame_seq,
    }
  }

  pub fn is_ok(&self) -> bool {
    self.kind == VerdictKind::Ok
  }
}

struct RunnerStage {
  name: String,
  enabled: bool,
  tool: Box<dyn Tool>,
}

/// 工具链运行器
///
/// 从校验过的作业编译而来：中间阶段实例化为工具，
/// 终点阶段的规则集单独保存。阶段按序执行并计时，
/// 超出预算或内部出错即中止本次运行并给出 ERROR 判定。
pub struct ChainRunner {
  job_name: String,
  stages: Vec<RunnerStage>,
  result_rules: crate::job::ResultParams,
  stage_budget: Duration,
}

impl ChainRunner {
  /// 由作业编译运行器
  pub fn compile(job: &Job, stage_budget: Duration) -> Result<Self, JobError> {
    let mut stages = Vec::new();
    for stage in job.stages() {
      let tool: Box<dyn Tool> = match &stage.spec {
        // camera_source 由触发调度器装帧，不执行
        StageSpec::CameraSource => continue,
        StageSpec::Result(_) => continue,
        StageSpec::Detect(params) => Box::new(
          DetectTool::new(params.clone()).map_err(|e| JobError::BadParams {
            stage: stage.name.clone(),
            message: e.to_string(),
          })?,
        ),
        StageSpec::Classify(params) => Box::new(
          ClassifyTool::new(params.clone()).map_err(|e| JobError::BadParams {
            stage: stage.name.clone(),
            message: e.to_string(),
          })?,
        ),
        StageSpec::Ocr(params) => Box::new(
          OcrTool::new(params.clone()).map_err(|e| JobError::BadParams {
            stage: stage.name.clone(),
            message: e.to_string(),
          })?,
        ),
        StageSpec::EdgeDetect(params) => Box::new(EdgeDetectTool::new(params.clone())),
        StageSpec::SaveImage(params) => Box::new(SaveImageTool::new(params.clone())),
      };
      stages.push(RunnerStage {
        name: stage.name.clone(),
        enabled: stage.enabled,
        tool,
      });
    }
    Ok(Self {
      job_name: job.name().to_string(),
      stages,
      result_rules: job.result_params().clone(),
      stage_budget,
    })
  }

  pub fn job_name(&self) -> &str {
    &self.job_name
  }

  /// 对一帧运行整条链
  pub fn run(&self, frame: Frame, counters: &Counters) -> Verdict {
    let frame_seq = frame.seq;
    let mut ctx = StageContext::new(frame);
    let mut latencies: Vec<(String, f64)> = Vec::with_capacity(self.stages.len() + 1);

    for stage in &self.stages {
      if !stage.enabled {
        debug!("阶段 {} 已禁用, 跳过", stage.name);
        continue;
      }
      let started = Instant::now();
      let outcome = stage.tool.run(&mut ctx);
      let elapsed = started.elapsed();
      latencies.push((stage.name.clone(), elapsed.as_secs_f64() * 1e3));

      if let Err(e) = outcome {
        warn!("阶段 {} 失败: {}", stage.name, e);
        counters.set_stage_latencies(latencies);
        return Verdict::error(format!("阶段 {} 失败: {}", stage.name, e), frame_seq);
      }
      if elapsed > self.stage_budget {
        warn!("阶段 {} 超出预算 ({:.1?})", stage.name, elapsed);
        counters.set_stage_latencies(latencies);
        return Verdict::error(format!("stage {} timed out", stage.name), frame_seq);
      }
    }

    let started = Instant::now();
    let verdict = result::evaluate(&self.result_rules.rules, &ctx, frame_seq);
    latencies.push(("result".into(), started.elapsed().as_secs_f64() * 1e3));
    counters.set_stage_latencies(latencies);
    counters
      .jobs_executed
      .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    verdict
  }
}
