// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/tool/result.rs - 判定阶段
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

use crate::job::Rule;
use crate::tool::{KEY_EDGE_DENSITY, KEY_OCR_TEXT, StageContext, Verdict};

/// 按声明式规则集评估上下文
///
/// 所有规则满足为 OK，第一条不满足的规则给出 NG 理由。
pub fn evaluate(rules: &[Rule], ctx: &StageContext, frame_seq: u64) -> Verdict {
  for rule in rules {
    if let Some(reason) = check(rule, ctx) {
      return Verdict::ng(reason, frame_seq);
    }
  }
  Verdict::ok(frame_seq)
}

/// 单条规则；满足返回 None，否则返回 NG 理由
fn check(rule: &Rule, ctx: &StageContext) -> Option<String> {
  match rule {
    Rule::RequireClass { class, min_conf } => {
      let found = ctx
        .detections_or_empty()
        .iter()
        .any(|det| det.label == *class && det.confidence >= *min_conf);
      if found {
        None
      } else {
        Some(format!("缺少类别 {} (置信度 >= {})", class, min_conf))
      }
    }
    Rule::ForbidClass { class, min_conf } => {
      let found = ctx
        .detections_or_empty()
        .iter()
        .any(|det| det.label == *class && det.confidence >= *min_conf);
      if found {
        Some(format!("出现禁止类别 {}", class))
      } else {
        None
      }
    }
    Rule::MinDetections { count } => {
      let actual = ctx.detections_or_empty().len();
      if actual >= *count {
        None
      } else {
        Some(format!("检测数 {} 低于下限 {}", actual, count))
      }
    }
    Rule::RequireLabel { label, min_conf } => {
      let found = ctx
        .classifications()
        .map(|cs| {
          cs.iter()
            .any(|c| c.label == *label && c.confidence >= *min_conf)
        })
        .unwrap_or(false);
      if found {
        None
      } else {
        Some(format!("缺少分类标签 {}", label))
      }
    }
    Rule::RequireText { text } => {
      let found = ctx
        .text(KEY_OCR_TEXT)
        .map(|t| t.contains(text.as_str()))
        .unwrap_or(false);
      if found {
        None
      } else {
        Some(format!("识别文本不含 {:?}", text))
      }
    }
    Rule::MinEdgeDensity { min } => {
      let density = ctx.scalar(KEY_EDGE_DENSITY).unwrap_or(0.0);
      if density >= *min {
        None
      } else {
        Some(format!("边缘密度 {:.4} 低于下限 {}", density, min))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::{Classification, Detection};
  use crate::frame::{ChannelLayout, Frame, FrameMetadata};
  use crate::tool::{KEY_CLASSIFICATIONS, KEY_DETECTIONS, StageValue, VerdictKind};

  fn ctx_with_blob(confidence: f32) -> StageContext {
    let frame = Frame::black(8, 8, ChannelLayout::Rgb, FrameMetadata::default());
    let mut ctx = StageContext::new(frame);
    ctx.put(
      KEY_DETECTIONS,
      StageValue::Detections(vec![Detection {
        class_id: 0,
        label: "blob".into(),
        confidence,
        bbox: [0.0, 0.0, 4.0, 4.0],
      }]),
    );
    ctx
  }

  #[test]
  fn require_class_passes_with_confident_detection() {
    let ctx = ctx_with_blob(0.9);
    let rules = vec![Rule::RequireClass {
      class: "blob".into(),
      min_conf: 0.5,
    }];
    assert_eq!(evaluate(&rules, &ctx, 1).kind, VerdictKind::Ok);
  }

  #[test]
  fn require_class_fails_below_threshold() {
    let ctx = ctx_with_blob(0.3);
    let rules = vec![Rule::RequireClass {
      class: "blob".into(),
      min_conf: 0.5,
    }];
    let verdict = evaluate(&rules, &ctx, 1);
    assert_eq!(verdict.kind, VerdictKind::Ng);
    assert!(verdict.reason.unwrap().contains("blob"));
  }

  #[test]
  fn forbid_class_fails_when_present() {
    let ctx = ctx_with_blob(0.9);
    let rules = vec![Rule::ForbidClass {
      class: "blob".into(),
      min_conf: 0.5,
    }];
    assert_eq!(evaluate(&rules, &ctx, 1).kind, VerdictKind::Ng);
  }

  #[test]
  fn min_detections_counts_context_entries() {
    let ctx = ctx_with_blob(0.9);
    assert_eq!(
      evaluate(&[Rule::MinDetections { count: 1 }], &ctx, 1).kind,
      VerdictKind::Ok
    );
    assert_eq!(
      evaluate(&[Rule::MinDetections { count: 2 }], &ctx, 1).kind,
      VerdictKind::Ng
    );
  }

  #[test]
  fn require_label_reads_classifications() {
    let mut ctx = ctx_with_blob(0.9);
    ctx.put(
      KEY_CLASSIFICATIONS,
      StageValue::Classifications(vec![Classification {
        label: "bright".into(),
        confidence: 0.8,
      }]),
    );
    let ok = vec![Rule::RequireLabel {
      label: "bright".into(),
      min_conf: 0.5,
    }];
    let ng = vec![Rule::RequireLabel {
      label: "dark".into(),
      min_conf: 0.5,
    }];
    assert_eq!(evaluate(&ok, &ctx, 1).kind, VerdictKind::Ok);
    assert_eq!(evaluate(&ng, &ctx, 1).kind, VerdictKind::Ng);
  }

  #[test]
  fn require_text_is_substring_match() {
    let mut ctx = ctx_with_blob(0.9);
    ctx.put(KEY_OCR_TEXT, StageValue::Text("LOT-042-B".into()));
    assert_eq!(
      evaluate(&[Rule::RequireText { text: "042".into() }], &ctx, 1).kind,
      VerdictKind::Ok
    );
    assert_eq!(
      evaluate(&[Rule::RequireText { text: "043".into() }], &ctx, 1).kind,
      VerdictKind::Ng
    );
  }

  #[test]
  fn missing_context_keys_fail_closed() {
    let frame = Frame::black(8, 8, ChannelLayout::Rgb, FrameMetadata::default());
    let ctx = StageContext::new(frame);
    // 没有写入任何阶段输出时, require 类规则一律 NG
    assert_eq!(
      evaluate(
        &[Rule::MinEdgeDensity { min: 0.1 }],
        &ctx,
        1
      )
      .kind,
      VerdictKind::Ng
    );
    assert_eq!(
      evaluate(&[Rule::RequireText { text: "x".into() }], &ctx, 1).kind,
      VerdictKind::Ng
    );
  }

  #[test]
  fn empty_rule_set_is_ok() {
    let ctx = ctx_with_blob(0.9);
    let verdict = evaluate(&[], &ctx, 5);
    assert_eq!(verdict.kind, VerdictKind::Ok);
    assert_eq!(verdict.frame_seq, 5);
  }
}
