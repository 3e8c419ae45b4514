// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/tool/ocr.rs - 字符识别阶段
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

use crate::engine::{self, EngineError, OcrEngine};
use crate::job::OcrParams;
use crate::tool::{KEY_OCR_TEXT, KEY_ROI, StageContext, StageError, StageValue, Tool};

/// 字符识别阶段
///
/// 对当前帧（或上下文圈定的区域）运行识别引擎，文本写入 `ocr_text`。
pub struct OcrTool {
  engine: Box<dyn OcrEngine>,
}

impl OcrTool {
  pub fn new(params: OcrParams) -> Result<Self, EngineError> {
    let url = url::Url::parse(&params.model)
      .map_err(|_| EngineError::BadParameter(params.model.clone()))?;
    Ok(Self {
      engine: engine::ocr_from_url(&url)?,
    })
  }
}

impl Tool for OcrTool {
  fn run(&self, ctx: &mut StageContext) -> Result<(), StageError> {
    let image = match ctx.region_opt(KEY_ROI) {
      Some([x0, y0, x1, y1]) => ctx
        .frame()
        .crop(
          x0.max(0.0) as u32,
          y0.max(0.0) as u32,
          x1.max(0.0) as u32,
          y1.max(0.0) as u32,
        )?
        .to_rgb_image(),
      None => ctx.frame().to_rgb_image(),
    };
    let text = self.engine.recognize(&image)?;
    ctx.put(KEY_OCR_TEXT, StageValue::Text(text));
    Ok(())
  }
}
