// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/args.rs - 项目参数配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use clap::Parser;
use url::Url;

/// Mingcha 项目参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 摄像头来源
  /// 支持格式:
  /// - 模拟: sim://?pattern=blob|black|gradient
  /// - V4L2: v4l2:///dev/video0 （需启用 v4l2_capture 特性）
  #[arg(long, default_value = "sim://?pattern=blob", value_name = "SOURCE")]
  pub camera: Url,

  /// 频闪输出
  /// 支持格式:
  /// - GPIO: gpio://?line=18&active=high
  /// - 模拟: sim://
  #[arg(long, default_value = "sim://", value_name = "STROBE")]
  pub strobe: Url,

  /// 作业文件路径（JSON）
  #[arg(long, value_name = "FILE")]
  pub job: String,

  /// 运行模式: trigger 或 live
  #[arg(long, default_value = "trigger", value_name = "MODE")]
  pub mode: String,

  /// 自动触发频率（赫兹, 0 表示关, 仅 trigger 模式有效）
  #[arg(long, default_value = "0", value_name = "HZ")]
  pub auto_trigger_hz: f64,

  /// 运行时长（秒, 0 表示直到 Ctrl-C）
  #[arg(long, default_value = "0", value_name = "SECONDS")]
  pub duration: u64,
}
