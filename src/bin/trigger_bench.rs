// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/bin/trigger_bench.rs - 触发周期基准
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

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use url::Url;

use mingcha::FromUrl;
use mingcha::camera::{CameraConfig, CameraDevice};
use mingcha::counters::Counters;
use mingcha::frame::MonoClock;
use mingcha::strobe::StrobeWrapper;
use mingcha::trigger::{TriggerConfig, TriggerScheduler};
use tracing::info;

/// Mingcha 触发基准参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 摄像头来源
  #[arg(long, default_value = "sim://?pattern=blob", value_name = "SOURCE")]
  pub camera: Url,
  /// 频闪输出
  #[arg(long, default_value = "sim://", value_name = "STROBE")]
  pub strobe: Url,
  /// 触发次数
  #[arg(long, default_value = "100", value_name = "COUNT")]
  pub count: u64,
  /// 频闪脉宽（微秒）
  #[arg(long, default_value = "1000", value_name = "US")]
  pub pulse_width_us: u32,
  /// 频闪后延时（毫秒）
  #[arg(long, default_value = "0", value_name = "MS")]
  pub delay_ms: u64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("摄像头来源: {}", args.camera);
  info!("频闪输出: {}", args.strobe);
  info!("触发次数: {}", args.count);

  let clock = Arc::new(MonoClock::new());
  let mut device = CameraDevice::open(&args.camera, Arc::clone(&clock));
  device.configure(&CameraConfig::preview())?;
  device.start()?;

  let strobe = StrobeWrapper::from_url(&args.strobe)?;
  let counters = Arc::new(Counters::new());
  let scheduler = TriggerScheduler::new(
    Arc::new(Mutex::new(device)),
    Arc::new(Mutex::new(strobe)),
    clock,
    Arc::clone(&counters),
    TriggerConfig {
      pulse_width_us: args.pulse_width_us,
      delay_before_capture_ms: args.delay_ms,
      ..TriggerConfig::default()
    },
  );

  let started = Instant::now();
  let mut delivered = 0u64;
  let mut failed = 0u64;
  for _ in 0..args.count {
    match scheduler.fire(None) {
      Some((mut request, Ok(_frame))) => {
        scheduler.mark_delivered(&mut request);
        delivered += 1;
      }
      Some((_, Err(e))) => {
        info!("触发失败: {}", e);
        failed += 1;
      }
      None => unreachable!("基准单线程, 不会有飞行中丢弃"),
    }
  }
  let elapsed = started.elapsed();

  println!("触发 {} 次, 交付 {} 次, 失败 {} 次", args.count, delivered, failed);
  println!(
    "总耗时 {:.3} 秒, 平均周期 {:.2} 毫秒",
    elapsed.as_secs_f64(),
    elapsed.as_secs_f64() * 1000.0 / args.count as f64
  );
  println!("计数快照: {}", serde_json::to_string(&counters.snapshot())?);

  Ok(())
}
