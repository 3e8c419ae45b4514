// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod args;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;

use mingcha::job::JobDoc;
use mingcha::station::{ConsoleSink, Station, StationConfig};
use mingcha::trigger::Mode;

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  println!("Mingcha 在线检查工位");
  println!("====================");
  println!("摄像头来源: {}", args.camera);
  println!("频闪输出: {}", args.strobe);
  println!("作业文件: {}", args.job);
  println!("运行模式: {}", args.mode);
  println!();

  let mode = match args.mode.as_str() {
    "trigger" => Mode::Trigger,
    "live" => Mode::Live,
    other => bail!("未知运行模式: {}", other),
  };

  println!("正在加载作业...");
  let text = std::fs::read_to_string(&args.job)
    .with_context(|| format!("读取作业文件失败: {}", args.job))?;
  let doc: JobDoc = serde_json::from_str(&text).context("作业文件不是合法 JSON")?;

  let mut station = Station::open(
    &args.camera,
    &args.strobe,
    StationConfig::default(),
    Arc::new(ConsoleSink),
  );
  station.load_job(doc).context("作业校验失败")?;
  station.set_mode(mode)?;
  station.set_auto_trigger_hz(args.auto_trigger_hz)?;
  println!("作业加载完成");

  let running = Arc::new(AtomicBool::new(true));
  {
    let running = Arc::clone(&running);
    ctrlc::set_handler(move || {
      println!();
      println!("收到停止信号, 正在关站...");
      running.store(false, Ordering::SeqCst);
    })
    .context("安装信号处理失败")?;
  }

  println!("正在启动工位...");
  station.start_live()?;
  println!("工位已启动");
  println!();

  let started = Instant::now();
  while running.load(Ordering::SeqCst) {
    if args.duration > 0 && started.elapsed() >= Duration::from_secs(args.duration) {
      println!("已达到运行时长: {} 秒", args.duration);
      break;
    }
    std::thread::sleep(Duration::from_millis(100));
  }

  station.stop()?;

  let snapshot = station.counters();
  println!();
  println!("处理完成!");
  println!("触发次数: {}", snapshot.trigger_count);
  println!("丢弃触发: {}", snapshot.triggers_dropped);
  println!("执行作业: {}", snapshot.jobs_executed);
  println!("节流作业: {}", snapshot.jobs_throttled);
  println!("失步重采: {}", snapshot.sync_retries);
  println!("同步超时: {}", snapshot.sync_timeouts);
  println!("计数快照: {}", serde_json::to_string(&snapshot)?);

  Ok(())
}
