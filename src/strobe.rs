// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/strobe.rs - 频闪光源驱动
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

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{FromUrl, FromUrlWithScheme};

/// 脉宽下限（微秒）
pub const MIN_PULSE_US: u32 = 100;
/// 脉宽上限（微秒）
pub const MAX_PULSE_US: u32 = 10_000;

#[derive(Error, Debug)]
pub enum StrobeError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("GPIO 线 {0} 无法打开: {1}")]
  OpenFailed(u32, std::io::Error),
  #[error("GPIO 线 {0} 写入失败: {1}")]
  WriteFailed(u32, std::io::Error),
  #[error("URI 参数错误: {0}")]
  BadParameter(String),
}

/// 数字输出线电平
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineLevel {
  Low,
  High,
}

impl LineLevel {
  fn sysfs_value(&self) -> &'static [u8] {
    match self {
      LineLevel::Low => b"0",
      LineLevel::High => b"1",
    }
  }

  pub fn inverted(&self) -> Self {
    match self {
      LineLevel::Low => LineLevel::High,
      LineLevel::High => LineLevel::Low,
    }
  }
}

/// 频闪驱动
///
/// `pulse` 为同步调用：返回时线路已回到空闲电平。
/// 空闲电平由驱动在两次脉冲之间持续保持，反极性硬件（空闲为高、
/// 触发为低）因此不需要每次调用附带极性标志。
pub trait Strobe: Send {
  /// 发出一个宽度为 `width_us` 微秒的脉冲
  fn pulse(&mut self, width_us: u32) -> Result<(), StrobeError>;

  /// 释放线路
  fn close(&mut self);
}

/// sysfs GPIO 频闪驱动
pub struct GpioStrobe {
  line: u32,
  value_path: PathBuf,
  active: LineLevel,
  idle: LineLevel,
}

impl GpioStrobe {
  /// 打开 GPIO 线并将其保持在空闲电平
  pub fn open(line: u32, active: LineLevel, idle: LineLevel) -> Result<Self, StrobeError> {
    let base = PathBuf::from("/sys/class/gpio");
    let gpio_dir = base.join(format!("gpio{}", line));

    if !gpio_dir.exists() {
      fs::write(base.join("export"), format!("{}", line))
        .map_err(|e| StrobeError::OpenFailed(line, e))?;
    }
    fs::write(gpio_dir.join("direction"), b"out")
      .map_err(|e| StrobeError::OpenFailed(line, e))?;

    let strobe = Self {
      line,
      value_path: gpio_dir.join("value"),
      active,
      idle,
    };
    strobe.write_level(idle)?;
    info!("GPIO 线 {} 已打开, 空闲电平 {:?}", line, idle);
    Ok(strobe)
  }

  fn write_level(&self, level: LineLevel) -> Result<(), StrobeError> {
    let mut file = fs::OpenOptions::new()
      .write(true)
      .open(&self.value_path)
      .map_err(|e| StrobeError::WriteFailed(self.line, e))?;
    file
      .write_all(level.sysfs_value())
      .map_err(|e| StrobeError::WriteFailed(self.line, e))
  }
}

impl Strobe for GpioStrobe {
  fn pulse(&mut self, width_us: u32) -> Result<(), StrobeError> {
    let width_us = width_us.clamp(MIN_PULSE_US, MAX_PULSE_US);
    self.write_level(self.active)?;
    sleep_precise(Duration::from_micros(width_us as u64));
    self.write_level(self.idle)?;
    debug!("GPIO 线 {} 脉冲 {} 微秒", self.line, width_us);
    Ok(())
  }

  fn close(&mut self) {
    if let Err(e) = self.write_level(self.idle) {
      warn!("关闭时无法恢复空闲电平: {}", e);
    }
    let unexport = PathBuf::from("/sys/class/gpio/unexport");
    let _ = fs::write(unexport, format!("{}", self.line));
    info!("GPIO 线 {} 已释放", self.line);
  }
}

/// 模拟频闪（无硬件主机上的降级实现）
///
/// 脉冲退化为等宽的睡眠，使流水线其余部分的时序保持可测。
#[derive(Debug, Default)]
pub struct SimStrobe {
  pulses: u64,
}

impl SimStrobe {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn pulses(&self) -> u64 {
    self.pulses
  }
}

impl Strobe for SimStrobe {
  fn pulse(&mut self, width_us: u32) -> Result<(), StrobeError> {
    let width_us = width_us.clamp(MIN_PULSE_US, MAX_PULSE_US);
    sleep_precise(Duration::from_micros(width_us as u64));
    self.pulses += 1;
    Ok(())
  }

  fn close(&mut self) {}
}

pub enum StrobeWrapper {
  Gpio(GpioStrobe),
  Sim(SimStrobe),
}

impl Strobe for StrobeWrapper {
  fn pulse(&mut self, width_us: u32) -> Result<(), StrobeError> {
    match self {
      StrobeWrapper::Gpio(s) => s.pulse(width_us),
      StrobeWrapper::Sim(s) => s.pulse(width_us),
    }
  }

  fn close(&mut self) {
    match self {
      StrobeWrapper::Gpio(s) => s.close(),
      StrobeWrapper::Sim(s) => s.close(),
    }
  }
}

impl FromUrlWithScheme for GpioStrobe {
  const SCHEME: &'static str = "gpio";
}

impl FromUrl for GpioStrobe {
  type Error = StrobeError;

  /// `gpio://?line=18&active=high`
  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(StrobeError::SchemeMismatch);
    }
    let mut line = None;
    let mut active = LineLevel::High;
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "line" => {
          line = Some(
            v.parse::<u32>()
              .map_err(|_| StrobeError::BadParameter(format!("line={}", v)))?,
          );
        }
        "active" => {
          active = match v.as_ref() {
            "high" => LineLevel::High,
            "low" => LineLevel::Low,
            other => return Err(StrobeError::BadParameter(format!("active={}", other))),
          };
        }
        _ => {}
      }
    }
    let line = line.ok_or_else(|| StrobeError::BadParameter("缺少 line 参数".into()))?;
    GpioStrobe::open(line, active, active.inverted())
  }
}

impl FromUrl for StrobeWrapper {
  type Error = StrobeError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      "sim" => Ok(StrobeWrapper::Sim(SimStrobe::new())),
      GpioStrobe::SCHEME => Ok(StrobeWrapper::Gpio(GpioStrobe::from_url(url)?)),
      _ => Err(StrobeError::SchemeMismatch),
    }
  }
}

/// 亚毫秒精度的睡眠：粗粒度睡眠留出 200 微秒余量，剩余部分自旋
fn sleep_precise(duration: Duration) {
  let start = Instant::now();
  let margin = Duration::from_micros(200);
  if duration > margin {
    std::thread::sleep(duration - margin);
  }
  while start.elapsed() < duration {
    std::hint::spin_loop();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sim_pulse_takes_at_least_width() {
    let mut strobe = SimStrobe::new();
    let start = Instant::now();
    strobe.pulse(1000).unwrap();
    assert!(start.elapsed() >= Duration::from_micros(1000));
    assert_eq!(strobe.pulses(), 1);
  }

  #[test]
  fn pulse_width_is_clamped() {
    let mut strobe = SimStrobe::new();
    let start = Instant::now();
    // 超出上限的请求被收紧到 10 毫秒
    strobe.pulse(50_000).unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_micros(MAX_PULSE_US as u64));
    assert!(elapsed < Duration::from_millis(40));
  }

  #[test]
  fn line_level_inversion() {
    assert_eq!(LineLevel::High.inverted(), LineLevel::Low);
    assert_eq!(LineLevel::Low.inverted(), LineLevel::High);
  }

  #[test]
  fn gpio_url_requires_line() {
    let url = url::Url::parse("gpio://?active=low").unwrap();
    assert!(matches!(
      GpioStrobe::from_url(&url),
      Err(StrobeError::BadParameter(_))
    ));
  }

  #[test]
  fn sim_url_builds_sim_strobe() {
    let url = url::Url::parse("sim://").unwrap();
    assert!(matches!(
      StrobeWrapper::from_url(&url),
      Ok(StrobeWrapper::Sim(_))
    ));
  }
}
