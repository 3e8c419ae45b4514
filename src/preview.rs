// 该文件是 Mingcha （明察秋毫） 项目的一部分。
// src/preview.rs - 预览泵
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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::camera::{CameraDevice, CameraError};
use crate::counters::Counters;
use crate::ring::FrameRing;

/// fps 指数滑动平均权重
const FPS_EMA_ALPHA: f32 = 0.1;

struct PumpShared {
  run: AtomicBool,
  pause_requested: AtomicBool,
  paused: Mutex<bool>,
  cv: Condvar,
}

/// 预览泵
///
/// 独立线程持续从摄像头取帧入环。暂停协议是合作式的：
/// 调度器置请求标志，泵完成当前迭代后停靠并应答，
/// 恢复对称。`stop` 每次迭代都会被观察，一帧周期内退出。
pub struct PreviewPump {
  shared: Arc<PumpShared>,
  handle: Mutex<Option<JoinHandle<()>>>,
}

impl PreviewPump {
  /// 启动预览线程
  pub fn spawn(
    camera: Arc<Mutex<CameraDevice>>,
    ring: Arc<FrameRing>,
    counters: Arc<Counters>,
  ) -> std::io::Result<Self> {
    let shared = Arc::new(PumpShared {
      run: AtomicBool::new(true),
      pause_requested: AtomicBool::new(false),
      paused: Mutex::new(false),
      cv: Condvar::new(),
    });
    let thread_shared = Arc::clone(&shared);
    let handle = std::thread::Builder::new()
      .name("mingcha-preview".into())
      .spawn(move || pump_loop(thread_shared, camera, ring, counters))?;
    info!("预览泵已启动");
    Ok(Self {
      shared,
      handle: Mutex::new(Some(handle)),
    })
  }

  /// 请求暂停并等待泵应答
  ///
  /// 返回真表示泵已停靠（不再持有摄像头）。
  pub fn pause(&self, timeout: Duration) -> bool {
    self.shared.pause_requested.store(true, Ordering::SeqCst);
    let mut paused = self.shared.paused.lock().expect("预览泵锁中毒");
    let deadline = Instant::now() + timeout;
    while !*paused {
      let remaining = match deadline.checked_duration_since(Instant::now()) {
        Some(r) => r,
        None => return false,
      };
      let (guard, result) = self
        .shared
        .cv
        .wait_timeout(paused, remaining)
        .expect("预览泵锁中毒");
      paused = guard;
      if result.timed_out() && !*paused {
        return false;
      }
    }
    true
  }

  pub fn resume(&self) {
    self.shared.pause_requested.store(false, Ordering::SeqCst);
    self.shared.cv.notify_all();
  }

  pub fn is_paused(&self) -> bool {
    *self.shared.paused.lock().expect("预览泵锁中毒")
  }

  /// 停止泵；限时等待退出，超时则弃管
  pub fn stop(&self, timeout: Duration) -> bool {
    self.shared.run.store(false, Ordering::SeqCst);
    self.shared.pause_requested.store(false, Ordering::SeqCst);
    self.shared.cv.notify_all();
    let handle = self.handle.lock().expect("预览泵锁中毒").take();
    if let Some(handle) = handle {
      let deadline = Instant::now() + timeout;
      while !handle.is_finished() {
        if Instant::now() >= deadline {
          warn!("预览泵未在限时内退出, 弃管");
          return false;
        }
        std::thread::sleep(Duration::from_millis(5));
      }
      let _ = handle.join();
    }
    info!("预览泵已停止");
    true
  }
}

fn pump_loop(
  shared: Arc<PumpShared>,
  camera: Arc<Mutex<CameraDevice>>,
  ring: Arc<FrameRing>,
  counters: Arc<Counters>,
) {
  let mut last_frame_at: Option<Instant> = None;
  let mut fps_ema: f32 = 0.0;

  while shared.run.load(Ordering::SeqCst) {
    if shared.pause_requested.load(Ordering::SeqCst) {
      // 停靠并应答，直到恢复或停止
      let mut paused = shared.paused.lock().expect("预览泵锁中毒");
      *paused = true;
      shared.cv.notify_all();
      while shared.pause_requested.load(Ordering::SeqCst) && shared.run.load(Ordering::SeqCst) {
        let (guard, _) = shared
          .cv
          .wait_timeout(paused, Duration::from_millis(50))
          .expect("预览泵锁中毒");
        paused = guard;
      }
      *paused = false;
      last_frame_at = None;
      continue;
    }

    // 摄像头互斥锁只覆盖硬件调用
    let outcome = {
      let mut device = camera.lock().expect("摄像头锁中毒");
      if !device.is_running() {
        drop(device);
        std::thread::sleep(Duration::from_millis(10));
        continue;
      }
      let deadline = device.config().frame_period() * 2;
      device.next_frame(deadline)
    };

    match outcome {
      Ok(frame) => {
        let now = Instant::now();
        if let Some(last) = last_frame_at {
          let dt = now.duration_since(last).as_secs_f32();
          if dt > 0.0 {
            let inst = 1.0 / dt;
            fps_ema = if fps_ema == 0.0 {
              inst
            } else {
              fps_ema + FPS_EMA_ALPHA * (inst - fps_ema)
            };
            counters.set_last_fps(fps_ema);
          }
        }
        last_frame_at = Some(now);
        ring.push(Arc::new(frame));
      }
      Err(CameraError::CaptureTimeout) => continue,
      Err(e) => {
        warn!("预览取帧失败: {}", e);
        std::thread::sleep(Duration::from_millis(20));
      }
    }
  }
  debug!("预览泵线程退出");
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::camera::{CameraConfig, CameraWrapper, SimCamera, TestPattern};
  use crate::frame::MonoClock;

  fn rig() -> (Arc<Mutex<CameraDevice>>, Arc<FrameRing>, Arc<Counters>) {
    let clock = Arc::new(MonoClock::new());
    let mut device = CameraDevice::with_backend(
      CameraWrapper::Sim(SimCamera::new(TestPattern::Blob)),
      clock,
    );
    let mut config = CameraConfig::preview();
    config.width = 16;
    config.height = 12;
    config.target_fps = 500.0;
    device.configure(&config).unwrap();
    device.start().unwrap();
    (
      Arc::new(Mutex::new(device)),
      Arc::new(FrameRing::new(3)),
      Arc::new(Counters::new()),
    )
  }

  #[test]
  fn pump_fills_ring_and_stops() {
    let (camera, ring, counters) = rig();
    let pump = PreviewPump::spawn(
      Arc::clone(&camera),
      Arc::clone(&ring),
      Arc::clone(&counters),
    )
    .unwrap();
    assert!(ring.wait_for_frame(2, Duration::from_secs(2)).is_some());
    assert!(pump.stop(Duration::from_secs(2)));
    assert!(counters.last_fps() > 0.0);
  }

  #[test]
  fn pause_acknowledges_and_releases_camera() {
    let (camera, ring, counters) = rig();
    let pump = PreviewPump::spawn(Arc::clone(&camera), ring, counters).unwrap();
    assert!(pump.pause(Duration::from_secs(2)));
    assert!(pump.is_paused());
    // 泵已停靠, 摄像头锁立即可得
    let guard = camera.try_lock();
    assert!(guard.is_ok());
    drop(guard);
    pump.resume();
    assert!(pump.stop(Duration::from_secs(2)));
  }

  #[test]
  fn resume_restarts_frame_flow() {
    let (camera, ring, counters) = rig();
    let pump = PreviewPump::spawn(camera, Arc::clone(&ring), counters).unwrap();
    assert!(pump.pause(Duration::from_secs(2)));
    let seen = ring.pushed();
    pump.resume();
    assert!(ring.wait_for_frame(seen, Duration::from_secs(2)).is_some());
    assert!(pump.stop(Duration::from_secs(2)));
  }
}
