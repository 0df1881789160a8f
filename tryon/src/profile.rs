use std::time::{Duration, Instant};

use anyhow::Result;
use candle_core::Device;

/// Accumulated wall-clock time of one pipeline stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct Profile {
    total: Duration,
}

impl Profile {
    /// Runs `f` and adds its duration. The device is synchronized on both
    /// sides so queued kernels are charged to the stage that launched them.
    pub fn time<T>(&mut self, device: &Device, f: impl FnOnce() -> Result<T>) -> Result<T> {
        device.synchronize()?;
        let start = Instant::now();
        let out = f()?;
        device.synchronize()?;
        self.total += start.elapsed();
        Ok(out)
    }

    pub fn add(&mut self, elapsed: Duration) {
        self.total += elapsed;
    }

    pub fn total(&self) -> Duration {
        self.total
    }
}

#[derive(Debug, Default, Clone)]
pub struct Stages {
    pub preprocess: Profile,
    pub warp: Profile,
    pub generate: Profile,
    seen: usize,
}

impl Stages {
    pub fn record(&mut self, samples: usize) {
        self.seen += samples;
    }

    pub fn seen(&self) -> usize {
        self.seen
    }

    /// Per-image latency, or `None` before any sample was processed.
    pub fn speed(&self) -> Option<Speed> {
        if self.seen == 0 {
            return None;
        }
        let per_image = |profile: &Profile| profile.total().as_secs_f64() * 1e3 / self.seen as f64;
        let preprocess = per_image(&self.preprocess);
        let warp = per_image(&self.warp);
        let generate = per_image(&self.generate);
        Some(Speed {
            all: preprocess + warp + generate,
            preprocess,
            warp,
            generate,
        })
    }
}

/// Milliseconds per image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Speed {
    pub all: f64,
    pub preprocess: f64,
    pub warp: f64,
    pub generate: f64,
}

impl Speed {
    pub fn summary(&self, shape: &[usize]) -> String {
        format!(
            "Speed: {:.1}ms all, {:.1}ms pre-process, {:.1}ms warp, {:.1}ms gen per image at shape {shape:?}",
            self.all, self.preprocess, self.warp, self.generate
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_seen_has_no_speed() {
        let mut stages = Stages::default();
        stages.warp.add(Duration::from_millis(40));
        assert_eq!(stages.speed(), None);
    }

    #[test]
    fn speed_is_per_image_and_sums_stages() {
        let mut stages = Stages::default();
        stages.preprocess.add(Duration::from_millis(4));
        stages.warp.add(Duration::from_millis(40));
        stages.generate.add(Duration::from_millis(60));
        stages.record(3);
        stages.record(1);

        let speed = stages.speed().unwrap();
        assert!((speed.preprocess - 1.).abs() < 1e-9);
        assert!((speed.warp - 10.).abs() < 1e-9);
        assert!((speed.generate - 15.).abs() < 1e-9);
        assert!((speed.all - 26.).abs() < 1e-9);
        assert_eq!(
            speed.summary(&[4, 3, 256, 192]),
            "Speed: 26.0ms all, 1.0ms pre-process, 10.0ms warp, 15.0ms gen per image at shape [4, 3, 256, 192]"
        );
    }

    #[test]
    fn timed_closure_accumulates() -> Result<()> {
        let mut profile = Profile::default();
        let value = profile.time(&Device::Cpu, || {
            std::thread::sleep(Duration::from_millis(2));
            Ok(7)
        })?;
        assert_eq!(value, 7);
        assert!(profile.total() >= Duration::from_millis(2));
        Ok(())
    }
}
