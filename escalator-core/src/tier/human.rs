use std::time::Duration;

use chromiumoxide::layout::Point;
use chromiumoxide::page::Page;
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::sleep;

use crate::config::HumanSimulationSection;

use super::error::{BackendResult, TierError};
use super::launcher::ViewportSpec;

#[derive(Debug, Clone)]
pub struct HumanMotionPlan {
    pub events: Vec<MotionEvent>,
}

impl HumanMotionPlan {
    pub fn total_delay(&self) -> Duration {
        self.events
            .iter()
            .map(|event| match event {
                MotionEvent::Move { delay, .. } => *delay,
                MotionEvent::Pause(duration) => *duration,
                MotionEvent::Scroll { .. } => Duration::ZERO,
            })
            .sum()
    }
}

#[derive(Debug, Clone)]
pub enum MotionEvent {
    Move { point: Point, delay: Duration },
    Pause(Duration),
    Scroll { delta_y: f64 },
}

/// Mouse travel and scroll bursts that make a full-browser visit look read.
#[derive(Debug)]
pub struct HumanMotionController {
    config: HumanSimulationSection,
    last_point: Option<Point>,
    rng: StdRng,
}

impl HumanMotionController {
    pub fn new(config: HumanSimulationSection) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_rng(config: HumanSimulationSection, rng: StdRng) -> Self {
        Self {
            config,
            last_point: None,
            rng,
        }
    }

    /// Wanders over the viewport, scrolling a few bursts with pauses in between.
    pub async fn browse(&mut self, page: &Page, viewport: &ViewportSpec) -> BackendResult<()> {
        for _ in 0..self.config.scroll_bursts {
            let target = Point::new(
                self.rng.gen_range(0.15..0.85) * viewport.width as f64,
                self.rng.gen_range(0.2..0.8) * viewport.height as f64,
            );
            self.move_to(page, target).await?;
            let delta = self.random_between(self.config.scroll_burst_px) as f64;
            self.scroll_by(page, delta).await?;
        }
        self.idle().await;
        Ok(())
    }

    pub async fn move_to(&mut self, page: &Page, target: Point) -> BackendResult<()> {
        let plan = self.plan_motion(target);
        self.execute_motion(page, &plan).await?;
        self.last_point = Some(target);
        Ok(())
    }

    pub async fn scroll_by(&mut self, page: &Page, delta: f64) -> BackendResult<()> {
        let pause = self.random_duration(self.config.scroll_pause_ms);
        let plan = HumanMotionPlan {
            events: vec![MotionEvent::Scroll { delta_y: delta }, MotionEvent::Pause(pause)],
        };
        self.execute_motion(page, &plan).await
    }

    pub async fn idle(&mut self) {
        let delay = self.random_duration(self.config.idle_duration_ms);
        sleep(delay).await;
    }

    pub fn plan_motion(&mut self, target: Point) -> HumanMotionPlan {
        let start = self.last_point.unwrap_or_else(|| Point::new(0.0, 0.0));
        let distance = ((target.x - start.x).powi(2) + (target.y - start.y).powi(2)).sqrt();
        let min_speed = self.config.mouse_speed_min_px_s.max(1);
        let max_speed = self.config.mouse_speed_max_px_s.max(min_speed);
        let speed = self.rng.gen_range(min_speed..=max_speed) as f64;
        let duration_secs = (distance / speed).max(0.08);
        let steps = (duration_secs * 60.0).clamp(12.0, 48.0) as usize;
        let jitter = self.config.mouse_jitter_px as f64;
        let mut events = Vec::with_capacity(steps + 1);
        for idx in 1..steps {
            let eased = ease_in_out_cubic(idx as f64 / steps as f64);
            let intermediate = Point::new(
                start.x + (target.x - start.x) * eased + self.random_offset(jitter),
                start.y + (target.y - start.y) * eased + self.random_offset(jitter),
            );
            events.push(MotionEvent::Move {
                point: intermediate,
                delay: Duration::from_secs_f64(duration_secs / steps as f64),
            });
        }
        events.push(MotionEvent::Move {
            point: target,
            delay: Duration::from_secs_f64(duration_secs / steps as f64),
        });
        HumanMotionPlan { events }
    }

    async fn execute_motion(&mut self, page: &Page, plan: &HumanMotionPlan) -> BackendResult<()> {
        for event in &plan.events {
            match event {
                MotionEvent::Move { point, delay } => {
                    page.move_mouse(*point).await.map_err(|err| {
                        TierError::Unexpected(format!("failed to move mouse: {err}"))
                    })?;
                    sleep(*delay).await;
                }
                MotionEvent::Pause(duration) => sleep(*duration).await,
                MotionEvent::Scroll { delta_y } => {
                    let js = format!("window.scrollBy({{ top: {delta_y}, behavior: 'smooth' }});");
                    page.evaluate(js.as_str()).await.map_err(|err| {
                        TierError::Unexpected(format!("failed to execute scroll script: {err}"))
                    })?;
                }
            }
        }
        Ok(())
    }

    fn random_between(&mut self, bounds: [u32; 2]) -> u32 {
        let (low, high) = (bounds[0].min(bounds[1]), bounds[0].max(bounds[1]));
        self.rng.gen_range(low..=high)
    }

    fn random_duration(&mut self, bounds: [u32; 2]) -> Duration {
        Duration::from_millis(self.random_between(bounds) as u64)
    }

    fn random_offset(&mut self, max: f64) -> f64 {
        if max <= 0.0 {
            return 0.0;
        }
        let distribution = Uniform::new_inclusive(-max, max);
        self.rng.sample(distribution)
    }
}

fn ease_in_out_cubic(t: f64) -> f64 {
    if t < 0.5 {
        4.0 * t * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
    }
}
