use anyhow::Result;
use rand::{thread_rng, Rng};
use std::time::Duration;
use thirtyfour::prelude::*;
use tokio::time::sleep;
use tracing::debug;

use crate::cli::config::BrowserBehavior;

/// Random duration in `[min, max]` milliseconds. A reversed range is
/// normalized and an empty one yields `min`.
pub fn random_delay((min, max): (u64, u64)) -> Duration {
    let (low, high) = if min <= max { (min, max) } else { (max, min) };
    if low == high {
        return Duration::from_millis(low);
    }
    Duration::from_millis(thread_rng().gen_range(low..=high))
}

/// Human-like pacing for page interactions
#[derive(Debug, Clone)]
pub struct BehaviorSimulator {
    config: BrowserBehavior,
}

impl BehaviorSimulator {
    pub fn new(config: BrowserBehavior) -> Self {
        Self { config }
    }

    /// Click with a short reaction-time delay
    pub async fn click(&self, element: &WebElement) -> Result<()> {
        sleep(random_delay(self.config.click_delay)).await;

        element.scroll_into_view().await?;
        element.click().await?;

        debug!("Clicked element");

        Ok(())
    }

    /// Type text one character at a time at a variable speed
    pub async fn type_text(&self, element: &WebElement, text: &str) -> Result<()> {
        element.clear().await?;

        for c in text.chars() {
            element.send_keys(c.to_string()).await?;
            sleep(random_delay(self.config.typing_speed)).await;
        }

        debug!("Typed {} characters", text.chars().count());

        Ok(())
    }

    /// Let the page settle after a navigation click
    pub async fn settle(&self) {
        sleep(Duration::from_millis(self.config.action_pause_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_bounds() {
        for _ in 0..200 {
            let d = random_delay((2000, 5000));
            assert!(d >= Duration::from_millis(2000) && d <= Duration::from_millis(5000));
        }
    }

    #[test]
    fn degenerate_ranges() {
        assert_eq!(random_delay((300, 300)), Duration::from_millis(300));
        assert_eq!(random_delay((0, 0)), Duration::ZERO);

        let d = random_delay((500, 100));
        assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(500));
    }
}
