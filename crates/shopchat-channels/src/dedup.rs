use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Remembers platform message ids for a window so redelivered webhooks are processed once.
pub struct RecentMessageIds {
    window: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl RecentMessageIds {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Records `id` and returns `true` if it was not seen within the window.
    pub fn first_sighting(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(at) = seen.get(id) {
            if now.duration_since(*at) < self.window {
                return false;
            }
        }
        seen.insert(id.to_string(), now);
        true
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = seen.len();
        seen.retain(|_, at| now.duration_since(*at) < self.window);
        before - seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_within_window_is_rejected() {
        let ids = RecentMessageIds::new(Duration::from_secs(300));
        assert!(ids.first_sighting("mid.1"));
        assert!(!ids.first_sighting("mid.1"));
        assert!(ids.first_sighting("mid.2"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(ids.purge_expired(), 2);
        assert!(ids.first_sighting("mid.1"));
    }
}
