use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serializer};

/// Reads a duration in milliseconds from an environment variable.
pub fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Serde helpers for humantime durations (`"90s"`, `"5m"`).
pub mod humantime_serde {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        humantime::parse_duration(&value).map_err(serde::de::Error::custom)
    }
}

pub fn epoch_seconds(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(not(test))]
pub fn now_monotonic() -> std::time::Instant {
    std::time::Instant::now()
}

#[cfg(not(test))]
pub fn now_system() -> SystemTime {
    SystemTime::now()
}

#[cfg(test)]
pub use mock_time::{now_monotonic, now_system};

/// Awaits a transport call for at most `timeout`.
pub async fn bounded<T>(
    future: classad::TransportFuture<T>,
    timeout: Duration,
) -> Result<T, classad::TransportError> {
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(classad::TransportError::Timeout(
            humantime::format_duration(timeout).to_string(),
        )),
    }
}

/// Seconds since the Unix epoch according to [`now_system`].
pub fn now_epoch() -> i64 {
    epoch_seconds(now_system())
}

/// Testing utilities for mocking timestamps.
/// Use `now_monotonic`/`now_system` if you want to be able to mock the time in tests.
#[cfg(test)]
pub mod mock_time {
    use std::cell::RefCell;
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    thread_local! {
        static MOCK_TIME: RefCell<Option<Instant>> = const { RefCell::new(None) };
        static MOCK_EPOCH: RefCell<Option<SystemTime>> = const { RefCell::new(None) };
    }

    pub struct MockTime;

    impl MockTime {
        pub fn mock(time: Instant) -> Self {
            MOCK_TIME.with(|cell| {
                assert!(cell.borrow().is_none());
                *cell.borrow_mut() = Some(time);
            });
            MockTime
        }

        /// Fixes the wall clock at `seconds` after the epoch.
        pub fn mock_epoch(seconds: u64) -> Self {
            MOCK_EPOCH.with(|cell| {
                assert!(cell.borrow().is_none());
                *cell.borrow_mut() = Some(UNIX_EPOCH + Duration::from_secs(seconds));
            });
            MockTime
        }
    }

    impl Drop for MockTime {
        fn drop(&mut self) {
            MOCK_TIME.with(|cell| *cell.borrow_mut() = None);
            MOCK_EPOCH.with(|cell| *cell.borrow_mut() = None);
        }
    }

    pub fn now_monotonic() -> Instant {
        MOCK_TIME.with(|cell| cell.borrow().as_ref().cloned().unwrap_or_else(Instant::now))
    }

    pub fn now_system() -> SystemTime {
        MOCK_EPOCH.with(|cell| cell.borrow().unwrap_or_else(SystemTime::now))
    }
}
