//! Target registry
//!
//! Holds the per-target configurations (start time, click interval, click
//! duration) and the ordered list of selected targets, with JSON persistence.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, NaiveTime, TimeZone};
use thiserror::Error;
use tracing::{info, warn};

/// Start-of-day the original deployment claims rewards at.
pub const DEFAULT_START_TIME: &str = "00:29:57";
pub const DEFAULT_CLICK_INTERVAL: f64 = 0.05;
pub const DEFAULT_CLICK_DURATION: f64 = 10.0;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid time format: {0}")]
    TimeFormat(String),

    #[error("invalid click interval {0}: must be a finite number >= 0")]
    Interval(f64),

    #[error("invalid click duration {0}: must be a finite number > 0")]
    Duration(f64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Parse task start-time input into a concrete future instant.
///
/// Accepted forms:
/// - `"+N"`: N seconds from now (fractional allowed)
/// - `"HH:MM:SS"`: that wall-clock time today, rolled to tomorrow if already past
/// - a bare number: N seconds from now
/// - empty input falls back to [`DEFAULT_START_TIME`]
pub fn parse_time_input(input: &str) -> Result<DateTime<Local>, RegistryError> {
    let input = input.trim();
    if input.is_empty() {
        return parse_time_input(DEFAULT_START_TIME);
    }

    if let Some(rest) = input.strip_prefix('+') {
        let seconds: f64 = rest
            .parse()
            .map_err(|_| RegistryError::TimeFormat(input.to_string()))?;
        return relative_from_now(seconds, input);
    }

    if let Ok(time) = NaiveTime::parse_from_str(input, "%H:%M:%S") {
        let now = Local::now();
        let today = now.date_naive();
        let mut target = Local
            .with_ymd_and_hms(
                today.year(),
                today.month(),
                today.day(),
                0,
                0,
                0,
            )
            .single()
            .ok_or_else(|| RegistryError::TimeFormat(input.to_string()))?
            + (time - NaiveTime::MIN);
        if target < now {
            target += chrono::Duration::days(1);
        }
        return Ok(target);
    }

    match input.parse::<f64>() {
        Ok(seconds) => relative_from_now(seconds, input),
        Err(_) => Err(RegistryError::TimeFormat(input.to_string())),
    }
}

fn relative_from_now(seconds: f64, input: &str) -> Result<DateTime<Local>, RegistryError> {
    if !seconds.is_finite() {
        return Err(RegistryError::TimeFormat(input.to_string()));
    }
    let offset = chrono::Duration::milliseconds((seconds * 1000.0) as i64);
    Ok(Local::now() + offset)
}

/// One target's schedule, validated at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetConfig {
    /// Absolute start instant, always resolved to the future at creation.
    pub start_at: DateTime<Local>,
    /// Delay between click attempts; zero means no inter-click delay.
    pub interval: Duration,
    /// Wall-clock length of the clicking window.
    pub duration: Duration,
}

impl TargetConfig {
    pub fn new(
        start_at: DateTime<Local>,
        interval_secs: f64,
        duration_secs: f64,
    ) -> Result<Self, RegistryError> {
        if !interval_secs.is_finite() || interval_secs < 0.0 {
            return Err(RegistryError::Interval(interval_secs));
        }
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return Err(RegistryError::Duration(duration_secs));
        }
        Ok(Self {
            start_at,
            interval: Duration::from_secs_f64(interval_secs),
            duration: Duration::from_secs_f64(duration_secs),
        })
    }

    fn defaults() -> Self {
        Self {
            // DEFAULT_START_TIME is a valid literal
            start_at: parse_time_input(DEFAULT_START_TIME)
                .unwrap_or_else(|_| Local::now()),
            interval: Duration::from_secs_f64(DEFAULT_CLICK_INTERVAL),
            duration: Duration::from_secs_f64(DEFAULT_CLICK_DURATION),
        }
    }
}

/// On-disk form of one target config (`task_configs.json` entry).
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StoredTarget {
    start_time: String,
    interval: f64,
    duration: f64,
}

/// The set of configured targets and the ordered selection for a run.
#[derive(Default)]
pub struct TaskRegistry {
    configs: HashMap<String, TargetConfig>,
    selected: Vec<String>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a target with default schedule. Returns false if it already exists.
    pub fn add_task(&mut self, task_id: &str) -> bool {
        if self.configs.contains_key(task_id) {
            return false;
        }
        self.configs
            .insert(task_id.to_string(), TargetConfig::defaults());
        if !self.selected.iter().any(|id| id == task_id) {
            self.selected.push(task_id.to_string());
        }
        true
    }

    pub fn remove_task(&mut self, task_id: &str) {
        self.configs.remove(task_id);
        self.selected.retain(|id| id != task_id);
    }

    /// Replace a target's schedule from user input.
    pub fn update_task(
        &mut self,
        task_id: &str,
        start_time: &str,
        interval_secs: f64,
        duration_secs: f64,
    ) -> Result<(), RegistryError> {
        let start_at = parse_time_input(start_time)?;
        let config = TargetConfig::new(start_at, interval_secs, duration_secs)?;
        self.configs.insert(task_id.to_string(), config);
        if !self.selected.iter().any(|id| id == task_id) {
            self.selected.push(task_id.to_string());
        }
        Ok(())
    }

    /// Reset every configured target back to the default schedule.
    pub fn apply_defaults(&mut self) {
        for config in self.configs.values_mut() {
            *config = TargetConfig::defaults();
        }
    }

    pub fn clear(&mut self) {
        self.configs.clear();
        self.selected.clear();
    }

    pub fn get(&self, task_id: &str) -> Option<&TargetConfig> {
        self.configs.get(task_id)
    }

    /// Selected targets in insertion order.
    pub fn selected(&self) -> &[String] {
        &self.selected
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Load `task_configs.json`. Entries with an unparseable start time fall
    /// back to the default start time rather than being dropped.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path)?;
        let stored: HashMap<String, StoredTarget> = serde_json::from_str(&content)?;

        let mut registry = Self::new();
        let mut ids: Vec<&String> = stored.keys().collect();
        ids.sort();

        for task_id in ids {
            let entry = &stored[task_id];
            let start_at = match DateTime::parse_from_rfc3339(&entry.start_time) {
                Ok(t) => t.with_timezone(&Local),
                Err(_) => {
                    warn!(
                        "Task {} has unparseable start time {:?}, using default",
                        task_id, entry.start_time
                    );
                    parse_time_input(DEFAULT_START_TIME)?
                }
            };
            match TargetConfig::new(start_at, entry.interval, entry.duration) {
                Ok(config) => {
                    registry.configs.insert(task_id.clone(), config);
                    registry.selected.push(task_id.clone());
                }
                Err(e) => warn!("Skipping task {}: {}", task_id, e),
            }
        }

        info!("Loaded {} task configs from {:?}", registry.len(), path);
        Ok(registry)
    }

    pub fn save(&self, path: &Path) -> Result<(), RegistryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stored: HashMap<&String, StoredTarget> = self
            .configs
            .iter()
            .map(|(id, config)| {
                (
                    id,
                    StoredTarget {
                        start_time: config.start_at.to_rfc3339(),
                        interval: config.interval.as_secs_f64(),
                        duration: config.duration.as_secs_f64(),
                    },
                )
            })
            .collect();
        std::fs::write(path, serde_json::to_string_pretty(&stored)?)?;
        info!("Saved {} task configs to {:?}", stored.len(), path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_plus_ten_is_ten_seconds_out() {
        let before = Local::now();
        let parsed = parse_time_input("+10").unwrap();
        let offset = (parsed - before).num_milliseconds();
        assert!((9_000..=11_000).contains(&offset), "offset was {}ms", offset);
    }

    #[test]
    fn bare_number_is_relative_seconds() {
        let before = Local::now();
        let parsed = parse_time_input("5").unwrap();
        let offset = (parsed - before).num_milliseconds();
        assert!((4_000..=6_000).contains(&offset));
    }

    #[test]
    fn past_wall_clock_time_rolls_to_tomorrow() {
        // A time-of-day one minute in the past must resolve to tomorrow.
        let past = Local::now() - chrono::Duration::minutes(1);
        let input = past.format("%H:%M:%S").to_string();
        let parsed = parse_time_input(&input).unwrap();
        assert!(parsed > Local::now());
        assert!(parsed - Local::now() > chrono::Duration::hours(23));
    }

    #[test]
    fn garbage_input_is_a_format_error() {
        assert!(matches!(
            parse_time_input("not-a-time"),
            Err(RegistryError::TimeFormat(_))
        ));
        assert!(matches!(
            parse_time_input("+abc"),
            Err(RegistryError::TimeFormat(_))
        ));
    }

    #[test]
    fn empty_input_uses_the_default_start_time() {
        let parsed = parse_time_input("  ").unwrap();
        assert!(parsed > Local::now());
    }

    #[test]
    fn target_config_rejects_bad_values() {
        let at = Local::now();
        assert!(matches!(
            TargetConfig::new(at, -0.1, 1.0),
            Err(RegistryError::Interval(_))
        ));
        assert!(matches!(
            TargetConfig::new(at, 0.0, 0.0),
            Err(RegistryError::Duration(_))
        ));
        assert!(matches!(
            TargetConfig::new(at, f64::NAN, 1.0),
            Err(RegistryError::Interval(_))
        ));
        // zero interval is allowed: no inter-click delay
        assert!(TargetConfig::new(at, 0.0, 1.5).is_ok());
    }

    #[test]
    fn add_update_remove_keeps_selection_ordered() {
        let mut registry = TaskRegistry::new();
        assert!(registry.add_task("t2"));
        assert!(registry.add_task("t1"));
        assert!(!registry.add_task("t2"));
        assert_eq!(registry.selected(), &["t2".to_string(), "t1".to_string()]);

        registry.update_task("t1", "+30", 0.5, 2.0).unwrap();
        let config = registry.get("t1").unwrap();
        assert_eq!(config.interval, Duration::from_millis(500));
        assert_eq!(config.duration, Duration::from_secs(2));

        registry.remove_task("t2");
        assert_eq!(registry.selected(), &["t1".to_string()]);
        assert!(registry.get("t2").is_none());
    }

    #[test]
    fn update_rejects_bad_time_without_mutating() {
        let mut registry = TaskRegistry::new();
        registry.add_task("t1");
        let before = registry.get("t1").unwrap().clone();
        assert!(registry.update_task("t1", "nope", 0.1, 1.0).is_err());
        assert_eq!(registry.get("t1").unwrap(), &before);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("reward-clicker-test-{}", std::process::id()));
        let path = dir.join("task_configs.json");

        let mut registry = TaskRegistry::new();
        registry.add_task("t1");
        registry.update_task("t1", "+60", 0.25, 3.0).unwrap();
        registry.save(&path).unwrap();

        let loaded = TaskRegistry::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        let config = loaded.get("t1").unwrap();
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.duration, Duration::from_secs(3));
        assert_eq!(loaded.selected(), &["t1".to_string()]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
