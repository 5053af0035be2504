// src/config.rs
//! Process configuration from environment variables (a `.env` file is loaded first
//! when present). Every variable is optional; malformed values are an error that
//! names the variable.

use std::time::Duration;

use thiserror::Error;

use crate::ingest::types::SourceJob;

pub const ENV_HN_URL: &str = "HN_URL";
pub const ENV_PAGES: &str = "NUMBER_OF_PAGES_TO_SCRAPE";
pub const ENV_FRONT_PAGE_INTERVAL: &str = "FRONT_PAGE_INTERVAL";
pub const ENV_NEW_STORIES_INTERVAL: &str = "NEW_STORIES_INTERVAL";
pub const ENV_PORT: &str = "PORT";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

const DEFAULT_HN_URL: &str = "https://news.ycombinator.com";
const DEFAULT_PAGES: u32 = 3;
const DEFAULT_INTERVAL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DATABASE_URL: &str = "sqlite://data/stories.db";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?} as {expected}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("{var}: must be greater than zero")]
    Zero { var: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub base_url: String,
    pub pages_per_run: u32,
    pub front_page_interval: Duration,
    pub new_stories_interval: Duration,
    pub port: u16,
    pub database_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_HN_URL.to_string(),
            pages_per_run: DEFAULT_PAGES,
            front_page_interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            new_stories_interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            port: DEFAULT_PORT,
            database_url: DEFAULT_DATABASE_URL.to_string(),
        }
    }
}

impl AppConfig {
    /// Read from the process environment, after loading `.env` if there is one.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let d = Self::default();

        let pages_per_run = match get(ENV_PAGES) {
            Some(v) => positive(ENV_PAGES, parse::<u32>(ENV_PAGES, &v, "a page count")?)?,
            None => d.pages_per_run,
        };
        let front_page_interval = match get(ENV_FRONT_PAGE_INTERVAL) {
            Some(v) => interval_ms(ENV_FRONT_PAGE_INTERVAL, &v)?,
            None => d.front_page_interval,
        };
        let new_stories_interval = match get(ENV_NEW_STORIES_INTERVAL) {
            Some(v) => interval_ms(ENV_NEW_STORIES_INTERVAL, &v)?,
            None => d.new_stories_interval,
        };
        let port = match get(ENV_PORT) {
            Some(v) => parse::<u16>(ENV_PORT, &v, "a TCP port")?,
            None => d.port,
        };

        Ok(Self {
            base_url: get(ENV_HN_URL)
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(d.base_url),
            pages_per_run,
            front_page_interval,
            new_stories_interval,
            port,
            database_url: get(ENV_DATABASE_URL).unwrap_or(d.database_url),
        })
    }

    /// The two listing sources, each with its own interval.
    pub fn sources(&self) -> Vec<SourceJob> {
        vec![
            SourceJob::new(
                "Front Page",
                format!("{}/front", self.base_url),
                self.pages_per_run,
                self.front_page_interval,
            ),
            SourceJob::new(
                "New Stories",
                format!("{}/newest", self.base_url),
                self.pages_per_run,
                self.new_stories_interval,
            ),
        ]
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: &str, expected: &'static str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
        expected,
    })
}

fn positive<T: PartialEq + Default>(var: &'static str, v: T) -> Result<T, ConfigError> {
    if v == T::default() {
        Err(ConfigError::Zero { var })
    } else {
        Ok(v)
    }
}

fn interval_ms(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let ms = positive(var, parse::<u64>(var, value, "milliseconds")?)?;
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.pages_per_run, 3);
        assert_eq!(cfg.front_page_interval, Duration::from_secs(300));
        assert_eq!(cfg.port, 3000);
    }

    #[test]
    fn sources_derive_from_base_url() {
        let cfg = AppConfig::from_lookup(lookup(&[
            (ENV_HN_URL, "http://localhost:9999/"),
            (ENV_PAGES, "2"),
            (ENV_NEW_STORIES_INTERVAL, "60000"),
        ]))
        .unwrap();
        let sources = cfg.sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].name, "Front Page");
        assert_eq!(sources[0].endpoint, "http://localhost:9999/front");
        assert_eq!(sources[0].pages, 2);
        assert_eq!(sources[1].name, "New Stories");
        assert_eq!(sources[1].endpoint, "http://localhost:9999/newest");
        assert_eq!(sources[1].interval, Duration::from_secs(60));
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = AppConfig::from_lookup(lookup(&[(ENV_PORT, "eighty")])).unwrap_err();
        assert!(err.to_string().starts_with("PORT"));

        let err = AppConfig::from_lookup(lookup(&[(ENV_PAGES, "0")])).unwrap_err();
        assert_eq!(err, ConfigError::Zero { var: ENV_PAGES });

        let err = AppConfig::from_lookup(lookup(&[(ENV_FRONT_PAGE_INTERVAL, "-5")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: ENV_FRONT_PAGE_INTERVAL, .. }));
    }
}
