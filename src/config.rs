use crate::error::{AppError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_HISTORY_BUCKETS: usize = 60;
pub const DEFAULT_HISTORY_BUCKET_DURATION: u64 = 1;
pub const DEFAULT_UNMEASURED_TITLE: &str = "Unmeasured power";
pub const DEFAULT_HOUSE_TITLE: &str = "House";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: HostConfig,
    #[serde(default)]
    pub power_sensor_label: Option<String>,
    #[serde(default)]
    pub power_switch_label: Option<String>,
    #[serde(default)]
    pub power_sensor_name_cleaner_regex: Option<String>,
    #[serde(default = "default_history_buckets")]
    pub history_buckets: usize,
    /// Seconds per history bucket
    #[serde(default = "default_history_bucket_duration")]
    pub history_bucket_duration: u64,
    #[serde(default)]
    pub house: Option<HouseConfig>,
    #[serde(default)]
    pub grid: Option<PowerDeviceConfig>,
    #[serde(default)]
    pub solar: Option<PowerDeviceConfig>,
    #[serde(default)]
    pub battery: Option<PowerDeviceConfig>,
}

fn default_history_buckets() -> usize {
    DEFAULT_HISTORY_BUCKETS
}

fn default_history_bucket_duration() -> u64 {
    DEFAULT_HISTORY_BUCKET_DURATION
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    /// JSON export of the consumption declarations and registries
    #[serde(default = "default_registry_snapshot")]
    pub registry_snapshot: PathBuf,
}

fn default_registry_snapshot() -> PathBuf {
    PathBuf::from("config/registries.json")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HouseConfig {
    /// Whole-house power sensor; without it the house root is virtual
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub unmeasured_power_title: Option<String>,
    #[serde(default)]
    pub power_sensor_label: Option<String>,
    #[serde(default)]
    pub power_switch_label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerDeviceConfig {
    pub entity_id: String,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub consumption_name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Solar,
    Grid,
    Battery,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Solar => "solar",
            SourceKind::Grid => "grid",
            SourceKind::Battery => "battery",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            SourceKind::Solar => "Solar",
            SourceKind::Grid => "Grid",
            SourceKind::Battery => "Battery",
        }
    }

    pub fn default_color(&self) -> &'static str {
        match self {
            SourceKind::Solar => "#ffc107",
            SourceKind::Grid => "#2196f3",
            SourceKind::Battery => "#4caf50",
        }
    }

    /// Solar panels only ever produce
    pub fn has_sink(&self) -> bool {
        !matches!(self, SourceKind::Solar)
    }
}

/// Fully resolved, immutable engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub power_sensor_label: Option<String>,
    pub power_switch_label: Option<String>,
    pub name_cleaner: NameCleaner,
    pub unmeasured_title: String,
    pub history_buckets: usize,
    pub bucket_duration: Duration,
    pub house: Option<HouseSpec>,
    pub sources: Vec<SourceSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HouseSpec {
    pub entity_id: Option<String>,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    pub kind: SourceKind,
    pub entity_id: String,
    pub source_name: String,
    pub consumption_name: Option<String>,
    pub color: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            power_sensor_label: None,
            power_switch_label: None,
            name_cleaner: NameCleaner::default(),
            unmeasured_title: DEFAULT_UNMEASURED_TITLE.to_string(),
            history_buckets: DEFAULT_HISTORY_BUCKETS,
            bucket_duration: Duration::from_secs(DEFAULT_HISTORY_BUCKET_DURATION),
            house: None,
            sources: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn bucket_seconds(&self) -> f64 {
        self.bucket_duration.as_secs_f64()
    }
}

/// Strips every match of the configured pattern from display names.
#[derive(Debug, Clone, Default)]
pub struct NameCleaner {
    pattern: Option<Regex>,
}

impl NameCleaner {
    /// An invalid pattern degrades to a cleaner that leaves names untouched.
    pub fn new(pattern: Option<&str>) -> Self {
        let pattern = match pattern {
            None | Some("") => None,
            Some(p) => match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "invalid power_sensor_name_cleaner_regex, names are left as-is");
                    None
                }
            },
        };
        Self { pattern }
    }

    pub fn clean(&self, name: &str) -> String {
        match &self.pattern {
            Some(re) => re.replace_all(name, "").trim().to_string(),
            None => name.to_string(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.pattern.is_some()
    }
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards, if HOST_TOKEN env is set, override `host.token`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_placeholders(&content)?;
        let mut config: Config = serde_yaml::from_str(&expanded)?;

        if let Ok(token) = std::env::var("HOST_TOKEN") {
            config.host.token = Some(token);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.host.base_url.is_empty() {
            return Err(AppError::Config("host.base_url cannot be empty".to_string()));
        }

        if self.history_buckets == 0 {
            return Err(AppError::Config(
                "history_buckets must be at least 1".to_string(),
            ));
        }

        if self.history_bucket_duration == 0 {
            return Err(AppError::Config(
                "history_bucket_duration must be at least 1 second".to_string(),
            ));
        }

        for (kind, device) in self.power_devices() {
            if device.entity_id.is_empty() {
                return Err(AppError::Config(format!(
                    "{}.entity_id cannot be empty",
                    kind.as_str()
                )));
            }
        }

        Ok(())
    }

    fn power_devices(&self) -> impl Iterator<Item = (SourceKind, &PowerDeviceConfig)> {
        [
            (SourceKind::Solar, self.solar.as_ref()),
            (SourceKind::Grid, self.grid.as_ref()),
            (SourceKind::Battery, self.battery.as_ref()),
        ]
        .into_iter()
        .filter_map(|(kind, device)| device.map(|d| (kind, d)))
    }

    /// Apply defaults and compile patterns once, before any engine call.
    pub fn resolve(&self) -> EngineConfig {
        let house_cfg = self.house.as_ref();

        let house = house_cfg.map(|h| HouseSpec {
            entity_id: h.entity_id.clone().filter(|id| !id.is_empty()),
            title: h
                .title
                .clone()
                .unwrap_or_else(|| DEFAULT_HOUSE_TITLE.to_string()),
        });

        let sources = self
            .power_devices()
            .map(|(kind, device)| SourceSpec {
                kind,
                entity_id: device.entity_id.clone(),
                source_name: device
                    .source_name
                    .clone()
                    .unwrap_or_else(|| kind.title().to_string()),
                consumption_name: device
                    .consumption_name
                    .clone()
                    .filter(|_| kind.has_sink()),
                color: device
                    .color
                    .clone()
                    .unwrap_or_else(|| kind.default_color().to_string()),
            })
            .collect();

        EngineConfig {
            power_sensor_label: house_cfg
                .and_then(|h| h.power_sensor_label.clone())
                .or_else(|| self.power_sensor_label.clone()),
            power_switch_label: house_cfg
                .and_then(|h| h.power_switch_label.clone())
                .or_else(|| self.power_switch_label.clone()),
            name_cleaner: NameCleaner::new(self.power_sensor_name_cleaner_regex.as_deref()),
            unmeasured_title: house_cfg
                .and_then(|h| h.unmeasured_power_title.clone())
                .unwrap_or_else(|| DEFAULT_UNMEASURED_TITLE.to_string()),
            history_buckets: self.history_buckets.max(1),
            bucket_duration: Duration::from_secs(self.history_bucket_duration.max(1)),
            house,
            sources,
        }
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" becomes a literal "$".
fn expand_env_placeholders(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next();
        let var = read_until(&mut it, close).ok_or_else(|| {
            AppError::Config(format!("unterminated env placeholder: missing '{}'", close))
        })?;
        let val = std::env::var(&var)
            .map_err(|_| AppError::Config(format!("missing environment variable: {}", var)))?;
        out.push_str(&val);
    }

    Ok(out)
}

/// Read characters until we hit `end`, consuming the delimiter.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn minimal() -> Config {
        serde_yaml::from_str(
            r#"
host:
  base_url: "http://localhost:8123"
"#,
        )
        .unwrap()
    }

    #[test]
    #[serial]
    fn test_expand_env_placeholders() {
        std::env::set_var("POWER_TREE_TEST_VAR", "test_value");

        let output = expand_env_placeholders("a: $(POWER_TREE_TEST_VAR) b: ${POWER_TREE_TEST_VAR}").unwrap();
        assert_eq!(output, "a: test_value b: test_value");

        std::env::remove_var("POWER_TREE_TEST_VAR");
    }

    #[test]
    fn test_expand_env_placeholders_escape_and_plain_dollar() {
        let output = expand_env_placeholders("price: $$5 regex: \" Power$\"").unwrap();
        assert_eq!(output, "price: $5 regex: \" Power$\"");
    }

    #[test]
    #[serial]
    fn test_expand_env_placeholders_missing_var() {
        std::env::remove_var("POWER_TREE_MISSING_VAR");
        assert!(expand_env_placeholders("x: $(POWER_TREE_MISSING_VAR)").is_err());
    }

    #[test]
    fn test_expand_env_placeholders_unterminated() {
        assert!(expand_env_placeholders("x: ${OOPS").is_err());
    }

    #[test]
    fn test_defaults_resolved() {
        let engine = minimal().resolve();
        assert_eq!(engine.history_buckets, 60);
        assert_eq!(engine.bucket_duration, Duration::from_secs(1));
        assert_eq!(engine.unmeasured_title, DEFAULT_UNMEASURED_TITLE);
        assert!(engine.house.is_none());
        assert!(engine.sources.is_empty());
        assert!(!engine.name_cleaner.is_active());
    }

    #[test]
    fn test_invalid_regex_is_noop() {
        let cleaner = NameCleaner::new(Some("(unclosed"));
        assert!(!cleaner.is_active());
        assert_eq!(cleaner.clean("Washer Power"), "Washer Power");
    }

    #[test]
    fn test_cleaner_removes_all_matches_and_trims() {
        let cleaner = NameCleaner::new(Some("Power|Plug"));
        assert_eq!(cleaner.clean("Plug Washer Power "), "Washer");
    }

    #[test]
    fn test_house_labels_override_top_level() {
        let mut cfg = minimal();
        cfg.power_sensor_label = Some("top".into());
        cfg.house = Some(HouseConfig {
            power_sensor_label: Some("house".into()),
            unmeasured_power_title: Some("Other".into()),
            ..Default::default()
        });
        let engine = cfg.resolve();
        assert_eq!(engine.power_sensor_label.as_deref(), Some("house"));
        assert_eq!(engine.unmeasured_title, "Other");
        assert_eq!(
            engine.house,
            Some(HouseSpec {
                entity_id: None,
                title: DEFAULT_HOUSE_TITLE.to_string()
            })
        );
    }

    #[test]
    fn test_solar_never_gets_a_sink() {
        let mut cfg = minimal();
        cfg.solar = Some(PowerDeviceConfig {
            entity_id: "sensor.pv".into(),
            source_name: None,
            consumption_name: Some("Curtailed".into()),
            color: None,
        });
        let engine = cfg.resolve();
        assert_eq!(engine.sources.len(), 1);
        assert_eq!(engine.sources[0].source_name, "Solar");
        assert_eq!(engine.sources[0].consumption_name, None);
        assert_eq!(engine.sources[0].color, "#ffc107");
    }

    #[test]
    fn test_validate_rejects_zero_buckets() {
        let mut cfg = minimal();
        cfg.history_buckets = 0;
        assert!(cfg.validate().is_err());
    }
}
