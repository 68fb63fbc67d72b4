//! Typed configuration.
//!
//! The on-disk format is an INI file (`captn.cfg`) whose sections map onto
//! the structs below; rules and container-specific env rules are JSON values
//! inside that file. Every field has a default, so an absent file yields a
//! fully usable (dry-run) configuration. Validation collects every problem
//! before failing so a broken file is reported in one pass.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use ::config::{File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::errors::ConfigError;
use crate::rules::RuleSet;

const VALID_LOG_LEVELS: [&str; 5] = ["debug", "info", "warning", "error", "critical"];

/// Parse a duration of the form `<number><unit>` with unit one of
/// `s`, `m`, `h`, `d`.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^(\d+)([smhd])$").unwrap());
    let caps = re
        .captures(text.trim())
        .ok_or_else(|| format!("invalid duration '{text}' (expected e.g. '30s', '2m', '1h')"))?;
    let value: u64 = caps[1]
        .parse()
        .map_err(|_| format!("duration value out of range in '{text}'"))?;
    let seconds = match &caps[2] {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        _ => unreachable!(),
    };
    Ok(Duration::from_secs(seconds))
}

/// Serde adapter for duration-string fields.
pub(crate) mod duration_str {
    use super::*;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

fn comma_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let text = String::deserialize(deserializer)?;
    Ok(text
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub general: GeneralConfig,
    pub logging: LoggingConfig,
    pub update: UpdateConfig,
    pub update_verification: VerificationConfig,
    pub prune: PruneConfig,
    pub pre_scripts: PreScriptsConfig,
    pub post_scripts: PostScriptsConfig,
    pub docker: RegistryEndpoint,
    pub ghcr: RegistryEndpoint,
    pub registry_auth: RegistryAuthConfig,
    pub env_filtering: EnvFilterSettings,
    pub self_update: SelfUpdateConfig,
    /// Container name -> rule name, exact case-sensitive match.
    pub assignments_by_name: BTreeMap<String, String>,
    /// Image-repository glob -> rule name.
    pub assignments_by_image: BTreeMap<String, String>,
    /// Rule name -> rule JSON, merged over the built-in rules.
    pub rules: BTreeMap<String, String>,
    /// Directory holding the configuration, exported to hook scripts.
    #[serde(skip)]
    pub config_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            general: GeneralConfig::default(),
            logging: LoggingConfig::default(),
            update: UpdateConfig::default(),
            update_verification: VerificationConfig::default(),
            prune: PruneConfig::default(),
            pre_scripts: PreScriptsConfig::default(),
            post_scripts: PostScriptsConfig::default(),
            docker: RegistryEndpoint::docker_hub(),
            ghcr: RegistryEndpoint::ghcr(),
            registry_auth: RegistryAuthConfig::default(),
            env_filtering: EnvFilterSettings::default(),
            self_update: SelfUpdateConfig::default(),
            assignments_by_name: BTreeMap::new(),
            assignments_by_image: BTreeMap::new(),
            rules: BTreeMap::new(),
            config_dir: PathBuf::from("/app/conf"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GeneralConfig {
    pub dry_run: bool,
    pub cron_schedule: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            dry_run: true,
            cron_schedule: "0 4 * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    pub level: String,
    pub directory: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            directory: PathBuf::from("/app/logs"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdateConfig {
    #[serde(with = "duration_str")]
    pub delay_between_updates: Duration,
    /// Hard ceiling on a whole run; the step in flight still completes.
    #[serde(with = "duration_str")]
    pub max_run_time: Duration,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        UpdateConfig {
            delay_between_updates: Duration::from_secs(120),
            max_run_time: Duration::from_secs(10 * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VerificationConfig {
    #[serde(with = "duration_str")]
    pub max_wait: Duration,
    #[serde(with = "duration_str")]
    pub stable_time: Duration,
    #[serde(with = "duration_str")]
    pub check_interval: Duration,
    #[serde(with = "duration_str")]
    pub grace_period: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        VerificationConfig {
            max_wait: Duration::from_secs(480),
            stable_time: Duration::from_secs(15),
            check_interval: Duration::from_secs(5),
            grace_period: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PruneConfig {
    pub remove_unused_images: bool,
    pub remove_old_containers: bool,
    #[serde(with = "duration_str")]
    pub min_backup_age: Duration,
    pub min_backups_to_keep: usize,
}

impl Default for PruneConfig {
    fn default() -> Self {
        PruneConfig {
            remove_unused_images: true,
            remove_old_containers: true,
            min_backup_age: Duration::from_secs(48 * 3600),
            min_backups_to_keep: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PreScriptsConfig {
    pub enabled: bool,
    pub scripts_directory: PathBuf,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    pub continue_on_failure: bool,
}

impl Default for PreScriptsConfig {
    fn default() -> Self {
        PreScriptsConfig {
            enabled: false,
            scripts_directory: PathBuf::from("/app/conf/scripts"),
            timeout: Duration::from_secs(300),
            continue_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PostScriptsConfig {
    pub enabled: bool,
    pub scripts_directory: PathBuf,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    pub rollback_on_failure: bool,
}

impl Default for PostScriptsConfig {
    fn default() -> Self {
        PostScriptsConfig {
            enabled: false,
            scripts_directory: PathBuf::from("/app/conf/scripts"),
            timeout: Duration::from_secs(300),
            rollback_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryEndpoint {
    pub api_url: String,
    pub page_crawl_limit: u32,
    pub page_size: u32,
}

impl RegistryEndpoint {
    fn docker_hub() -> Self {
        RegistryEndpoint {
            api_url: "https://registry.hub.docker.com/v2".to_string(),
            page_crawl_limit: 1000,
            page_size: 100,
        }
    }

    fn ghcr() -> Self {
        RegistryEndpoint {
            api_url: "https://ghcr.io/v2".to_string(),
            page_crawl_limit: 1000,
            page_size: 100,
        }
    }
}

impl Default for RegistryEndpoint {
    fn default() -> Self {
        RegistryEndpoint::docker_hub()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryAuthConfig {
    pub enabled: bool,
    pub credentials_file: PathBuf,
}

impl Default for RegistryAuthConfig {
    fn default() -> Self {
        RegistryAuthConfig {
            enabled: false,
            credentials_file: PathBuf::from("/app/conf/credentials.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct EnvFilterSettings {
    pub enabled: bool,
    #[serde(deserialize_with = "comma_list")]
    pub exclude_patterns: Vec<String>,
    #[serde(deserialize_with = "comma_list")]
    pub preserve_patterns: Vec<String>,
    /// JSON object: container-name substring -> {"exclude": [...], "preserve": [...]}.
    pub container_specific_rules: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SelfUpdateConfig {
    pub remove_helper_container: bool,
}

impl Default for SelfUpdateConfig {
    fn default() -> Self {
        SelfUpdateConfig {
            remove_helper_container: true,
        }
    }
}

impl Config {
    /// Load from an INI file, falling back to defaults when the file does
    /// not exist, then validate.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let built = ::config::Config::builder()
            .add_source(
                File::with_name(&path.to_string_lossy())
                    .format(FileFormat::Ini)
                    .required(false),
            )
            .build()
            .map_err(|e| ConfigError::Read(e.to_string()))?;

        let mut cfg: Config = built
            .try_deserialize()
            .map_err(|e| ConfigError::Read(e.to_string()))?;
        cfg.config_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural validation. Collects every problem before failing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();

        if !VALID_LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            issues.push(format!(
                "logging.level must be one of: {}",
                VALID_LOG_LEVELS.join(", ")
            ));
        }

        for (section, endpoint) in [("docker", &self.docker), ("ghcr", &self.ghcr)] {
            if !endpoint.api_url.starts_with("http://") && !endpoint.api_url.starts_with("https://")
            {
                issues.push(format!("{section}.apiUrl must be a valid URL"));
            }
            if !(1..=1000).contains(&endpoint.page_crawl_limit) {
                issues.push(format!("{section}.pageCrawlLimit must be in 1..=1000"));
            }
            if !(1..=100).contains(&endpoint.page_size) {
                issues.push(format!("{section}.pageSize must be in 1..=100"));
            }
        }

        for (name, source) in &self.rules {
            if let Err(reason) = RuleSet::parse_rule(source) {
                issues.push(format!("rules.{name}: {reason}"));
            }
        }

        if let Err(reason) = self.env_filtering.container_rules() {
            issues.push(format!("envFiltering.containerSpecificRules: {reason}"));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(issues))
        }
    }

    /// Built-in rules overlaid with the rules from the file.
    pub fn rule_set(&self) -> Result<RuleSet, ConfigError> {
        RuleSet::with_overrides(&self.rules)
    }
}

impl EnvFilterSettings {
    /// Parse the container-specific rules JSON.
    pub fn container_rules(&self) -> Result<BTreeMap<String, ContainerEnvRules>, String> {
        if self.container_specific_rules.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&self.container_specific_rules).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerEnvRules {
    pub exclude: Vec<String>,
    pub preserve: Vec<String>,
}
