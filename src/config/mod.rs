use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{
    DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_NAMESPACE_FLAG, ExitCodePolicy, MAX_TIMEOUT, ScanRequest,
};
use crate::parser::ParserConfig;

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    pub ui: UiConfig,
    pub scan: ScanConfig,
    pub parser: ParserConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct UiConfig {
    pub color: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanConfig {
    pub timeout_secs: u64,
    pub namespace_flag: String,
    pub exit_policy: ExitCodePolicy,
    pub max_output_bytes: usize,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            ui: UiConfig { color: true },
            scan: ScanConfig {
                timeout_secs: 90,
                namespace_flag: DEFAULT_NAMESPACE_FLAG.to_string(),
                exit_policy: ExitCodePolicy::Parse,
                max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            },
            parser: ParserConfig::default(),
        }
    }
}

impl EffectiveConfig {
    /// Request pre-filled with the configured scan defaults.
    pub fn scan_request(&self, namespace: &str, tool: &str) -> ScanRequest {
        ScanRequest::new(namespace, tool, Duration::from_secs(self.scan.timeout_secs))
            .namespace_flag(self.scan.namespace_flag.clone())
            .exit_policy(self.scan.exit_policy)
            .max_output_bytes(self.scan.max_output_bytes)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    ui: Option<RawUiConfig>,
    scan: Option<RawScanConfig>,
    parser: Option<RawParserConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawUiConfig {
    color: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScanConfig {
    timeout_secs: Option<u64>,
    namespace_flag: Option<String>,
    exit_policy: Option<ExitCodePolicy>,
    max_output_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawParserConfig {
    category_key: Option<String>,
    severity_key: Option<String>,
    severities: Option<Vec<String>>,
}

pub fn default_config_path(home_dir: &Path) -> PathBuf {
    home_dir.join(".config/scanharness/config.toml")
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

pub fn load(config_path: Option<&Path>, home_dir: Option<&Path>) -> Result<EffectiveConfig> {
    let mut cfg = EffectiveConfig::default();

    let path = config_path
        .map(ToOwned::to_owned)
        .or_else(|| home_dir.map(default_config_path));

    if let Some(path) = path {
        if path.exists() {
            let s = std::fs::read_to_string(&path).with_context(|| {
                format!("設定ファイルの読み取りに失敗しました: {}", path.display())
            })?;
            let raw: RawConfig =
                toml::from_str(&s).context("設定ファイル(TOML)の解析に失敗しました")?;
            apply_raw_config(&mut cfg, raw);
            cfg.config_path = Some(path.display().to_string());
        } else if config_path.is_some() {
            anyhow::bail!("設定ファイルが見つかりません: {}", path.display());
        }
    }

    apply_env_overrides(&mut cfg)?;
    validate(&cfg)?;

    Ok(cfg)
}

fn apply_raw_config(cfg: &mut EffectiveConfig, raw: RawConfig) {
    if let Some(ui) = raw.ui {
        if let Some(color) = ui.color {
            cfg.ui.color = color;
        }
    }

    if let Some(scan) = raw.scan {
        if let Some(timeout_secs) = scan.timeout_secs {
            cfg.scan.timeout_secs = timeout_secs;
        }
        if let Some(namespace_flag) = scan.namespace_flag {
            cfg.scan.namespace_flag = namespace_flag;
        }
        if let Some(exit_policy) = scan.exit_policy {
            cfg.scan.exit_policy = exit_policy;
        }
        if let Some(max_output_bytes) = scan.max_output_bytes {
            cfg.scan.max_output_bytes = max_output_bytes;
        }
    }

    if let Some(parser) = raw.parser {
        if let Some(category_key) = parser.category_key {
            cfg.parser.category_key = category_key;
        }
        if let Some(severity_key) = parser.severity_key {
            cfg.parser.severity_key = severity_key;
        }
        if let Some(severities) = parser.severities {
            cfg.parser.severities = severities;
        }
    }
}

fn apply_env_overrides(cfg: &mut EffectiveConfig) -> Result<()> {
    if let Ok(v) = std::env::var("SCANHARNESS_UI_COLOR") {
        cfg.ui.color = parse_bool(&v).with_context(|| "SCANHARNESS_UI_COLOR")?;
    }
    if let Ok(v) = std::env::var("SCANHARNESS_SCAN_TIMEOUT_SECS") {
        cfg.scan.timeout_secs = v
            .trim()
            .parse::<u64>()
            .with_context(|| "SCANHARNESS_SCAN_TIMEOUT_SECS")?;
    }
    if let Ok(v) = std::env::var("SCANHARNESS_SCAN_NAMESPACE_FLAG") {
        cfg.scan.namespace_flag = v.trim().to_string();
    }
    if let Ok(v) = std::env::var("SCANHARNESS_SCAN_EXIT_POLICY") {
        cfg.scan.exit_policy = v
            .parse::<ExitCodePolicy>()
            .map_err(anyhow::Error::msg)
            .with_context(|| "SCANHARNESS_SCAN_EXIT_POLICY")?;
    }
    if let Ok(v) = std::env::var("SCANHARNESS_SCAN_MAX_OUTPUT_BYTES") {
        cfg.scan.max_output_bytes = v
            .trim()
            .parse::<usize>()
            .with_context(|| "SCANHARNESS_SCAN_MAX_OUTPUT_BYTES")?;
    }
    if let Ok(v) = std::env::var("SCANHARNESS_PARSER_CATEGORY_KEY") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.parser.category_key = v.to_string();
        }
    }
    if let Ok(v) = std::env::var("SCANHARNESS_PARSER_SEVERITY_KEY") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.parser.severity_key = v.to_string();
        }
    }
    if let Ok(v) = std::env::var("SCANHARNESS_PARSER_SEVERITIES") {
        cfg.parser.severities = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
    }

    Ok(())
}

fn validate(cfg: &EffectiveConfig) -> Result<()> {
    if cfg.scan.timeout_secs == 0 {
        anyhow::bail!("scan.timeout_secs は 1 以上を指定してください");
    }
    if cfg.scan.timeout_secs > MAX_TIMEOUT.as_secs() {
        anyhow::bail!(
            "scan.timeout_secs は {} 以下を指定してください: {}",
            MAX_TIMEOUT.as_secs(),
            cfg.scan.timeout_secs
        );
    }
    if cfg.scan.max_output_bytes == 0 {
        anyhow::bail!("scan.max_output_bytes は 1 以上を指定してください");
    }
    if cfg.parser.category_key.trim().is_empty() || cfg.parser.severity_key.trim().is_empty() {
        anyhow::bail!("parser.category_key / parser.severity_key は空にできません");
    }
    if cfg.parser.category_key == cfg.parser.severity_key {
        anyhow::bail!(
            "parser.category_key と parser.severity_key は異なるキーを指定してください: {}",
            cfg.parser.category_key
        );
    }
    Ok(())
}

fn parse_bool(s: &str) -> Result<bool> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow::anyhow!(
            "真偽値が不正です: {s}（true|false|1|0|yes|no|on|off を指定してください）"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_config_overrides_defaults_field_by_field() {
        let raw: RawConfig = toml::from_str(
            r#"
[scan]
timeout_secs = 300
exit_policy = "fail-on-nonzero"

[parser]
severities = ["low", "medium"]
"#,
        )
        .expect("parse toml");

        let mut cfg = EffectiveConfig::default();
        apply_raw_config(&mut cfg, raw);

        assert_eq!(cfg.scan.timeout_secs, 300);
        assert_eq!(cfg.scan.exit_policy, ExitCodePolicy::FailOnNonZero);
        assert_eq!(cfg.scan.namespace_flag, "-n");
        assert_eq!(cfg.parser.severities, vec!["low", "medium"]);
        assert_eq!(cfg.parser.category_key, "category");
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<RawConfig>("[scan]\ntimeout = 3\n").is_err());
    }

    #[test]
    fn validation_rejects_zero_timeout_and_shared_keys() {
        let mut cfg = EffectiveConfig::default();
        cfg.scan.timeout_secs = 0;
        assert!(validate(&cfg).is_err());

        cfg.scan.timeout_secs = u64::MAX;
        assert!(validate(&cfg).is_err());

        let mut cfg = EffectiveConfig::default();
        cfg.parser.severity_key = "category".to_string();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn scan_request_carries_configured_defaults() {
        let mut cfg = EffectiveConfig::default();
        cfg.scan.timeout_secs = 42;
        cfg.scan.namespace_flag = "--namespace".to_string();
        let req = cfg.scan_request("ns", "kubeaudit");
        assert_eq!(req.timeout, Duration::from_secs(42));
        assert_eq!(req.tool_args(), vec!["--namespace", "ns"]);
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert!(parse_bool(" Yes ").unwrap());
        assert!(!parse_bool("off").unwrap());
        assert!(parse_bool("maybe").is_err());
    }
}
