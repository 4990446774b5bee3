use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use vtrack_adapters::gazetteer::DEFAULT_MEMBER;
use vtrack_adapters::processing::ProcessingLayout;
use vtrack_core::WaitTimeFormat;
use vtrack_storage::{BackoffPolicy, HttpClientConfig};

pub const CONFIG_FILE: &str = "pipeline.yaml";

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceUrls {
    pub gazetteer: String,
    pub gazetteer_referer: String,
    pub wait_times: String,
    pub bulletin_index: String,
    pub processing_times: String,
}

impl Default for SourceUrls {
    fn default() -> Self {
        Self {
            gazetteer: "https://simplemaps.com/static/data/world-cities/basic/simplemaps_worldcities_basicv1.77.zip"
                .to_string(),
            gazetteer_referer: "https://simplemaps.com/data/world-cities".to_string(),
            wait_times: "https://travel.state.gov/content/travel/en/us-visas/visa-information-resources/global-visa-wait-times.html"
                .to_string(),
            bulletin_index: "https://travel.state.gov/content/travel/en/legal/visa-law0/visa-bulletin.html"
                .to_string(),
            processing_times: "https://flag.dol.gov/processingtimes".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    /// Six-field cron expression (seconds first).
    pub cron: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cron: "0 0 6 * * *".to_string(),
        }
    }
}

/// Run configuration. Every key is optional in `pipeline.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    pub reference_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub user_agent: String,
    pub urls: SourceUrls,
    pub wait_time_format: WaitTimeFormat,
    pub gazetteer_member: String,
    pub processing_layout: ProcessingLayout,
    pub schedule: ScheduleConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            reference_dir: PathBuf::from("data"),
            http_timeout_secs: 10,
            max_retries: BackoffPolicy::default().max_retries,
            user_agent: BROWSER_USER_AGENT.to_string(),
            urls: SourceUrls::default(),
            wait_time_format: WaitTimeFormat::default(),
            gazetteer_member: DEFAULT_MEMBER.to_string(),
            processing_layout: ProcessingLayout::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Read `pipeline.yaml` under `workspace_root` if present; relative directories
    /// are resolved against `workspace_root`.
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };
        config.output_dir = anchor(workspace_root, &config.output_dir);
        config.reference_dir = anchor(workspace_root, &config.reference_dir);
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..Default::default()
            },
        }
    }
}

fn anchor(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
