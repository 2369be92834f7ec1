// ⚙️ Configuration
// recon.toml: input files, per-group carrier exports, snapshot backend and
// review thresholds. Relative paths resolve against the config file's
// directory.

use crate::cluster::GroupFilter;
use crate::costs::StatusThresholds;
use crate::pipeline::Reconciler;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct InputsConfig {
    pub trackings: PathBuf,
    pub orders: PathBuf,
    #[serde(default)]
    pub cancellations: Option<PathBuf>,
    #[serde(default)]
    pub purchase_orders: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub carrier_costs: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotBackend {
    #[default]
    Sqlite,
    Csv,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub backend: SnapshotBackend,
    #[serde(default = "default_snapshot_path")]
    pub path: PathBuf,
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("reconciliation.db")
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            backend: SnapshotBackend::default(),
            path: default_snapshot_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub inputs: InputsConfig,

    /// Buying groups by name; iteration order is the fetch order
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,

    #[serde(default)]
    pub snapshot: SnapshotConfig,

    #[serde(default)]
    pub thresholds: StatusThresholds,

    #[serde(skip)]
    base_dir: PathBuf,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let mut config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.groups.is_empty() {
            bail!("At least one [groups.<name>] section is required");
        }
        if self.thresholds.balance_tolerance < 0.0 {
            bail!("thresholds.balance_tolerance must not be negative");
        }
        if self.thresholds.overcompensation_ratio < 0.0 {
            bail!("thresholds.overcompensation_ratio must not be negative");
        }
        Ok(())
    }

    /// Relative paths are taken from the config file's directory
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    pub fn carrier_paths(&self) -> BTreeMap<String, PathBuf> {
        self.groups
            .iter()
            .map(|(name, group)| (name.clone(), self.resolve(&group.carrier_costs)))
            .collect()
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.resolve(&self.snapshot.path)
    }

    /// Empty selection means every group
    pub fn group_filter(&self, selected: &[String]) -> Result<GroupFilter> {
        if selected.is_empty() {
            return Ok(GroupFilter::all());
        }

        for name in selected {
            if !self.groups.contains_key(name) {
                bail!(
                    "Unknown group '{}' (configured: {})",
                    name,
                    self.group_names().join(", ")
                );
            }
        }
        Ok(GroupFilter::only(selected.iter().cloned()))
    }

    pub fn reconciler(&self, selected: &[String]) -> Result<Reconciler> {
        Ok(Reconciler::new(
            self.group_names(),
            self.group_filter(selected)?,
            self.thresholds,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[inputs]
trackings = "data/trackings.csv"
orders = "/srv/orders.csv"

[groups.usa]
carrier_costs = "data/usa.csv"

[groups.bfmr]
carrier_costs = "data/bfmr.csv"

[snapshot]
backend = "csv"
path = "review.csv"

[thresholds]
balance_tolerance = 0.05
"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = Config::from_toml(SAMPLE).unwrap();

        assert_eq!(config.snapshot.backend, SnapshotBackend::Csv);
        assert_eq!(config.thresholds.balance_tolerance, 0.05);
        assert_eq!(config.thresholds.overcompensation_ratio, 0.05);
        assert!(config.inputs.cancellations.is_none());
        assert_eq!(config.group_names(), vec!["bfmr", "usa"]);
    }

    #[test]
    fn test_snapshot_defaults_to_sqlite() {
        let config = Config::from_toml(
            "[inputs]\ntrackings = \"t.csv\"\norders = \"o.csv\"\n[groups.usa]\ncarrier_costs = \"u.csv\"\n",
        )
        .unwrap();

        assert_eq!(config.snapshot.backend, SnapshotBackend::Sqlite);
        assert_eq!(config.snapshot.path, PathBuf::from("reconciliation.db"));
    }

    #[test]
    fn test_requires_a_group() {
        let result = Config::from_toml("[inputs]\ntrackings = \"t.csv\"\norders = \"o.csv\"\n");

        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_negative_thresholds() {
        let toml = SAMPLE.replace("balance_tolerance = 0.05", "balance_tolerance = -1.0");

        assert!(Config::from_toml(&toml).is_err());
    }

    #[test]
    fn test_group_filter_validates_names() {
        let config = Config::from_toml(SAMPLE).unwrap();

        assert!(!config.group_filter(&[]).unwrap().is_restricted());
        let filter = config.group_filter(&["usa".to_string()]).unwrap();
        assert!(filter.includes("usa"));
        assert!(!filter.includes("bfmr"));
        assert!(config.group_filter(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recon.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::from_file(&path).unwrap();

        assert_eq!(
            config.resolve(&config.inputs.trackings),
            dir.path().join("data/trackings.csv")
        );
        assert_eq!(config.resolve(&config.inputs.orders), PathBuf::from("/srv/orders.csv"));
        assert_eq!(config.carrier_paths()["usa"], dir.path().join("data/usa.csv"));
        assert_eq!(config.snapshot_path(), dir.path().join("review.csv"));
    }
}
