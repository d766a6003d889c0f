//! Configuration and run-number persistence of the acquisition host.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// `config.json` of the acquisition host.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub system: System,
    pub daq: DaqSection,
    pub targets: HashMap<String, Target>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct System {
    /// Directory raw-data run directories are created under.
    pub logging_dir: PathBuf,
    /// Record unit size of the acquisition stream.
    pub data_unit: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DaqSection {
    /// Name of the target (from `targets`) to acquire from.
    pub connect: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Target {
    pub ip: String,
    pub tcp: u16,
    pub udp: u16,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let file = fs::File::open(path)
            .with_context(|| format!("could not open config {}", path.display()))?;
        let config: Config = serde_json::from_reader(file)
            .with_context(|| format!("could not parse config {}", path.display()))?;
        config
            .targets
            .get(&config.daq.connect)
            .with_context(|| format!("unknown daq target {:?}", config.daq.connect))?;
        Ok(config)
    }

    /// The target selected by `daq.connect`.
    pub fn target(&self) -> &Target {
        &self.targets[&self.daq.connect]
    }
}

/// Reads the persisted run number; 1 when the file is missing or bad.
pub fn load_run_no(path: &Path) -> u32 {
    match fs::read_to_string(path) {
        Ok(content) => content.trim().parse().unwrap_or(1),
        Err(_) => 1,
    }
}

/// Persists the run number atomically (temp file + rename).
pub fn save_run_no(path: &Path, run_no: u32) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, format!("{run_no}"))
        .with_context(|| format!("could not write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("could not replace {}", path.display()))?;
    Ok(())
}
