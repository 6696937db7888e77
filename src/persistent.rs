use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::spans_list::DEFAULT_MIN_SIBLING_GROUP_SIZE;

/// Persistent data structure that holds the user's waterfall settings.
/// If the data structure changes, it should be versioned to maintain compatibility with data saved
/// using older versions of spantree.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum PersistentData {
    V1(PersistentDataV1),
}

impl Default for PersistentData {
    fn default() -> Self {
        PersistentData::V1(PersistentDataV1::default())
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PersistentDataV1 {
    settings: ViewSettings,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ViewSettings {
    /// Runs of identical siblings at least this long are shown as one row.
    pub min_sibling_group_size: usize,
    /// Gaps between siblings longer than this (seconds) are shown as missing instrumentation.
    pub gap_threshold: Option<f64>,
    pub filter_presets: Vec<FilterPreset>,
}

impl Default for ViewSettings {
    fn default() -> Self {
        ViewSettings {
            min_sibling_group_size: DEFAULT_MIN_SIBLING_GROUP_SIZE,
            gap_threshold: None,
            filter_presets: Vec::new(),
        }
    }
}

/// A named set of operation names to filter the waterfall by.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FilterPreset {
    pub id: Uuid,
    pub name: String,
    pub operations: Vec<String>,
}

impl FilterPreset {
    pub fn new(name: &str, operations: &[&str]) -> FilterPreset {
        FilterPreset {
            id: Uuid::new_v4(),
            name: name.to_string(),
            operations: operations.iter().map(|op| op.to_string()).collect(),
        }
    }
}

pub fn save_settings(settings: &ViewSettings) -> Result<()> {
    save_settings_in(&persistent_data_folder()?, settings)
}

pub fn load_settings() -> Result<ViewSettings> {
    load_settings_in(&persistent_data_folder()?)
}

pub fn save_settings_in(folder: &Path, settings: &ViewSettings) -> Result<()> {
    let data = PersistentData::V1(PersistentDataV1 {
        settings: settings.clone(),
    });
    write_data(folder, &data)
}

pub fn load_settings_in(folder: &Path) -> Result<ViewSettings> {
    let data = read_data(folder)?;
    let settings = match data {
        PersistentData::V1(data) => data.settings,
    };
    Ok(settings)
}

fn write_data(folder: &Path, data: &PersistentData) -> Result<()> {
    let persistent_data_file = persistent_data_file_path(folder);
    info!(path = %persistent_data_file.display(), "writing persistent data");

    // Create the directory if it doesn't exist
    std::fs::create_dir_all(folder)
        .with_context(|| format!("creating {}", folder.display()))?;

    // First write the data to a temporary file
    let write_file_path = temporary_write_file_path(folder);
    let mut file = std::fs::File::create(&write_file_path)?;
    serde_json::to_writer_pretty(&mut file, &data)?;
    file.sync_all()?;

    // Then move the temporary file to the final location
    // Makes things more robust against crashes
    std::fs::rename(&write_file_path, &persistent_data_file)?;

    Ok(())
}

fn read_data(folder: &Path) -> Result<PersistentData> {
    let path = persistent_data_file_path(folder);
    debug!(path = %path.display(), "reading persistent data");
    if !path.try_exists()? {
        info!("persistent data not found, using defaults");
        return Ok(PersistentData::default());
    }
    let file = std::fs::File::open(&path)?;
    let data: PersistentData = serde_json::from_reader(file)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(data)
}

fn persistent_data_folder() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "spantree", "spantree")
        .ok_or_else(|| anyhow::anyhow!("No home directory to store settings in"))?;
    Ok(dirs.data_dir().to_path_buf())
}

fn persistent_data_file_path(folder: &Path) -> PathBuf {
    folder.join("persistent_data.json")
}

fn temporary_write_file_path(folder: &Path) -> PathBuf {
    let random_number: u64 = rand::random();
    folder.join(format!("temporary_persistent_data{}.json", random_number))
}
