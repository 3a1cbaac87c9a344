use crate::util::SerdeLevelFilter;
use anyhow::{anyhow, Context};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::OnceLock;
use std::{
    env::{self, VarError},
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};

static GLOBAL_CONFIG: OnceLock<Config> = OnceLock::new();

const LOCATION_ENV_VAR: &str = "IG_CACHE_LOCATION";
const CONFIG_PATH: &str = "./config.json";

pub const MEMORY_LOCATION: &str = "memory";

pub struct Config {
    pub store: StoreConfig,
    pub maintenance: MaintenanceConfig,
    pub log_level_filter: LevelFilter,
    pub log_directory: PathBuf,
}

impl Config {
    pub fn get() -> &'static Self {
        GLOBAL_CONFIG.get().expect("Config not set")
    }

    pub fn init() -> anyhow::Result<()> {
        let me = Self::load(Path::new(CONFIG_PATH))?;

        GLOBAL_CONFIG
            .set(me)
            .map_err(|_| anyhow!("Config already initialized"))
    }

    /// Reads the on-disk config at `config_path`, writing the default one if it is missing or
    /// unreadable, then applies environment overrides.
    pub fn load(config_path: &Path) -> anyhow::Result<Self> {
        let on_disk_config = if config_path.exists() {
            let mut config_file = OpenOptions::new()
                .read(true)
                .write(false)
                .open(config_path)
                .context("Failed to open config file")?;

            let mut buf = String::with_capacity(usize::try_from(config_file.metadata()?.len())?);
            config_file
                .read_to_string(&mut buf)
                .context("Failed to read config file")?;

            match serde_json::from_str::<OnDiskConfig>(&buf) {
                Ok(config) => config,
                Err(error) => {
                    println!("Failed to read on-disk config ({error}), writing default config.");
                    let (default, buf) = OnDiskConfig::default_serialized();
                    drop(config_file);
                    fs::write(config_path, buf.as_bytes())
                        .context("Failed to write default config")?;
                    default
                }
            }
        } else {
            let mut config_file =
                File::create(config_path).context("Failed to create config file")?;
            let (default, buf) = OnDiskConfig::default_serialized();
            config_file
                .write_all(buf.as_bytes())
                .context("Failed to write default config")?;
            default
        };

        let mut store = on_disk_config.store;
        if let Some(location) = read_opt_env_var(LOCATION_ENV_VAR)? {
            store.location = location;
        }

        Ok(Self {
            store,
            maintenance: on_disk_config.maintenance,
            log_level_filter: on_disk_config.log_level_filter,
            log_directory: on_disk_config.log_directory,
        })
    }
}

/// Where the cache lives and what the opener may assume about it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    /// Either `"memory"` or a `file://` URL.
    pub location: String,
    #[serde(default)]
    pub expectation: FileExpectation,
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            location: MEMORY_LOCATION.to_owned(),
            expectation: FileExpectation::Any,
        }
    }
}

// File URLs can't express relative paths, so a persistent store has to be configured explicitly
impl Default for StoreConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// What the caller asserts about a store file before opening it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileExpectation {
    /// Open the file, creating it (and its parent directory) when missing.
    #[default]
    Any,
    MustExist,
    MustNotExist,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceConfig {
    #[serde(default)]
    pub vacuum_on_start: bool,
}

fn read_opt_env_var(env_var: &str) -> anyhow::Result<Option<String>> {
    match env::var(env_var) {
        Ok(var) => Ok(Some(var)),
        Err(VarError::NotPresent) => Ok(None),
        Err(error @ VarError::NotUnicode(_)) => {
            Err(anyhow!("Failed to parse env var {env_var}: {error}"))
        }
    }
}

#[derive(Serialize, Deserialize)]
struct OnDiskConfig {
    store: StoreConfig,
    #[serde(default)]
    maintenance: MaintenanceConfig,
    #[serde(with = "SerdeLevelFilter")]
    log_level_filter: LevelFilter,
    log_directory: PathBuf,
}

impl OnDiskConfig {
    fn default_serialized() -> (Self, String) {
        let default = Self::default();
        let serialized =
            serde_json::to_string_pretty(&default).expect("Failed to serialize on-disk config");

        (default, serialized)
    }
}

impl Default for OnDiskConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            maintenance: MaintenanceConfig::default(),
            log_level_filter: LevelFilter::Debug,
            log_directory: PathBuf::from("./logs"),
        }
    }
}
