use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "runhub", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Directory for per-run source files and artifacts
    #[arg(long = "work-dir", short = 'w')]
    pub work_dir: Option<PathBuf>,
}

impl CliArgs {
    /// Load the configuration from the specified file, or the defaults if none was given
    pub fn to_config(&self) -> std::io::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader)?
            }
            None => Config::default(),
        };
        if let Some(work_dir) = &self.work_dir {
            config.work_dir = Some(work_dir.clone());
        }
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub builder: BuilderConfig,
    pub policy: PolicyConfig,
    pub programs: Vec<ProgramConfig>,
    pub work_dir: Option<PathBuf>,
}

impl Config {
    /// Resolves the directory that holds run files, creating it if needed
    pub fn resolve_work_dir(&self) -> std::io::Result<PathBuf> {
        use directories::ProjectDirs;

        let work_dir = match &self.work_dir {
            Some(dir) => dir.clone(),
            None => ProjectDirs::from("", "", "runhub")
                .map(|dirs| dirs.cache_dir().join("runs"))
                .unwrap_or_else(|| std::env::temp_dir().join("runhub")),
        };
        std::fs::create_dir_all(&work_dir)?;
        Ok(work_dir)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// HTTP port serving `/run` and `/sessions`
    pub bind_port: u16,
    /// TCP port of the interactive line protocol
    pub session_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 3000,
            session_port: 3001,
        }
    }
}

/// Toolchain invocation. `%INPUT%` and `%OUTPUT%` are substituted in every argument.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BuilderConfig {
    pub command: Vec<String>,
    pub source_extension: String,
    pub timeout: MilliSecond,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            command: ["g++", "%INPUT%", "-o", "%OUTPUT%"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            source_extension: "cpp".to_string(),
            timeout: MilliSecond(20_000),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PolicyConfig {
    /// Interactive sessions: kill after this long without process I/O
    pub inactivity_timeout: MilliSecond,
    /// Single-shot runs: wall-clock budget regardless of activity
    pub hard_timeout: MilliSecond,
    /// Interactive sessions: optional wall-clock cap, off unless set
    pub interactive_hard_timeout: Option<MilliSecond>,
    pub cleanup_retry_delay: MilliSecond,
    /// How long to keep reading leftover output after the process exited
    pub output_drain_grace: MilliSecond,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: MilliSecond(300_000),
            hard_timeout: MilliSecond(30_000),
            interactive_hard_timeout: None,
            cleanup_retry_delay: MilliSecond(500),
            output_drain_grace: MilliSecond(1_000),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProgramConfig {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl MilliSecond {
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.0)
    }

    /// Whole seconds, as shown in timeout messages
    pub fn as_secs(self) -> u64 {
        self.0 / 1000
    }
}
