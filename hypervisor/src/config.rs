use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SETUP_COMMAND: &str = r#"sudo mkdir -p /usr/lib/firefox-esr/distribution && echo '{"policies":{"OverrideFirstRunPage":"","OverridePostUpdatePage":"","DisableProfileImport":true,"DontCheckDefaultBrowser":true}}' | sudo tee /usr/lib/firefox-esr/distribution/policies.json > /dev/null"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxRuntime {
    Process,
}

impl SandboxRuntime {
    fn from_env(value: &str) -> anyhow::Result<Self> {
        match value {
            "process" => Ok(Self::Process),
            other => Err(anyhow::anyhow!(
                "Invalid SANDBOX_RUNTIME '{other}'. Expected 'process'"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 960,
        }
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once('x')
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{s}'"))?;
        let width = w.trim().parse::<u32>().map_err(|e| e.to_string())?;
        let height = h.trim().parse::<u32>().map_err(|e| e.to_string())?;
        if width == 0 || height == 0 {
            return Err(format!("resolution must be non-zero, got '{s}'"));
        }
        Ok(Self { width, height })
    }
}

/// Sandbox pool bookkeeping limits.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Max slots in Creating or Ready.
    pub capacity: usize,
    pub resolution: Resolution,
    /// Lifetime requested from the provisioning service.
    pub sandbox_timeout: Duration,
    /// A Ready slot older than this (since creation) is replaced on acquire.
    pub reuse_window: Duration,
    /// A slot stuck in Creating longer than this is torn down by the sweeper.
    pub max_creation_time: Duration,
    pub sweep_interval: Duration,
    /// Run once on every freshly provisioned instance.
    pub setup_commands: Vec<String>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: 50,
            resolution: Resolution::default(),
            sandbox_timeout: Duration::from_secs(500),
            reuse_window: Duration::from_secs(200),
            max_creation_time: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            setup_commands: vec![DEFAULT_SETUP_COMMAND.to_string()],
        }
    }
}

/// Task admission and execution loop knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Max live tasks; kept below pool capacity to leave headroom.
    pub admission_limit: usize,
    pub acquire_attempts: u32,
    pub acquire_delay: Duration,
    /// Wall-clock bound on sandbox acquisition, whichever of this and the
    /// attempt count is hit first.
    pub acquire_deadline: Duration,
    /// Pause after a step so the desktop settles before the screenshot is kept.
    pub step_settle_delay: Duration,
    pub max_steps: u32,
    pub data_dir: PathBuf,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            admission_limit: 48,
            acquire_attempts: 20,
            acquire_delay: Duration::from_secs(2),
            acquire_deadline: Duration::from_secs(300),
            step_settle_delay: Duration::from_secs(3),
            max_steps: 200,
            data_dir: PathBuf::from("data"),
        }
    }
}

/// Archival worker cadence and remote store location.
#[derive(Debug, Clone)]
pub struct ArchivalSettings {
    pub data_dir: PathBuf,
    /// `http(s)://` base URL or a directory path. `None` disables archival.
    pub store_url: Option<String>,
    pub store_token: Option<String>,
    pub interval: Duration,
    pub age_threshold: Duration,
    pub lock_path: PathBuf,
    pub worker_binary: Option<PathBuf>,
    pub stop_grace: Duration,
}

impl Default for ArchivalSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            store_url: None,
            store_token: None,
            interval: Duration::from_secs(30 * 60),
            age_threshold: Duration::from_secs(30 * 60),
            lock_path: PathBuf::from("/tmp/cua_archival.lock"),
            worker_binary: None,
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// Process-backed desktop provider settings.
#[derive(Debug, Clone)]
pub struct DesktopSettings {
    pub runtime: SandboxRuntime,
    /// Launcher for one virtual desktop; receives DISPLAY, STREAM_PORT,
    /// RESOLUTION and SANDBOX_TIMEOUT_SECS in its environment.
    pub binary: String,
    pub base_port: u16,
    pub port_count: u16,
    pub stream_host: String,
    pub screenshot_command: String,
    pub screenshot_timeout: Duration,
    /// Bound on each setup or action command before the desktop counts as
    /// unresponsive.
    pub command_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub pool: PoolSettings,
    pub orchestrator: OrchestratorSettings,
    pub archival: ArchivalSettings,
    pub desktop: DesktopSettings,
    /// HTTP endpoint of the step provider.
    pub agent_step_url: Option<String>,
    pub agent_step_timeout: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let total_sandboxes: usize = env_parse("CUA_TOTAL_SANDBOXES", 600)?;
        let num_workers: usize = env_parse("NUM_WORKERS", 12)?;
        let capacity = pool_capacity(total_sandboxes, num_workers)?;
        let headroom: usize = env_parse("TASK_ADMISSION_HEADROOM", 2)?;
        let data_dir = PathBuf::from(env_str("CUA_DATA_DIR", "data"));
        let max_creation_time = Duration::from_secs(env_parse("SANDBOX_CREATION_MAX_SECS", 300)?);

        let setup_commands = match std::env::var("SANDBOX_SETUP_COMMANDS") {
            Ok(raw) => split_commands(&raw),
            Err(_) => vec![DEFAULT_SETUP_COMMAND.to_string()],
        };

        Ok(Self {
            pool: PoolSettings {
                capacity,
                resolution: env_parse("DESKTOP_RESOLUTION", Resolution::default())?,
                sandbox_timeout: Duration::from_secs(env_parse("SANDBOX_TIMEOUT_SECS", 500)?),
                reuse_window: Duration::from_secs(env_parse("SANDBOX_REUSE_WINDOW_SECS", 200)?),
                max_creation_time,
                sweep_interval: Duration::from_secs(env_parse("SANDBOX_SWEEP_INTERVAL_SECS", 60)?),
                setup_commands,
            },
            orchestrator: OrchestratorSettings {
                admission_limit: admission_limit(capacity, headroom),
                acquire_attempts: env_parse("SANDBOX_ACQUIRE_ATTEMPTS", 20)?,
                acquire_delay: Duration::from_millis(env_parse("SANDBOX_ACQUIRE_DELAY_MS", 2000)?),
                acquire_deadline: max_creation_time,
                step_settle_delay: Duration::from_millis(env_parse("STEP_SETTLE_DELAY_MS", 3000)?),
                max_steps: env_parse("AGENT_MAX_STEPS", 200)?,
                data_dir: data_dir.clone(),
            },
            archival: ArchivalSettings {
                data_dir,
                store_url: env_opt("ARCHIVE_STORE_URL"),
                store_token: env_opt("ARCHIVE_STORE_TOKEN"),
                interval: Duration::from_secs(env_parse("ARCHIVE_INTERVAL_SECS", 1800)?),
                age_threshold: Duration::from_secs(env_parse("ARCHIVE_AGE_THRESHOLD_SECS", 1800)?),
                lock_path: PathBuf::from(env_str("ARCHIVE_LOCK_PATH", "/tmp/cua_archival.lock")),
                worker_binary: env_opt("ARCHIVAL_WORKER_BINARY").map(PathBuf::from),
                stop_grace: Duration::from_secs(env_parse("ARCHIVE_STOP_GRACE_SECS", 10)?),
            },
            desktop: DesktopSettings {
                runtime: SandboxRuntime::from_env(&env_str("SANDBOX_RUNTIME", "process"))?,
                binary: env_str("DESKTOP_BINARY", "cua-desktop"),
                base_port: env_parse("DESKTOP_BASE_PORT", 6080)?,
                port_count: env_parse("DESKTOP_PORT_COUNT", 64)?,
                stream_host: env_str("DESKTOP_STREAM_HOST", "127.0.0.1"),
                screenshot_command: env_str("SCREENSHOT_COMMAND", "import -window root png:-"),
                screenshot_timeout: Duration::from_secs(env_parse("SCREENSHOT_TIMEOUT_SECS", 30)?),
                command_timeout: Duration::from_secs(env_parse("DESKTOP_COMMAND_TIMEOUT_SECS", 120)?),
            },
            agent_step_url: env_opt("AGENT_STEP_URL"),
            agent_step_timeout: Duration::from_secs(env_parse("AGENT_STEP_TIMEOUT_SECS", 120)?),
        })
    }
}

/// Per-process share of the global sandbox budget.
fn pool_capacity(total: usize, workers: usize) -> anyhow::Result<usize> {
    if workers == 0 {
        return Err(anyhow::anyhow!("NUM_WORKERS must be at least 1"));
    }
    let capacity = total / workers;
    if capacity == 0 {
        return Err(anyhow::anyhow!(
            "CUA_TOTAL_SANDBOXES={total} leaves no sandbox for each of {workers} workers"
        ));
    }
    Ok(capacity)
}

fn admission_limit(capacity: usize, headroom: usize) -> usize {
    capacity.saturating_sub(headroom).max(1)
}

fn split_commands(raw: &str) -> Vec<String> {
    raw.split(";;")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_split_across_workers() {
        assert_eq!(pool_capacity(600, 12).unwrap(), 50);
        assert!(pool_capacity(600, 0).is_err());
        assert!(pool_capacity(5, 12).is_err());
    }

    #[test]
    fn admission_leaves_headroom_but_never_zero() {
        assert_eq!(admission_limit(50, 2), 48);
        assert_eq!(admission_limit(2, 5), 1);
    }

    #[test]
    fn resolution_parses_width_by_height() {
        let r: Resolution = "1920x1080".parse().unwrap();
        assert_eq!(r, Resolution { width: 1920, height: 1080 });
        assert!("1920".parse::<Resolution>().is_err());
        assert!("0x10".parse::<Resolution>().is_err());
    }

    #[test]
    fn setup_commands_split_on_double_semicolon() {
        let cmds = split_commands("echo a; echo b ;; touch /tmp/x;; ");
        assert_eq!(cmds, vec!["echo a; echo b".to_string(), "touch /tmp/x".to_string()]);
    }
}
