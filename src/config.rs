//! Agent configuration: compiled-in defaults plus environment overrides.

use std::path::PathBuf;

/// External tool binaries. Substitution points for the opaque
/// collaborators; tests point these at stub scripts.
#[derive(Debug, Clone)]
pub struct Tools {
    pub apt_get: String,
    pub dpkg_deb: String,
    pub systemd_run: String,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            apt_get: "apt-get".to_string(),
            dpkg_deb: "dpkg-deb".to_string(),
            systemd_run: "systemd-run".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// TCP listen address; a bare `:port` binds all interfaces.
    pub listen_addr: String,
    /// Directory holding `operations.json` and `operations.lock`.
    pub state_dir: PathBuf,
    /// Staging directory for uploaded package files.
    pub pool_dir: PathBuf,
    /// Directory of package files applied to this host.
    pub installed_dir: PathBuf,
    /// Package that contains this agent; protected from removal.
    pub self_package: String,
    /// Upper bound for a single pool upload.
    pub max_upload_bytes: u64,
    pub tools: Tools,
    /// Executable launched by the supervisor in executor mode. Defaults to
    /// the current executable.
    pub executor_exe: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: ":8080".to_string(),
            state_dir: PathBuf::from("/var/lib/groom/state"),
            pool_dir: PathBuf::from("/var/lib/groom/pool"),
            installed_dir: PathBuf::from("/var/lib/groom/installed"),
            self_package: "groom-agent".to_string(),
            max_upload_bytes: 1024 * 1024 * 1024,
            tools: Tools::default(),
            executor_exe: None,
        }
    }
}

impl Config {
    /// Listen address in the form the socket API accepts: a bare `:8080`
    /// becomes `0.0.0.0:8080`.
    pub fn bind_addr(&self) -> String {
        if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        }
    }
}

/// Defaults overridden by the environment.
pub fn load() -> Config {
    let mut cfg = Config::default();
    apply_env_overrides(&mut cfg);
    cfg
}

pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(addr) = env_var("GROOM_ADDR") {
        cfg.listen_addr = addr;
    }
    if let Some(dir) = env_var("GROOM_STATE_DIR") {
        cfg.state_dir = PathBuf::from(dir);
    }
    if let Some(dir) = env_var("GROOM_POOL_DIR") {
        cfg.pool_dir = PathBuf::from(dir);
    }
    if let Some(dir) = env_var("GROOM_INSTALLED_DIR") {
        cfg.installed_dir = PathBuf::from(dir);
    }
    if let Some(name) = env_var("GROOM_SELF_PACKAGE") {
        cfg.self_package = name;
    }
    if let Some(bytes) = env_var("GROOM_MAX_UPLOAD_BYTES") {
        match bytes.parse() {
            Ok(n) => cfg.max_upload_bytes = n,
            Err(err) => tracing::warn!("ignoring GROOM_MAX_UPLOAD_BYTES={bytes}: {err}"),
        }
    }
    if let Some(bin) = env_var("GROOM_APT_GET") {
        cfg.tools.apt_get = bin;
    }
    if let Some(bin) = env_var("GROOM_DPKG_DEB") {
        cfg.tools.dpkg_deb = bin;
    }
    if let Some(bin) = env_var("GROOM_SYSTEMD_RUN") {
        cfg.tools.systemd_run = bin;
    }
    if let Some(exe) = env_var("GROOM_EXECUTOR_BIN") {
        cfg.executor_exe = Some(PathBuf::from(exe));
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
