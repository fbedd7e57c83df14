//! Lifecycle of the Node.js Baileys sidecar process.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use {
    anyhow::{Context, Result, bail},
    tokio::{
        io::{AsyncBufReadExt, BufReader},
        process::{Child, Command},
    },
    tracing::{debug, error, info, warn},
};

use crate::sidecar::DEFAULT_SIDECAR_PORT;

const SIDECAR_DIR_ENV: &str = "PARLEY_WHATSAPP_SIDECAR_DIR";
const SIDECAR_REL_PATH: &str = "sidecar/whatsapp";
const STARTUP_GRACE: Duration = Duration::from_millis(500);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for spawning the sidecar.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// Directory holding the sidecar's `package.json`.
    pub sidecar_dir: PathBuf,
    pub port: u16,
    /// Where Baileys keeps its multi-file auth state.
    pub auth_dir: Option<PathBuf>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            sidecar_dir: PathBuf::new(),
            port: DEFAULT_SIDECAR_PORT,
            auth_dir: None,
        }
    }
}

/// A spawned sidecar. Killed when dropped.
pub struct SidecarProcess {
    child: Child,
    port: u16,
}

impl SidecarProcess {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// SIGTERM, then kill if it has not exited within five seconds.
    pub async fn stop(&mut self) {
        info!("stopping whatsapp sidecar");

        #[cfg(unix)]
        {
            use nix::{
                sys::signal::{Signal, kill},
                unistd::Pid,
            };

            if let Some(pid) = self.child.id()
                && let Ok(pid) = i32::try_from(pid)
            {
                let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        match tokio::time::timeout(STOP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => info!(?status, "whatsapp sidecar exited"),
            Ok(Err(e)) => warn!(error = %e, "error waiting for whatsapp sidecar"),
            Err(_) => {
                warn!("whatsapp sidecar ignored SIGTERM, killing");
                let _ = self.child.kill().await;
            },
        }
    }
}

/// Locate the sidecar: explicit path, then `PARLEY_WHATSAPP_SIDECAR_DIR`,
/// then next to the executable, then the working directory.
pub fn find_sidecar_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    let has_package = |dir: &Path| dir.join("package.json").exists();

    if let Some(path) = explicit {
        if has_package(path) {
            return Ok(path.to_path_buf());
        }
        bail!(
            "sidecar directory does not exist or has no package.json: {}",
            path.display()
        );
    }

    if let Ok(dir) = std::env::var(SIDECAR_DIR_ENV) {
        let path = PathBuf::from(&dir);
        if has_package(&path) {
            return Ok(path);
        }
        warn!(path = %dir, "{SIDECAR_DIR_ENV} set but package.json not found");
    }

    let mut candidates = Vec::new();
    if let Ok(exe) = std::env::current_exe()
        && let Some(exe_dir) = exe.parent()
    {
        candidates.push(exe_dir.join("..").join(SIDECAR_REL_PATH));
        candidates.push(exe_dir.join("../..").join(SIDECAR_REL_PATH));
    }
    candidates.extend(
        ["", "..", "../.."]
            .iter()
            .map(|prefix| Path::new(prefix).join(SIDECAR_REL_PATH)),
    );

    candidates
        .into_iter()
        .find(|path| has_package(path))
        .map(|path| path.canonicalize().unwrap_or(path))
        .with_context(|| {
            format!(
                "whatsapp sidecar not found; set {SIDECAR_DIR_ENV} or install it under {SIDECAR_REL_PATH}"
            )
        })
}

/// Build the sidecar if needed, start it and wait out its startup grace
/// period.
pub async fn start_sidecar(config: &SidecarConfig) -> Result<SidecarProcess> {
    let dir = &config.sidecar_dir;
    if !dir.join("package.json").exists() {
        bail!("whatsapp sidecar not found at {}", dir.display());
    }

    if !dir.join("dist/index.js").exists() {
        if !dir.join("node_modules").exists() {
            run_npm(dir, &["install"]).await?;
        }
        run_npm(dir, &["run", "build"]).await?;
    }

    info!(path = %dir.display(), port = config.port, "starting whatsapp sidecar");

    let mut cmd = Command::new("node");
    cmd.arg("dist/index.js")
        .current_dir(dir)
        .env("PARLEY_WHATSAPP_PORT", config.port.to_string())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(auth_dir) = &config.auth_dir {
        cmd.env("PARLEY_WHATSAPP_AUTH_DIR", auth_dir);
    }

    let mut child = cmd.spawn().context("failed to spawn whatsapp sidecar")?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                forward_log_line(&line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "whatsapp_sidecar", "{line}");
            }
        });
    }

    tokio::time::sleep(STARTUP_GRACE).await;
    match child.try_wait() {
        Ok(Some(status)) => bail!("whatsapp sidecar exited immediately with status: {status}"),
        Ok(None) => {},
        Err(e) => bail!("failed to check whatsapp sidecar status: {e}"),
    }

    info!(port = config.port, "whatsapp sidecar started");
    Ok(SidecarProcess {
        child,
        port: config.port,
    })
}

async fn run_npm(dir: &Path, args: &[&str]) -> Result<()> {
    let command = format!("npm {}", args.join(" "));
    info!(path = %dir.display(), command = %command, "preparing whatsapp sidecar");

    let output = Command::new("npm")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("failed to run {command}"))?;
    if !output.status.success() {
        bail!(
            "{command} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

/// Log level of a sidecar stdout line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Split a pino JSON line into its level and message. Plain lines are info.
fn parse_log_line(line: &str) -> (LineLevel, String) {
    if line.starts_with('{')
        && let Ok(log) = serde_json::from_str::<serde_json::Value>(line)
    {
        let level = match log.get("level").and_then(|v| v.as_u64()).unwrap_or(30) {
            0..=29 => LineLevel::Debug,
            30..=39 => LineLevel::Info,
            40..=49 => LineLevel::Warn,
            _ => LineLevel::Error,
        };
        let msg = log
            .get("msg")
            .and_then(|v| v.as_str())
            .unwrap_or(line)
            .to_string();
        return (level, msg);
    }
    (LineLevel::Info, line.to_string())
}

fn forward_log_line(line: &str) {
    let (level, msg) = parse_log_line(line);
    match level {
        LineLevel::Debug => debug!(target: "whatsapp_sidecar", "{msg}"),
        LineLevel::Info => info!(target: "whatsapp_sidecar", "{msg}"),
        LineLevel::Warn => warn!(target: "whatsapp_sidecar", "{msg}"),
        LineLevel::Error => error!(target: "whatsapp_sidecar", "{msg}"),
    }
}
