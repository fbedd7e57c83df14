//! `parley doctor`: config validation and installation audit.
//!
//! Prints one line per check with an `[ok]`, `[warn]`, `[fail]` or
//! `[info]` marker.

use std::path::Path;

use {
    anyhow::{Result, bail},
    parley_config::{ParleyConfig, Severity},
};

// ── ANSI helpers ────────────────────────────────────────────────────────────

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    Warn,
    Fail,
    Info,
}

impl Status {
    fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Fail => "fail",
            Self::Info => "info",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Self::Ok => GREEN,
            Self::Warn => YELLOW,
            Self::Fail => RED,
            Self::Info => CYAN,
        }
    }
}

struct CheckItem {
    status: Status,
    message: String,
}

#[derive(Default)]
struct Report {
    items: Vec<CheckItem>,
}

impl Report {
    fn add(&mut self, status: Status, message: impl Into<String>) {
        self.items.push(CheckItem {
            status,
            message: message.into(),
        });
    }

    fn failed(&self) -> bool {
        self.items.iter().any(|i| i.status == Status::Fail)
    }

    fn print(&self) {
        println!("{BOLD}parley doctor{RESET}");
        for item in &self.items {
            println!(
                "  {}[{}]{RESET} {}",
                item.status.color(),
                item.status.label(),
                item.message
            );
        }
    }
}

fn check_config(config: &ParleyConfig, report: &mut Report) {
    let result = parley_config::validate(config);
    if result.diagnostics.is_empty() {
        report.add(Status::Ok, "configuration is valid");
    }
    for diagnostic in result.diagnostics {
        let status = match diagnostic.severity {
            Severity::Error => Status::Fail,
            Severity::Warning => Status::Warn,
        };
        report.add(status, format!("{}: {}", diagnostic.path, diagnostic.message));
    }
    report.add(
        Status::Info,
        format!("ai backend: {}", config.backend.ai_endpoint()),
    );
    report.add(
        Status::Info,
        format!("voice backend: {}", config.backend.voice_endpoint()),
    );
}

fn check_data_dir(dir: &Path, report: &mut Report) {
    if !dir.exists() {
        report.add(
            Status::Info,
            format!("data dir {} will be created on start", dir.display()),
        );
        return;
    }
    let probe = dir.join(".parley-doctor");
    match std::fs::write(&probe, b"ok") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            report.add(Status::Ok, format!("data dir {} is writable", dir.display()));
        },
        Err(e) => report.add(
            Status::Fail,
            format!("data dir {} is not writable: {e}", dir.display()),
        ),
    }
}

fn check_sidecar(config: &ParleyConfig, report: &mut Report) {
    if !config.whatsapp.auto_start_sidecar {
        report.add(
            Status::Info,
            format!(
                "sidecar auto-start disabled; expecting one on port {}",
                config.whatsapp.sidecar_port
            ),
        );
        return;
    }
    match parley_whatsapp::find_sidecar_dir(config.whatsapp.sidecar_dir.as_deref()) {
        Ok(dir) => report.add(Status::Ok, format!("whatsapp sidecar at {}", dir.display())),
        Err(e) => report.add(Status::Fail, e.to_string()),
    }
    match std::process::Command::new("node").arg("--version").output() {
        Ok(output) if output.status.success() => report.add(
            Status::Ok,
            format!(
                "node {}",
                String::from_utf8_lossy(&output.stdout).trim()
            ),
        ),
        _ => report.add(Status::Fail, "node not found on PATH"),
    }
}

pub fn run(config: &ParleyConfig) -> Result<()> {
    let mut report = Report::default();
    check_config(config, &mut report);
    check_data_dir(&config.data_dir, &mut report);
    check_sidecar(config, &mut report);
    report.print();
    if report.failed() {
        bail!("doctor found problems");
    }
    Ok(())
}
