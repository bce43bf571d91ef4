#![allow(dead_code)]

use campaign_core::campaign::SafetySettings;
use campaign_core::Config;
use campaignd::safety::SafetyProtocol;
use campaignd::supervisor::{Supervisor, SupervisorConfig};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

pub const APP_FILE: &str = "src/app.ts";
pub const APP_V1: &str = "export const value = 1;\n";

/// Throwaway git repository with one committed source file.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let repo = Self {
            dir: TempDir::new().unwrap(),
        };
        repo.git(&["init", "-q"]);
        repo.git(&["config", "user.email", "campaign@example.com"]);
        repo.git(&["config", "user.name", "Campaign Test"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        repo.write(APP_FILE, APP_V1);
        repo.git(&["add", "."]);
        repo.git(&["commit", "-q", "-m", "initial"]);
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.join(rel)).unwrap()
    }

    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.dir.path())
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).to_string()
    }

    pub fn head(&self) -> String {
        self.git(&["rev-parse", "HEAD"]).trim().to_string()
    }

    /// Config with no-op build and test commands, resolved against the repo.
    pub fn config(&self) -> Config {
        let mut config = Config {
            build_cmd: "true".to_string(),
            test_cmd: "true".to_string(),
            ..Config::default()
        };
        config.resolve_paths(self.path());
        config
    }

    pub fn protocol(&self) -> (Arc<SafetyProtocol>, Supervisor) {
        self.protocol_with(SafetySettings::default())
    }

    pub fn protocol_with(&self, settings: SafetySettings) -> (Arc<SafetyProtocol>, Supervisor) {
        let config = self.config();
        let supervisor = Supervisor::start(SupervisorConfig::from_config(&config));
        let protocol =
            SafetyProtocol::open(supervisor.clone(), self.path(), config, settings).unwrap();
        (Arc::new(protocol), supervisor)
    }
}
