//! Script plugins — out-of-process tools loaded at runtime.
//!
//! Each plugin lives in its own subdirectory of the plugins directory:
//!
//! ```text
//! plugins/
//!   dice/
//!     tool.toml   ← manifest (name, description, run config)
//!     roll.py     ← entry point (any language)
//! ```
//!
//! ## Execution contract
//!
//! - The tool input arrives in the `BEIGEBOX_INPUT` env variable.
//! - The script writes its result to **stdout**.
//! - Exit code 0 = success; non-zero becomes an `Error: …` result with
//!   stderr appended.
//! - Default timeout 30 seconds, overridable per plugin.
//!
//! ## Manifest (`tool.toml`)
//!
//! ```toml
//! name        = "dice"
//! description = "Roll dice, e.g. '3d6'"
//!
//! [run]
//! command = "python3"
//! script  = "roll.py"
//! timeout = 30
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::Tool;

#[derive(Debug, Deserialize)]
struct PluginManifest {
    name: String,
    #[serde(default)]
    description: String,
    run: RunConfig,
}

#[derive(Debug, Deserialize)]
struct RunConfig {
    /// Interpreter: "python3", "bash", "node", …
    command: String,
    /// Entry point, relative to the plugin directory.
    script: String,
    #[serde(default = "default_timeout")]
    timeout: u64,
}

fn default_timeout() -> u64 {
    30
}

/// One plugin loaded from a `tool.toml` manifest.
pub struct ScriptTool {
    manifest: PluginManifest,
    dir: PathBuf,
}

impl ScriptTool {
    fn load(dir: &Path) -> Option<Self> {
        let manifest_path = dir.join("tool.toml");
        let content = std::fs::read_to_string(&manifest_path)
            .map_err(|e| warn!(path = %manifest_path.display(), err = %e, "cannot read tool.toml"))
            .ok()?;
        let manifest: PluginManifest = toml::from_str(&content)
            .map_err(|e| warn!(path = %manifest_path.display(), err = %e, "invalid tool.toml"))
            .ok()?;
        Some(Self { manifest, dir: dir.to_path_buf() })
    }
}

#[async_trait]
impl Tool for ScriptTool {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn description(&self) -> &str {
        if self.manifest.description.is_empty() {
            "Script plugin"
        } else {
            &self.manifest.description
        }
    }

    async fn run(&self, input: &str) -> String {
        let script_path = self.dir.join(&self.manifest.run.script);
        let run = tokio::process::Command::new(&self.manifest.run.command)
            .arg(&script_path)
            .env("BEIGEBOX_INPUT", input)
            .current_dir(&self.dir)
            .output();

        let timeout = std::time::Duration::from_secs(self.manifest.run.timeout);
        match tokio::time::timeout(timeout, run).await {
            Err(_) => format!(
                "Error: plugin '{}' timed out after {}s",
                self.manifest.name, self.manifest.run.timeout
            ),
            Ok(Err(e)) => format!("Error: failed to launch plugin '{}': {e}", self.manifest.name),
            Ok(Ok(out)) => {
                let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
                let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
                if out.status.success() {
                    if stdout.is_empty() {
                        "(no output)".to_string()
                    } else {
                        stdout
                    }
                } else {
                    let mut msg = format!("Error: plugin '{}' failed", self.manifest.name);
                    if !stdout.is_empty() {
                        msg.push_str(&format!("\n{stdout}"));
                    }
                    if !stderr.is_empty() {
                        msg.push_str(&format!("\n[stderr]: {stderr}"));
                    }
                    msg.push_str(&format!("\n[exit: {}]", out.status.code().unwrap_or(-1)));
                    msg
                }
            }
        }
    }
}

/// Scan the plugins directory and load every enabled plugin. Missing
/// directory means no plugins; broken manifests are skipped with a log
/// line. `disabled` holds plugin names switched off in config (absent =
/// enabled).
pub fn load_script_tools(plugins_dir: &Path, disabled: &[String]) -> Vec<Arc<dyn Tool>> {
    let mut tools: Vec<Arc<dyn Tool>> = Vec::new();

    let entries = match std::fs::read_dir(plugins_dir) {
        Ok(e) => e,
        Err(_) => return tools,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || !path.join("tool.toml").exists() {
            continue;
        }
        match ScriptTool::load(&path) {
            Some(tool) => {
                if disabled.iter().any(|d| d == tool.name()) {
                    info!(name = tool.name(), "plugin disabled in config, skipped");
                    continue;
                }
                info!(name = tool.name(), dir = %path.display(), "script plugin loaded");
                tools.push(Arc::new(tool));
            }
            None => warn!(dir = %path.display(), "skipped plugin: invalid tool.toml"),
        }
    }

    tools
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_plugin(dir: &Path, name: &str, manifest: &str, script: &str) {
        let plugin_dir = dir.join(name);
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(plugin_dir.join("tool.toml"), manifest).unwrap();
        std::fs::write(plugin_dir.join("run.sh"), script).unwrap();
    }

    #[tokio::test]
    async fn plugin_runs_and_returns_stdout() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "echo",
            "name = \"echo\"\ndescription = \"echo input\"\n[run]\ncommand = \"sh\"\nscript = \"run.sh\"\n",
            "printf 'got: %s' \"$BEIGEBOX_INPUT\"\n",
        );

        let tools = load_script_tools(dir.path(), &[]);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name(), "echo");
        assert_eq!(tools[0].run("hello").await, "got: hello");
    }

    #[tokio::test]
    async fn failing_plugin_reports_error_string() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "broken",
            "name = \"broken\"\n[run]\ncommand = \"sh\"\nscript = \"run.sh\"\n",
            "echo 'boom' >&2\nexit 3\n",
        );

        let tools = load_script_tools(dir.path(), &[]);
        let out = tools[0].run("x").await;
        assert!(out.starts_with("Error:"));
        assert!(out.contains("boom"));
        assert!(out.contains("[exit: 3]"));
    }

    #[test]
    fn disabled_and_broken_plugins_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "off",
            "name = \"off\"\n[run]\ncommand = \"sh\"\nscript = \"run.sh\"\n",
            "true\n",
        );
        // Broken manifest: missing [run] table
        let broken = dir.path().join("bad");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join("tool.toml"), "name = \"bad\"\n").unwrap();

        let tools = load_script_tools(dir.path(), &["off".to_string()]);
        assert!(tools.is_empty());
    }

    #[test]
    fn missing_plugins_dir_is_fine() {
        assert!(load_script_tools(Path::new("/definitely/not/here"), &[]).is_empty());
    }
}
