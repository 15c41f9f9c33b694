//! Script-backed activities.
//!
//! Each file in the activities directory whose stem is a valid activity
//! name becomes an activity: `charge_card.sh` runs under bash,
//! `charge_card.py` under python3, and an extensionless executable runs
//! directly. The activity's trimmed stdout is its output; a non-zero exit
//! fails it with stderr as the message.
//!
//! Timeouts are applied by the invoker, which drops the call future; the
//! child is spawned with `kill_on_drop` so an abandoned attempt does not
//! outlive it.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use localflow_core::activity::{ActivityHandler, ActivityRegistry};

/// Environment variable carrying the activity name into the script.
pub const ACTIVITY_NAME_ENV: &str = "LOCALFLOW_ACTIVITY";

/// Runs one script per call.
#[derive(Debug, Clone)]
pub struct ProcessActivity {
    script: PathBuf,
}

impl ProcessActivity {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
        }
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    /// Interpreter (if any) for the script, chosen by extension.
    fn command(&self) -> tokio::process::Command {
        match self.script.extension().and_then(|ext| ext.to_str()) {
            Some("sh") => {
                let mut cmd = tokio::process::Command::new("bash");
                cmd.arg(&self.script);
                cmd
            }
            Some("py") => {
                let mut cmd = tokio::process::Command::new("python3");
                cmd.arg(&self.script);
                cmd
            }
            _ => tokio::process::Command::new(&self.script),
        }
    }

    async fn run(&self, name: &str) -> Result<String, String> {
        let mut cmd = self.command();
        cmd.env(ACTIVITY_NAME_ENV, name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.script.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {e}", self.script.display()))?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| format!("failed to wait for {}: {e}", self.script.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "activity '{name}' exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }

        String::from_utf8(output.stdout)
            .map(|s| s.trim().to_string())
            .map_err(|_| format!("activity '{name}' output is not valid UTF-8"))
    }
}

impl ActivityHandler for ProcessActivity {
    fn call<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>> {
        Box::pin(self.run(name))
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Find activity scripts in `dir`, sorted by activity name.
///
/// A missing directory yields no activities.
pub async fn discover_activities(dir: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let Some(name) = activity_name(&path) else {
            continue;
        };
        if is_runnable(&path).await {
            found.push((name, path));
        } else {
            tracing::debug!(path = %path.display(), "skipping non-executable file");
        }
    }
    found.sort();
    Ok(found)
}

/// Register every script in `dir` with `registry`. Returns how many.
pub async fn register_process_activities(
    registry: &mut ActivityRegistry,
    dir: &Path,
) -> std::io::Result<usize> {
    let scripts = discover_activities(dir).await?;
    let count = scripts.len();
    for (name, path) in scripts {
        tracing::debug!(activity = %name, script = %path.display(), "registering script activity");
        registry.register(name, ProcessActivity::new(path));
    }
    Ok(count)
}

fn activity_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let valid = !stem.is_empty()
        && !stem.starts_with('.')
        && stem.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    valid.then(|| stem.to_string())
}

async fn is_runnable(path: &Path) -> bool {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("sh") | Some("py") => true,
        Some(_) => false,
        None => is_executable(path).await,
    }
}

#[cfg(unix)]
async fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::metadata(path)
        .await
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
async fn is_executable(_path: &Path) -> bool {
    false
}
