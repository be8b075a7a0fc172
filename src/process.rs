//! Process Runner
//!
//! Builds the execution environment for external tools and spawns them with piped stdio.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

use tokio::process::{Child, Command};

use crate::config::SupervisorConfig;
use crate::errors::{Result, SupervisorError};

/// How a process is launched.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Exported to the child as `DEBUG=1` / `DEBUG=0`.
    pub debug: bool,
    /// Prepended to `PATH` on Linux.
    pub extra_paths: Vec<PathBuf>,
    /// Resolve the executable through `sh -c`. On by default on Linux only.
    pub shell: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            debug: false,
            extra_paths: Vec::new(),
            shell: cfg!(target_os = "linux"),
        }
    }
}

impl ProcessOptions {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            debug: config.debug,
            extra_paths: config.extra_paths.clone(),
            ..Self::default()
        }
    }

    /// Variables added on top of the inherited host environment.
    pub fn env_overrides(&self) -> Vec<(String, OsString)> {
        let mut env: Vec<(String, OsString)> = vec![
            ("PYTHONIOENCODING".to_string(), "utf-8".into()),
            ("LANG".to_string(), "en_US.UTF-8".into()),
            ("LC_ALL".to_string(), "en_US.UTF-8".into()),
            ("FORCE_COLOR".to_string(), "0".into()),
            (
                "DEBUG".to_string(),
                if self.debug { "1" } else { "0" }.into(),
            ),
        ];

        if cfg!(target_os = "linux") {
            if let Some(path) = self.augmented_path() {
                env.push(("PATH".to_string(), path));
            }
        }

        env
    }

    /// `extra_paths` followed by the host `PATH`.
    fn augmented_path(&self) -> Option<OsString> {
        let host = std::env::var_os("PATH").unwrap_or_default();
        let joined = std::env::join_paths(
            self.extra_paths
                .iter()
                .cloned()
                .chain(std::env::split_paths(&host)),
        );
        match joined {
            Ok(path) => Some(path),
            Err(e) => {
                log::warn!("Could not extend PATH: {}", e);
                None
            }
        }
    }
}

/// Appends `.exe` on Windows when missing.
pub fn normalize_executable(name: &str) -> String {
    with_exe_suffix(name, cfg!(windows))
}

fn with_exe_suffix(name: &str, windows: bool) -> String {
    if windows && !name.ends_with(".exe") {
        format!("{}.exe", name)
    } else {
        name.to_string()
    }
}

/// POSIX single-quote escaping for `sh -c`.
fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Build the command without spawning it.
pub fn build_command(executable: &str, args: &[String], opts: &ProcessOptions) -> Command {
    let executable = normalize_executable(executable);

    let mut cmd = if opts.shell {
        // `exec` so that killing the handle kills the tool, not just the shell
        let line = std::iter::once(executable.as_str())
            .chain(args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("exec {}", line));
        cmd
    } else {
        let mut cmd = Command::new(&executable);
        cmd.args(args);
        cmd
    };

    cmd.envs(opts.env_overrides())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Hide console window on Windows
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    cmd
}

/// Spawn `executable` with `args`. Failure is not retried.
pub fn spawn(executable: &str, args: &[String], opts: &ProcessOptions) -> Result<Child> {
    log::info!(
        "Spawning process: {} {:?} (shell: {})",
        executable,
        args,
        opts.shell
    );

    let child = build_command(executable, args, opts).spawn().map_err(|e| {
        log::error!("Failed to spawn {}: {}", executable, e);
        SupervisorError::SpawnFailed(e.to_string())
    })?;

    log::info!("Process spawned successfully. PID: {:?}", child.id());
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_exe_suffix() {
        assert_eq!(with_exe_suffix("custom_rip", true), "custom_rip.exe");
        assert_eq!(with_exe_suffix("custom_rip.exe", true), "custom_rip.exe");
        assert_eq!(with_exe_suffix("custom_rip", false), "custom_rip");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("url"), "url");
        assert_eq!(shell_quote("https://x.y/a?b=c&d"), "'https://x.y/a?b=c&d'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_env_overrides() {
        let opts = ProcessOptions {
            debug: true,
            extra_paths: vec![PathBuf::from("/opt/rip/bin")],
            shell: false,
        };
        let env = opts.env_overrides();
        let get = |k: &str| env.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());
        assert_eq!(get("PYTHONIOENCODING"), Some("utf-8".into()));
        assert_eq!(get("FORCE_COLOR"), Some("0".into()));
        assert_eq!(get("DEBUG"), Some("1".into()));

        if cfg!(target_os = "linux") {
            let path = get("PATH").unwrap();
            assert!(path.to_string_lossy().starts_with("/opt/rip/bin"));
        }
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let opts = ProcessOptions {
            shell: false,
            ..ProcessOptions::default()
        };
        let err = spawn("definitely-not-a-real-binary-4821", &[], &opts).unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_mode_passes_args_verbatim() {
        let opts = ProcessOptions {
            shell: true,
            ..ProcessOptions::default()
        };
        let args = vec!["a b".to_string(), "it's".to_string(), "$HOME".to_string()];
        let mut child = spawn("printf", &[vec!["%s|".to_string()], args].concat(), &opts).unwrap();
        let mut out = String::new();
        child
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert!(child.wait().await.unwrap().success());
        assert_eq!(out, "a b|it's|$HOME|");
    }
}
