//! Materializes untrusted backend source and spawns it under the sandbox
//! policy.
//!
//! The spawned command line has a fixed shape:
//! ```bash
//! deno run --allow-net --allow-env=PORT,NWC_URL,STORAGE_PATH \
//!     --allow-read=<storage> --allow-write=<storage> \
//!     --v8-flags=--max-heap-size=32,--max-old-space-size=32 <source file>
//! ```

use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{LaunchError, PortAllocator, SandboxPolicy};
use crate::config::{Config, PathsConfig};
use crate::store::AppId;

/// Prefix generated code uses for routes that are reached through the proxy.
const PROXY_PREFIX: &str = "/PROXY/";

/// Inputs for a single spawn
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub app_id: &'a AppId,
    pub source_code: &'a str,
    pub nwc_url: Option<&'a str>,
}

/// A freshly spawned backend. The caller takes ownership of the child.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub child: Child,
    pub pid: Option<u32>,
    pub port: u16,
    pub source_path: PathBuf,
    pub storage_path: PathBuf,
}

#[derive(Debug)]
pub struct Launcher {
    program: String,
    base_args: Vec<String>,
    policy: SandboxPolicy,
    paths: PathsConfig,
    ports: PortAllocator,
}

impl Launcher {
    pub fn from_config(config: &Config) -> Result<Self, LaunchError> {
        let (program, base_args) = config
            .runtime
            .program_and_args()
            .map_err(|e| LaunchError::invalid_runtime(e.to_string()))?;

        Ok(Self {
            program,
            base_args,
            policy: SandboxPolicy::from_config(&config.runtime)?,
            paths: config.paths.clone(),
            ports: PortAllocator::new(&config.ports),
        })
    }

    pub fn storage_path(&self, app_id: &AppId) -> PathBuf {
        self.paths.storage_path(app_id)
    }

    /// Write the source, prepare storage, pick a port and spawn.
    ///
    /// On any failure after the source file was written, the file is removed
    /// again before the error is returned.
    pub async fn launch(&self, request: LaunchRequest<'_>) -> Result<LaunchedProcess, LaunchError> {
        let source_path = self.materialize(request.app_id, request.source_code).await?;

        match self.spawn_materialized(request, &source_path).await {
            Ok((child, port, storage_path)) => Ok(LaunchedProcess {
                pid: child.id(),
                child,
                port,
                source_path,
                storage_path,
            }),
            Err(e) => {
                remove_artifact(&source_path).await;
                Err(e)
            }
        }
    }

    async fn materialize(&self, app_id: &AppId, source_code: &str) -> Result<PathBuf, LaunchError> {
        let scratch = self.paths.scratch_dir();
        fs::create_dir_all(&scratch)
            .await
            .map_err(|e| LaunchError::materialize(&scratch, e))?;

        let path = scratch.join(artifact_name(app_id));
        fs::write(&path, rewrite_proxy_prefix(source_code))
            .await
            .map_err(|e| LaunchError::materialize(&path, e))?;

        debug!(app_id = %app_id, path = %path.display(), "Backend source materialized");
        Ok(path)
    }

    async fn spawn_materialized(
        &self,
        request: LaunchRequest<'_>,
        source_path: &Path,
    ) -> Result<(Child, u16, PathBuf), LaunchError> {
        let storage_dir = self.paths.storage_dir(request.app_id);
        fs::create_dir_all(&storage_dir)
            .await
            .map_err(|e| LaunchError::storage(&storage_dir, e))?;
        let storage_path = self.paths.storage_path(request.app_id);

        let port = self.ports.next_port()?;

        let mut command = self.build_command(port, request.nwc_url, &storage_path, source_path);
        info!(
            app_id = %request.app_id,
            port,
            program = %self.program,
            "Spawning backend runtime"
        );

        let child = command
            .spawn()
            .map_err(|e| LaunchError::spawn_failed(&self.program, e))?;

        Ok((child, port, storage_path))
    }

    fn build_command(
        &self,
        port: u16,
        nwc_url: Option<&str>,
        storage_path: &Path,
        source_path: &Path,
    ) -> Command {
        let env = self
            .policy
            .child_env(port, nwc_url, storage_path, |name| std::env::var(name).ok());

        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .args(self.policy.permission_flags(storage_path))
            .arg(source_path)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// Delete a materialized source file; a missing file is fine.
pub async fn remove_artifact(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed backend source"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove backend source"),
    }
}

fn artifact_name(app_id: &AppId) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "app_{app_id}_{}_{}.ts",
        Utc::now().timestamp_millis(),
        &nonce[..8]
    )
}

/// Generated code addresses proxied routes as `/PROXY/...`; inside the
/// process they are served from the root.
pub fn rewrite_proxy_prefix(source: &str) -> String {
    source.replace(PROXY_PREFIX, "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{app_id, files_in, TestEnv, CRASHING_BACKEND};
    use std::ffi::OsStr;

    #[test]
    fn test_rewrite_proxy_prefix() {
        let source = "app.get('/PROXY/items', h); fetch('/PROXY/PROXY/x')";
        assert_eq!(
            rewrite_proxy_prefix(source),
            "app.get('/items', h); fetch('/PROXY/x')"
        );
        assert_eq!(rewrite_proxy_prefix("/api/PROXY"), "/api/PROXY");
    }

    #[test]
    fn test_artifact_name_is_unique() {
        let id = app_id("app-7");
        let a = artifact_name(&id);
        let b = artifact_name(&id);
        assert!(a.starts_with("app_app-7_"));
        assert!(Path::new(&a).extension() == Some(OsStr::new("ts")));
        assert_ne!(a, b);
    }

    #[test]
    fn test_command_shape() {
        let mut config = Config::default();
        config.paths.work_dir = PathBuf::from("/work");
        let launcher = Launcher::from_config(&config).unwrap();
        let storage = launcher.storage_path(&app_id("a1"));

        let command = launcher.build_command(
            9005,
            None,
            &storage,
            Path::new("/tmp/lnfly_deno_apps/app_a1.ts"),
        );
        let std = command.as_std();
        assert_eq!(std.get_program(), OsStr::new("deno"));

        let args: Vec<_> = std.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "run",
                "--allow-net",
                "--allow-env=PORT,NWC_URL,STORAGE_PATH",
                "--allow-read=/work/apps/a1/storage.json",
                "--allow-write=/work/apps/a1/storage.json",
                "--v8-flags=--max-heap-size=32,--max-old-space-size=32",
                "/tmp/lnfly_deno_apps/app_a1.ts",
            ]
        );

        let envs: Vec<_> = std
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_str()?.to_string(), v?.to_str()?.to_string())))
            .collect();
        assert!(envs.contains(&("PORT".to_string(), "9005".to_string())));
        assert!(envs.contains(&(
            "STORAGE_PATH".to_string(),
            "/work/apps/a1/storage.json".to_string()
        )));
        assert!(!envs.iter().any(|(k, _)| k == "NWC_URL"));
    }

    #[test]
    fn test_invalid_memory_limit_rejected() {
        let mut config = Config::default();
        config.runtime.memory = "huge".to_string();
        let err = Launcher::from_config(&config).unwrap_err();
        assert!(matches!(err, LaunchError::InvalidRuntime { .. }));
    }

    #[tokio::test]
    async fn test_launch_materializes_and_spawns() {
        let env = TestEnv::new();
        let launcher = Launcher::from_config(&env.config).unwrap();
        let id = app_id("spawn-ok");

        let mut launched = launcher
            .launch(LaunchRequest {
                app_id: &id,
                source_code: "fetch('/PROXY/x')\nexit 0\n",
                nwc_url: Some("nostr+walletconnect://w"),
            })
            .await
            .unwrap();

        assert_eq!(launched.port, 9000);
        assert!(launched.pid.is_some());
        let written = std::fs::read_to_string(&launched.source_path).unwrap();
        assert!(written.contains("fetch('/x')"));
        assert!(launched.storage_path.parent().unwrap().is_dir());
        // Storage file itself is left to the backend
        assert!(!launched.storage_path.exists());

        launched.child.wait().await.unwrap();
        remove_artifact(&launched.source_path).await;
        assert!(files_in(&env.scratch_dir()).is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_removes_source() {
        let mut env = TestEnv::new();
        env.config.runtime.command = "/nonexistent/deno run".to_string();
        let launcher = Launcher::from_config(&env.config).unwrap();
        let id = app_id("spawn-fail");

        let err = launcher
            .launch(LaunchRequest {
                app_id: &id,
                source_code: CRASHING_BACKEND,
                nwc_url: None,
            })
            .await
            .unwrap_err();

        assert!(err.is_spawn_failure());
        assert!(files_in(&env.scratch_dir()).is_empty());
    }

    #[tokio::test]
    async fn test_remove_artifact_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        remove_artifact(&dir.path().join("gone.ts")).await;
    }
}
