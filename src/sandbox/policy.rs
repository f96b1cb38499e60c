//! Permission set and environment for an untrusted backend.

use std::path::Path;

use super::LaunchError;
use crate::config::RuntimeConfig;

pub const ENV_PORT: &str = "PORT";
pub const ENV_NWC_URL: &str = "NWC_URL";
pub const ENV_STORAGE_PATH: &str = "STORAGE_PATH";

/// Variables the untrusted code may read.
const GRANTED_ENV: [&str; 3] = [ENV_PORT, ENV_NWC_URL, ENV_STORAGE_PATH];

/// What a backend is allowed to do: open network sockets, read the three
/// granted variables, touch exactly one storage file, and stay under a heap
/// ceiling.
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    memory_mb: u64,
    passthrough_env: Vec<String>,
}

impl SandboxPolicy {
    pub fn from_config(runtime: &RuntimeConfig) -> Result<Self, LaunchError> {
        Ok(Self {
            memory_mb: parse_memory_limit(&runtime.memory)?,
            passthrough_env: runtime
                .passthrough_env
                .iter()
                .filter(|name| !GRANTED_ENV.contains(&name.as_str()))
                .cloned()
                .collect(),
        })
    }

    /// Runtime flags placed between the command prefix and the source file.
    pub fn permission_flags(&self, storage_path: &Path) -> Vec<String> {
        let storage = storage_path.display();
        let mb = self.memory_mb;
        vec![
            "--allow-net".to_string(),
            format!("--allow-env={}", GRANTED_ENV.join(",")),
            format!("--allow-read={storage}"),
            format!("--allow-write={storage}"),
            format!("--v8-flags=--max-heap-size={mb},--max-old-space-size={mb}"),
        ]
    }

    /// Complete child environment.
    ///
    /// Pass-through variables come from `lookup` and are only there for the
    /// runtime binary; the granted variables always win.
    pub fn child_env<F>(
        &self,
        port: u16,
        nwc_url: Option<&str>,
        storage_path: &Path,
        lookup: F,
    ) -> Vec<(String, String)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env: Vec<(String, String)> = self
            .passthrough_env
            .iter()
            .filter_map(|name| lookup(name).map(|value| (name.clone(), value)))
            .collect();

        env.push((ENV_PORT.to_string(), port.to_string()));
        if let Some(url) = nwc_url.filter(|url| !url.is_empty()) {
            env.push((ENV_NWC_URL.to_string(), url.to_string()));
        }
        env.push((
            ENV_STORAGE_PATH.to_string(),
            storage_path.display().to_string(),
        ));
        env
    }
}

/// Parse a memory limit like "32m" or "1g" into megabytes
pub fn parse_memory_limit(limit: &str) -> Result<u64, LaunchError> {
    let limit = limit.trim().to_lowercase();
    let invalid = || LaunchError::invalid_runtime(format!("Invalid memory limit: {limit}"));

    let megs = if let Some(num) = limit.strip_suffix('g') {
        num.parse::<u64>()
            .map_err(|_| invalid())?
            .checked_mul(1024)
            .ok_or_else(invalid)?
    } else if let Some(num) = limit.strip_suffix('m') {
        num.parse::<u64>().map_err(|_| invalid())?
    } else {
        limit.parse::<u64>().map_err(|_| invalid())?
    };

    if megs == 0 {
        return Err(invalid());
    }
    Ok(megs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn policy() -> SandboxPolicy {
        SandboxPolicy::from_config(&RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("32m").unwrap(), 32);
        assert_eq!(parse_memory_limit("1G").unwrap(), 1024);
        assert_eq!(parse_memory_limit("64").unwrap(), 64);
        assert!(parse_memory_limit("lots").is_err());
        assert!(parse_memory_limit("0m").is_err());
    }

    #[test]
    fn test_huge_memory_limit_is_rejected() {
        let err = parse_memory_limit(&format!("{}g", u64::MAX)).unwrap_err();
        assert!(err.to_string().contains("Invalid memory limit"));
        assert_eq!(
            parse_memory_limit(&format!("{}g", u64::MAX / 1024)).unwrap(),
            u64::MAX / 1024 * 1024
        );
    }

    #[test]
    fn test_permission_flags() {
        let storage = PathBuf::from("/work/apps/a1/storage.json");
        let flags = policy().permission_flags(&storage);
        assert_eq!(
            flags,
            vec![
                "--allow-net",
                "--allow-env=PORT,NWC_URL,STORAGE_PATH",
                "--allow-read=/work/apps/a1/storage.json",
                "--allow-write=/work/apps/a1/storage.json",
                "--v8-flags=--max-heap-size=32,--max-old-space-size=32",
            ]
        );
    }

    #[test]
    fn test_child_env_only_carries_granted_and_passthrough() {
        let host: HashMap<&str, &str> = [
            ("PATH", "/usr/bin"),
            ("HOME", "/home/svc"),
            ("DATABASE_URL", "postgres://secret"),
        ]
        .into_iter()
        .collect();

        let env = policy().child_env(
            9001,
            Some("nostr+walletconnect://w"),
            Path::new("/s/storage.json"),
            |name| host.get(name).map(ToString::to_string),
        );
        let env: HashMap<_, _> = env.into_iter().collect();

        assert_eq!(env.get("PORT").map(String::as_str), Some("9001"));
        assert_eq!(
            env.get("NWC_URL").map(String::as_str),
            Some("nostr+walletconnect://w")
        );
        assert_eq!(
            env.get("STORAGE_PATH").map(String::as_str),
            Some("/s/storage.json")
        );
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert!(!env.contains_key("DATABASE_URL"));
        // DENO_DIR is configured but unset on the host
        assert!(!env.contains_key("DENO_DIR"));
    }

    #[test]
    fn test_granted_names_cannot_be_passed_through() {
        let runtime = RuntimeConfig {
            passthrough_env: vec!["PORT".to_string(), "PATH".to_string()],
            ..RuntimeConfig::default()
        };
        let policy = SandboxPolicy::from_config(&runtime).unwrap();
        let env = policy.child_env(9000, None, Path::new("/s"), |_| Some("host".to_string()));

        let ports: Vec<_> = env.iter().filter(|(k, _)| k == "PORT").collect();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].1, "9000");
        assert!(!env.iter().any(|(k, _)| k == "NWC_URL"));
    }
}
