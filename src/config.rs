// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Server configuration.
//!
//! The configuration file is YAML:
//!
//! ```yaml
//! listen_address: "0.0.0.0:2222"   # or listen_port: 2222
//! host_key_path: /var/lib/tinyssh/host_key
//! shell: /bin/sh
//! users:
//!   - username: demo
//!     password: secret
//! ```
//!
//! Omitted values get defaults: the listen address falls back to
//! `":<listen_port>"` (or `":2222"`), the host key lives next to the
//! config file, and the shell comes from `$SHELL` or `/bin/sh`. A
//! relative `host_key_path` is resolved against the config file's
//! directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// An account allowed to log in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password: String,
}

/// Validated server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind string for the TCP listener. A bare `:port` is legal and
    /// binds all interfaces.
    #[serde(default)]
    pub listen_address: String,

    /// Shorthand for `listen_address: ":<port>"`; ignored when a full
    /// listen address is given.
    #[serde(default)]
    pub listen_port: u16,

    /// Where the host key is persisted (created on first run).
    #[serde(default)]
    pub host_key_path: PathBuf,

    /// Login shell spawned for sessions.
    #[serde(default)]
    pub shell: PathBuf,

    /// Accounts allowed to authenticate.
    #[serde(default)]
    pub users: Vec<User>,
}

impl Config {
    /// Read, default, and validate the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let mut config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse config: {}", path.display()))?;

        let config_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_defaults(config_dir);
        config.validate()?;
        Ok(config)
    }

    fn apply_defaults(&mut self, config_dir: &Path) {
        if self.listen_address.is_empty() {
            self.listen_address = if self.listen_port > 0 {
                format!(":{}", self.listen_port)
            } else {
                ":2222".to_string()
            };
        }

        if self.host_key_path.as_os_str().is_empty() {
            self.host_key_path = config_dir.join("tinyssh_host_key");
        } else if self.host_key_path.is_relative() {
            self.host_key_path = config_dir.join(&self.host_key_path);
        }

        if self.shell.as_os_str().is_empty() {
            self.shell = match std::env::var("SHELL") {
                Ok(shell) if !shell.is_empty() => PathBuf::from(shell),
                _ => PathBuf::from("/bin/sh"),
            };
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.users.is_empty() {
            anyhow::bail!("at least one user must be configured");
        }

        let mut seen = std::collections::HashSet::new();
        for user in &mut self.users {
            user.username = user.username.trim().to_string();
            if user.username.is_empty() {
                anyhow::bail!("user username cannot be empty");
            }
            if user.password.is_empty() {
                anyhow::bail!("user {} must have a password", user.username);
            }
            if !seen.insert(user.username.clone()) {
                anyhow::bail!("duplicate user {}", user.username);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, yaml: &str) -> PathBuf {
        let path = dir.join("tinyssh.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        path
    }

    const MINIMAL: &str = "users:\n  - username: demo\n    password: pw\n";

    #[test]
    fn test_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), MINIMAL);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.listen_address, ":2222");
        assert_eq!(config.host_key_path, dir.path().join("tinyssh_host_key"));
        assert!(!config.shell.as_os_str().is_empty());
    }

    #[test]
    fn test_listen_port_shorthand() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &format!("listen_port: 2022\n{MINIMAL}"));

        let config = Config::load(&path).unwrap();
        assert_eq!(config.listen_address, ":2022");
    }

    #[test]
    fn test_explicit_listen_address_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            &format!("listen_address: \"127.0.0.1:2200\"\nlisten_port: 9\n{MINIMAL}"),
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:2200");
    }

    #[test]
    fn test_relative_host_key_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &format!("host_key_path: keys/hk\n{MINIMAL}"));

        let config = Config::load(&path).unwrap();
        assert_eq!(config.host_key_path, dir.path().join("keys/hk"));
    }

    #[test]
    fn test_absolute_host_key_path_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            &format!("host_key_path: /etc/tinyssh/hk\n{MINIMAL}"),
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.host_key_path, PathBuf::from("/etc/tinyssh/hk"));
    }

    #[test]
    fn test_no_users_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "listen_port: 2222\n");

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("at least one user"));
    }

    #[test]
    fn test_empty_username_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "users:\n  - username: \"  \"\n    password: pw\n");

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("username cannot be empty"));
    }

    #[test]
    fn test_missing_password_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "users:\n  - username: demo\n    password: \"\"\n");

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("must have a password"));
    }

    #[test]
    fn test_duplicate_user_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "users:\n  - username: demo\n    password: a\n  - username: \" demo \"\n    password: b\n",
        );

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate user demo"));
    }

    #[test]
    fn test_usernames_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "users:\n  - username: \" demo \"\n    password: pw\n",
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.users[0].username, "demo");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(err.to_string().contains("read config"));
    }

    #[test]
    fn test_malformed_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "users: [not: {valid");

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("parse config"));
    }
}
