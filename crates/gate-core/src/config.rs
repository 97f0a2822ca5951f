use crate::access::CookieTransport;
use crate::rate::RateLimitOptions;
use crate::store::StoreConfig;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessConfig {
    pub backend_url: String,
    pub cookie_name: String,
    #[serde(default)]
    pub transport: CookieTransport,
    #[serde(default = "default_access_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_access_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GateConfig {
    pub rate: RateLimitOptions,
    pub store: StoreConfig,
    pub access: Option<AccessConfig>,
}

impl GateConfig {
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).context("read config")?;
        let parsed = toml::from_str::<GateConfig>(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.rate.validate()?;
        if let Some(access) = &self.access {
            if access.backend_url.trim().is_empty() {
                bail!("access.backend_url must not be empty");
            }
            if access.cookie_name.trim().is_empty() {
                bail!("access.cookie_name must not be empty");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_default() {
        let dir = tempdir().unwrap();
        let cfg = GateConfig::load(&dir.path().join("gate.toml")).unwrap();
        assert_eq!(cfg, GateConfig::default());
        assert_eq!(cfg.rate.window, 60);
        assert_eq!(cfg.store.port, 6379);
    }

    #[test]
    fn full_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gate.toml");
        std::fs::write(
            &path,
            r#"
[rate]
limit = 2
window = 10
trust_proxy = true

[store]
host = "cache.internal"
password = "pw"

[access]
backend_url = "http://auth.internal/verify"
cookie_name = "session"
transport = "split_headers"
"#,
        )
        .unwrap();

        let cfg = GateConfig::load(&path).unwrap();
        assert_eq!(cfg.rate.limit, 2);
        assert!(cfg.rate.trust_proxy);
        assert_eq!(cfg.rate.timeout_ms, 2000);
        assert_eq!(cfg.store.host, "cache.internal");
        assert_eq!(cfg.store.port, 6379);
        assert_eq!(cfg.store.password.as_deref(), Some("pw"));
        assert_eq!(cfg.store.url, None);
        let access = cfg.access.unwrap();
        assert_eq!(access.transport, CookieTransport::SplitHeaders);
        assert_eq!(access.timeout_ms, 5000);
    }

    #[test]
    fn invalid_limit_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gate.toml");
        std::fs::write(&path, "[rate]\nlimit = 0\n").unwrap();
        assert!(GateConfig::load(&path).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gate.toml");
        std::fs::write(&path, "rate = [").unwrap();
        let err = GateConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parse config"));
    }
}
