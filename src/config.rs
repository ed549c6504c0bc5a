use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(4 * 60)
}

fn default_client_id() -> bytes::Bytes {
    bytes::Bytes::from_static(b"kpro_default")
}

/// Connection configuration. Every field is optional and defaults as documented.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    #[serde(with = "serde_bytes_str")]
    pub client_id: bytes::Bytes,

    /// If `true`, the connection's lifetime is not tied to the handle that created it.
    pub nolink: bool,

    pub tls: Tls,

    pub sasl: Sasl,

    pub debug: Debug,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            client_id: default_client_id(),
            nolink: false,
            tls: Tls::Off,
            sasl: Sasl::Off,
            debug: Debug::Off,
        }
    }
}

impl Config {
    /// Validate cross-field invariants not expressible via `serde` defaults alone.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout < Duration::from_secs(1) {
            return Err(Error::InvalidConfig(
                "request_timeout must be at least 1 second".into(),
            ));
        }
        Ok(())
    }

    /// `min(request_timeout / 2, 1 minute)`, per the liveness-tick cadence in §4.5.
    pub fn liveness_tick_interval(&self) -> Duration {
        std::cmp::min(self.request_timeout / 2, Duration::from_secs(60))
    }
}

/// TLS configuration for a connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tls {
    #[default]
    Off,
    /// TLS with the platform's default trust roots and no client certificate.
    On,
    /// TLS with explicit parameters.
    Explicit(TlsParams),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsParams {
    /// PEM-encoded CA certificate bundle to trust, in addition to the platform's defaults.
    pub ca_cert_path: Option<PathBuf>,
    /// PEM-encoded client certificate, for mutual TLS.
    pub client_cert_path: Option<PathBuf>,
    /// PEM-encoded client private key, for mutual TLS.
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification. Dangerous; intended for local testing only.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// SASL configuration for a connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sasl {
    #[default]
    Off,
    Plain(PlainSasl),
    Callback {
        module: String,
        #[serde(default)]
        opts: serde_json::Value,
    },
}

/// `SASL/PLAIN` credentials, supplied inline or via a credentials file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlainSasl {
    Inline { user: String, password: String },
    File { path: PathBuf },
}

impl PlainSasl {
    /// Resolve to `(user, password)`, reading the credentials file if necessary.
    ///
    /// File format (§6): two non-empty lines separated by `\n` — username then password.
    /// Empty lines are filtered before taking the first two.
    pub async fn resolve(&self) -> Result<(String, String)> {
        match self {
            PlainSasl::Inline { user, password } => Ok((user.clone(), password.clone())),
            PlainSasl::File { path } => {
                let contents = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| Error::InvalidConfig(format!("reading credentials file: {e}")))?;
                let mut lines = contents.lines().filter(|l| !l.is_empty());
                let user = lines.next().ok_or_else(|| {
                    Error::InvalidConfig("credentials file is missing a username line".into())
                })?;
                let password = lines.next().ok_or_else(|| {
                    Error::InvalidConfig("credentials file is missing a password line".into())
                })?;
                Ok((user.to_string(), password.to_string()))
            }
        }
    }
}

/// Per-connection debug tracing configuration (§4.5 item 6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Debug {
    #[default]
    Off,
    Stdout,
    File(PathBuf),
}

/// `serde(with = ...)` helper so `client_id` round-trips as a UTF-8 string in config files
/// while being stored as `Bytes` internally (the wire format is a binary string).
mod serde_bytes_str {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bytes::Bytes, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&String::from_utf8_lossy(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<bytes::Bytes, D::Error> {
        let s = String::deserialize(de)?;
        Ok(bytes::Bytes::from(s.into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(4 * 60));
        assert_eq!(&config.client_id[..], b"kpro_default");
        assert!(!config.nolink);
    }

    #[test]
    fn rejects_too_short_request_timeout() {
        let mut config = Config::default();
        config.request_timeout = Duration::from_millis(500);
        assert!(config.validate().is_err());
    }

    #[test]
    fn liveness_tick_caps_at_one_minute() {
        let mut config = Config::default();
        config.request_timeout = Duration::from_secs(60 * 60);
        assert_eq!(config.liveness_tick_interval(), Duration::from_secs(60));

        config.request_timeout = Duration::from_secs(10);
        assert_eq!(config.liveness_tick_interval(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn plain_sasl_file_filters_empty_lines() {
        let dir = tempdir();
        let path = dir.join("creds");
        tokio::fs::write(&path, "\n\nuser-1\n\npassword-1\n")
            .await
            .unwrap();

        let creds = PlainSasl::File { path };
        let (user, password) = creds.resolve().await.unwrap();
        assert_eq!(user, "user-1");
        assert_eq!(password, "password-1");
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kpro-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
