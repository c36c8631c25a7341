//! Broker endpoint and TLS material

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::{TransportError, TransportResult};
use crate::config::BrokerConfig;

/// Paths of the mutual-TLS files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Contents of the mutual-TLS files
pub struct TlsMaterial {
    pub ca: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

/// Everything needed to open a broker session
#[derive(Debug, Clone)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// `None` means plain TCP
    pub tls: Option<TlsFiles>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl Credentials {
    pub fn from_config(config: &BrokerConfig) -> Self {
        let tls = config.tls.then(|| TlsFiles {
            ca: PathBuf::from(&config.ca_file),
            cert: PathBuf::from(&config.cert_file),
            key: PathBuf::from(&config.key_file),
        });

        Self {
            host: config.host.clone(),
            port: config.port,
            client_id: config.client_id.clone(),
            tls,
            username: config.username.clone(),
            password: config.password.clone(),
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }

    /// Plain endpoint without TLS, for local brokers and tests
    pub fn plain(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            tls: None,
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Check that every TLS file exists and is readable
    pub fn verify(&self) -> TransportResult<()> {
        if let Some(files) = &self.tls {
            for path in [&files.ca, &files.cert, &files.key] {
                check_readable(path)?;
            }
            tracing::debug!(ca = ?files.ca, cert = ?files.cert, "TLS material verified");
        }
        Ok(())
    }

    /// Read the TLS files, `None` for plain sessions
    pub fn load_tls(&self) -> TransportResult<Option<TlsMaterial>> {
        let Some(files) = &self.tls else {
            return Ok(None);
        };

        Ok(Some(TlsMaterial {
            ca: read_file(&files.ca)?,
            cert: read_file(&files.cert)?,
            key: read_file(&files.key)?,
        }))
    }
}

fn check_readable(path: &Path) -> TransportResult<()> {
    let metadata = std::fs::metadata(path).map_err(|e| credentials_error(path, e))?;
    if !metadata.is_file() {
        return Err(TransportError::Credentials {
            path: path.to_path_buf(),
            reason: "not a regular file".to_string(),
        });
    }
    std::fs::File::open(path).map_err(|e| credentials_error(path, e))?;
    Ok(())
}

fn read_file(path: &Path) -> TransportResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| credentials_error(path, e))
}

fn credentials_error(path: &Path, err: std::io::Error) -> TransportError {
    TransportError::Credentials {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_tls_files(dir: &Path) -> BrokerConfig {
        for name in ["ca.pem", "client.crt", "client.key"] {
            std::fs::write(dir.join(name), b"-----BEGIN TEST-----").unwrap();
        }
        BrokerConfig {
            ca_file: dir.join("ca.pem").to_string_lossy().to_string(),
            cert_file: dir.join("client.crt").to_string_lossy().to_string(),
            key_file: dir.join("client.key").to_string_lossy().to_string(),
            ..BrokerConfig::default()
        }
    }

    #[test]
    fn test_verify_present_files() {
        let dir = TempDir::new().unwrap();
        let credentials = Credentials::from_config(&write_tls_files(dir.path()));

        credentials.verify().unwrap();
        let material = credentials.load_tls().unwrap().unwrap();
        assert_eq!(material.ca, b"-----BEGIN TEST-----");
    }

    #[test]
    fn test_verify_names_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = write_tls_files(dir.path());
        std::fs::remove_file(dir.path().join("client.key")).unwrap();

        let err = Credentials::from_config(&config).verify().unwrap_err();
        match err {
            TransportError::Credentials { path, .. } => {
                assert_eq!(path, dir.path().join("client.key"));
            }
            other => panic!("Expected Credentials error, got {other:?}"),
        }
    }

    #[test]
    fn test_plain_session_skips_tls() {
        let credentials = Credentials::plain("localhost", 1883, "test");
        credentials.verify().unwrap();
        assert!(credentials.load_tls().unwrap().is_none());
    }

    #[test]
    fn test_from_config_durations() {
        let config = BrokerConfig {
            tls: false,
            ..BrokerConfig::default()
        };
        let credentials = Credentials::from_config(&config);
        assert!(credentials.tls.is_none());
        assert_eq!(credentials.keep_alive, Duration::from_secs(60));
        assert_eq!(credentials.connect_timeout, Duration::from_secs(30));
    }
}
