//! TLS material loading with certificate path policy
//!
//! Certificate, key and CA paths must be absolute, free of `..` components and
//! located under an allow-listed directory. The checks are purely lexical and
//! run before any file is opened.
//!
//! Verification can only be disabled through [`DevMode::Enabled`], which is
//! never the default.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Environment variable that switches on [`DevMode`]
pub const DEV_MODE_ENV: &str = "TUNLINK_DEV_MODE";

/// Default directories certificates and CA bundles may be loaded from
pub const DEFAULT_CERT_DIRS: &[&str] = &[
    "/etc/ssl/certs",
    "/etc/pki/tls/certs",
    "/usr/local/share/ca-certificates",
    "/etc/tunlink/certs",
];

/// Default directories private keys may be loaded from
pub const DEFAULT_KEY_DIRS: &[&str] = &[
    "/etc/ssl/private",
    "/etc/pki/tls/private",
    "/etc/tunlink/keys",
];

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Path policy violation for {path:?}: {reason}")]
    PathPolicy { path: PathBuf, reason: &'static str },

    #[error("Client certificate and key must be provided together")]
    IncompletePair,

    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid certificate in {path:?}: {reason}")]
    InvalidCertificate { path: PathBuf, reason: String },

    #[error("Invalid private key in {path:?}: {reason}")]
    InvalidKey { path: PathBuf, reason: String },

    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
}

/// Development-mode switch for certificate verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevMode {
    #[default]
    Disabled,
    /// Skip server certificate verification. Local development only.
    Enabled,
}

impl DevMode {
    /// Read [`DEV_MODE_ENV`]; only `1`, `true` or `yes` enable it
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(DEV_MODE_ENV).ok().as_deref())
    }

    fn from_env_value(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "1" || v == "true" || v == "yes" => DevMode::Enabled,
            _ => DevMode::Disabled,
        }
    }

    pub fn skips_verification(&self) -> bool {
        matches!(self, DevMode::Enabled)
    }
}

/// Allow-listed base directories for TLS files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPolicy {
    cert_dirs: Vec<PathBuf>,
    key_dirs: Vec<PathBuf>,
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self {
            cert_dirs: DEFAULT_CERT_DIRS.iter().map(PathBuf::from).collect(),
            key_dirs: DEFAULT_KEY_DIRS.iter().map(PathBuf::from).collect(),
        }
    }
}

impl PathPolicy {
    pub fn new(cert_dirs: Vec<PathBuf>, key_dirs: Vec<PathBuf>) -> Self {
        Self {
            cert_dirs,
            key_dirs,
        }
    }

    /// Check a certificate or CA bundle path
    pub fn resolve_cert(&self, path: &Path) -> Result<PathBuf, TlsError> {
        resolve_under(path, &self.cert_dirs)
    }

    /// Check a private key path
    pub fn resolve_key(&self, path: &Path) -> Result<PathBuf, TlsError> {
        resolve_under(path, &self.key_dirs)
    }

    /// Follow symlinks in an already resolved certificate path and check
    /// that the target is still under an allowed directory
    pub fn confirm_cert(&self, resolved: &Path) -> Result<PathBuf, TlsError> {
        confirm_under(resolved, &self.cert_dirs)
    }

    /// Same as [`PathPolicy::confirm_cert`], for private keys
    pub fn confirm_key(&self, resolved: &Path) -> Result<PathBuf, TlsError> {
        confirm_under(resolved, &self.key_dirs)
    }
}

fn resolve_under(path: &Path, allowed: &[PathBuf]) -> Result<PathBuf, TlsError> {
    let violation = |reason| TlsError::PathPolicy {
        path: path.to_path_buf(),
        reason,
    };

    if !path.is_absolute() {
        return Err(violation("path must be absolute"));
    }

    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(violation("path must not contain `..`"));
    }

    let normalized: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();

    let permitted = allowed
        .iter()
        .any(|dir| normalized.starts_with(dir) && normalized != *dir);
    if !permitted {
        return Err(violation("path is outside the allowed directories"));
    }

    Ok(normalized)
}

fn confirm_under(path: &Path, allowed: &[PathBuf]) -> Result<PathBuf, TlsError> {
    let real = std::fs::canonicalize(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let permitted = allowed.iter().any(|dir| {
        let dir = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.clone());
        real.starts_with(&dir) && real != dir
    });
    if !permitted {
        return Err(TlsError::PathPolicy {
            path: path.to_path_buf(),
            reason: "path resolves outside the allowed directories",
        });
    }

    Ok(real)
}

/// Requested TLS files, as configured
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    /// Never read from configuration files; see [`DevMode::from_env`]
    #[serde(skip)]
    pub dev_mode: DevMode,
}

/// Resolved TLS material and the client configuration built from it
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub insecure_skip_verify: bool,
    pub client_config: Arc<ClientConfig>,
}

/// Builds [`TlsMaterial`] under a [`PathPolicy`]
#[derive(Debug, Clone, Default)]
pub struct TlsMaterialLoader {
    policy: PathPolicy,
}

impl TlsMaterialLoader {
    pub fn new(policy: PathPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    pub fn load(&self, settings: &TlsSettings) -> Result<TlsMaterial, TlsError> {
        // Every path is checked before anything is read
        let identity_paths = match (&settings.cert_path, &settings.key_path) {
            (Some(cert), Some(key)) => {
                Some((self.policy.resolve_cert(cert)?, self.policy.resolve_key(key)?))
            }
            (None, None) => None,
            _ => return Err(TlsError::IncompletePair),
        };
        let ca_path = settings
            .ca_path
            .as_deref()
            .map(|ca| self.policy.resolve_cert(ca))
            .transpose()?;

        // Symlinks are only followed once the lexical checks have passed
        let identity_files = match &identity_paths {
            Some((cert, key)) => Some((
                self.policy.confirm_cert(cert)?,
                self.policy.confirm_key(key)?,
            )),
            None => None,
        };
        let ca_file = ca_path
            .as_deref()
            .map(|ca| self.policy.confirm_cert(ca))
            .transpose()?;

        ensure_crypto_provider();

        let roots = match &ca_file {
            Some(ca) => load_root_store(ca)?,
            None => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                roots
            }
        };

        let builder = ClientConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS13,
            &rustls::version::TLS12,
        ]);

        let insecure_skip_verify = settings.dev_mode.skips_verification();
        let builder = if insecure_skip_verify {
            warn!(
                "{} is set: server certificate verification is DISABLED",
                DEV_MODE_ENV
            );
            builder
                .dangerous()
                .with_custom_certificate_verifier(DevModeVerifier::new())
        } else {
            builder.with_root_certificates(roots)
        };

        let client_config = match &identity_files {
            Some((cert, key)) => {
                let certs = load_certs(cert)?;
                let key_der = load_private_key(key)?;
                builder.with_client_auth_cert(certs, key_der)?
            }
            None => builder.with_no_client_auth(),
        };

        debug!(
            "Built TLS client config (ca: {:?}, client cert: {})",
            ca_path,
            identity_paths.is_some()
        );

        let (cert_path, key_path) = identity_paths.unzip();
        Ok(TlsMaterial {
            cert_path,
            key_path,
            ca_path,
            insecure_skip_verify,
            client_config: Arc::new(client_config),
        })
    }
}

/// Build a TLS client configuration with the default path policy
pub fn build_tls_config(
    cert_path: Option<&Path>,
    key_path: Option<&Path>,
    ca_path: Option<&Path>,
) -> Result<TlsMaterial, TlsError> {
    TlsMaterialLoader::default().load(&TlsSettings {
        cert_path: cert_path.map(Path::to_path_buf),
        key_path: key_path.map(Path::to_path_buf),
        ca_path: ca_path.map(Path::to_path_buf),
        dev_mode: DevMode::Disabled,
    })
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring provider as the process default if none is installed yet
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("Rustls crypto provider already installed");
        }
    });
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let invalid = |reason: String| TlsError::InvalidCertificate {
        path: path.to_path_buf(),
        reason,
    };

    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid(e.to_string()))?;

    if certs.is_empty() {
        return Err(invalid("no PEM certificates found".to_string()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let invalid = |reason: String| TlsError::InvalidKey {
        path: path.to_path_buf(),
        reason,
    };

    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| invalid(e.to_string()))?
        .ok_or_else(|| invalid("no private key found".to_string()))
}

fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| TlsError::InvalidCertificate {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
    }
    Ok(roots)
}

/// Accepts any server certificate but still checks handshake signatures.
/// Only reachable through [`DevMode::Enabled`].
#[derive(Debug)]
struct DevModeVerifier {
    provider: Arc<CryptoProvider>,
}

impl DevModeVerifier {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }
}

impl ServerCertVerifier for DevModeVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_mode_parsing() {
        assert_eq!(DevMode::from_env_value(None), DevMode::Disabled);
        assert_eq!(DevMode::from_env_value(Some("")), DevMode::Disabled);
        assert_eq!(DevMode::from_env_value(Some("0")), DevMode::Disabled);
        assert_eq!(DevMode::from_env_value(Some("false")), DevMode::Disabled);
        assert_eq!(DevMode::from_env_value(Some("1")), DevMode::Enabled);
        assert_eq!(DevMode::from_env_value(Some(" TRUE ")), DevMode::Enabled);
        assert_eq!(DevMode::default(), DevMode::Disabled);
    }

    #[test]
    fn test_default_policy_accepts_allowed_dirs() {
        let policy = PathPolicy::default();
        assert_eq!(
            policy
                .resolve_cert(Path::new("/etc/ssl/certs/./ca.pem"))
                .unwrap(),
            PathBuf::from("/etc/ssl/certs/ca.pem")
        );
        assert!(policy
            .resolve_key(Path::new("/etc/tunlink/keys/client.key"))
            .is_ok());
    }

    #[test]
    fn test_policy_rejects_traversal() {
        let policy = PathPolicy::default();
        let err = policy
            .resolve_cert(Path::new("/etc/ssl/certs/../../shadow"))
            .unwrap_err();
        assert!(matches!(err, TlsError::PathPolicy { .. }));
    }

    #[test]
    fn test_policy_rejects_relative_and_foreign_paths() {
        let policy = PathPolicy::default();
        assert!(matches!(
            policy.resolve_cert(Path::new("certs/ca.pem")),
            Err(TlsError::PathPolicy { .. })
        ));
        assert!(matches!(
            policy.resolve_cert(Path::new("/home/user/ca.pem")),
            Err(TlsError::PathPolicy { .. })
        ));
        // the directory itself is not a file under it
        assert!(matches!(
            policy.resolve_cert(Path::new("/etc/ssl/certs")),
            Err(TlsError::PathPolicy { .. })
        ));
        // prefix match is per component, not per character
        assert!(matches!(
            policy.resolve_cert(Path::new("/etc/ssl/certs-evil/ca.pem")),
            Err(TlsError::PathPolicy { .. })
        ));
    }

    #[test]
    fn test_keys_are_checked_against_key_dirs() {
        let policy = PathPolicy::default();
        assert!(matches!(
            policy.resolve_key(Path::new("/etc/ssl/certs/client.key")),
            Err(TlsError::PathPolicy { .. })
        ));
    }
}
