use std::num::NonZeroUsize;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use lru::LruCache;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;

use crate::error::ProxyCacheError;

const CA_CERT_FILENAME: &str = "mitmproxy-ca-cert.pem";
const CA_KEY_FILENAME: &str = "mitmproxy-ca-key.pem";

const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60); /* ~10 years */
const LEAF_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60); /* ~1 year */

const LEAF_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(256) {
    Some(v) => v,
    None => panic!("capacity is zero"),
};

/// Host used when a TLS client sends no server name.
const FALLBACK_SERVER_NAME: &str = "localhost";

/// Persistent root CA plus on-demand, memoized per-host leaf certificates.
///
/// The CA pair lives as PEM files in a well-known directory so the operator
/// can install the certificate as a trust anchor. Leaves are minted signed
/// by that root, with the host in the SAN, and cached for the process
/// lifetime.
pub(crate) struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    cert_path: PathBuf,
    serial: AtomicU64,
    leaves: Mutex<LruCache<String, Arc<CertifiedKey>>>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_path", &self.cert_path)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Directory beside the user's home holding the trust-anchor files.
    #[must_use]
    pub(crate) fn default_directory() -> Option<PathBuf> {
        directories::UserDirs::new().map(|dirs| dirs.home_dir().join(".mitmproxy"))
    }

    /// Loads the persisted CA pair, or generates and persists a fresh one.
    /// A partially readable pair (cert without key, or vice versa, or
    /// unparseable material) regenerates both files.
    pub(crate) fn load_or_create(dir: &Path) -> Result<Self, ProxyCacheError> {
        let cert_path = dir.join(CA_CERT_FILENAME);
        let key_path = dir.join(CA_KEY_FILENAME);

        let serial = AtomicU64::new(unix_now_seconds());

        if let Some((ca_cert, ca_key)) = Self::try_load(&cert_path, &key_path) {
            debug!("Loaded root CA from `{}`", cert_path.display());
            return Ok(Self {
                ca_cert,
                ca_key,
                cert_path,
                serial,
                leaves: Mutex::new(LruCache::new(LEAF_CACHE_CAPACITY)),
            });
        }

        let ca_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "MitmCDN Proxy CA");
        dn.push(DnType::OrganizationName, "MitmCDN Proxy");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + CA_VALIDITY;

        let ca_cert = params.self_signed(&ca_key)?;

        std::fs::create_dir_all(dir)?;

        std::fs::write(&cert_path, ca_cert.pem())?;
        std::fs::set_permissions(&cert_path, std::fs::Permissions::from_mode(0o644))?;

        std::fs::write(&key_path, ca_key.serialize_pem())?;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;

        info!(
            "Root CA certificate generated at `{}`; install it in the system or browser trust store to trust intercepted connections",
            cert_path.display()
        );

        Ok(Self {
            ca_cert,
            ca_key,
            cert_path,
            serial,
            leaves: Mutex::new(LruCache::new(LEAF_CACHE_CAPACITY)),
        })
    }

    fn try_load(cert_path: &Path, key_path: &Path) -> Option<(Certificate, KeyPair)> {
        let cert_pem = std::fs::read_to_string(cert_path).ok()?;
        let key_pem = std::fs::read_to_string(key_path).ok()?;

        let ca_key = KeyPair::from_pem(&key_pem).ok()?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem).ok()?;
        let ca_cert = params.self_signed(&ca_key).ok()?;

        Some((ca_cert, ca_key))
    }

    #[must_use]
    pub(crate) fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Returns the memoized leaf for `host`, minting one on first use.
    /// Serial numbers are unique via a time-seeded monotone counter.
    pub(crate) fn certified_key(&self, host: &str) -> Result<Arc<CertifiedKey>, ProxyCacheError> {
        {
            let mut leaves = self.leaves.lock().expect("other users should not panic");
            if let Some(ck) = leaves.get(host) {
                return Ok(Arc::clone(ck));
            }
        }

        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::new(vec![host.to_string()])?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        dn.push(DnType::OrganizationName, "MitmCDN Proxy");
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(SerialNumber::from(
            self.serial
                .fetch_add(1, Ordering::Relaxed)
                .to_be_bytes()
                .to_vec(),
        ));
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + LEAF_VALIDITY;

        let cert = params.signed_by(&leaf_key, &self.ca_cert, &self.ca_key)?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key_der)?;

        let ck = Arc::new(CertifiedKey::new(vec![cert_der], signing_key));

        let mut leaves = self.leaves.lock().expect("other users should not panic");
        if let Some(existing) = leaves.get(host) {
            /* another connection minted concurrently, keep the first */
            return Ok(Arc::clone(existing));
        }
        leaves.put(host.to_string(), Arc::clone(&ck));

        Ok(ck)
    }

    /// TLS server configuration presenting the leaf for one known host,
    /// used when the target is fixed by a CONNECT or SOCKS5 request.
    pub(crate) fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, ProxyCacheError> {
        let ck = self.certified_key(host)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(FixedCertResolver(ck)));

        Ok(Arc::new(config))
    }

    /// TLS server configuration minting by SNI, with a `localhost` fallback,
    /// used for raw TLS connections on the unified listener.
    #[must_use]
    pub(crate) fn sni_server_config(self: &Arc<Self>) -> Arc<ServerConfig> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(MintingCertResolver {
                ca: Arc::clone(self),
            }));

        Arc::new(config)
    }
}

#[derive(Debug)]
struct FixedCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

#[derive(Debug)]
struct MintingCertResolver {
    ca: Arc<CertificateAuthority>,
}

impl ResolvesServerCert for MintingCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello.server_name().unwrap_or(FALLBACK_SERVER_NAME);

        match self.ca.certified_key(host) {
            Ok(ck) => Some(ck),
            Err(err) => {
                warn!("Failed to mint certificate for `{host}`:  {err}");
                None
            }
        }
    }
}

#[must_use]
fn unix_now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |dur| dur.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_provider() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }

    #[test]
    fn generates_and_persists_ca_pair() {
        let dir = tempfile::tempdir().unwrap();

        let ca = CertificateAuthority::load_or_create(dir.path()).unwrap();

        let cert_path = dir.path().join(CA_CERT_FILENAME);
        let key_path = dir.path().join(CA_KEY_FILENAME);
        assert!(cert_path.exists());
        assert!(key_path.exists());
        assert_eq!(ca.cert_path(), cert_path);

        let key_mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(key_mode & 0o777, 0o600);
        let cert_mode = std::fs::metadata(&cert_path).unwrap().permissions().mode();
        assert_eq!(cert_mode & 0o777, 0o644);
    }

    #[test]
    fn reload_reuses_persisted_pair() {
        let dir = tempfile::tempdir().unwrap();

        let _first = CertificateAuthority::load_or_create(dir.path()).unwrap();
        let cert_pem = std::fs::read(dir.path().join(CA_CERT_FILENAME)).unwrap();

        let _second = CertificateAuthority::load_or_create(dir.path()).unwrap();
        let cert_pem_after = std::fs::read(dir.path().join(CA_CERT_FILENAME)).unwrap();

        assert_eq!(cert_pem, cert_pem_after);
    }

    #[test]
    fn partial_pair_regenerates_both() {
        let dir = tempfile::tempdir().unwrap();

        let _first = CertificateAuthority::load_or_create(dir.path()).unwrap();
        let cert_pem = std::fs::read(dir.path().join(CA_CERT_FILENAME)).unwrap();

        std::fs::write(dir.path().join(CA_KEY_FILENAME), "garbage").unwrap();

        let _second = CertificateAuthority::load_or_create(dir.path()).unwrap();
        let cert_pem_after = std::fs::read(dir.path().join(CA_CERT_FILENAME)).unwrap();
        let key_pem_after = std::fs::read(dir.path().join(CA_KEY_FILENAME)).unwrap();

        assert_ne!(cert_pem, cert_pem_after);
        assert_ne!(key_pem_after, b"garbage");
    }

    #[test]
    fn leaf_is_memoized_per_host() {
        install_provider();
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(dir.path()).unwrap();

        let first = ca.certified_key("cdn.example.com").unwrap();
        let second = ca.certified_key("cdn.example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = ca.certified_key("other.example.com").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn server_configs_build() {
        install_provider();
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(CertificateAuthority::load_or_create(dir.path()).unwrap());

        let _fixed = ca.server_config("cdn.example.com").unwrap();
        let _sni = ca.sni_server_config();
    }
}
