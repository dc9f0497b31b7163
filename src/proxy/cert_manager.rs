use anyhow::{anyhow, Context};
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::ServerConfig;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

const MAX_SERVER_CONFIG_CACHE: usize = 256;
const CA_CERT_FILE: &str = "layerproxy-ca.pem";
const CA_KEY_FILE: &str = "layerproxy-ca.key";

/// Local certificate authority issuing leaf certificates for intercepted hosts.
pub struct CertManager {
    storage_path: PathBuf,
    pub ca_cert_pem: String,
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_chain: Vec<CertificateDer<'static>>,
    server_configs: Mutex<ServerConfigCache>,
}

impl CertManager {
    /// Loads the CA from `storage_path`, or creates and stores a new one.
    pub fn new(storage_path: &Path) -> anyhow::Result<Self> {
        let ca_cert_path = storage_path.join(CA_CERT_FILE);
        let ca_key_path = storage_path.join(CA_KEY_FILE);

        let (ca_cert, ca_key, ca_cert_pem) = if ca_cert_path.exists() && ca_key_path.exists() {
            let ca_cert_pem =
                fs::read_to_string(&ca_cert_path).context("Failed to read CA certificate file")?;
            let ca_key_pem =
                fs::read_to_string(&ca_key_path).context("Failed to read CA key file")?;

            let ca_key = KeyPair::from_pem(&ca_key_pem).context("Failed to parse CA key")?;
            let params =
                CertificateParams::from_ca_cert_pem(&ca_cert_pem).context("Invalid CA PEM")?;
            let ca_cert = params
                .self_signed(&ca_key)
                .context("Failed to reconstruct CA certificate")?;
            tracing::debug!("Loaded CA from {}", ca_cert_path.display());
            (ca_cert, ca_key, ca_cert_pem)
        } else {
            let (ca_cert, ca_key) = Self::generate_root()?;
            let ca_cert_pem = ca_cert.pem();

            fs::create_dir_all(storage_path).context("Failed to create cert storage directory")?;
            fs::write(&ca_cert_path, &ca_cert_pem).context("Failed to write CA certificate")?;
            fs::write(&ca_key_path, ca_key.serialize_pem()).context("Failed to write CA key")?;
            tracing::info!("Generated a new CA at {}", ca_cert_path.display());
            (ca_cert, ca_key, ca_cert_pem)
        };

        let ca_chain = vec![ca_cert.der().clone()];
        Ok(Self {
            storage_path: storage_path.to_path_buf(),
            ca_cert_pem,
            ca_cert,
            ca_key,
            ca_chain,
            server_configs: Mutex::new(ServerConfigCache::new()),
        })
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.storage_path.join(CA_CERT_FILE)
    }

    pub fn ca_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    fn generate_root() -> anyhow::Result<(Certificate, KeyPair)> {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let now = OffsetDateTime::now_utc();
        let common_name = format!(
            "layerproxy CA ({}, {:04}-{:02}-{:02})",
            hostname,
            now.year(),
            now.month() as u8,
            now.day()
        );

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "layerproxy");

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
        params.not_after = now.checked_add(Duration::days(365 * 10)).unwrap_or(now);

        let key_pair = KeyPair::generate().context("Failed to generate CA key")?;
        let cert = params
            .self_signed(&key_pair)
            .context("Failed to self-sign CA certificate")?;
        Ok((cert, key_pair))
    }

    /// TLS server config presenting a certificate for `host`. The caller sets ALPN.
    pub fn server_config_for_host(&self, host: &str) -> anyhow::Result<Arc<ServerConfig>> {
        let cache_key = host.to_ascii_lowercase();
        if let Some(cfg) = self.server_configs.lock().get(&cache_key) {
            return Ok(cfg);
        }

        let (cert_chain, key_der) = self.issue_leaf_cert(host)?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key_der)
            .context("Failed to build TLS server config")?;

        let arc = Arc::new(config);
        self.server_configs.lock().insert(cache_key, arc.clone());
        Ok(arc)
    }

    fn issue_leaf_cert(
        &self,
        host: &str,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let mut params = CertificateParams::default();
        params.subject_alt_names = vec![match IpAddr::from_str(host) {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                Ia5String::try_from(host)
                    .map_err(|_| anyhow!("Invalid hostname for certificate: {}", host))?,
            ),
        }];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        dn.push(DnType::OrganizationName, "layerproxy intercepted");
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        // Backdated for clock skew.
        let now = OffsetDateTime::now_utc();
        params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
        params.not_after = now.checked_add(Duration::days(365)).unwrap_or(now);

        let key_pair = KeyPair::generate().context("Failed to generate leaf key")?;
        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .context("Failed to sign leaf certificate")?;

        let mut chain = Vec::with_capacity(1 + self.ca_chain.len());
        chain.push(cert.der().clone());
        chain.extend(self.ca_chain.iter().cloned());

        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Ok((chain, key))
    }

    #[cfg(test)]
    fn cached_hosts(&self) -> usize {
        self.server_configs.lock().map.len()
    }
}

/// Least recently used server configs, bounded by [`MAX_SERVER_CONFIG_CACHE`].
struct ServerConfigCache {
    map: HashMap<String, Arc<ServerConfig>>,
    order: VecDeque<String>,
}

impl ServerConfigCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<Arc<ServerConfig>> {
        let cfg = self.map.get(key)?.clone();
        self.promote(key);
        Some(cfg)
    }

    fn insert(&mut self, key: String, config: Arc<ServerConfig>) {
        self.map.insert(key.clone(), config);
        self.promote(&key);
        while self.order.len() > MAX_SERVER_CONFIG_CACHE {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    fn promote(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generates_ca_once_and_reuses_existing_files() {
        let dir = tempdir().unwrap();
        let original_pem = {
            let manager = CertManager::new(dir.path()).expect("initial creation");
            assert!(manager.ca_cert_path().exists());
            assert!(dir.path().join(CA_KEY_FILE).exists());
            manager.ca_cert_pem.clone()
        };

        let again = CertManager::new(dir.path()).expect("reuse existing");
        assert_eq!(again.ca_cert_pem, original_pem);
    }

    #[test]
    fn server_configs_are_cached_per_host() {
        let dir = tempdir().unwrap();
        let manager = CertManager::new(&dir.path().join("nested")).unwrap();
        let a = manager.server_config_for_host("Example.com").unwrap();
        let b = manager.server_config_for_host("example.com").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        manager.server_config_for_host("10.0.0.1").unwrap();
        assert_eq!(manager.cached_hosts(), 2);
        assert!(manager.server_config_for_host("bad host\n").is_err());
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let dir = tempdir().unwrap();
        let manager = CertManager::new(dir.path()).unwrap();
        let config = manager.server_config_for_host("example.com").unwrap();
        let mut cache = ServerConfigCache::new();
        for i in 0..=MAX_SERVER_CONFIG_CACHE {
            cache.insert(format!("host{}", i), config.clone());
            if i == 1 {
                assert!(cache.get("host0").is_some());
            }
        }
        assert_eq!(cache.map.len(), MAX_SERVER_CONFIG_CACHE);
        assert!(cache.get("host0").is_some());
        assert!(cache.get("host1").is_none());
    }
}
