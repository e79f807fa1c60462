//! Peer identity.
//!
//! Every peer owns an Ed25519 key pair and a self-signed certificate built from it.
//! The identity used for rooms and ACLs is the BLAKE3 hash of the certificate's
//! SubjectPublicKeyInfo, so it is stable across certificate regeneration as long as
//! the key is kept.

use std::{collections::HashSet, fmt, fs, path::Path, str::FromStr};

use anyhow::Context;
use rcgen::{CertificateParams, DnType, KeyPair, PKCS_ED25519};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Serialize, Serializer};
use thiserror::Error;
use x509_parser::prelude::{FromDer, X509Certificate};

pub const FINGERPRINT_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("fingerprint must be {expected} hex chars, got {0}", expected = FINGERPRINT_LEN * 2)]
    BadLength(usize),
    #[error("fingerprint is not valid hex")]
    BadHex,
    #[error("certificate is not valid X.509")]
    BadCertificate,
}

/// 32-byte identity derived from a certificate public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    #[cfg(test)]
    pub const fn from_bytes(b: [u8; FINGERPRINT_LEN]) -> Self {
        Self(b)
    }

    /// Hash of a DER-encoded SubjectPublicKeyInfo.
    pub fn of_public_key(spki_der: &[u8]) -> Self {
        Self(*blake3::hash(spki_der).as_bytes())
    }

    pub fn from_cert_der(der: &[u8]) -> Result<Self, FingerprintError> {
        let (_, cert) =
            X509Certificate::from_der(der).map_err(|_| FingerprintError::BadCertificate)?;
        Ok(Self::of_public_key(cert.public_key().raw))
    }

    pub fn parse_hex(s: &str) -> Result<Self, FingerprintError> {
        let s = s.trim();
        if s.len() != FINGERPRINT_LEN * 2 {
            return Err(FingerprintError::BadLength(s.len()));
        }
        let mut out = [0u8; FINGERPRINT_LEN];
        hex::decode_to_slice(s, &mut out).map_err(|_| FingerprintError::BadHex)?;
        Ok(Self(out))
    }

    /// Short form for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}..)", self.short())
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_hex(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

/// Key pair plus the self-signed certificate presented in every handshake.
pub struct Identity {
    key: KeyPair,
    cert: CertificateDer<'static>,
    fingerprint: Fingerprint,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn generate() -> anyhow::Result<Self> {
        let key = KeyPair::generate_for(&PKCS_ED25519).context("identity: generate ed25519 key")?;
        Self::from_key(key)
    }

    pub fn from_pem(pem: &str) -> anyhow::Result<Self> {
        let mut rd = std::io::Cursor::new(pem.as_bytes());
        let key = rustls_pemfile::private_key(&mut rd)
            .context("identity: read private key pem")?
            .ok_or_else(|| anyhow::anyhow!("identity: no private key found in pem"))?;
        let PrivateKeyDer::Pkcs8(pkcs8) = key else {
            anyhow::bail!("identity: private key must be PKCS#8");
        };
        let key = KeyPair::try_from(&pkcs8).context("identity: parse private key")?;
        Self::from_key(key)
    }

    /// Loads the key at `path`, or generates and persists a new one.
    /// The returned flag is true when a key was created.
    pub fn load_or_generate(path: &Path) -> anyhow::Result<(Self, bool)> {
        match fs::read_to_string(path) {
            Ok(pem) => {
                let id = Self::from_pem(&pem)
                    .with_context(|| format!("identity: load {}", path.display()))?;
                Ok((id, false))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let id = Self::generate()?;
                id.save(path)?;
                Ok((id, true))
            }
            Err(err) => Err(err).with_context(|| format!("identity: read {}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("identity: mkdir {}", parent.display()))?;
            }
        }
        fs::write(path, self.to_pem())
            .with_context(|| format!("identity: write {}", path.display()))
    }

    fn from_key(key: KeyPair) -> anyhow::Result<Self> {
        let mut params = CertificateParams::new(vec!["aefrp".to_string()])
            .context("identity: certificate params")?;
        params
            .distinguished_name
            .push(DnType::CommonName, "aefrp peer");
        let cert = params
            .self_signed(&key)
            .context("identity: self-sign certificate")?;
        let cert = cert.der().clone();
        let fingerprint = Fingerprint::from_cert_der(&cert)?;
        Ok(Self {
            key,
            cert,
            fingerprint,
        })
    }

    pub fn to_pem(&self) -> String {
        self.key.serialize_pem()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert.clone()]
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.serialize_der()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclDecision {
    Allowed,
    NotAllowed,
    Blocked,
}

/// Whitelist/blacklist pair. The blacklist wins; an empty whitelist allows everyone.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    pub whitelist: HashSet<Fingerprint>,
    pub blacklist: HashSet<Fingerprint>,
}

impl Acl {
    pub fn whitelist<I: IntoIterator<Item = Fingerprint>>(ids: I) -> Self {
        Self {
            whitelist: ids.into_iter().collect(),
            blacklist: HashSet::new(),
        }
    }

    pub fn check(&self, fp: &Fingerprint) -> AclDecision {
        if self.blacklist.contains(fp) {
            return AclDecision::Blocked;
        }
        if !self.whitelist.is_empty() && !self.whitelist.contains(fp) {
            return AclDecision::NotAllowed;
        }
        AclDecision::Allowed
    }

    pub fn permits(&self, fp: &Fingerprint) -> bool {
        self.check(fp) == AclDecision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_survives_pem_roundtrip() {
        let id = Identity::generate().unwrap();
        let again = Identity::from_pem(&id.to_pem()).unwrap();
        assert_eq!(id.fingerprint(), again.fingerprint());
        assert_eq!(
            Fingerprint::from_cert_der(&again.cert_chain()[0]).unwrap(),
            id.fingerprint()
        );
    }

    #[test]
    fn distinct_keys_have_distinct_fingerprints() {
        let a = Identity::generate().unwrap();
        let b = Identity::generate().unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn hex_parse_checks_length_and_alphabet() {
        let fp = Fingerprint::from_bytes([0xab; 32]);
        assert_eq!(Fingerprint::parse_hex(&fp.to_string()).unwrap(), fp);
        assert_eq!(
            Fingerprint::parse_hex("abcd"),
            Err(FingerprintError::BadLength(4))
        );
        assert_eq!(
            Fingerprint::parse_hex(&"zz".repeat(32)),
            Err(FingerprintError::BadHex)
        );
    }

    #[test]
    fn blacklist_wins_over_whitelist() {
        let a = Fingerprint::from_bytes([1; 32]);
        let b = Fingerprint::from_bytes([2; 32]);
        let mut acl = Acl::whitelist([a, b]);
        acl.blacklist.insert(a);
        assert_eq!(acl.check(&a), AclDecision::Blocked);
        assert_eq!(acl.check(&b), AclDecision::Allowed);
        assert_eq!(
            acl.check(&Fingerprint::from_bytes([3; 32])),
            AclDecision::NotAllowed
        );
        assert!(Acl::default().permits(&a));
    }
}
