//! Deterministic leaf-certificate forgery under a locally configured signing
//! authority. A leaf's serial number, subject, validity window, SAN, and RSA
//! key are all derived from the hostname alone, so repeated forgeries for the
//! same host under the same authority present the same fingerprint without
//! any stored state.

use std::error::Error as StdError;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use x509_parser::parse_x509_certificate;
use x509_parser::x509::X509Name;

mod seeded_rng;

pub use seeded_rng::SeededRng;

const LEAF_KEY_BITS: usize = 2048;

#[derive(Debug)]
pub enum ForgeError {
    InvalidAuthority(String),
    CertificateGeneration(rcgen::Error),
    KeyGeneration(rsa::Error),
    KeyEncoding(rsa::pkcs8::Error),
    ConfigBuild(rustls::Error),
}

impl fmt::Display for ForgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAuthority(reason) => write!(f, "invalid signing authority: {reason}"),
            Self::CertificateGeneration(error) => {
                write!(f, "certificate generation failed: {error}")
            }
            Self::KeyGeneration(error) => write!(f, "leaf key generation failed: {error}"),
            Self::KeyEncoding(error) => write!(f, "leaf key encoding failed: {error}"),
            Self::ConfigBuild(error) => write!(f, "TLS config build failed: {error}"),
        }
    }
}

impl StdError for ForgeError {}

impl From<rcgen::Error> for ForgeError {
    fn from(value: rcgen::Error) -> Self {
        Self::CertificateGeneration(value)
    }
}

impl From<rsa::Error> for ForgeError {
    fn from(value: rsa::Error) -> Self {
        Self::KeyGeneration(value)
    }
}

impl From<rsa::pkcs8::Error> for ForgeError {
    fn from(value: rsa::pkcs8::Error) -> Self {
        Self::KeyEncoding(value)
    }
}

impl From<rustls::Error> for ForgeError {
    fn from(value: rustls::Error) -> Self {
        Self::ConfigBuild(value)
    }
}

/// The signing credential: a CA certificate and its private key. Read-only
/// after construction and safe to share across connections.
pub struct SigningAuthority {
    cert_der: CertificateDer<'static>,
    issuer: Issuer<'static, KeyPair>,
}

impl SigningAuthority {
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, ForgeError> {
        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
            ForgeError::InvalidAuthority(format!("failed to parse certificate PEM: {error}"))
        })?;
        let key = KeyPair::from_pem(key_pem)?;
        Self::from_der(cert_der, key)
    }

    pub fn from_der(cert_der: CertificateDer<'static>, key: KeyPair) -> Result<Self, ForgeError> {
        let issuer = Issuer::from_ca_cert_der(&cert_der, key).map_err(|error| {
            ForgeError::InvalidAuthority(format!(
                "failed to parse issuer metadata from certificate: {error}"
            ))
        })?;
        Ok(Self { cert_der, issuer })
    }

    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Forges a leaf certificate for `host`, chained under this authority.
    ///
    /// Serial number and RSA key are derived from `SHA-256(host)`; subject
    /// and validity window are copied from the authority certificate. The
    /// SAN is an IP address when `host` parses as an IP literal and a DNS
    /// name otherwise.
    pub fn forge_leaf(&self, host: &str) -> Result<ForgedLeaf, ForgeError> {
        let (_, authority) = parse_x509_certificate(self.cert_der.as_ref()).map_err(|error| {
            ForgeError::InvalidAuthority(format!("failed to parse certificate: {error}"))
        })?;

        let seed: [u8; 32] = Sha256::digest(host.as_bytes()).into();

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.serial_number = Some(SerialNumber::from_slice(&seed));
        params.is_ca = IsCa::ExplicitNoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.distinguished_name = copy_subject(authority.subject());
        params.not_before = validity_timestamp(authority.validity().not_before.timestamp())?;
        params.not_after = validity_timestamp(authority.validity().not_after.timestamp())?;

        if let Ok(ip) = host.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(SanType::DnsName(host.try_into()?));
        }

        let mut rng = SeededRng::new(seed);
        let leaf_key = RsaPrivateKey::new(&mut rng, LEAF_KEY_BITS)?;
        let leaf_key_der = leaf_key.to_pkcs8_der()?;
        let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(
            &PrivatePkcs8KeyDer::from(leaf_key_der.as_bytes().to_vec()),
            &rcgen::PKCS_RSA_SHA256,
        )?;

        let leaf_cert = params.signed_by(&key_pair, &self.issuer)?;

        Ok(ForgedLeaf {
            chain: vec![leaf_cert.der().clone(), self.cert_der.clone()],
            key: PrivatePkcs8KeyDer::from(leaf_key_der.as_bytes().to_vec()),
        })
    }
}

/// A forged server identity: the `[leaf, authority]` chain plus the leaf's
/// private key. Lives for one TLS session; nothing is cached.
#[derive(Debug)]
pub struct ForgedLeaf {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivatePkcs8KeyDer<'static>,
}

impl ForgedLeaf {
    pub fn leaf_der(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    /// Builds a rustls server config presenting this identity, with
    /// `http/1.1` as the sole ALPN protocol.
    pub fn into_server_config(self) -> Result<Arc<ServerConfig>, ForgeError> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.chain, PrivateKeyDer::from(self.key))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

fn copy_subject(subject: &X509Name<'_>) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    for attribute in subject.iter_attributes() {
        let Ok(value) = attribute.as_str() else {
            continue;
        };
        let dn_type = match attribute.attr_type().to_id_string().as_str() {
            "2.5.4.3" => DnType::CommonName,
            "2.5.4.6" => DnType::CountryName,
            "2.5.4.7" => DnType::LocalityName,
            "2.5.4.8" => DnType::StateOrProvinceName,
            "2.5.4.10" => DnType::OrganizationName,
            "2.5.4.11" => DnType::OrganizationalUnitName,
            _ => match attribute.attr_type().iter() {
                Some(components) => DnType::CustomDnType(components.collect()),
                None => continue,
            },
        };
        name.push(dn_type, value);
    }
    name
}

fn validity_timestamp(timestamp: i64) -> Result<OffsetDateTime, ForgeError> {
    OffsetDateTime::from_unix_timestamp(timestamp).map_err(|_| {
        ForgeError::InvalidAuthority("validity timestamp out of range".to_string())
    })
}
