//! Self-signed certificate generation

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::time::Duration;
use time::OffsetDateTime;

use crate::config::CertPaths;
use crate::error::{ProxyError, Result};

/// Validity of generated certificates
pub const SELF_SIGNED_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const ORGANIZATION: &str = "ssl-proxy";

/// A freshly generated certificate and its private key, both PEM encoded
pub struct CertificateMaterial {
    pub cert_pem: String,
    pub key_pem: String,
    /// SHA-256 of the DER certificate
    pub fingerprint: [u8; 32],
}

impl std::fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("fingerprint", &format_fingerprint(&self.fingerprint))
            .finish_non_exhaustive()
    }
}

/// Generate a key pair and a certificate signed by it.
///
/// The SAN list is exactly `subject_names`, in order. IP literals become
/// IP SANs, everything else a DNS SAN. The certificate is valid from now
/// until `now + validity`.
pub fn generate(validity: Duration, subject_names: &[String]) -> Result<CertificateMaterial> {
    let mut params = CertificateParams::new(subject_names.to_vec())
        .map_err(|e| ProxyError::Generation(format!("Invalid subject names: {}", e)))?;

    let mut dn = DistinguishedName::new();
    if let Some(primary) = subject_names.first() {
        dn.push(DnType::CommonName, primary.as_str());
    }
    dn.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + validity;

    let key_pair = KeyPair::generate()
        .map_err(|e| ProxyError::Generation(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| ProxyError::Generation(format!("Failed to sign certificate: {}", e)))?;

    Ok(CertificateMaterial {
        fingerprint: fingerprint(cert.der()),
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

impl CertificateMaterial {
    /// Write the pair to disk, the key with owner-only permissions.
    ///
    /// Consumes the material; the returned fingerprint is all that remains.
    pub fn persist(self, paths: &CertPaths) -> Result<[u8; 32]> {
        for path in [&paths.cert, &paths.key] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| ProxyError::persistence(parent, e))?;
            }
        }

        fs::write(&paths.cert, self.cert_pem.as_bytes())
            .map_err(|e| ProxyError::persistence(&paths.cert, e))?;
        write_private(&paths.key, self.key_pem.as_bytes())
            .map_err(|e| ProxyError::persistence(&paths.key, e))?;

        Ok(self.fingerprint)
    }
}

fn write_private(path: &std::path::Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    // mode() only applies when the file is created
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(contents)?;
    file.sync_all()
}

/// SHA-256 digest of a DER certificate
pub fn fingerprint(der: &[u8]) -> [u8; 32] {
    Sha256::digest(der).into()
}

/// Upper-case hex pairs separated by spaces
pub fn format_fingerprint(fingerprint: &[u8]) -> String {
    fingerprint
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
