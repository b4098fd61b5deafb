//! Trust anchors for chain validation.

use std::path::Path;

use tracing::debug;
use x509_parser::prelude::*;

use certctl_common::{CertError, CertResult};

/// A trusted root, reduced to the parts needed to anchor a chain.
///
/// Both fields hold DER contents without the outer SEQUENCE header, the
/// form used by `webpki-roots`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Anchor {
    subject: Vec<u8>,
    spki: Vec<u8>,
}

/// Set of trusted roots.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    anchors: Vec<Anchor>,
}

impl TrustStore {
    /// A store without any anchors.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A store seeded with the Mozilla root program.
    pub fn with_public_roots() -> Self {
        let anchors = webpki_roots::TLS_SERVER_ROOTS
            .iter()
            .map(|ta| Anchor {
                subject: ta.subject.as_ref().to_vec(),
                spki: ta.subject_public_key_info.as_ref().to_vec(),
            })
            .collect();
        Self { anchors }
    }

    /// Trust a root certificate given as DER.
    pub fn add_der(&mut self, der: &[u8]) -> Result<(), String> {
        let (_, cert) =
            parse_x509_certificate(der).map_err(|e| format!("invalid trust anchor: {}", e))?;
        let anchor = Anchor {
            subject: der_contents(cert.subject().as_raw())
                .ok_or("malformed anchor subject")?
                .to_vec(),
            spki: der_contents(cert.public_key().raw)
                .ok_or("malformed anchor public key")?
                .to_vec(),
        };
        if !self.anchors.contains(&anchor) {
            self.anchors.push(anchor);
        }
        Ok(())
    }

    /// Trust every certificate in a PEM file.
    pub fn add_pem_file(&mut self, path: &Path) -> CertResult<usize> {
        let pem = std::fs::read_to_string(path)?;
        let chain = crate::certinfo::parse_chain(&pem).map_err(|e| {
            CertError::PolicyViolation(format!("trust anchor {:?}: {}", path, e))
        })?;
        for der in &chain {
            self.add_der(der).map_err(|e| {
                CertError::PolicyViolation(format!("trust anchor {:?}: {}", path, e))
            })?;
        }
        debug!(path = %path.display(), count = chain.len(), "Loaded trust anchors");
        Ok(chain.len())
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Whether the certificate is itself one of the anchors.
    pub(crate) fn is_anchor(&self, cert: &X509Certificate<'_>) -> bool {
        let (Some(subject), Some(spki)) = (
            der_contents(cert.subject().as_raw()),
            der_contents(cert.public_key().raw),
        ) else {
            return false;
        };
        self.anchors
            .iter()
            .any(|a| a.subject == subject && a.spki == spki)
    }

    /// Whether an anchor issued and signed the certificate.
    pub(crate) fn is_signed_by_anchor(&self, cert: &X509Certificate<'_>) -> bool {
        let Some(issuer) = der_contents(cert.issuer().as_raw()) else {
            return false;
        };
        self.anchors
            .iter()
            .filter(|a| a.subject == issuer)
            .any(|a| {
                let full = wrap_sequence(&a.spki);
                match SubjectPublicKeyInfo::from_der(&full) {
                    Ok((_, spki)) => cert.verify_signature(Some(&spki)).is_ok(),
                    Err(_) => false,
                }
            })
    }
}

/// Strip the tag and length of a DER SEQUENCE.
fn der_contents(raw: &[u8]) -> Option<&[u8]> {
    if raw.len() < 2 || raw[0] != 0x30 {
        return None;
    }
    let (len, header) = match raw[1] {
        n if n < 0x80 => (n as usize, 2),
        n => {
            let count = (n & 0x7f) as usize;
            if count == 0 || count > 4 || raw.len() < 2 + count {
                return None;
            }
            let len = raw[2..2 + count]
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | *b as usize);
            (len, 2 + count)
        }
    };
    raw.get(header..header + len)
}

/// Wrap DER contents in a SEQUENCE header.
fn wrap_sequence(contents: &[u8]) -> Vec<u8> {
    let len = contents.len();
    let mut out = vec![0x30];
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes: Vec<u8> = len
            .to_be_bytes()
            .iter()
            .copied()
            .skip_while(|b| *b == 0)
            .collect();
        out.push(0x80 | bytes.len() as u8);
        out.extend_from_slice(&bytes);
    }
    out.extend_from_slice(contents);
    out
}
