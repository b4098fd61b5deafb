//! Test fixtures shared by unit tests.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls_pki_types::CertificateDer;

/// Throwaway root CA.
pub(crate) struct TestCa {
    key: KeyPair,
    cert: rcgen::Certificate,
}

impl TestCa {
    pub(crate) fn new(common_name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let cert = params.self_signed(&key).unwrap();
        Self { key, cert }
    }

    pub(crate) fn root_der(&self) -> Vec<u8> {
        self.cert.der().to_vec()
    }

    pub(crate) fn root_pem(&self) -> String {
        self.cert.pem()
    }

    /// Issue a leaf valid from one minute ago for `days` days.
    ///
    /// Returns the chain (leaf, root) and the leaf key.
    pub(crate) fn issue(&self, names: &[&str], days: i64) -> (Vec<CertificateDer<'static>>, KeyPair) {
        let leaf_key = KeyPair::generate().unwrap();
        let mut params =
            CertificateParams::new(names.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                .unwrap();
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::minutes(1);
        params.not_after = now + time::Duration::days(days);

        let issuer = Issuer::from_ca_cert_pem(&self.cert.pem(), &self.key).unwrap();
        let leaf = params.signed_by(&leaf_key, &issuer).unwrap();
        (vec![leaf.der().clone(), self.cert.der().clone()], leaf_key)
    }

    /// Same as [`TestCa::issue`], as a PEM bundle.
    pub(crate) fn issue_pem(&self, names: &[&str], days: i64) -> (String, KeyPair) {
        let (chain, key) = self.issue(names, days);
        let pem = chain
            .iter()
            .map(|der| crate::certinfo::to_pem(der))
            .collect::<Vec<_>>()
            .join("");
        (pem, key)
    }
}
