//! Private certificate authority.
//!
//! Issues certificates from a self-managed root. Challenges follow the
//! HTTP-01 shape and are checked against the in-process
//! [`ChallengeManager`], so the whole order flow runs without a network.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
    SerialNumber,
};
use rustls_pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use certctl_common::{CertError, CertResult, ChallengeKind};

use super::authority::{Authority, Challenge, OrderToken, Submission, ValidationStatus};
use super::challenge::ChallengeManager;
use crate::certinfo::{parse_chain, CertInfo};
use crate::request::CertificateRequest;
use crate::store::CertStore;

const CA_STATE: &str = "authority/local-ca.json";
const CA_KEY_SECRET: &str = "local-ca-key";
const REVOKED_STATE: &str = "authority/local-ca-revoked.json";
const ROOT_VALIDITY_DAYS: i64 = 3650;

/// Persisted root certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CaState {
    name: String,
    cert_pem: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct LocalOrder {
    names: Vec<String>,
    challenges: Vec<Challenge>,
    notified: HashSet<String>,
}

/// Private CA authority.
pub struct LocalAuthority {
    name: String,
    ca_key: KeyPair,
    ca_cert_pem: String,
    ca_cert_der: CertificateDer<'static>,
    validity_days: u32,
    responder: ChallengeManager,
    orders: DashMap<OrderToken, LocalOrder>,
    revoked: Mutex<BTreeSet<String>>,
    /// Store holding the CA state; `None` for in-memory CAs.
    store: Option<Arc<CertStore>>,
}

impl LocalAuthority {
    /// In-memory CA with a fresh root. Nothing is persisted.
    pub fn generate(
        name: &str,
        validity_days: u32,
        responder: ChallengeManager,
    ) -> CertResult<Self> {
        let (ca_key, ca_cert_pem) = generate_root(name)?;
        Self::assemble(name, ca_key, ca_cert_pem, validity_days, responder, BTreeSet::new(), None)
    }

    /// Load the CA from the store, creating and persisting it on first use.
    pub fn open(
        store: &Arc<CertStore>,
        name: &str,
        validity_days: u32,
        responder: ChallengeManager,
    ) -> CertResult<Self> {
        let existing = store.read_state::<CaState>(CA_STATE)?;
        let key_pem = store.read_secret(CA_KEY_SECRET)?;

        let (ca_key, ca_cert_pem) = match (existing, key_pem) {
            (Some(state), Some(key_pem)) => {
                let key_pem = String::from_utf8(key_pem)
                    .map_err(|_| CertError::integrity("local-ca", "CA key is not UTF-8"))?;
                let key = KeyPair::from_pem(&key_pem)
                    .map_err(|e| CertError::integrity("local-ca", format!("CA key: {}", e)))?;
                debug!(name = %state.name, "Loaded local CA");
                (key, state.cert_pem)
            }
            (None, None) => {
                let (key, cert_pem) = generate_root(name)?;
                store.write_secret(CA_KEY_SECRET, key.serialize_pem().as_bytes())?;
                store.write_state(
                    CA_STATE,
                    &CaState {
                        name: name.to_string(),
                        cert_pem: cert_pem.clone(),
                        created_at: Utc::now(),
                    },
                )?;
                info!(name, "Created local CA root");
                (key, cert_pem)
            }
            _ => {
                return Err(CertError::integrity(
                    "local-ca",
                    "CA certificate and key are not both present",
                ))
            }
        };

        let revoked = store
            .read_state::<BTreeSet<String>>(REVOKED_STATE)?
            .unwrap_or_default();
        Self::assemble(
            name,
            ca_key,
            ca_cert_pem,
            validity_days,
            responder,
            revoked,
            Some(Arc::clone(store)),
        )
    }

    fn assemble(
        name: &str,
        ca_key: KeyPair,
        ca_cert_pem: String,
        validity_days: u32,
        responder: ChallengeManager,
        revoked: BTreeSet<String>,
        store: Option<Arc<CertStore>>,
    ) -> CertResult<Self> {
        let ca_cert_der = parse_chain(&ca_cert_pem)
            .map_err(|e| CertError::integrity("local-ca", e))?
            .swap_remove(0);
        Ok(Self {
            name: name.to_string(),
            ca_key,
            ca_cert_pem,
            ca_cert_der,
            validity_days,
            responder,
            orders: DashMap::new(),
            revoked: Mutex::new(revoked),
            store,
        })
    }

    pub fn root_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Serials revoked by this CA, lowercase hex.
    pub fn revoked_serials(&self) -> Vec<String> {
        self.revoked.lock().iter().cloned().collect()
    }

    fn save_revocations(&self) -> CertResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let revoked = self.revoked.lock().clone();
        store.write_state(REVOKED_STATE, &revoked)
    }

    fn thumbprint(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(self.ca_key.public_key_raw()))
    }

    fn unknown_order(order: &OrderToken) -> CertError {
        CertError::InternalStore(format!("unknown order {}", order))
    }

    fn sign(&self, request: &CertificateRequest, names: &[String]) -> CertResult<String> {
        let mut csr = CertificateSigningRequestParams::from_pem(&request.csr_pem)
            .map_err(|e| CertError::PolicyViolation(format!("unreadable CSR: {}", e)))?;

        let requested: BTreeSet<String> = csr
            .params
            .subject_alt_names
            .iter()
            .filter_map(|san| match san {
                SanType::DnsName(name) => Some(name.as_str().to_ascii_lowercase()),
                _ => None,
            })
            .collect();
        let ordered: BTreeSet<String> = names.iter().cloned().collect();
        if requested != ordered {
            return Err(CertError::PolicyViolation(
                "CSR names do not match the validated order".to_string(),
            ));
        }

        let mut serial = *Uuid::new_v4().as_bytes();
        serial[0] &= 0x7f;
        let now = time::OffsetDateTime::now_utc();

        csr.params.serial_number = Some(SerialNumber::from_slice(&serial));
        csr.params.is_ca = IsCa::ExplicitNoCa;
        csr.params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        csr.params.not_before = now - time::Duration::minutes(1);
        csr.params.not_after = now + time::Duration::days(i64::from(self.validity_days));

        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &self.ca_key)
            .map_err(|e| CertError::integrity("local-ca", format!("CA certificate: {}", e)))?;
        let leaf = csr
            .signed_by(&issuer)
            .map_err(|e| CertError::InternalStore(format!("failed to sign certificate: {}", e)))?;

        Ok(format!("{}{}", leaf.pem(), self.ca_cert_pem))
    }
}

impl std::fmt::Debug for LocalAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAuthority")
            .field("name", &self.name)
            .field("validity_days", &self.validity_days)
            .field("pending_orders", &self.orders.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Authority for LocalAuthority {
    fn name(&self) -> &str {
        &self.name
    }

    fn challenge_kind(&self) -> ChallengeKind {
        ChallengeKind::Http01
    }

    async fn submit(&self, request: &CertificateRequest) -> CertResult<Submission> {
        let thumbprint = self.thumbprint();
        let challenges: Vec<Challenge> = request
            .sans
            .iter()
            .map(|name| {
                let token = Uuid::new_v4().simple().to_string();
                Challenge {
                    kind: ChallengeKind::Http01,
                    identifier: name.clone(),
                    key_authorization: format!("{}.{}", token, thumbprint),
                    url: format!("local:{}", token),
                    token,
                }
            })
            .collect();

        let order = OrderToken::new(format!("local-{}", Uuid::new_v4().simple()));
        self.orders.insert(
            order.clone(),
            LocalOrder {
                names: request.sans.clone(),
                challenges: challenges.clone(),
                notified: HashSet::new(),
            },
        );
        debug!(order = %order, names = request.sans.len(), "Created local order");

        Ok(Submission { order, challenges })
    }

    async fn notify(&self, order: &OrderToken, challenge: &Challenge) -> CertResult<()> {
        let mut entry = self
            .orders
            .get_mut(order)
            .ok_or_else(|| Self::unknown_order(order))?;
        entry.notified.insert(challenge.token.clone());
        Ok(())
    }

    async fn poll(&self, order: &OrderToken) -> CertResult<ValidationStatus> {
        let entry = self
            .orders
            .get(order)
            .ok_or_else(|| Self::unknown_order(order))?;

        for challenge in &entry.challenges {
            if !entry.notified.contains(&challenge.token) {
                return Ok(ValidationStatus::Pending);
            }
            match self.responder.get_response(&challenge.token) {
                Some(response) if response == challenge.key_authorization => {}
                Some(_) => {
                    return Ok(ValidationStatus::Invalid(format!(
                        "wrong challenge response for {}",
                        challenge.identifier
                    )))
                }
                None => {
                    return Ok(ValidationStatus::Invalid(format!(
                        "no challenge response for {}",
                        challenge.identifier
                    )))
                }
            }
        }
        Ok(ValidationStatus::Ready)
    }

    async fn finalize(
        &self,
        order: &OrderToken,
        request: &CertificateRequest,
    ) -> CertResult<String> {
        if self.poll(order).await? != ValidationStatus::Ready {
            return Err(CertError::PolicyViolation(
                "order is not ready for finalization".to_string(),
            ));
        }
        let names = self
            .orders
            .get(order)
            .map(|o| o.names.clone())
            .ok_or_else(|| Self::unknown_order(order))?;

        let chain = self.sign(request, &names)?;
        info!(identity = %request.identity, authority = %self.name, "Local CA issued certificate");
        Ok(chain)
    }

    async fn revoke(&self, chain_pem: &str) -> CertResult<()> {
        let chain = parse_chain(chain_pem).map_err(CertError::PolicyViolation)?;
        let leaf = CertInfo::from_der(&chain[0]).map_err(CertError::PolicyViolation)?;
        if chain.get(1) != Some(&self.ca_cert_der) {
            return Err(CertError::PolicyViolation(format!(
                "certificate {} was not issued by {}",
                leaf.serial, self.name
            )));
        }
        self.revoked.lock().insert(leaf.serial.clone());
        self.save_revocations()?;
        info!(serial = %leaf.serial, authority = %self.name, "Local CA revoked certificate");
        Ok(())
    }

    fn release(&self, order: &OrderToken) {
        self.orders.remove(order);
    }

    fn trust_anchors(&self) -> Vec<CertificateDer<'static>> {
        vec![self.ca_cert_der.clone()]
    }
}

fn generate_root(name: &str) -> CertResult<(KeyPair, String)> {
    let key = KeyPair::generate()
        .map_err(|e| CertError::InternalStore(format!("failed to generate CA key: {}", e)))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(name.to_string()));
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::minutes(1);
    params.not_after = now + time::Duration::days(ROOT_VALIDITY_DAYS);

    let cert = params
        .self_signed(&key)
        .map_err(|e| CertError::InternalStore(format!("failed to create CA root: {}", e)))?;
    Ok((key, cert.pem()))
}
