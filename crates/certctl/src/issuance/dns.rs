//! Manual DNS-01 solving.
//!
//! The operator publishes the TXT record by hand; the solver prints what to
//! publish and then watches public resolvers until the value shows up.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use certctl_common::{CertError, CertResult, ChallengeKind};

use super::authority::Challenge;
use super::challenge::ChallengeSolver;

/// Public resolvers queried for propagation.
pub const DEFAULT_RESOLVERS: [IpAddr; 3] = [
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
    IpAddr::V4(Ipv4Addr::new(223, 5, 5, 5)),
];

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Name of the TXT record for a DNS-01 challenge.
pub fn record_name(identifier: &str) -> String {
    format!("_acme-challenge.{}", identifier.trim_start_matches("*."))
}

/// TXT record value: unpadded base64url of SHA-256 over the key authorization.
pub fn record_value(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

/// DNS-01 solver for records published by a human.
pub struct ManualDnsSolver {
    resolvers: Vec<(IpAddr, TokioAsyncResolver)>,
    propagation_timeout: Duration,
    check_interval: Duration,
}

impl ManualDnsSolver {
    pub fn new(propagation_timeout: Duration, check_interval: Duration) -> Self {
        Self::with_resolvers(&DEFAULT_RESOLVERS, propagation_timeout, check_interval)
    }

    pub fn with_resolvers(
        servers: &[IpAddr],
        propagation_timeout: Duration,
        check_interval: Duration,
    ) -> Self {
        let resolvers = servers
            .iter()
            .map(|ip| {
                let group = NameServerConfigGroup::from_ips_clear(&[*ip], 53, true);
                let config = ResolverConfig::from_parts(None, vec![], group);
                let mut opts = ResolverOpts::default();
                opts.timeout = QUERY_TIMEOUT;
                opts.attempts = 1;
                // Each poll must see fresh answers.
                opts.cache_size = 0;
                (*ip, TokioAsyncResolver::tokio(config, opts))
            })
            .collect();

        Self {
            resolvers,
            propagation_timeout,
            check_interval,
        }
    }

    /// True once any resolver returns the expected value.
    async fn visible(&self, name: &str, expected: &str) -> bool {
        let fqdn = format!("{}.", name.trim_end_matches('.'));
        for (server, resolver) in &self.resolvers {
            match resolver.txt_lookup(fqdn.as_str()).await {
                Ok(lookup) => {
                    let found = lookup.iter().any(|txt| {
                        let joined: Vec<u8> = txt
                            .txt_data()
                            .iter()
                            .flat_map(|segment| segment.iter().copied())
                            .collect();
                        joined == expected.as_bytes()
                    });
                    if found {
                        debug!(record = %fqdn, server = %server, "TXT record visible");
                        return true;
                    }
                }
                Err(e) => debug!(record = %fqdn, server = %server, error = %e, "TXT lookup failed"),
            }
        }
        false
    }
}

impl std::fmt::Debug for ManualDnsSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let servers: Vec<&IpAddr> = self.resolvers.iter().map(|(ip, _)| ip).collect();
        f.debug_struct("ManualDnsSolver")
            .field("resolvers", &servers)
            .field("propagation_timeout", &self.propagation_timeout)
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

#[async_trait]
impl ChallengeSolver for ManualDnsSolver {
    fn kind(&self) -> ChallengeKind {
        ChallengeKind::Dns01
    }

    async fn present(&self, challenge: &Challenge) -> CertResult<()> {
        let name = record_name(&challenge.identifier);
        let value = record_value(&challenge.key_authorization);

        info!(
            identifier = %challenge.identifier,
            record = %name,
            value = %value,
            "Publish this TXT record to continue"
        );

        let deadline = Instant::now() + self.propagation_timeout;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.visible(&name, &value).await {
                info!(record = %name, attempt, "DNS record propagated");
                return Ok(());
            }
            if Instant::now() + self.check_interval > deadline {
                break;
            }
            debug!(record = %name, attempt, "TXT record not visible yet");
            tokio::time::sleep(self.check_interval).await;
        }

        warn!(record = %name, attempts = attempt, "DNS record did not propagate in time");
        Err(CertError::challenge_failed(
            &challenge.identifier,
            format!(
                "TXT record {} not visible after {}s",
                name,
                self.propagation_timeout.as_secs()
            ),
        ))
    }

    async fn cleanup(&self, challenge: &Challenge) -> CertResult<()> {
        info!(
            record = %record_name(&challenge.identifier),
            "The TXT record may now be removed"
        );
        Ok(())
    }
}
