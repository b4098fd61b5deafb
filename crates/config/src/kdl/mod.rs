//! KDL configuration parsing.

use anyhow::Result;
use tracing::{debug, trace};

use crate::Config;

mod helpers;
mod sections;

pub use sections::{
    parse_authority_config, parse_issuance_config, parse_logging_config, parse_policy_config,
    parse_renewal_config, parse_store_config,
};

/// Parse a complete configuration document.
///
/// Unknown top-level nodes are rejected so typos do not silently fall back
/// to defaults.
pub fn parse_config(content: &str) -> Result<Config> {
    let doc: ::kdl::KdlDocument = content
        .parse()
        .map_err(|e: ::kdl::KdlError| anyhow::anyhow!("Invalid KDL: {}", e))?;

    let mut config = Config::default();

    for node in doc.nodes() {
        let name = node.name().value();
        trace!(section = name, "Parsing configuration section");
        match name {
            "store" => config.store = parse_store_config(node)?,
            "authority" => config.authority = parse_authority_config(node)?,
            "issuance" => config.issuance = parse_issuance_config(node)?,
            "renewal" => config.renewal = parse_renewal_config(node)?,
            "policy" => config.policy = parse_policy_config(node)?,
            "logging" => config.logging = parse_logging_config(node)?,
            other => {
                return Err(anyhow::anyhow!(
                    "Unknown configuration section '{}'. Valid sections: store, authority, issuance, renewal, policy, logging",
                    other
                ));
            }
        }
    }

    debug!(
        authority = config.authority.kind.as_str(),
        store = %config.store.path.display(),
        "Parsed configuration"
    );

    Ok(config)
}
