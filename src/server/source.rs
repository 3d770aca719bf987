use super::ServerError;
use crate::config::{ConfigError, SourceConfig};
use log::{debug, trace};
use serde::Deserialize;
use std::{net::IpAddr, str::FromStr, time::Duration};

/// Where GitHub publishes the addresses its webhooks are sent from.
pub const GITHUB_META_URL: &str = "https://api.github.com/meta";

const META_TIMEOUT: Duration = Duration::from_secs(10);

/// A network in CIDR notation, like `192.30.252.0/22` or `2a0a:a440::/29`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    address: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.address, normalize(ip)) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.prefix);
                u32::from(network) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(network), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.prefix);
                u128::from(network) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpNetwork {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidNetwork(s.to_string());

        let (address, prefix) = match s.trim().split_once('/') {
            Some((address, prefix)) => (address, Some(prefix)),
            None => (s.trim(), None),
        };
        let address = IpAddr::from_str(address).map_err(|_| invalid())?;
        let max_prefix = if address.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(prefix) => prefix.parse::<u8>().map_err(|_| invalid())?,
            None => max_prefix,
        };
        if prefix > max_prefix {
            return Err(invalid());
        }

        Ok(IpNetwork { address, prefix })
    }
}

fn mask_u32(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0)
}

fn mask_u128(prefix: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0)
}

/// IPv4 callers on a dual-stack socket show up as `::ffff:a.b.c.d`.
fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

#[derive(Debug, Deserialize)]
struct GithubMeta {
    hooks: Vec<String>,
}

/// Decides which callers may deliver webhooks.
#[derive(Debug, Clone)]
pub struct SourceFilter {
    networks: Vec<IpNetwork>,
    meta_url: Option<String>,
}

impl SourceFilter {
    pub fn from_config(config: &SourceConfig) -> Result<Self, ConfigError> {
        let networks = config
            .allowed_networks
            .iter()
            .map(|network| network.parse())
            .collect::<Result<Vec<IpNetwork>, ConfigError>>()?;

        Ok(SourceFilter {
            networks,
            meta_url: config.github_meta.then(|| GITHUB_META_URL.to_string()),
        })
    }

    /// A filter that lets every caller in.
    pub fn disabled() -> Self {
        SourceFilter {
            networks: vec![],
            meta_url: None,
        }
    }

    /// Read the GitHub hook networks from another URL.
    pub fn with_meta_url(mut self, url: impl Into<String>) -> Self {
        self.meta_url = Some(url.into());
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.networks.is_empty() || self.meta_url.is_some()
    }

    /// Check the caller against the static networks, then against the current
    /// GitHub hook networks.
    ///
    /// If the GitHub networks can't be fetched, the caller is not let in.
    pub fn allows(&self, ip: IpAddr) -> Result<bool, ServerError> {
        if !self.is_enabled() {
            return Ok(true);
        }
        if self.networks.iter().any(|network| network.contains(ip)) {
            trace!("{ip} is in an allowed network.");
            return Ok(true);
        }

        match &self.meta_url {
            Some(url) => {
                let hooks = fetch_hook_networks(url)?;
                Ok(hooks.iter().any(|network| network.contains(ip)))
            }
            None => Ok(false),
        }
    }
}

fn fetch_hook_networks(url: &str) -> Result<Vec<IpNetwork>, ServerError> {
    debug!("Fetching hook networks from {url}.");
    let unavailable = |reason: String| ServerError::SourceCheckUnavailable(reason);

    let agent = ureq::AgentBuilder::new().timeout(META_TIMEOUT).build();
    let meta: GithubMeta = agent
        .get(url)
        .set("Accept", "application/json")
        .call()
        .map_err(|err| unavailable(err.to_string()))?
        .into_json()
        .map_err(|err| unavailable(err.to_string()))?;

    meta.hooks
        .iter()
        .map(|network| network.parse())
        .collect::<Result<Vec<IpNetwork>, ConfigError>>()
        .map_err(|err| unavailable(err.to_string()))
}
