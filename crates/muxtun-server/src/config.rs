//! Server configuration
//!
//! A JSON dictionary mirroring the tunnel's wire settings vocabulary. The
//! same tree is delivered to clients over the tunnel, minus the address
//! pool, which clients never see.

use muxtun_core::{TunnelError, TunnelResult};
use muxtun_proto::{ConfigMap, Value};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::warn;

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(rename = "IPv4", default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Settings>,

    #[serde(rename = "DNS", default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsSettings>,

    /// Opaque proxy settings forwarded to clients unchanged.
    #[serde(rename = "Proxies", default, skip_serializing_if = "Option::is_none")]
    pub proxies: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Ipv4Settings {
    #[serde(rename = "Address", default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(rename = "Netmask", default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,

    #[serde(rename = "Pool", default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolRange>,

    #[serde(rename = "Routes", default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRange {
    #[serde(rename = "StartAddress")]
    pub start_address: String,

    #[serde(rename = "EndAddress")]
    pub end_address: String,
}

impl PoolRange {
    pub fn parse(&self) -> TunnelResult<(Ipv4Addr, Ipv4Addr)> {
        let start = self.start_address.parse().map_err(|_| {
            TunnelError::BadConfiguration(format!("bad pool start {}", self.start_address))
        })?;
        let end = self.end_address.parse().map_err(|_| {
            TunnelError::BadConfiguration(format!("bad pool end {}", self.end_address))
        })?;
        Ok((start, end))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    #[serde(rename = "Address")]
    pub address: String,

    #[serde(rename = "Netmask")]
    pub netmask: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DnsSettings {
    #[serde(rename = "Servers", default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<String>,

    #[serde(rename = "SearchDomains", default, skip_serializing_if = "Vec::is_empty")]
    pub search_domains: Vec<String>,
}

impl DnsSettings {
    /// Resolver settings of the host, read from `/etc/resolv.conf`.
    pub fn from_system() -> DnsSettings {
        Self::from_resolv_conf(RESOLV_CONF)
    }

    fn from_resolv_conf(path: &str) -> DnsSettings {
        let mut settings = DnsSettings::default();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(path, error = %e, "cannot read resolver configuration");
                return settings;
            }
        };
        for line in contents.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("nameserver") {
                if let Some(server) = rest.split_whitespace().next() {
                    settings.servers.push(server.to_string());
                }
            } else if let Some(rest) = line.strip_prefix("search") {
                settings
                    .search_domains
                    .extend(rest.split_whitespace().map(String::from));
            }
        }
        settings
    }
}

impl ServerConfig {
    /// Load the configuration file. Any failure here is fatal at startup.
    ///
    /// When the file does not name DNS servers, the host's resolver
    /// configuration is captured at load time.
    pub fn load(path: &Path) -> TunnelResult<ServerConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::BadConfiguration(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config: ServerConfig = serde_json::from_str(&contents).map_err(|e| {
            TunnelError::BadConfiguration(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.fill_system_dns();
        Ok(config)
    }

    pub fn fill_system_dns(&mut self) {
        if self.dns.is_none() {
            self.dns = Some(DnsSettings::from_system());
        }
    }

    /// The full settings tree in wire form, pool included.
    pub fn to_wire(&self) -> ConfigMap {
        let mut root = ConfigMap::new();

        if let Some(ipv4) = &self.ipv4 {
            let mut v4 = ConfigMap::new();
            if let Some(address) = &ipv4.address {
                v4.insert("Address".into(), Value::from(address.as_str()));
            }
            if let Some(netmask) = &ipv4.netmask {
                v4.insert("Netmask".into(), Value::from(netmask.as_str()));
            }
            if let Some(pool) = &ipv4.pool {
                let mut range = ConfigMap::new();
                range.insert(
                    "StartAddress".into(),
                    Value::from(pool.start_address.as_str()),
                );
                range.insert("EndAddress".into(), Value::from(pool.end_address.as_str()));
                v4.insert("Pool".into(), Value::Map(range));
            }
            if !ipv4.routes.is_empty() {
                let routes = ipv4
                    .routes
                    .iter()
                    .map(|route| {
                        let mut entry = ConfigMap::new();
                        entry.insert("Address".into(), Value::from(route.address.as_str()));
                        entry.insert("Netmask".into(), Value::from(route.netmask.as_str()));
                        Value::Map(entry)
                    })
                    .collect();
                v4.insert("Routes".into(), Value::List(routes));
            }
            root.insert("IPv4".into(), Value::Map(v4));
        }

        if let Some(dns) = &self.dns {
            let mut d = ConfigMap::new();
            if !dns.servers.is_empty() {
                d.insert(
                    "Servers".into(),
                    Value::List(dns.servers.iter().map(|s| Value::from(s.as_str())).collect()),
                );
            }
            if !dns.search_domains.is_empty() {
                d.insert(
                    "SearchDomains".into(),
                    Value::List(
                        dns.search_domains
                            .iter()
                            .map(|s| Value::from(s.as_str()))
                            .collect(),
                    ),
                );
            }
            root.insert("DNS".into(), Value::Map(d));
        }

        if let Some(proxies) = &self.proxies {
            if let Some(value) = json_to_value(proxies) {
                root.insert("Proxies".into(), value);
            }
        }

        root
    }

    /// The settings delivered to a client: everything except the pool range.
    pub fn client_view(&self) -> ConfigMap {
        let mut wire = self.to_wire();
        if let Some(Value::Map(v4)) = wire.get_mut("IPv4") {
            v4.remove("Pool");
        }
        wire
    }

    /// Per-flow settings for an IP flow: the client view plus the address
    /// assigned to this flow.
    pub fn flow_view(&self, address: Ipv4Addr) -> ConfigMap {
        let mut wire = self.client_view();
        let v4 = wire
            .entry("IPv4".to_string())
            .or_insert_with(|| Value::Map(ConfigMap::new()));
        if let Value::Map(v4) = v4 {
            v4.insert("Address".into(), Value::from(address.to_string()));
        }
        wire
    }
}

fn json_to_value(json: &serde_json::Value) -> Option<Value> {
    match json {
        serde_json::Value::Null => None,
        serde_json::Value::Bool(flag) => Some(Value::Int(*flag as i64)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(n) => Some(Value::Int(n)),
            None => Some(Value::Str(n.to_string())),
        },
        serde_json::Value::String(s) => Some(Value::Str(s.clone())),
        serde_json::Value::Array(items) => {
            Some(Value::List(items.iter().filter_map(json_to_value).collect()))
        }
        serde_json::Value::Object(entries) => Some(Value::Map(
            entries
                .iter()
                .filter_map(|(key, value)| json_to_value(value).map(|v| (key.clone(), v)))
                .collect(),
        )),
    }
}
