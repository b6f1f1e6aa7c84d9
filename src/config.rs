// config.rs - ini-style configuration document
//
// Sections [Identity], [TCPIP], [UCMM] and [Originator]; values are scalar
// strings, integers (0x/0o/0b prefixes honoured, leading zeros decimal), or
// JSON literals where noted.  A parse failure is reported once and is fatal
// to the process.

use crate::cip::{RouteEntry, RoutePolicy, Ucmm};
use crate::device::{IdentityConfig, InterfaceConfiguration, TcpipConfig};
use crate::epath::{parse_int, Epath, Segment};
use crate::error::{EnipError, Result};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Client-side defaults from the `[Originator]` section.
#[derive(Debug, Clone)]
pub struct OriginatorConfig {
    pub host: String,
    pub port: u16,
    pub timeout: f64,
    pub depth: usize,
    pub multiple: usize,
}

impl Default for OriginatorConfig {
    fn default() -> OriginatorConfig {
        OriginatorConfig {
            host: "127.0.0.1".to_string(),
            port: crate::frame::DEFAULT_PORT,
            timeout: 5.0,
            depth: 1,
            multiple: 0,
        }
    }
}

/// The parsed document.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub identity: IdentityConfig,
    pub tcpip: TcpipConfig,
    pub ucmm: Ucmm,
    pub originator: OriginatorConfig,
}

/// Raw section/key/value view of the document.
#[derive(Debug, Clone, Default)]
pub struct RawConfig {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl RawConfig {
    pub fn parse(text: &str) -> Result<RawConfig> {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current = String::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or_else(|| {
                    EnipError::Config(format!("line {}: unterminated section header", lineno + 1))
                })?;
                current = name.trim().to_string();
                sections.entry(current.clone()).or_default();
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                EnipError::Config(format!("line {}: expected key = value", lineno + 1))
            })?;
            if current.is_empty() {
                return Err(EnipError::Config(format!(
                    "line {}: option outside any section",
                    lineno + 1
                )));
            }
            sections
                .entry(current.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(RawConfig { sections })
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section).and_then(|s| s.get(key)).map(|s| s.as_str())
    }

    fn int(&self, section: &str, key: &str, default: i64) -> Result<i64> {
        match self.get(section, key) {
            Some(v) => parse_int(v),
            None => Ok(default),
        }
    }

    fn string(&self, section: &str, key: &str, default: &str) -> String {
        self.get(section, key).unwrap_or(default).to_string()
    }

    fn json(&self, section: &str, key: &str) -> Result<Option<serde_json::Value>> {
        match self.get(section, key) {
            None => Ok(None),
            Some(v) => serde_json::from_str(v)
                .map(Some)
                .map_err(|e| EnipError::Config(format!("{} / {}: bad JSON: {}", section, key, e))),
        }
    }
}

fn parse_ipv4(value: &serde_json::Value, what: &str) -> Result<Option<Ipv4Addr>> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => s
            .parse::<Ipv4Addr>()
            .map(Some)
            .map_err(|e| EnipError::Config(format!("{}: bad address {:?}: {}", what, s, e))),
        other => Err(EnipError::Config(format!("{}: expected address string, got {}", what, other))),
    }
}

/// `Route Path` value: JSON `null` (accept any), `false`/`0` (accept only an
/// empty route path), a JSON segment list, or the `port/link` short form.
pub fn parse_route_path(value: &str) -> Result<RoutePolicy> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("null") {
        return Ok(RoutePolicy::Any);
    }
    if trimmed.eq_ignore_ascii_case("false") || trimmed == "0" {
        return Ok(RoutePolicy::EmptyOnly);
    }
    if trimmed.starts_with('[') {
        let parsed: serde_json::Value = serde_json::from_str(trimmed)
            .map_err(|e| EnipError::Config(format!("Route Path: bad JSON: {}", e)))?;
        let arr = parsed
            .as_array()
            .ok_or_else(|| EnipError::Config("Route Path must be a list".into()))?;
        let segs = arr.iter().map(Segment::from_json).collect::<Result<Vec<_>>>()?;
        return Ok(RoutePolicy::Exact(segs));
    }
    // port/link short form, eg. "1/0"
    let (port, link) = trimmed
        .split_once('/')
        .ok_or_else(|| EnipError::Config(format!("Route Path {:?} not port/link", value)))?;
    let seg = Segment::from_json(&serde_json::json!({
        "port": parse_int(port)? as u16,
        "link": parse_int(link)? as u8,
    }))?;
    Ok(RoutePolicy::Exact(vec![seg]))
}

/// `Route` table: JSON object mapping `port/link`, `port/lo-hi` or
/// `port/ip.address` to a downstream `host:port`.
pub fn parse_route_table(value: &serde_json::Value) -> Result<Vec<RouteEntry>> {
    let obj = value
        .as_object()
        .ok_or_else(|| EnipError::Config("Route must be an object".into()))?;
    let mut entries = Vec::new();
    for (pattern, target) in obj {
        let target = target
            .as_str()
            .ok_or_else(|| EnipError::Config(format!("Route {:?}: target must be host:port", pattern)))?;
        let (port, link) = pattern.split_once('/').ok_or_else(|| {
            EnipError::Config(format!("Route key {:?} must be port/link", pattern))
        })?;
        let port = parse_int(port)? as u16;
        let entry = if link.chars().all(|c| c.is_ascii_digit() || c == '-') && !link.contains('.') {
            let (lo, hi) = match link.split_once('-') {
                Some((lo, hi)) => (parse_int(lo)? as u8, parse_int(hi)? as u8),
                None => {
                    let n = parse_int(link)? as u8;
                    (n, n)
                }
            };
            RouteEntry { port, link_min: lo, link_max: hi, link_addr: None, target: target.to_string() }
        } else {
            RouteEntry {
                port,
                link_min: 0,
                link_max: 0,
                link_addr: Some(link.to_string()),
                target: target.to_string(),
            }
        };
        entries.push(entry);
    }
    Ok(entries)
}

impl Config {
    pub fn parse(text: &str) -> Result<Config> {
        let raw = RawConfig::parse(text)?;
        Config::from_raw(&raw)
    }

    pub fn from_raw(raw: &RawConfig) -> Result<Config> {
        let d = IdentityConfig::default();
        let identity = IdentityConfig {
            vendor: raw.int("Identity", "Vendor Number", d.vendor as i64)? as u16,
            device_type: raw.int("Identity", "Device Type", d.device_type as i64)? as u16,
            product_code: raw.int("Identity", "Product Code Number", d.product_code as i64)? as u16,
            product_revision: raw.int("Identity", "Product Revision", d.product_revision as i64)?
                as u16,
            status_word: raw.int("Identity", "Status Word", d.status_word as i64)? as u16,
            serial_number: raw.int("Identity", "Serial Number", d.serial_number as i64)? as u32,
            product_name: raw.string("Identity", "Product Name", &d.product_name),
            state: raw.int("Identity", "State", d.state as i64)? as u8,
            configuration_consistency: raw.int(
                "Identity",
                "Configuration Consistency Value",
                d.configuration_consistency as i64,
            )? as u16,
            heartbeat_interval: raw.int("Identity", "Heartbeat Interval", d.heartbeat_interval as i64)?
                as u8,
        };

        let mut tcpip = TcpipConfig {
            interface_status: raw.int("TCPIP", "Interface Status", 2)? as u32,
            configuration_capability: raw.int("TCPIP", "Configuration Capability", 0x30)? as u32,
            configuration_control: raw.int("TCPIP", "Configuration Control", 0)? as u32,
            host_name: raw.string("TCPIP", "Host Name", ""),
            ..TcpipConfig::default()
        };
        if let Some(path) = raw.json("TCPIP", "Path to Physical Link")? {
            let arr = path
                .as_array()
                .ok_or_else(|| EnipError::Config("Path to Physical Link must be a list".into()))?;
            tcpip.path_to_physical_link =
                Epath(arr.iter().map(Segment::from_json).collect::<Result<Vec<_>>>()?);
        }
        if let Some(ifc) = raw.json("TCPIP", "Interface Configuration")? {
            let obj = ifc
                .as_object()
                .ok_or_else(|| EnipError::Config("Interface Configuration must be an object".into()))?;
            let addr = |key: &str| -> Result<Option<Ipv4Addr>> {
                match obj.get(key) {
                    None => Ok(None),
                    Some(v) => parse_ipv4(v, key),
                }
            };
            tcpip.interface_configuration = InterfaceConfiguration {
                ip_address: addr("ip_address")?,
                gateway_address: addr("gateway_address")?,
                network_mask: addr("network_mask")?,
                dns_primary: addr("dns_primary")?,
                dns_secondary: addr("dns_secondary")?,
                domain_name: obj
                    .get("domain_name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            };
        }

        let mut ucmm = Ucmm::default();
        if let Some(rp) = raw.get("UCMM", "Route Path") {
            ucmm.route_path = parse_route_path(rp)?;
        }
        if let Some(route) = raw.json("UCMM", "Route")? {
            ucmm.routes = parse_route_table(&route)?;
        }

        let od = OriginatorConfig::default();
        let originator = OriginatorConfig {
            host: raw.string("Originator", "Host", &od.host),
            port: raw.int("Originator", "Port", od.port as i64)? as u16,
            timeout: raw
                .get("Originator", "Timeout")
                .map(|v| {
                    v.parse::<f64>()
                        .map_err(|e| EnipError::Config(format!("Timeout: {}", e)))
                })
                .transpose()?
                .unwrap_or(od.timeout),
            depth: raw.int("Originator", "Depth", od.depth as i64)? as usize,
            multiple: raw.int("Originator", "Multiple", od.multiple as i64)? as usize,
        };

        Ok(Config { identity, tcpip, ucmm, originator })
    }
}
