// proxy.rs - Named-parameter gateway to one CIP device, plus a cyclic poller
//
// A proxy maps human parameter names (eg. "Motor Velocity") to attribute
// addresses, opening its gateway connection lazily and populating itself
// from the peer's List Identity.  On any raised failure the gateway must be
// closed so the next use reopens it; that is the proxy's one recovery
// contract, and `read`/`write` honour it internally.

use crate::client::{parse_operations, Connector, Method, OpResult, OpValue, Operation};
use crate::epath::Segment;
use crate::error::{EnipError, Result};
use crate::frame::IdentityItem;
use crate::types::CipType;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// An attribute address, its CIP type, and engineering units.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub path: String,
    pub typ: Option<CipType>,
    pub units: Option<String>,
}

impl Parameter {
    pub fn new(path: &str, typ: Option<CipType>, units: Option<&str>) -> Parameter {
        Parameter { path: path.to_string(), typ, units: units.map(|u| u.to_string()) }
    }
}

/// Normalize "Motor Velocity " -> "motor_velocity" for parameter lookup.
fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace(' ', "_")
}

pub struct Proxy {
    pub host: String,
    pub port: Option<u16>,
    pub timeout: Duration,
    pub depth: usize,
    pub multiple: usize,
    parameters: HashMap<String, Parameter>,
    gateway: Option<Connector>,
    /// Peer identity, captured when the gateway opens
    pub identity: Option<IdentityItem>,
}

impl Proxy {
    pub fn new(host: &str, port: Option<u16>) -> Proxy {
        let mut parameters = HashMap::new();
        // Every CIP device offers its product name
        parameters.insert(
            "product_name".to_string(),
            Parameter::new("@1/1/7", Some(CipType::Sstring), None),
        );
        Proxy {
            host: host.to_string(),
            port,
            timeout: Duration::from_secs(5),
            depth: 1,
            multiple: 0,
            parameters,
            gateway: None,
            identity: None,
        }
    }

    pub fn define(&mut self, name: &str, parameter: Parameter) {
        self.parameters.insert(normalize(name), parameter);
    }

    /// Replace bare parameter names with their attribute paths; anything
    /// carrying path syntax (`@`, `[`, `=`) passes through untouched.
    pub fn parameter_substitution(&self, names: &[&str]) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let (target, assignment) = match name.split_once('=') {
                Some((t, v)) => (t, Some(v)),
                None => (*name, None),
            };
            let resolved = match self.parameters.get(&normalize(target)) {
                Some(p) => match (&p.typ, assignment) {
                    (Some(t), Some(_)) => format!("{}=({})", p.path, t),
                    _ => p.path.clone(),
                },
                None => target.to_string(),
            };
            out.push(match assignment {
                Some(v) if resolved.ends_with(')') => format!("{}{}", resolved, v),
                Some(v) => format!("{}={}", resolved, v),
                None => resolved,
            });
        }
        Ok(out)
    }

    pub fn is_open(&self) -> bool {
        self.gateway.is_some()
    }

    /// Connect and self-describe, if not already open.
    pub async fn open_gateway(&mut self) -> Result<()> {
        if self.gateway.is_some() {
            return Ok(());
        }
        let mut conn = Connector::connect(&self.host, self.port, self.timeout).await?;
        match conn.list_identity().await {
            Ok(identity) => {
                if let Some(id) = &identity {
                    info!("gateway to {} is {:?}", self.host, id.product_name);
                }
                self.identity = identity;
            }
            Err(e) => debug!("peer did not answer List Identity: {}", e),
        }
        self.gateway = Some(conn);
        Ok(())
    }

    /// Drop the gateway; the next use reopens it.  Must be invoked after any
    /// raised failure.
    pub fn close_gateway(&mut self) {
        if self.gateway.take().is_some() {
            debug!("gateway to {} closed", self.host);
        }
    }

    async fn operate(&mut self, operations: &[&str]) -> Result<Vec<(String, OpResult)>> {
        self.open_gateway().await?;
        let substituted = self.parameter_substitution(operations)?;
        let refs: Vec<&str> = substituted.iter().map(|s| s.as_str()).collect();
        let ops: Vec<Operation> =
            parse_operations(&refs)?.into_iter().map(attribute_operation).collect();
        let depth = self.depth;
        let multiple = self.multiple;
        let gateway = self
            .gateway
            .as_mut()
            .ok_or_else(|| EnipError::Protocol("gateway not open".into()))?;
        let results = match gateway.operate(&ops, depth, multiple).await {
            Ok(results) => results,
            Err(e) => {
                // The recovery contract: a raised failure closes the gateway
                self.close_gateway();
                return Err(e);
            }
        };
        Ok(operations
            .iter()
            .map(|n| n.to_string())
            .zip(results)
            .collect())
    }

    /// Read the named parameters (or pass-through paths), yielding
    /// `(parameter, result)` pairs in request order.
    pub async fn read(&mut self, parameters: &[&str]) -> Result<Vec<(String, OpResult)>> {
        self.operate(parameters).await
    }

    /// Apply `name=value` assignments.
    pub async fn write(&mut self, assignments: &[&str]) -> Result<Vec<(String, OpResult)>> {
        self.operate(assignments).await
    }
}

/// Operations addressing an explicit attribute use the Get/Set Attribute
/// Single services instead of the Logix tag services; attributes are not
/// tags, and may hold types (strings, structs) the tag services cannot.
fn attribute_operation(mut op: Operation) -> Operation {
    if op.path.0.iter().any(|s| matches!(s, Segment::Attribute(_))) {
        op.method = match op.method {
            Method::Read => Method::GetAttributeSingle,
            Method::Write => Method::SetAttributeSingle,
            other => other,
        };
    }
    op
}

/// Cyclic polling of one proxy: every `cycle`, read all parameters and hand
/// each `(parameter, value)` to `process`; failures go to `failure` and back
/// off exponentially (the gateway having been closed by the proxy).
pub struct Poller {
    pub cycle: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub backoff_multiplier: f64,
}

impl Default for Poller {
    fn default() -> Poller {
        Poller {
            cycle: Duration::from_secs(1),
            backoff_min: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl Poller {
    /// Run until `stop` is raised.  `process` sees every polled value;
    /// `failure` sees every cycle-level error.
    pub async fn run<P, F>(
        &self,
        proxy: &mut Proxy,
        parameters: &[&str],
        mut process: P,
        mut failure: F,
        stop: &AtomicBool,
    ) where
        P: FnMut(&str, &OpValue),
        F: FnMut(&EnipError),
    {
        let mut backoff = self.backoff_min;
        while !stop.load(Ordering::SeqCst) {
            match proxy.read(parameters).await {
                Ok(results) => {
                    backoff = self.backoff_min;
                    for (name, result) in &results {
                        if result.ok() {
                            process(name, &result.value);
                        } else {
                            warn!(
                                "poll of {} failed with status 0x{:02X}",
                                name, result.status
                            );
                        }
                    }
                    tokio::time::sleep(self.cycle).await;
                }
                Err(e) => {
                    failure(&e);
                    warn!("poll cycle failed ({}); retrying in {:?}", e, backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = Duration::from_secs_f64(
                        (backoff.as_secs_f64() * self.backoff_multiplier)
                            .min(self.backoff_max.as_secs_f64()),
                    );
                }
            }
        }
    }
}
