// device.rs - CIP object model: classes, instances, attributes, tag namespace
//
// The registry is assembled once at startup and immutable thereafter; every
// instance's attribute data sits behind its own mutex, held for the duration
// of a single service invocation.

use crate::epath::{Epath, Segment};
use crate::error::{EnipError, Result};
use crate::types::{encode_array, encode_string, encode_sstring, CipType, CipValue};
use lazy_static::lazy_static;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const CLASS_IDENTITY: u16 = 0x01;
pub const CLASS_MESSAGE_ROUTER: u16 = 0x02;
pub const CLASS_ASSEMBLY: u16 = 0x04;
pub const CLASS_CONNECTION_MANAGER: u16 = 0x06;
pub const CLASS_SYMBOL: u16 = 0x6B;
pub const CLASS_TCPIP: u16 = 0xF5;
pub const CLASS_ETHERNET_LINK: u16 = 0xF6;

lazy_static! {
    /// CIP general status text, for logs and error surfaces.
    pub static ref STATUS_TEXT: HashMap<u8, &'static str> = {
        let mut m = HashMap::new();
        m.insert(0x00, "Success");
        m.insert(0x01, "Connection failure");
        m.insert(0x02, "Resource unavailable");
        m.insert(0x03, "Invalid parameter value");
        m.insert(0x04, "Path segment error");
        m.insert(0x05, "Path destination unknown");
        m.insert(0x06, "Partial transfer");
        m.insert(0x08, "Service not supported");
        m.insert(0x0E, "Attribute not settable");
        m.insert(0x10, "Device state conflict");
        m.insert(0x11, "Reply data too large");
        m.insert(0x13, "Not enough data");
        m.insert(0x14, "Attribute not supported");
        m.insert(0x15, "Too much data");
        m.insert(0x16, "Object does not exist");
        m.insert(0x1A, "Routing failure, request packet too large");
        m.insert(0x26, "Path size invalid");
        m.insert(0xFF, "General error");
        m
    };
}

pub fn status_text(status: u8) -> &'static str {
    STATUS_TEXT.get(&status).copied().unwrap_or("Vendor specific error")
}

/// Capability interface every attribute exposes.  The default serves a raw
/// backing buffer; custom implementations synthesize values or journal
/// writes.
pub trait AttributeHandler: Send + Sync {
    fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>>;
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;
    fn size(&self) -> usize;
}

/// Default storage: a plain byte buffer.
pub struct RawBuffer {
    data: Vec<u8>,
}

impl RawBuffer {
    pub fn new(data: Vec<u8>) -> RawBuffer {
        RawBuffer { data }
    }
}

impl AttributeHandler for RawBuffer {
    fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        if offset + len > self.data.len() {
            return Err(EnipError::Service { status: 0xFF, extended: vec![0x2105] });
        }
        Ok(self.data[offset..offset + len].to_vec())
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() > self.data.len() {
            return Err(EnipError::Service { status: 0xFF, extended: vec![0x2105] });
        }
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn size(&self) -> usize {
        self.data.len()
    }
}

/// An addressable data container owned by an Instance.
pub struct Attribute {
    pub name: String,
    pub typ: CipType,
    /// Array cardinality; 1 for scalars
    pub count: usize,
    /// Induced error: served instead of success when non-zero
    pub error: u8,
    handler: Box<dyn AttributeHandler>,
}

impl Attribute {
    /// Typed attribute backed by a raw buffer initialized from `defaults`,
    /// zero-filled to `count` elements.
    pub fn new(name: &str, typ: CipType, count: usize, defaults: &[CipValue]) -> Attribute {
        let mut data = Vec::new();
        encode_array(defaults, &mut data);
        if let Some(size) = typ.size() {
            data.resize(size * count, 0);
        }
        Attribute {
            name: name.to_string(),
            typ,
            count,
            error: 0,
            handler: Box::new(RawBuffer::new(data)),
        }
    }

    /// Untyped attribute holding pre-encoded bytes (structs, EPATHs,
    /// strings); served raw by Get-Attribute services.
    pub fn raw(name: &str, bytes: Vec<u8>) -> Attribute {
        let count = bytes.len();
        Attribute {
            name: name.to_string(),
            typ: CipType::Usint,
            count,
            error: 0,
            handler: Box::new(RawBuffer::new(bytes)),
        }
    }

    pub fn with_handler(
        name: &str,
        typ: CipType,
        count: usize,
        handler: Box<dyn AttributeHandler>,
    ) -> Attribute {
        Attribute { name: name.to_string(), typ, count, error: 0, handler }
    }

    pub fn element_size(&self) -> usize {
        self.typ.size().unwrap_or(1)
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.handler.read(offset, len)
    }

    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.handler.write(offset, bytes)
    }

    pub fn byte_size(&self) -> usize {
        self.handler.size()
    }
}

/// A numbered child of a Class, owning attributes keyed by attribute number.
pub struct Instance {
    pub instance_id: u16,
    pub attributes: BTreeMap<u16, Attribute>,
}

impl Instance {
    pub fn new(instance_id: u16) -> Instance {
        Instance { instance_id, attributes: BTreeMap::new() }
    }

    pub fn attribute(&self, id: u16) -> Result<&Attribute> {
        self.attributes
            .get(&id)
            .ok_or(EnipError::Service { status: 0x14, extended: vec![] })
    }

    pub fn attribute_mut(&mut self, id: u16) -> Result<&mut Attribute> {
        self.attributes
            .get_mut(&id)
            .ok_or(EnipError::Service { status: 0x14, extended: vec![] })
    }
}

/// A process-wide registry entry identified by class code; owns an
/// instance 0 (the class object) and numbered instances.
pub struct Class {
    pub class_id: u16,
    pub name: String,
    pub instances: BTreeMap<u16, Arc<Mutex<Instance>>>,
}

impl Class {
    fn new(class_id: u16, name: &str) -> Class {
        let mut instances = BTreeMap::new();
        let mut class_obj = Instance::new(0);
        class_obj
            .attributes
            .insert(1, Attribute::new("Revision", CipType::Uint, 1, &[CipValue::Uint(1)]));
        instances.insert(0, Arc::new(Mutex::new(class_obj)));
        Class { class_id, name: name.to_string(), instances }
    }
}

/// Where a symbolic tag lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagAddress {
    pub class: u16,
    pub instance: u16,
    pub attribute: u16,
}

/// A fully resolved request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub class: u16,
    pub instance: u16,
    pub attribute: Option<u16>,
    pub element: u32,
}

/// Identity object configuration; defaults mirror a 1756-L61 controller.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub vendor: u16,
    pub device_type: u16,
    pub product_code: u16,
    pub product_revision: u16,
    pub status_word: u16,
    pub serial_number: u32,
    pub product_name: String,
    pub state: u8,
    pub configuration_consistency: u16,
    pub heartbeat_interval: u8,
}

impl Default for IdentityConfig {
    fn default() -> IdentityConfig {
        IdentityConfig {
            vendor: 0x0001,
            device_type: 0x000E,
            product_code: 0x0036,
            product_revision: 0x0B14,
            status_word: 0x3160,
            serial_number: 0x006C_061A,
            product_name: "1756-L61/B LOGIX5561".to_string(),
            state: 0xFF,
            configuration_consistency: 0,
            heartbeat_interval: 0,
        }
    }
}

/// TCP/IP Interface object configuration.
#[derive(Debug, Clone, Default)]
pub struct TcpipConfig {
    pub interface_status: u32,
    pub configuration_capability: u32,
    pub configuration_control: u32,
    pub host_name: String,
    pub path_to_physical_link: Epath,
    pub interface_configuration: InterfaceConfiguration,
}

#[derive(Debug, Clone, Default)]
pub struct InterfaceConfiguration {
    pub ip_address: Option<Ipv4Addr>,
    pub gateway_address: Option<Ipv4Addr>,
    pub network_mask: Option<Ipv4Addr>,
    pub dns_primary: Option<Ipv4Addr>,
    pub dns_secondary: Option<Ipv4Addr>,
    pub domain_name: String,
}

impl InterfaceConfiguration {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for addr in [
            self.ip_address,
            self.gateway_address,
            self.network_mask,
            self.dns_primary,
            self.dns_secondary,
        ] {
            out.extend_from_slice(&addr.unwrap_or(Ipv4Addr::UNSPECIFIED).octets());
        }
        encode_string(&self.domain_name, &mut out);
        out
    }
}

/// A declared Logix tag: `name[@class/instance/attribute]=TYPE[count]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TagSpec {
    pub name: String,
    pub address: Option<TagAddress>,
    pub typ: CipType,
    pub count: usize,
}

impl TagSpec {
    pub fn parse(spec: &str) -> Result<TagSpec> {
        let (lhs, rhs) = spec
            .split_once('=')
            .ok_or_else(|| EnipError::Config(format!("tag {:?} must be name=TYPE[count]", spec)))?;
        let (name, address) = match lhs.split_once('@') {
            Some((name, addr)) => {
                let parts: Vec<&str> = addr.split('/').collect();
                if parts.len() != 3 {
                    return Err(EnipError::Config(format!(
                        "tag address {:?} must be class/instance/attribute",
                        addr
                    )));
                }
                let addr = TagAddress {
                    class: crate::epath::parse_int(parts[0])? as u16,
                    instance: crate::epath::parse_int(parts[1])? as u16,
                    attribute: crate::epath::parse_int(parts[2])? as u16,
                };
                (name, Some(addr))
            }
            None => (lhs, None),
        };
        let (typ_name, count) = match rhs.split_once('[') {
            Some((t, c)) => {
                let c = c
                    .strip_suffix(']')
                    .ok_or_else(|| EnipError::Config(format!("unbalanced '[' in {:?}", spec)))?;
                (t, crate::epath::parse_int(c)? as usize)
            }
            None => (rhs, 1),
        };
        let typ = CipType::from_name(typ_name)
            .ok_or_else(|| EnipError::Config(format!("unknown tag type {:?}", typ_name)))?;
        if name.is_empty() || count == 0 {
            return Err(EnipError::Config(format!("invalid tag declaration {:?}", spec)));
        }
        Ok(TagSpec { name: name.to_string(), address, typ, count })
    }
}

/// The CIP device: class registry plus the symbolic tag namespace.
pub struct Device {
    classes: HashMap<u16, Class>,
    tags: HashMap<String, TagAddress>,
    pub identity: IdentityConfig,
    pub tcpip: TcpipConfig,
    /// Ceiling on fragmented read reply data bytes
    pub reply_size_limit: usize,
}

impl Device {
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder {
            identity: IdentityConfig::default(),
            tcpip: TcpipConfig::default(),
            tags: Vec::new(),
            reply_size_limit: 500,
            assembly: false,
        }
    }

    pub fn class(&self, class_id: u16) -> Option<&Class> {
        self.classes.get(&class_id)
    }

    pub fn lookup(&self, class_id: u16, instance_id: u16) -> Result<&Arc<Mutex<Instance>>> {
        self.classes
            .get(&class_id)
            .and_then(|c| c.instances.get(&instance_id))
            .ok_or(EnipError::Service { status: 0x16, extended: vec![] })
    }

    pub fn tag(&self, name: &str) -> Option<TagAddress> {
        self.tags.get(name).copied()
    }

    pub fn tag_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tags.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Translate an EPATH to `(class, instance, attribute)` plus element
    /// index.  Symbolic segments are joined with '.' and resolved through
    /// the tag namespace; a symbolic and a numeric read of the same tag
    /// address the same bytes.
    pub fn resolve(&self, path: &Epath) -> Result<Resolved> {
        let mut class = None;
        let mut instance = None;
        let mut attribute = None;
        let mut element = 0u32;
        let mut symbolic = String::new();
        for seg in &path.0 {
            match seg {
                Segment::Class(v) => class = Some(*v),
                // Connection points within the Assembly class are identical
                // to instances
                Segment::Instance(v) | Segment::Connection(v) => instance = Some(*v),
                Segment::Attribute(v) => attribute = Some(*v),
                Segment::Element(v) => element = *v,
                Segment::Symbolic(s) => {
                    if !symbolic.is_empty() {
                        symbolic.push('.');
                    }
                    symbolic.push_str(s);
                }
                Segment::Port { .. } => {
                    return Err(EnipError::Service { status: 0x04, extended: vec![0] })
                }
            }
        }
        if !symbolic.is_empty() {
            let addr = self
                .tags
                .get(&symbolic)
                .ok_or(EnipError::Service { status: 0x05, extended: vec![0] })?;
            return Ok(Resolved {
                class: addr.class,
                instance: addr.instance,
                attribute: Some(addr.attribute),
                element,
            });
        }
        let class = class.ok_or(EnipError::Service { status: 0x04, extended: vec![0] })?;
        let instance = instance.ok_or(EnipError::Service { status: 0x05, extended: vec![0] })?;
        Ok(Resolved { class, instance, attribute, element })
    }

    /// Attribute metadata `(type, element count, induced error)` without
    /// holding the instance lock beyond the call.
    pub async fn attribute_info(&self, r: &Resolved) -> Result<(CipType, usize, u8)> {
        let attr_id = r.attribute.ok_or(EnipError::Service { status: 0x05, extended: vec![0] })?;
        let inst = self.lookup(r.class, r.instance)?.lock().await;
        let attr = inst.attribute(attr_id)?;
        Ok((attr.typ, attr.count, attr.error))
    }

    /// Run one service invocation against the addressed attribute, holding
    /// the owning instance's mutex for the whole invocation.
    pub async fn with_attribute<R>(
        &self,
        r: &Resolved,
        f: impl FnOnce(&mut Attribute) -> Result<R>,
    ) -> Result<R> {
        let attr_id = r.attribute.ok_or(EnipError::Service { status: 0x05, extended: vec![0] })?;
        let mut inst = self.lookup(r.class, r.instance)?.lock().await;
        f(inst.attribute_mut(attr_id)?)
    }

    pub async fn read_attribute(&self, r: &Resolved, offset: usize, len: usize) -> Result<Vec<u8>> {
        let attr_id = r.attribute.ok_or(EnipError::Service { status: 0x05, extended: vec![0] })?;
        let inst = self.lookup(r.class, r.instance)?.lock().await;
        inst.attribute(attr_id)?.read(offset, len)
    }

    pub async fn write_attribute(&self, r: &Resolved, offset: usize, bytes: &[u8]) -> Result<()> {
        let attr_id = r.attribute.ok_or(EnipError::Service { status: 0x05, extended: vec![0] })?;
        let mut inst = self.lookup(r.class, r.instance)?.lock().await;
        inst.attribute_mut(attr_id)?.write(offset, bytes)
    }

    /// All attribute payloads of an instance concatenated in attribute-number
    /// order, for Get-Attributes-All.
    pub async fn read_all_attributes(&self, class: u16, instance: u16) -> Result<Vec<u8>> {
        let inst = self.lookup(class, instance)?.lock().await;
        let mut out = Vec::new();
        for attr in inst.attributes.values() {
            out.extend_from_slice(&attr.read(0, attr.byte_size())?);
        }
        Ok(out)
    }

    /// Force an error status on every access to the named tag; 0 restores
    /// normal service.
    pub async fn set_tag_error(&self, name: &str, error: u8) -> Result<()> {
        let addr = self
            .tag(name)
            .ok_or(EnipError::Service { status: 0x05, extended: vec![0] })?;
        let mut inst = self.lookup(addr.class, addr.instance)?.lock().await;
        inst.attribute_mut(addr.attribute)?.error = error;
        Ok(())
    }
}

/// Assembles the write-once registry.
pub struct DeviceBuilder {
    identity: IdentityConfig,
    tcpip: TcpipConfig,
    tags: Vec<TagSpec>,
    reply_size_limit: usize,
    assembly: bool,
}

impl DeviceBuilder {
    pub fn identity(mut self, identity: IdentityConfig) -> Self {
        self.identity = identity;
        self
    }

    pub fn tcpip(mut self, tcpip: TcpipConfig) -> Self {
        self.tcpip = tcpip;
        self
    }

    pub fn reply_size_limit(mut self, limit: usize) -> Self {
        self.reply_size_limit = limit;
        self
    }

    pub fn assembly(mut self) -> Self {
        self.assembly = true;
        self
    }

    pub fn tag(mut self, spec: TagSpec) -> Self {
        self.tags.push(spec);
        self
    }

    pub fn tag_str(self, spec: &str) -> Result<Self> {
        let spec = TagSpec::parse(spec)?;
        Ok(self.tag(spec))
    }

    pub fn build(self) -> Result<Arc<Device>> {
        let mut classes = HashMap::new();

        // Identity, instance 1
        let mut identity_class = Class::new(CLASS_IDENTITY, "Identity");
        let mut ident = Instance::new(1);
        let idc = &self.identity;
        ident.attributes.insert(1, Attribute::new("Vendor Number", CipType::Int, 1, &[CipValue::Int(idc.vendor as i16)]));
        ident.attributes.insert(2, Attribute::new("Device Type", CipType::Int, 1, &[CipValue::Int(idc.device_type as i16)]));
        ident.attributes.insert(3, Attribute::new("Product Code Number", CipType::Int, 1, &[CipValue::Int(idc.product_code as i16)]));
        ident.attributes.insert(4, Attribute::new("Product Revision", CipType::Int, 1, &[CipValue::Int(idc.product_revision as i16)]));
        ident.attributes.insert(5, Attribute::new("Status Word", CipType::Word, 1, &[CipValue::Word(idc.status_word)]));
        ident.attributes.insert(6, Attribute::new("Serial Number", CipType::Udint, 1, &[CipValue::Udint(idc.serial_number)]));
        let mut pn = Vec::new();
        encode_sstring(&idc.product_name, None, &mut pn);
        let mut product_name = Attribute::raw("Product Name", pn);
        product_name.typ = CipType::Sstring;
        ident.attributes.insert(7, product_name);
        ident.attributes.insert(8, Attribute::new("State", CipType::Usint, 1, &[CipValue::Usint(idc.state)]));
        ident.attributes.insert(9, Attribute::new("Configuration Consistency Value", CipType::Uint, 1, &[CipValue::Uint(idc.configuration_consistency)]));
        ident.attributes.insert(10, Attribute::new("Heartbeat Interval", CipType::Usint, 1, &[CipValue::Usint(idc.heartbeat_interval)]));
        identity_class.instances.insert(1, Arc::new(Mutex::new(ident)));
        classes.insert(CLASS_IDENTITY, identity_class);

        // TCPIP Interface, instance 1
        let mut tcpip_class = Class::new(CLASS_TCPIP, "TCPIP Interface");
        let mut tcpip = Instance::new(1);
        let tcc = &self.tcpip;
        tcpip.attributes.insert(1, Attribute::new("Interface Status", CipType::Dword, 1, &[CipValue::Dword(tcc.interface_status)]));
        tcpip.attributes.insert(2, Attribute::new("Configuration Capability", CipType::Dword, 1, &[CipValue::Dword(tcc.configuration_capability)]));
        tcpip.attributes.insert(3, Attribute::new("Configuration Control", CipType::Dword, 1, &[CipValue::Dword(tcc.configuration_control)]));
        tcpip.attributes.insert(4, Attribute::raw("Path to Physical Link", tcc.path_to_physical_link.encode(true)));
        tcpip.attributes.insert(5, Attribute::raw("Interface Configuration", tcc.interface_configuration.encode()));
        let mut host = Vec::new();
        encode_string(&tcc.host_name, &mut host);
        let mut host_attr = Attribute::raw("Host Name", host);
        host_attr.typ = CipType::StringType;
        tcpip.attributes.insert(6, host_attr);
        tcpip_class.instances.insert(1, Arc::new(Mutex::new(tcpip)));
        classes.insert(CLASS_TCPIP, tcpip_class);

        // Ethernet Link, instance 1
        let mut link_class = Class::new(CLASS_ETHERNET_LINK, "Ethernet Link");
        let mut link = Instance::new(1);
        link.attributes.insert(1, Attribute::new("Interface Speed", CipType::Udint, 1, &[CipValue::Udint(100)]));
        link.attributes.insert(2, Attribute::new("Interface Flags", CipType::Dword, 1, &[CipValue::Dword(0x03)]));
        link.attributes.insert(3, Attribute::raw("Physical Address", vec![0, 0, 0, 0, 0, 0]));
        link_class.instances.insert(1, Arc::new(Mutex::new(link)));
        classes.insert(CLASS_ETHERNET_LINK, link_class);

        // Message Router and Connection Manager, instance 1 (no attributes
        // beyond the class object; they exist to be addressed)
        let mut router_class = Class::new(CLASS_MESSAGE_ROUTER, "Message Router");
        router_class.instances.insert(1, Arc::new(Mutex::new(Instance::new(1))));
        classes.insert(CLASS_MESSAGE_ROUTER, router_class);
        let mut cm_class = Class::new(CLASS_CONNECTION_MANAGER, "Connection Manager");
        cm_class.instances.insert(1, Arc::new(Mutex::new(Instance::new(1))));
        classes.insert(CLASS_CONNECTION_MANAGER, cm_class);

        if self.assembly {
            let mut asm_class = Class::new(CLASS_ASSEMBLY, "Assembly");
            asm_class.instances.insert(1, Arc::new(Mutex::new(Instance::new(1))));
            classes.insert(CLASS_ASSEMBLY, asm_class);
        }

        // Tag namespace: unbound tags become numbered instances of the
        // Symbol class, attribute 1; bound tags land where directed.
        let mut tags = HashMap::new();
        let mut next_symbol_instance = 1u16;
        for spec in &self.tags {
            let addr = match spec.address {
                Some(addr) => addr,
                None => {
                    let addr = TagAddress {
                        class: CLASS_SYMBOL,
                        instance: next_symbol_instance,
                        attribute: 1,
                    };
                    next_symbol_instance += 1;
                    addr
                }
            };
            if tags.insert(spec.name.clone(), addr).is_some() {
                return Err(EnipError::Config(format!("duplicate tag {:?}", spec.name)));
            }
            let class = classes
                .entry(addr.class)
                .or_insert_with(|| Class::new(addr.class, if addr.class == CLASS_SYMBOL { "Symbol" } else { "Tag" }));
            let instance = class
                .instances
                .entry(addr.instance)
                .or_insert_with(|| Arc::new(Mutex::new(Instance::new(addr.instance))));
            let attr = Attribute::new(&spec.name, spec.typ, spec.count, &[]);
            let mut inst = instance
                .try_lock()
                .map_err(|_| EnipError::Config("registry is still being built".into()))?;
            if inst.attributes.insert(addr.attribute, attr).is_some() {
                return Err(EnipError::Config(format!(
                    "tag {:?} collides at {}/{}/{}",
                    spec.name, addr.class, addr.instance, addr.attribute
                )));
            }
        }

        Ok(Arc::new(Device {
            classes,
            tags,
            identity: self.identity,
            tcpip: self.tcpip,
            reply_size_limit: self.reply_size_limit,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_spec_parsing() {
        assert_eq!(
            TagSpec::parse("SCADA=INT[1000]").unwrap(),
            TagSpec { name: "SCADA".into(), address: None, typ: CipType::Int, count: 1000 }
        );
        assert_eq!(
            TagSpec::parse("SCADA@22/1/1=INT[1000]").unwrap(),
            TagSpec {
                name: "SCADA".into(),
                address: Some(TagAddress { class: 22, instance: 1, attribute: 1 }),
                typ: CipType::Int,
                count: 1000
            }
        );
        assert_eq!(TagSpec::parse("Motor=REAL").unwrap().count, 1);
        assert!(TagSpec::parse("SCADA").is_err());
        assert!(TagSpec::parse("SCADA=FLOAT[2]").is_err());
    }

    #[tokio::test]
    async fn test_symbolic_and_numeric_paths_agree() {
        let device = Device::builder()
            .tag_str("SCADA@22/1/1=INT[100]")
            .unwrap()
            .build()
            .unwrap();
        let sym = device
            .resolve(&Epath(vec![Segment::Symbolic("SCADA".into()), Segment::Element(3)]))
            .unwrap();
        let num = device
            .resolve(&Epath::logical(22, 1, Some(1)))
            .unwrap();
        assert_eq!((sym.class, sym.instance, sym.attribute), (22, 1, Some(1)));
        assert_eq!((num.class, num.instance, num.attribute), (22, 1, Some(1)));
        assert_eq!(sym.element, 3);

        device.write_attribute(&num, 6, &[0x2A, 0x00]).await.unwrap();
        let via_sym = device.read_attribute(&sym, 6, 2).await.unwrap();
        assert_eq!(via_sym, [0x2A, 0x00]);
    }

    #[tokio::test]
    async fn test_default_identity_attributes() {
        let device = Device::builder().build().unwrap();
        let r = device.resolve(&Epath::logical(CLASS_IDENTITY, 1, Some(7))).unwrap();
        let (typ, _, _) = device.attribute_info(&r).await.unwrap();
        assert_eq!(typ, CipType::Sstring);
        let bytes = device
            .read_attribute(&r, 0, "1756-L61/B LOGIX5561".len() + 1)
            .await
            .unwrap();
        assert_eq!(bytes[0] as usize, "1756-L61/B LOGIX5561".len());
        assert_eq!(&bytes[1..], "1756-L61/B LOGIX5561".as_bytes());
    }

    #[tokio::test]
    async fn test_unknown_paths_fail_with_status() {
        let device = Device::builder().build().unwrap();
        let err = device
            .resolve(&Epath(vec![Segment::Symbolic("NOPE".into())]))
            .unwrap_err();
        match err {
            EnipError::Service { status, .. } => assert_eq!(status, 0x05),
            other => panic!("unexpected {:?}", other),
        }
        assert!(device.lookup(0x99, 1).is_err());
    }

    #[tokio::test]
    async fn test_induced_tag_error() {
        let device = Device::builder().tag_str("T=DINT[4]").unwrap().build().unwrap();
        device.set_tag_error("T", 0x08).await.unwrap();
        let r = device.resolve(&Epath(vec![Segment::Symbolic("T".into())])).unwrap();
        let (_, _, error) = device.attribute_info(&r).await.unwrap();
        assert_eq!(error, 0x08);
    }
}
