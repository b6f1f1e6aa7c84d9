// cip.rs - CIP service codec, Message-Router dispatch, and UCMM routing
//
// The CPF unconnected-data item carries either an Unconnected Send (0x52)
// wrapper or a bare Message Router request.  Inside the router, 0x52 is the
// Read Tag Fragmented service; the two never meet at the same layer.

use crate::device::{status_text, Device, Resolved, CLASS_MESSAGE_ROUTER};
use crate::epath::{Epath, Link, Segment};
use crate::error::{EnipError, Result};
use crate::frame::{self, Cpf, Frame, FrameMachine, Payload, SendData};
use crate::types::{
    self, coerce, decode_all, encode_array, CipType, CipValue, Cursor,
};
use log::{debug, warn};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const GET_ATTRIBUTES_ALL: u8 = 0x01;
pub const MULTIPLE_SERVICE: u8 = 0x0A;
pub const GET_ATTRIBUTE_SINGLE: u8 = 0x0E;
pub const SET_ATTRIBUTE_SINGLE: u8 = 0x10;
pub const READ_TAG: u8 = 0x4C;
pub const WRITE_TAG: u8 = 0x4D;
pub const READ_FRAG: u8 = 0x52;
pub const WRITE_FRAG: u8 = 0x53;
pub const UNCONNECTED_SEND: u8 = 0x52;
pub const REPLY_MASK: u8 = 0x80;

/// Success, and "partial data returned" for fragmented reads; both carry
/// payload.
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_PARTIAL: u8 = 0x06;

/// A parsed Message Router request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub path: Epath,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    ReadTag { elements: u16 },
    ReadFrag { elements: u16, offset: u32 },
    WriteTag { typ: u16, elements: u16, data: Vec<CipValue> },
    WriteFrag { typ: u16, elements: u16, offset: u32, data: Vec<CipValue> },
    GetAttributesAll,
    GetAttributeSingle,
    SetAttributeSingle { data: Vec<u8> },
    Multiple { requests: Vec<Request> },
    Other { service: u8, data: Vec<u8> },
}

impl Request {
    pub fn service(&self) -> u8 {
        match &self.body {
            RequestBody::ReadTag { .. } => READ_TAG,
            RequestBody::ReadFrag { .. } => READ_FRAG,
            RequestBody::WriteTag { .. } => WRITE_TAG,
            RequestBody::WriteFrag { .. } => WRITE_FRAG,
            RequestBody::GetAttributesAll => GET_ATTRIBUTES_ALL,
            RequestBody::GetAttributeSingle => GET_ATTRIBUTE_SINGLE,
            RequestBody::SetAttributeSingle { .. } => SET_ATTRIBUTE_SINGLE,
            RequestBody::Multiple { .. } => MULTIPLE_SERVICE,
            RequestBody::Other { service, .. } => *service,
        }
    }
}

fn decode_typed(typ: u16, cur: &mut Cursor<'_>) -> Result<Vec<CipValue>> {
    let cip = CipType::from_code(typ)
        .ok_or(EnipError::Service { status: 0xFF, extended: vec![0x2107] })?;
    decode_all(cip, cur)
}

/// Parse one Message Router request (the content of an unconnected-data
/// item once any Unconnected Send wrapper is stripped, or one Multiple
/// Service Packet sub-request).
pub fn parse_request(bytes: &[u8]) -> Result<Request> {
    let mut cur = Cursor::new(bytes);
    let service = cur.u8()?;
    if service & REPLY_MASK != 0 {
        return Err(EnipError::Frame(format!("reply service 0x{:02X} in request", service)));
    }
    let path = Epath::parse(&mut cur, false)?;
    let body = match service {
        READ_TAG => RequestBody::ReadTag { elements: cur.u16()? },
        READ_FRAG => RequestBody::ReadFrag { elements: cur.u16()?, offset: cur.u32()? },
        WRITE_TAG => {
            let typ = cur.u16()?;
            let elements = cur.u16()?;
            RequestBody::WriteTag { typ, elements, data: decode_typed(typ, &mut cur)? }
        }
        WRITE_FRAG => {
            let typ = cur.u16()?;
            let elements = cur.u16()?;
            let offset = cur.u32()?;
            RequestBody::WriteFrag { typ, elements, offset, data: decode_typed(typ, &mut cur)? }
        }
        GET_ATTRIBUTES_ALL => RequestBody::GetAttributesAll,
        GET_ATTRIBUTE_SINGLE => RequestBody::GetAttributeSingle,
        SET_ATTRIBUTE_SINGLE => RequestBody::SetAttributeSingle { data: cur.rest().to_vec() },
        MULTIPLE_SERVICE => {
            let count = cur.u16()? as usize;
            let mut offsets = Vec::with_capacity(count);
            for _ in 0..count {
                offsets.push(cur.u16()? as usize);
            }
            let data = cur.rest();
            let base = 2 + 2 * count;
            let mut requests = Vec::with_capacity(count);
            for i in 0..count {
                let beg = offsets[i]
                    .checked_sub(base)
                    .ok_or_else(|| EnipError::Frame("bad MSP offset".into()))?;
                let end = if i + 1 < count {
                    offsets[i + 1]
                        .checked_sub(base)
                        .ok_or_else(|| EnipError::Frame("bad MSP offset".into()))?
                } else {
                    data.len()
                };
                if beg > end || end > data.len() {
                    return Err(EnipError::Frame("MSP offsets out of order".into()));
                }
                requests.push(parse_request(&data[beg..end])?);
            }
            RequestBody::Multiple { requests }
        }
        other => RequestBody::Other { service: other, data: cur.rest().to_vec() },
    };
    Ok(Request { path, body })
}

/// Serialize a request to wire form.
pub fn produce_request(req: &Request) -> Vec<u8> {
    let mut out = vec![req.service()];
    match &req.body {
        RequestBody::Multiple { requests } => {
            let path = if req.path.is_empty() {
                Epath::logical(CLASS_MESSAGE_ROUTER, 1, None)
            } else {
                req.path.clone()
            };
            out.extend_from_slice(&path.encode(false));
            let encoded: Vec<Vec<u8>> = requests.iter().map(produce_request).collect();
            out.extend_from_slice(&(encoded.len() as u16).to_le_bytes());
            let mut offset = 2 + 2 * encoded.len();
            for e in &encoded {
                out.extend_from_slice(&(offset as u16).to_le_bytes());
                offset += e.len();
            }
            for e in &encoded {
                out.extend_from_slice(e);
            }
        }
        body => {
            out.extend_from_slice(&req.path.encode(false));
            match body {
                RequestBody::ReadTag { elements } => {
                    out.extend_from_slice(&elements.to_le_bytes());
                }
                RequestBody::ReadFrag { elements, offset } => {
                    out.extend_from_slice(&elements.to_le_bytes());
                    out.extend_from_slice(&offset.to_le_bytes());
                }
                RequestBody::WriteTag { typ, elements, data } => {
                    out.extend_from_slice(&typ.to_le_bytes());
                    out.extend_from_slice(&elements.to_le_bytes());
                    encode_array(data, &mut out);
                }
                RequestBody::WriteFrag { typ, elements, offset, data } => {
                    out.extend_from_slice(&typ.to_le_bytes());
                    out.extend_from_slice(&elements.to_le_bytes());
                    out.extend_from_slice(&offset.to_le_bytes());
                    encode_array(data, &mut out);
                }
                RequestBody::GetAttributesAll | RequestBody::GetAttributeSingle => {}
                RequestBody::SetAttributeSingle { data } => out.extend_from_slice(data),
                RequestBody::Other { data, .. } => out.extend_from_slice(data),
                RequestBody::Multiple { .. } => unreachable!("handled above"),
            }
        }
    }
    out
}

/// A parsed service reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Request service with the reply bit set
    pub service: u8,
    pub status: u8,
    pub extended: Vec<u16>,
    pub body: ReplyBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    None,
    /// Read Tag [Fragmented] payload
    ReadTag { typ: u16, data: Vec<CipValue> },
    /// Raw attribute bytes (Get-Attribute services, unknown services)
    Attribute(Vec<u8>),
    Multiple(Vec<Reply>),
}

impl Reply {
    pub fn failure(service: u8, status: u8, extended: Vec<u16>) -> Reply {
        Reply { service: service | REPLY_MASK, status, extended, body: ReplyBody::None }
    }

    pub fn ok(&self) -> bool {
        self.status == STATUS_OK || self.status == STATUS_PARTIAL
    }
}

pub fn parse_reply(bytes: &[u8]) -> Result<Reply> {
    let mut cur = Cursor::new(bytes);
    let service = cur.u8()?;
    if service & REPLY_MASK == 0 {
        return Err(EnipError::Frame(format!("request service 0x{:02X} in reply", service)));
    }
    cur.u8()?; // reserved
    let status = cur.u8()?;
    let ext_count = cur.u8()? as usize;
    let mut extended = Vec::with_capacity(ext_count);
    for _ in 0..ext_count {
        extended.push(cur.u16()?);
    }
    let body = match service & !REPLY_MASK {
        READ_TAG | READ_FRAG if status == STATUS_OK || status == STATUS_PARTIAL => {
            let typ = cur.u16()?;
            ReplyBody::ReadTag { typ, data: decode_typed(typ, &mut cur)? }
        }
        WRITE_TAG | WRITE_FRAG | SET_ATTRIBUTE_SINGLE => ReplyBody::None,
        MULTIPLE_SERVICE if status == STATUS_OK => {
            let count = cur.u16()? as usize;
            let mut offsets = Vec::with_capacity(count);
            for _ in 0..count {
                offsets.push(cur.u16()? as usize);
            }
            let data = cur.rest();
            let base = 2 + 2 * count;
            let mut replies = Vec::with_capacity(count);
            for i in 0..count {
                let beg = offsets[i]
                    .checked_sub(base)
                    .ok_or_else(|| EnipError::Frame("bad MSP reply offset".into()))?;
                let end = if i + 1 < count {
                    offsets[i + 1]
                        .checked_sub(base)
                        .ok_or_else(|| EnipError::Frame("bad MSP reply offset".into()))?
                } else {
                    data.len()
                };
                replies.push(parse_reply(&data[beg..end])?);
            }
            ReplyBody::Multiple(replies)
        }
        _ => {
            let rest = cur.rest();
            if rest.is_empty() {
                ReplyBody::None
            } else {
                ReplyBody::Attribute(rest.to_vec())
            }
        }
    };
    Ok(Reply { service, status, extended, body })
}

pub fn produce_reply(reply: &Reply) -> Vec<u8> {
    let mut out = vec![reply.service, 0x00, reply.status, reply.extended.len() as u8];
    for w in &reply.extended {
        out.extend_from_slice(&w.to_le_bytes());
    }
    match &reply.body {
        ReplyBody::None => {}
        ReplyBody::ReadTag { typ, data } => {
            out.extend_from_slice(&typ.to_le_bytes());
            encode_array(data, &mut out);
        }
        ReplyBody::Attribute(bytes) => out.extend_from_slice(bytes),
        ReplyBody::Multiple(replies) => {
            let encoded: Vec<Vec<u8>> = replies.iter().map(produce_reply).collect();
            out.extend_from_slice(&(encoded.len() as u16).to_le_bytes());
            let mut offset = 2 + 2 * encoded.len();
            for e in &encoded {
                out.extend_from_slice(&(offset as u16).to_le_bytes());
                offset += e.len();
            }
            for e in &encoded {
                out.extend_from_slice(e);
            }
        }
    }
    out
}

/// Unconnected Send (0x52) wrapper as carried in the CPF unconnected-data
/// item.
#[derive(Debug, Clone, PartialEq)]
pub struct UnconnectedSend {
    /// Send path, normally the Connection Manager @0x06/1
    pub path: Epath,
    pub priority: u8,
    pub timeout_ticks: u8,
    /// The embedded message request, undecoded: it may not be ours to parse
    pub request: Vec<u8>,
    pub route_path: Epath,
}

impl Default for UnconnectedSend {
    fn default() -> Self {
        UnconnectedSend {
            path: Epath::logical(0x06, 1, None),
            priority: 5,
            timeout_ticks: 157,
            request: Vec::new(),
            route_path: Epath(vec![Segment::Port { port: 1, link: Link::Number(0) }]),
        }
    }
}

/// Content of the CPF unconnected-data item.
#[derive(Debug, Clone, PartialEq)]
pub enum UnconnectedItem {
    Send(UnconnectedSend),
    /// Anything but 0x52 is an opaque encapsulated request
    Bare(Vec<u8>),
}

pub fn parse_unconnected(bytes: &[u8]) -> Result<UnconnectedItem> {
    if bytes.first() != Some(&UNCONNECTED_SEND) {
        return Ok(UnconnectedItem::Bare(bytes.to_vec()));
    }
    let mut cur = Cursor::new(bytes);
    cur.u8()?; // service
    let path = Epath::parse(&mut cur, false)?;
    let priority = cur.u8()?;
    let timeout_ticks = cur.u8()?;
    let length = cur.u16()? as usize;
    let request = cur.take(length)?.to_vec();
    if length % 2 == 1 {
        cur.u8()?;
    }
    let route_path = Epath::parse(&mut cur, true)?;
    Ok(UnconnectedItem::Send(UnconnectedSend { path, priority, timeout_ticks, request, route_path }))
}

pub fn encode_unconnected_send(us: &UnconnectedSend) -> Vec<u8> {
    let mut out = vec![UNCONNECTED_SEND];
    out.extend_from_slice(&us.path.encode(false));
    out.push(us.priority);
    out.push(us.timeout_ticks);
    out.extend_from_slice(&(us.request.len() as u16).to_le_bytes());
    out.extend_from_slice(&us.request);
    if us.request.len() % 2 == 1 {
        out.push(0);
    }
    out.extend_from_slice(&us.route_path.encode(true));
    out
}

// ---------------------------------------------------------------------------
// Server-side dispatch
// ---------------------------------------------------------------------------

/// Compute the `[beg, end)` element range of a read/write, and the element
/// count the full request addressed.  Mirrors the controller's element math:
/// the byte offset advances the beginning, and the reply/payload capacity
/// bounds the end.
fn reply_elements(
    count: usize,
    element_size: usize,
    first_element: u32,
    elements: u16,
    byte_offset: u32,
    capacity_elements: usize,
    writing: bool,
) -> Result<(usize, usize, usize)> {
    let first = first_element as usize;
    let off = byte_offset as usize;
    if element_size == 0 || off % element_size != 0 {
        return Err(EnipError::Service { status: 0xFF, extended: vec![0x2104] });
    }
    let endactual = first + elements as usize;
    if endactual == 0 || endactual > count {
        return Err(EnipError::Service { status: 0xFF, extended: vec![0x2105] });
    }
    let beg = first + off / element_size;
    if beg >= count || beg >= endactual {
        let ext = if off > 0 { 0x2104 } else { 0x2105 };
        return Err(EnipError::Service { status: 0xFF, extended: vec![ext] });
    }
    let endmax = beg + capacity_elements;
    if writing && endmax > endactual {
        return Err(EnipError::Service { status: 0xFF, extended: vec![0x2105] });
    }
    let end = endactual.min(endmax);
    Ok((beg, end, endactual))
}

async fn read_service(
    device: &Device,
    resolved: &Resolved,
    elements: u16,
    byte_offset: u32,
) -> Result<(u8, u16, Vec<CipValue>)> {
    let limit = device.reply_size_limit;
    let element = resolved.element;
    device
        .with_attribute(resolved, |attr| {
            if attr.error != 0 {
                return Err(EnipError::Service { status: attr.error, extended: vec![] });
            }
            let typ = attr.typ;
            let siz = typ.size().ok_or(EnipError::Service { status: 0x08, extended: vec![] })?;
            let capacity = (limit / siz).max(1);
            let (beg, end, endactual) =
                reply_elements(attr.count, siz, element, elements, byte_offset, capacity, false)?;
            let bytes = attr.read(beg * siz, (end - beg) * siz)?;
            let mut cur = Cursor::new(&bytes);
            let data = decode_all(typ, &mut cur)?;
            let status = if end == endactual { STATUS_OK } else { STATUS_PARTIAL };
            Ok((status, typ.code(), data))
        })
        .await
}

async fn write_service(
    device: &Device,
    resolved: &Resolved,
    typ_code: u16,
    elements: u16,
    byte_offset: u32,
    data: &[CipValue],
) -> Result<()> {
    let element = resolved.element;
    device
        .with_attribute(resolved, |attr| {
            if attr.error != 0 {
                return Err(EnipError::Service { status: attr.error, extended: vec![] });
            }
            let typ = attr.typ;
            let siz = typ.size().ok_or(EnipError::Service { status: 0x08, extended: vec![] })?;
            let payload_typ = CipType::from_code(typ_code)
                .ok_or(EnipError::Service { status: 0xFF, extended: vec![0x2107] })?;
            if !types::write_compatible(typ, payload_typ) {
                return Err(EnipError::Service { status: 0xFF, extended: vec![0x2107] });
            }
            let (beg, end, _) =
                reply_elements(attr.count, siz, element, elements, byte_offset, data.len(), true)?;
            let mut bytes = Vec::with_capacity((end - beg) * siz);
            for v in &data[..end - beg] {
                let coerced = coerce(v, typ)?;
                types::encode_value(&coerced, &mut bytes);
            }
            attr.write(beg * siz, &bytes)
        })
        .await
}

fn service_failure(service: u8, err: EnipError) -> Reply {
    match err {
        EnipError::Service { status, extended } => {
            debug!("service 0x{:02X}: {} ({:04X?})", service, status_text(status), extended);
            Reply::failure(service, status, extended)
        }
        other => {
            warn!("service 0x{:02X} failed: {}", service, other);
            Reply::failure(service, 0xFF, vec![])
        }
    }
}

/// Dispatch one non-MSP request against the local object model.  Every
/// failure becomes a status reply; nothing here aborts the session.
async fn dispatch_single(device: &Device, request: &Request) -> Reply {
    let service = request.service();
    let reply_service = service | REPLY_MASK;
    let resolved = match device.resolve(&request.path) {
        Ok(r) => r,
        Err(err) => return service_failure(service, err),
    };
    debug!("service 0x{:02X} on {}", service, request.path);
    match &request.body {
        RequestBody::ReadTag { elements } => {
            match read_service(device, &resolved, *elements, 0).await {
                Ok((status, typ, data)) => Reply {
                    service: reply_service,
                    status,
                    extended: vec![],
                    body: ReplyBody::ReadTag { typ, data },
                },
                Err(err) => service_failure(service, err),
            }
        }
        RequestBody::ReadFrag { elements, offset } => {
            match read_service(device, &resolved, *elements, *offset).await {
                Ok((status, typ, data)) => Reply {
                    service: reply_service,
                    status,
                    extended: vec![],
                    body: ReplyBody::ReadTag { typ, data },
                },
                Err(err) => service_failure(service, err),
            }
        }
        RequestBody::WriteTag { typ, elements, data } => {
            match write_service(device, &resolved, *typ, *elements, 0, data).await {
                Ok(()) => Reply { service: reply_service, status: STATUS_OK, extended: vec![], body: ReplyBody::None },
                Err(err) => service_failure(service, err),
            }
        }
        RequestBody::WriteFrag { typ, elements, offset, data } => {
            match write_service(device, &resolved, *typ, *elements, *offset, data).await {
                Ok(()) => Reply { service: reply_service, status: STATUS_OK, extended: vec![], body: ReplyBody::None },
                Err(err) => service_failure(service, err),
            }
        }
        RequestBody::GetAttributesAll => {
            match device.read_all_attributes(resolved.class, resolved.instance).await {
                Ok(bytes) => Reply {
                    service: reply_service,
                    status: STATUS_OK,
                    extended: vec![],
                    body: ReplyBody::Attribute(bytes),
                },
                Err(err) => service_failure(service, err),
            }
        }
        RequestBody::GetAttributeSingle => {
            let read = device.with_attribute(&resolved, |attr| {
                if attr.error != 0 {
                    return Err(EnipError::Service { status: attr.error, extended: vec![] });
                }
                attr.read(0, attr.byte_size())
            });
            match read.await {
                Ok(bytes) => Reply {
                    service: reply_service,
                    status: STATUS_OK,
                    extended: vec![],
                    body: ReplyBody::Attribute(bytes),
                },
                Err(err) => service_failure(service, err),
            }
        }
        RequestBody::SetAttributeSingle { data } => {
            let write = device.with_attribute(&resolved, |attr| {
                if attr.error != 0 {
                    return Err(EnipError::Service { status: attr.error, extended: vec![] });
                }
                attr.write(0, data)
            });
            match write.await {
                Ok(()) => Reply { service: reply_service, status: STATUS_OK, extended: vec![], body: ReplyBody::None },
                Err(err) => service_failure(service, err),
            }
        }
        RequestBody::Multiple { .. } => {
            // Nested Multiple Service Packets are not serviced
            Reply::failure(service, 0x08, vec![])
        }
        RequestBody::Other { .. } => Reply::failure(service, 0x08, vec![]),
    }
}

/// Dispatch a Message Router request; Multiple Service Packet sub-requests
/// run sequentially in encoded order, and a failing sub-request never
/// disturbs its siblings.
pub async fn dispatch(device: &Device, request: &Request) -> Reply {
    match &request.body {
        RequestBody::Multiple { requests } => {
            let mut replies = Vec::with_capacity(requests.len());
            for sub in requests {
                replies.push(dispatch_single(device, sub).await);
            }
            Reply {
                service: MULTIPLE_SERVICE | REPLY_MASK,
                status: STATUS_OK,
                extended: vec![],
                body: ReplyBody::Multiple(replies),
            }
        }
        _ => dispatch_single(device, request).await,
    }
}

/// Dispatch raw request bytes to raw reply bytes.
pub async fn dispatch_bytes(device: &Device, bytes: &[u8]) -> Vec<u8> {
    let reply = match parse_request(bytes) {
        Ok(request) => dispatch(device, &request).await,
        Err(err) => {
            warn!("unparseable CIP request: {}", err);
            Reply::failure(bytes.first().copied().unwrap_or(0), 0x08, vec![])
        }
    };
    produce_reply(&reply)
}

// ---------------------------------------------------------------------------
// UCMM: route-path acceptance and Route-table forwarding
// ---------------------------------------------------------------------------

/// Configured `Route Path` acceptance for locally serviced requests.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RoutePolicy {
    /// JSON `null`: accept any route path
    #[default]
    Any,
    /// Accept only an exactly matching route path
    Exact(Vec<Segment>),
    /// JSON `false`: accept only an empty route path
    EmptyOnly,
}

/// One Route-table entry: a leading `{port, link}` pattern and the
/// downstream address it forwards to.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub port: u16,
    pub link_min: u8,
    pub link_max: u8,
    pub link_addr: Option<String>,
    pub target: String,
}

impl RouteEntry {
    pub fn matches(&self, seg: &Segment) -> bool {
        match seg {
            Segment::Port { port, link } if *port == self.port => match link {
                Link::Number(n) => {
                    self.link_addr.is_none() && self.link_min <= *n && *n <= self.link_max
                }
                Link::Address(a) => self.link_addr.as_deref() == Some(a.as_str()),
            },
            _ => false,
        }
    }
}

/// The Unconnected Message Manager: accepts explicit requests for the local
/// device, or forwards them down a configured route.
#[derive(Debug, Clone, Default)]
pub struct Ucmm {
    pub route_path: RoutePolicy,
    pub routes: Vec<RouteEntry>,
    pub forward_timeout: Option<Duration>,
}

impl Ucmm {
    /// Process the unconnected-data item of a SendRRData request, returning
    /// the reply item bytes.  The Unconnected Send wrapper is consumed here;
    /// the reply travels back as a bare encapsulated message.
    pub async fn process(&self, device: &Device, item: &[u8]) -> Vec<u8> {
        match parse_unconnected(item) {
            Ok(UnconnectedItem::Bare(request)) => dispatch_bytes(device, &request).await,
            Ok(UnconnectedItem::Send(us)) => self.process_send(device, us).await,
            Err(err) => {
                warn!("unparseable unconnected-data item: {}", err);
                produce_reply(&Reply::failure(0, 0x08, vec![]))
            }
        }
    }

    async fn process_send(&self, device: &Device, us: UnconnectedSend) -> Vec<u8> {
        let embedded_service = us.request.first().copied().unwrap_or(0);
        let reject = |ext: u16| produce_reply(&Reply::failure(embedded_service, 0x01, vec![ext]));
        let mut remaining: Vec<Segment> = us.route_path.0.clone();

        match &self.route_path {
            // `false`: only an empty route path is serviced
            RoutePolicy::EmptyOnly => {
                if !remaining.is_empty() {
                    debug!("non-empty route path rejected; local-only device");
                    return reject(0x0311);
                }
            }
            // An exact configured path is the local hop; strip it before
            // any table consultation.  An empty route path never matches a
            // configured one.
            RoutePolicy::Exact(segs) => {
                if remaining.len() >= segs.len() && remaining[..segs.len()] == segs[..] {
                    remaining.drain(..segs.len());
                } else {
                    debug!("route path does not begin with the configured local hop");
                    return reject(0x0311);
                }
            }
            RoutePolicy::Any => {}
        }

        // A remaining hop is forwarded through the route table.
        if let Some(first) = remaining.first() {
            if let Some(entry) = self.routes.iter().find(|e| e.matches(first)) {
                let trimmed = Epath(remaining[1..].to_vec());
                let item = if trimmed.is_empty() {
                    // Terminal hop: forward the embedded request simply
                    us.request.clone()
                } else {
                    encode_unconnected_send(&UnconnectedSend {
                        route_path: trimmed,
                        request: us.request.clone(),
                        ..us.clone()
                    })
                };
                debug!("forwarding via {} ({} hops left)", entry.target, remaining.len() - 1);
                return match forward(&entry.target, item, self.forward_timeout).await {
                    Ok(reply) => reply,
                    Err(err) => {
                        warn!("downstream {} failed: {}", entry.target, err);
                        return reject(0x0204);
                    }
                };
            }
            // Hops we cannot route are tolerated only by an unconfigured
            // (accept-any) device
            if self.route_path != RoutePolicy::Any {
                debug!("no route for {:?}", first);
                return reject(0x0311);
            }
        }

        dispatch_bytes(device, &us.request).await
    }
}

/// Forward an unconnected-data item to a downstream server and return its
/// reply item verbatim: connect, register a session, SendRRData, await.
async fn forward(target: &str, item: Vec<u8>, limit: Option<Duration>) -> Result<Vec<u8>> {
    let limit = limit.unwrap_or(Duration::from_secs(5));
    let mut stream = timeout(limit, TcpStream::connect(target))
        .await
        .map_err(|_| EnipError::Timeout(limit))??;

    let register = Frame::new(
        frame::REGISTER_SESSION,
        0,
        Payload::RegisterSession { protocol_version: 1, options: 0 },
    );
    stream.write_all(&register.encode()).await?;
    let reply = read_frame(&mut stream, limit).await?;
    if reply.status != 0 {
        return Err(EnipError::Routing(format!(
            "downstream registration failed: 0x{:08X}",
            reply.status
        )));
    }
    let session = reply.session_handle;

    let send = Frame::new(
        frame::SEND_RR_DATA,
        session,
        Payload::SendRRData(SendData {
            interface_handle: 0,
            timeout: 5,
            cpf: Cpf::unconnected(item),
        }),
    );
    stream.write_all(&send.encode()).await?;
    let reply = read_frame(&mut stream, limit).await?;
    match reply.payload {
        Payload::SendRRData(sd) => sd
            .cpf
            .unconnected_data()
            .map(|d| d.to_vec())
            .ok_or_else(|| EnipError::Routing("downstream reply lacked data item".into())),
        _ => Err(EnipError::Routing("unexpected downstream reply".into())),
    }
}

async fn read_frame(stream: &mut TcpStream, limit: Duration) -> Result<Frame> {
    use tokio::io::AsyncReadExt;
    let mut machine = FrameMachine::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some(frame) = machine.next_frame()? {
            return Ok(frame);
        }
        let n = timeout(limit, stream.read(&mut buf))
            .await
            .map_err(|_| EnipError::Timeout(limit))??;
        if n == 0 {
            return Err(EnipError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "downstream closed",
            )));
        }
        machine.feed(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epath::Segment;

    #[test]
    fn test_read_frag_request_wire_form() {
        // 0x52 SCADA[12], 1 element, offset 0, as a router-level request
        let wire = [
            0x52, 0x05, 0x91, 0x05, b'S', b'C', b'A', b'D', b'A', 0x00, 0x28, 0x0C, 0x01, 0x00,
            0x00, 0x00, 0x00, 0x00,
        ];
        let req = parse_request(&wire).unwrap();
        assert_eq!(
            req.path,
            Epath(vec![Segment::Symbolic("SCADA".into()), Segment::Element(12)])
        );
        assert_eq!(req.body, RequestBody::ReadFrag { elements: 1, offset: 0 });
        assert_eq!(produce_request(&req), wire);
    }

    #[test]
    fn test_write_tag_round_trip() {
        let req = Request {
            path: Epath(vec![Segment::Symbolic("parts".into())]),
            body: RequestBody::WriteTag {
                typ: CipType::Int.code(),
                elements: 2,
                data: vec![CipValue::Int(1), CipValue::Int(-1)],
            },
        };
        let wire = produce_request(&req);
        assert_eq!(parse_request(&wire).unwrap(), req);
    }

    #[test]
    fn test_multiple_service_packet_layout() {
        // The classic two-read example: offsets 6 and 18 from the count
        let req = Request {
            path: Epath::default(),
            body: RequestBody::Multiple {
                requests: vec![
                    Request {
                        path: Epath(vec![Segment::Symbolic("parts".into())]),
                        body: RequestBody::ReadTag { elements: 1 },
                    },
                    Request {
                        path: Epath(vec![Segment::Symbolic("ControlWord".into())]),
                        body: RequestBody::ReadTag { elements: 1 },
                    },
                ],
            },
        };
        let wire = produce_request(&req);
        assert_eq!(wire[0], MULTIPLE_SERVICE);
        // path @0x02/1 by default
        assert_eq!(&wire[1..5], &[0x02, 0x20, 0x02, 0x24]);
        let count = u16::from_le_bytes([wire[6], wire[7]]);
        assert_eq!(count, 2);
        assert_eq!(u16::from_le_bytes([wire[8], wire[9]]), 6);
        assert_eq!(u16::from_le_bytes([wire[10], wire[11]]), 18);
        let parsed = parse_request(&wire).unwrap();
        match parsed.body {
            RequestBody::Multiple { ref requests } => assert_eq!(requests.len(), 2),
            _ => panic!("not multiple"),
        }
    }

    #[test]
    fn test_reply_round_trip_with_extended_status() {
        let reply = Reply {
            service: WRITE_TAG | REPLY_MASK,
            status: 0xFF,
            extended: vec![0x2105],
            body: ReplyBody::None,
        };
        let wire = produce_reply(&reply);
        assert_eq!(wire, [0xCD, 0x00, 0xFF, 0x01, 0x05, 0x21]);
        assert_eq!(parse_reply(&wire).unwrap(), reply);
    }

    #[test]
    fn test_multiple_reply_preserves_order_and_status() {
        let replies = vec![
            Reply {
                service: READ_TAG | REPLY_MASK,
                status: STATUS_OK,
                extended: vec![],
                body: ReplyBody::ReadTag { typ: CipType::Dint.code(), data: vec![CipValue::Dint(42)] },
            },
            Reply::failure(READ_TAG, 0x05, vec![0]),
            Reply {
                service: READ_TAG | REPLY_MASK,
                status: STATUS_OK,
                extended: vec![],
                body: ReplyBody::ReadTag { typ: CipType::Dint.code(), data: vec![CipValue::Dint(476)] },
            },
        ];
        let outer = Reply {
            service: MULTIPLE_SERVICE | REPLY_MASK,
            status: STATUS_OK,
            extended: vec![],
            body: ReplyBody::Multiple(replies.clone()),
        };
        let wire = produce_reply(&outer);
        match parse_reply(&wire).unwrap().body {
            ReplyBody::Multiple(parsed) => {
                assert_eq!(parsed, replies);
                assert_eq!(parsed[1].status, 0x05);
            }
            _ => panic!("not multiple"),
        }
    }

    #[test]
    fn test_unconnected_send_round_trip() {
        let us = UnconnectedSend {
            request: produce_request(&Request {
                path: Epath(vec![Segment::Symbolic("SCADA".into()), Segment::Element(12)]),
                body: RequestBody::ReadFrag { elements: 1, offset: 0 },
            }),
            ..UnconnectedSend::default()
        };
        let wire = encode_unconnected_send(&us);
        match parse_unconnected(&wire).unwrap() {
            UnconnectedItem::Send(parsed) => assert_eq!(parsed, us),
            _ => panic!("not an unconnected send"),
        }
        // A bare request passes through untouched
        let bare = [0x4C, 0x01, 0x28, 0x00, 0x01, 0x00];
        match parse_unconnected(&bare).unwrap() {
            UnconnectedItem::Bare(b) => assert_eq!(b, bare),
            _ => panic!("not bare"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_write_then_read() {
        let device = Device::builder().tag_str("SCADA=INT[1000]").unwrap().build().unwrap();
        // Write SCADA[3] = 4 via Write Tag Fragmented
        let write = Request {
            path: Epath(vec![Segment::Symbolic("SCADA".into()), Segment::Element(3)]),
            body: RequestBody::WriteFrag {
                typ: CipType::Int.code(),
                elements: 1,
                offset: 0,
                data: vec![CipValue::Int(4)],
            },
        };
        let reply = dispatch(&device, &write).await;
        assert_eq!(reply.status, STATUS_OK);
        // Read SCADA[0-10]
        let read = Request {
            path: Epath(vec![Segment::Symbolic("SCADA".into()), Segment::Element(0)]),
            body: RequestBody::ReadTag { elements: 11 },
        };
        let reply = dispatch(&device, &read).await;
        assert_eq!(reply.status, STATUS_OK);
        match reply.body {
            ReplyBody::ReadTag { typ, data } => {
                assert_eq!(typ, CipType::Int.code());
                let expect: Vec<CipValue> = (0..11)
                    .map(|i| CipValue::Int(if i == 3 { 4 } else { 0 }))
                    .collect();
                assert_eq!(data, expect);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_fragmented_read_limits_reply() {
        let device = Device::builder()
            .tag_str("BIG=DINT[500]")
            .unwrap()
            .reply_size_limit(100)
            .build()
            .unwrap();
        let read = Request {
            path: Epath(vec![Segment::Symbolic("BIG".into()), Segment::Element(0)]),
            body: RequestBody::ReadFrag { elements: 500, offset: 0 },
        };
        let reply = dispatch(&device, &read).await;
        assert_eq!(reply.status, STATUS_PARTIAL);
        match reply.body {
            ReplyBody::ReadTag { data, .. } => assert_eq!(data.len(), 25), // 100 / 4
            other => panic!("unexpected body {:?}", other),
        }
        // Continue from the byte offset where the first reply stopped
        let read = Request {
            path: Epath(vec![Segment::Symbolic("BIG".into()), Segment::Element(0)]),
            body: RequestBody::ReadFrag { elements: 500, offset: 100 },
        };
        let reply = dispatch(&device, &read).await;
        assert_eq!(reply.status, STATUS_PARTIAL);
    }

    #[tokio::test]
    async fn test_dispatch_status_codes() {
        let device = Device::builder().tag_str("T=INT[10]").unwrap().build().unwrap();
        // Beyond end of tag
        let read = Request {
            path: Epath(vec![Segment::Symbolic("T".into()), Segment::Element(5)]),
            body: RequestBody::ReadTag { elements: 10 },
        };
        let reply = dispatch(&device, &read).await;
        assert_eq!((reply.status, reply.extended.clone()), (0xFF, vec![0x2105]));
        // Type mismatch on write
        let write = Request {
            path: Epath(vec![Segment::Symbolic("T".into())]),
            body: RequestBody::WriteTag {
                typ: CipType::Dint.code(),
                elements: 1,
                data: vec![CipValue::Dint(1)],
            },
        };
        let reply = dispatch(&device, &write).await;
        assert_eq!((reply.status, reply.extended.clone()), (0xFF, vec![0x2107]));
        // Unknown tag
        let read = Request {
            path: Epath(vec![Segment::Symbolic("MISSING".into())]),
            body: RequestBody::ReadTag { elements: 1 },
        };
        let reply = dispatch(&device, &read).await;
        assert_eq!(reply.status, 0x05);
    }

    #[tokio::test]
    async fn test_msp_sibling_isolation() {
        let device = Device::builder().tag_str("T=DINT[4]").unwrap().build().unwrap();
        let msp = Request {
            path: Epath::default(),
            body: RequestBody::Multiple {
                requests: vec![
                    Request {
                        path: Epath(vec![Segment::Symbolic("T".into()), Segment::Element(0)]),
                        body: RequestBody::ReadTag { elements: 1 },
                    },
                    Request {
                        path: Epath(vec![Segment::Symbolic("GHOST".into())]),
                        body: RequestBody::ReadTag { elements: 1 },
                    },
                    Request {
                        path: Epath(vec![Segment::Symbolic("T".into()), Segment::Element(1)]),
                        body: RequestBody::ReadTag { elements: 1 },
                    },
                ],
            },
        };
        let reply = dispatch(&device, &msp).await;
        assert_eq!(reply.status, STATUS_OK);
        match reply.body {
            ReplyBody::Multiple(replies) => {
                assert_eq!(replies.len(), 3);
                assert_eq!(replies[0].status, STATUS_OK);
                assert_eq!(replies[1].status, 0x05);
                assert_eq!(replies[2].status, STATUS_OK);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_route_policy_false_rejects_nonempty() {
        let device = Device::builder().tag_str("T=INT[1]").unwrap().build().unwrap();
        let ucmm = Ucmm { route_path: RoutePolicy::EmptyOnly, ..Ucmm::default() };
        let us = UnconnectedSend {
            request: produce_request(&Request {
                path: Epath(vec![Segment::Symbolic("T".into())]),
                body: RequestBody::ReadTag { elements: 1 },
            }),
            ..UnconnectedSend::default() // carries route path 1/0
        };
        let reply_bytes = ucmm.process(&device, &encode_unconnected_send(&us)).await;
        let reply = parse_reply(&reply_bytes).unwrap();
        assert_eq!(reply.status, 0x01);
        // Empty route path is accepted
        let us = UnconnectedSend { route_path: Epath::default(), ..us };
        let reply_bytes = ucmm.process(&device, &encode_unconnected_send(&us)).await;
        assert!(parse_reply(&reply_bytes).unwrap().ok());
    }

    #[test]
    fn test_route_entry_matching() {
        let entry = RouteEntry {
            port: 1,
            link_min: 1,
            link_max: 15,
            link_addr: None,
            target: "localhost:44819".into(),
        };
        assert!(entry.matches(&Segment::Port { port: 1, link: Link::Number(5) }));
        assert!(!entry.matches(&Segment::Port { port: 1, link: Link::Number(0) }));
        assert!(!entry.matches(&Segment::Port { port: 2, link: Link::Number(5) }));
        let by_addr = RouteEntry {
            port: 2,
            link_min: 0,
            link_max: 0,
            link_addr: Some("10.0.0.2".into()),
            target: "10.0.0.2:44818".into(),
        };
        assert!(by_addr.matches(&Segment::Port { port: 2, link: Link::Address("10.0.0.2".into()) }));
    }
}
