// client.rs - EtherNet/IP originator: operations, pipelining, aggregation
//
// A Connector registers a session and issues I/O operations, keeping up to
// `depth` requests on the wire and optionally bundling small contiguous
// operations into Multiple Service Packets under a byte budget.  The 8-byte
// sender context carries a monotonically increasing issue index; replies are
// correlated by that index, never by wire order.

use crate::cip::{
    self, encode_unconnected_send, produce_request, Reply, ReplyBody, Request, RequestBody,
    UnconnectedSend,
};
use crate::epath::{parse_int, Epath, Segment};
use crate::error::{EnipError, Result};
use crate::frame::{
    self, Cpf, CpfItem, Frame, FrameMachine, IdentityItem, Payload, SendData, DEFAULT_PORT,
};
use crate::types::{CipType, CipValue};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

/// What one logical operation asks of the device.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    Read,
    Write,
    GetAttributeSingle,
    GetAttributesAll,
    SetAttributeSingle,
}

/// One logical CIP request, before encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub method: Method,
    pub path: Epath,
    pub elements: Option<u16>,
    /// Byte offset; present forces the fragmented service
    pub offset: Option<u32>,
    pub tag_type: Option<u16>,
    pub data: Vec<CipValue>,
}

impl Operation {
    pub fn read(path: Epath, elements: u16) -> Operation {
        Operation {
            method: Method::Read,
            path,
            elements: Some(elements),
            offset: None,
            tag_type: None,
            data: Vec::new(),
        }
    }

    pub fn write(path: Epath, typ: CipType, data: Vec<CipValue>) -> Operation {
        Operation {
            method: Method::Write,
            path,
            elements: Some(data.len() as u16),
            offset: None,
            tag_type: Some(typ.code()),
            data,
        }
    }

    fn to_request(&self, fragment: bool) -> Request {
        let elements = self.elements.unwrap_or(1);
        let body = match self.method {
            Method::Read => {
                if fragment || self.offset.is_some() {
                    RequestBody::ReadFrag { elements, offset: self.offset.unwrap_or(0) }
                } else {
                    RequestBody::ReadTag { elements }
                }
            }
            Method::Write => {
                let typ = self.tag_type.unwrap_or(CipType::Int.code());
                if fragment || self.offset.is_some() {
                    RequestBody::WriteFrag {
                        typ,
                        elements,
                        offset: self.offset.unwrap_or(0),
                        data: self.data.clone(),
                    }
                } else {
                    RequestBody::WriteTag { typ, elements, data: self.data.clone() }
                }
            }
            Method::GetAttributeSingle => RequestBody::GetAttributeSingle,
            Method::GetAttributesAll => RequestBody::GetAttributesAll,
            Method::SetAttributeSingle => {
                let mut data = Vec::new();
                crate::types::encode_array(&self.data, &mut data);
                RequestBody::SetAttributeSingle { data }
            }
        };
        Request { path: self.path.clone(), body }
    }

    /// Request/reply wire size estimates used by the aggregation budget.
    fn estimate(&self) -> (usize, usize) {
        match self.method {
            Method::Read => {
                let elements = self.elements.unwrap_or(1) as usize;
                (22, 4 + 4 * elements)
            }
            Method::Write => {
                let typ = self
                    .tag_type
                    .and_then(CipType::from_code)
                    .unwrap_or(CipType::Int);
                (24 + typ.size().unwrap_or(4) * self.data.len(), 4)
            }
            _ => (8, usize::MAX / 4), // unknown reply size prevents merging
        }
    }

    fn describe(&self) -> String {
        let verb = match self.method {
            Method::Read => "Read",
            Method::Write => "Write",
            Method::GetAttributeSingle => "G_A_S",
            Method::GetAttributesAll => "G_A_A",
            Method::SetAttributeSingle => "S_A_S",
        };
        format!("{} {}", verb, self.path)
    }
}

/// Value yielded for one completed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpValue {
    /// Failed; see status
    None,
    /// Successful write
    Written,
    /// Read data
    Data(Vec<CipValue>),
    /// Raw attribute bytes
    Raw(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct OpResult {
    pub index: usize,
    pub description: String,
    pub status: u8,
    pub extended: Vec<u16>,
    pub value: OpValue,
}

impl OpResult {
    pub fn ok(&self) -> bool {
        self.status == cip::STATUS_OK || self.status == cip::STATUS_PARTIAL
    }
}

/// Parse a trailing `Tag[e]` / `Tag[lo-hi]` element annotation off a path,
/// appending the element segment and returning any element count.
fn parse_path_elements(path: &str) -> Result<(Epath, Option<u16>)> {
    let Some(i) = path.find('[') else {
        return Ok((Epath::parse_str(path)?, None));
    };
    let inner = path[i + 1..]
        .strip_suffix(']')
        .ok_or_else(|| EnipError::Config(format!("unbalanced '[' in {:?}", path)))?;
    let (first, count) = match inner.split_once('-') {
        None => (parse_int(inner)?, None),
        Some((lo, hi)) => {
            let lo = parse_int(lo)?;
            let hi = parse_int(hi)?;
            if hi < lo {
                return Err(EnipError::Config(format!("invalid element range in {:?}", path)));
            }
            (lo, Some((hi + 1 - lo) as u16))
        }
    };
    if first < 0 {
        return Err(EnipError::Config(format!("negative element in {:?}", path)));
    }
    let mut epath = Epath::parse_str(&path[..i])?;
    epath.0.push(Segment::Element(first as u32));
    Ok((epath, count))
}

/// Compile operation strings: `TAG[lo-hi]=(TYPE)v1,v2,…` writes,
/// `TAG[e]`/`@c/i/a[e]` reads, `+off` byte offsets for fragmented access.
pub fn parse_operations(tags: &[&str]) -> Result<Vec<Operation>> {
    let mut out = Vec::with_capacity(tags.len());
    for tag in tags {
        let (target, value) = match tag.split_once('=') {
            Some((t, v)) => (t, Some(v)),
            None => (*tag, None),
        };
        let (target, offset) = match target.split_once('+') {
            Some((t, o)) => (t, Some(parse_int(o)? as u32)),
            None => (target, None),
        };
        let (path, elements) = parse_path_elements(target)?;
        let mut op = Operation {
            method: if value.is_some() { Method::Write } else { Method::Read },
            path,
            elements,
            offset,
            tag_type: None,
            data: Vec::new(),
        };
        if let Some(value) = value {
            let (typ, values) = match value.split_once(')') {
                Some((t, rest)) => {
                    let name = t.strip_prefix('(').ok_or_else(|| {
                        EnipError::Config(format!("expected (TYPE) prefix in {:?}", tag))
                    })?;
                    let typ = CipType::from_name(name)
                        .ok_or_else(|| EnipError::Config(format!("unknown type {:?}", name)))?;
                    (typ, rest)
                }
                None => {
                    // Bare values: REAL if any decimal point, else INT
                    let typ = if value.contains('.') { CipType::Real } else { CipType::Int };
                    (typ, value)
                }
            };
            op.tag_type = Some(typ.code());
            for v in values.split(',') {
                let v = v.trim();
                let parsed = match typ {
                    CipType::Real => CipValue::Real(v.parse::<f32>().map_err(|e| {
                        EnipError::Config(format!("bad REAL {:?}: {}", v, e))
                    })?),
                    CipType::Bool => CipValue::Bool(parse_int(v)? != 0),
                    CipType::Sint => CipValue::Sint(parse_int(v)? as i8),
                    CipType::Dint => CipValue::Dint(parse_int(v)? as i32),
                    _ => CipValue::Int(parse_int(v)? as i16),
                };
                op.data.push(parsed);
            }
            if op.elements.is_none() {
                op.elements = Some(op.data.len() as u16);
            }
            if op.offset.is_none() && op.elements.map(|e| e as usize) != Some(op.data.len()) {
                return Err(EnipError::Config(format!(
                    "{:?}: {} values for {} elements",
                    tag,
                    op.data.len(),
                    op.elements.unwrap_or(0)
                )));
            }
        }
        out.push(op);
    }
    Ok(out)
}

/// Correlation token: the issue index, rendered as decimal bytes into the
/// 8-byte sender context.
fn format_context(index: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    let s = index.to_string();
    let bytes = s.as_bytes();
    out[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
    out
}

fn parse_context(context: &[u8; 8]) -> Result<usize> {
    let end = context.iter().position(|&b| b == 0).unwrap_or(8);
    std::str::from_utf8(&context[..end])
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| EnipError::Protocol(format!("uncorrelatable context {:?}", context)))
}

/// One wire-level request: a batch of operations and their shared context.
struct Issue {
    index: usize,
    ops: Vec<(usize, Operation)>,
}

/// A registered EtherNet/IP session to one device.
pub struct Connector {
    stream: TcpStream,
    machine: FrameMachine,
    pub session: u32,
    pub timeout: Duration,
    /// Route path placed in every Unconnected Send; None sends the request
    /// bare (no Unconnected Send wrapper)
    pub route_path: Option<Epath>,
}

impl Connector {
    /// Connect and register a session.
    pub async fn connect(host: &str, port: Option<u16>, limit: Duration) -> Result<Connector> {
        let addr = format!("{}:{}", host, port.unwrap_or(DEFAULT_PORT));
        let stream = timeout(limit, TcpStream::connect(&addr))
            .await
            .map_err(|_| EnipError::Timeout(limit))??;
        stream.set_nodelay(true)?;
        let mut conn = Connector {
            stream,
            machine: FrameMachine::new(),
            session: 0,
            timeout: limit,
            route_path: Some(Epath(vec![Segment::Port {
                port: 1,
                link: crate::epath::Link::Number(0),
            }])),
        };
        conn.register().await?;
        info!("EtherNet/IP session 0x{:08X} registered with {}", conn.session, addr);
        Ok(conn)
    }

    async fn register(&mut self) -> Result<()> {
        let frame = Frame::new(
            frame::REGISTER_SESSION,
            0,
            Payload::RegisterSession { protocol_version: 1, options: 0 },
        );
        self.send_frame(&frame).await?;
        let reply = self.recv_frame().await?;
        if reply.status != 0 {
            return Err(EnipError::Protocol(format!(
                "session registration failed with status 0x{:08X}",
                reply.status
            )));
        }
        if reply.session_handle == 0 {
            return Err(EnipError::Protocol("no session handle assigned".into()));
        }
        self.session = reply.session_handle;
        Ok(())
    }

    /// Unregister and drop the connection.
    pub async fn unregister(mut self) -> Result<()> {
        let frame = Frame::new(frame::UNREGISTER_SESSION, self.session, Payload::UnregisterSession);
        self.send_frame(&frame).await?;
        Ok(())
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let wire = frame.encode();
        timeout(self.timeout, self.stream.write_all(&wire))
            .await
            .map_err(|_| EnipError::Timeout(self.timeout))??;
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Frame> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.machine.next_frame()? {
                return Ok(frame);
            }
            let n = timeout(self.timeout, self.stream.read(&mut buf))
                .await
                .map_err(|_| EnipError::Timeout(self.timeout))??;
            if n == 0 {
                return Err(EnipError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "session closed by peer",
                )));
            }
            self.machine.feed(&buf[..n]);
        }
    }

    /// Wrap a router request for the wire, applying the configured route
    /// path.
    fn encapsulate(&self, request: &Request, context: [u8; 8]) -> Frame {
        let request_bytes = produce_request(request);
        let item = match &self.route_path {
            Some(route) => encode_unconnected_send(&UnconnectedSend {
                request: request_bytes,
                route_path: route.clone(),
                ..UnconnectedSend::default()
            }),
            None => request_bytes,
        };
        let mut frame = Frame::new(
            frame::SEND_RR_DATA,
            self.session,
            Payload::SendRRData(SendData {
                interface_handle: 0,
                timeout: 5,
                cpf: Cpf::unconnected(item),
            }),
        );
        frame.sender_context = context;
        frame
    }

    fn unpack_reply(frame: &Frame) -> Result<([u8; 8], Reply)> {
        if frame.status != 0 {
            return Err(EnipError::Protocol(format!(
                "encapsulation status 0x{:08X}",
                frame.status
            )));
        }
        let sd = match &frame.payload {
            Payload::SendRRData(sd) => sd,
            other => {
                return Err(EnipError::Protocol(format!("unexpected reply payload {:?}", other)))
            }
        };
        let item = sd
            .cpf
            .unconnected_data()
            .ok_or_else(|| EnipError::Protocol("reply lacked an unconnected-data item".into()))?;
        Ok((frame.sender_context, cip::parse_reply(item)?))
    }

    /// Convert one reply into results for the operations it answered.
    fn disaggregate(issue: &Issue, reply: Reply, out: &mut Vec<OpResult>) -> Result<()> {
        let sub_replies: Vec<Reply> = match reply.body {
            ReplyBody::Multiple(replies) => {
                if replies.len() != issue.ops.len() {
                    return Err(EnipError::Protocol(format!(
                        "{} replies for {} bundled operations",
                        replies.len(),
                        issue.ops.len()
                    )));
                }
                replies
            }
            _ => {
                if issue.ops.len() != 1 {
                    // The whole bundle failed; every operation inherits it
                    for (index, op) in &issue.ops {
                        out.push(OpResult {
                            index: *index,
                            description: op.describe(),
                            status: reply.status,
                            extended: reply.extended.clone(),
                            value: OpValue::None,
                        });
                    }
                    return Ok(());
                }
                vec![reply]
            }
        };
        for ((index, op), sub) in issue.ops.iter().zip(sub_replies) {
            let value = if !sub.ok() {
                OpValue::None
            } else {
                match sub.body {
                    ReplyBody::ReadTag { data, .. } => OpValue::Data(data),
                    ReplyBody::Attribute(bytes) => OpValue::Raw(bytes),
                    ReplyBody::None => OpValue::Written,
                    ReplyBody::Multiple(_) => {
                        return Err(EnipError::Protocol("nested bundle reply".into()))
                    }
                }
            };
            out.push(OpResult {
                index: *index,
                description: op.describe(),
                status: sub.status,
                extended: sub.extended,
                value,
            });
        }
        Ok(())
    }

    fn issue_frame(&self, issue: &Issue, fragment: bool) -> Frame {
        let context = format_context(issue.index);
        if issue.ops.len() == 1 {
            self.encapsulate(&issue.ops[0].1.to_request(fragment), context)
        } else {
            let requests = issue.ops.iter().map(|(_, op)| op.to_request(fragment)).collect();
            self.encapsulate(
                &Request { path: Epath::default(), body: RequestBody::Multiple { requests } },
                context,
            )
        }
    }

    /// Issue every operation with up to `depth` requests in flight, bundling
    /// under the `multiple` budget; results come back in operation order.
    pub async fn pipeline(
        &mut self,
        operations: &[Operation],
        depth: usize,
        multiple: usize,
    ) -> Result<Vec<OpResult>> {
        let depth = depth.max(1);
        let issues = plan(operations, multiple);
        debug!(
            "pipelining {} operations as {} issues, depth {}",
            operations.len(),
            issues.len(),
            depth
        );
        let mut results = Vec::with_capacity(operations.len());
        let mut inflight: std::collections::VecDeque<&Issue> = std::collections::VecDeque::new();
        let mut next = 0;
        while next < issues.len() || !inflight.is_empty() {
            if next < issues.len() && inflight.len() < depth {
                let issue = &issues[next];
                let frame = self.issue_frame(issue, false);
                self.send_frame(&frame).await?;
                debug!("issued   {:3} ({} ops)", issue.index, issue.ops.len());
                inflight.push_back(issue);
                next += 1;
                continue;
            }
            let frame = self.recv_frame().await?;
            let (context, reply) = Self::unpack_reply(&frame)?;
            let index = parse_context(&context)?;
            let issue = inflight
                .pop_front()
                .ok_or_else(|| EnipError::Protocol("reply with nothing in flight".into()))?;
            if issue.index != index {
                return Err(EnipError::Protocol(format!(
                    "reply context {} does not match issue {}",
                    index, issue.index
                )));
            }
            debug!("answered {:3}", index);
            Self::disaggregate(issue, reply, &mut results)?;
        }
        results.sort_by_key(|r| r.index);
        Ok(results)
    }

    /// Request, await reply, next.
    pub async fn synchronous(&mut self, operations: &[Operation]) -> Result<Vec<OpResult>> {
        self.pipeline(operations, 1, 0).await
    }

    /// Orchestrator: pipelined when depth > 1 or a bundle budget is set.
    pub async fn operate(
        &mut self,
        operations: &[Operation],
        depth: usize,
        multiple: usize,
    ) -> Result<Vec<OpResult>> {
        if depth <= 1 && multiple == 0 {
            self.synchronous(operations).await
        } else {
            self.pipeline(operations, depth, multiple).await
        }
    }

    pub async fn read(&mut self, path: &str) -> Result<OpResult> {
        let ops = parse_operations(&[path])?;
        let mut res = self.synchronous(&ops).await?;
        res.pop().ok_or_else(|| EnipError::Protocol("no result".into()))
    }

    pub async fn write(&mut self, op: &str) -> Result<OpResult> {
        let ops = parse_operations(&[op])?;
        let mut res = self.synchronous(&ops).await?;
        res.pop().ok_or_else(|| EnipError::Protocol("no result".into()))
    }

    pub async fn get_attribute_single(&mut self, path: &str) -> Result<OpResult> {
        let op = Operation {
            method: Method::GetAttributeSingle,
            path: Epath::parse_str(path)?,
            elements: None,
            offset: None,
            tag_type: None,
            data: Vec::new(),
        };
        let mut res = self.synchronous(std::slice::from_ref(&op)).await?;
        res.pop().ok_or_else(|| EnipError::Protocol("no result".into()))
    }

    pub async fn get_attributes_all(&mut self, path: &str) -> Result<OpResult> {
        let op = Operation {
            method: Method::GetAttributesAll,
            path: Epath::parse_str(path)?,
            elements: None,
            offset: None,
            tag_type: None,
            data: Vec::new(),
        };
        let mut res = self.synchronous(std::slice::from_ref(&op)).await?;
        res.pop().ok_or_else(|| EnipError::Protocol("no result".into()))
    }

    pub async fn set_attribute_single(&mut self, path: &str, data: Vec<CipValue>) -> Result<OpResult> {
        let op = Operation {
            method: Method::SetAttributeSingle,
            path: Epath::parse_str(path)?,
            elements: None,
            offset: None,
            tag_type: None,
            data,
        };
        let mut res = self.synchronous(std::slice::from_ref(&op)).await?;
        res.pop().ok_or_else(|| EnipError::Protocol("no result".into()))
    }

    async fn list_command(&mut self, command: u16) -> Result<Option<Cpf>> {
        let payload = match command {
            frame::LIST_SERVICES => Payload::ListServices(None),
            frame::LIST_IDENTITY => Payload::ListIdentity(None),
            frame::LIST_INTERFACES => Payload::ListInterfaces(None),
            _ => Payload::Legacy(None),
        };
        let frame = Frame::new(command, self.session, payload);
        self.send_frame(&frame).await?;
        let reply = self.recv_frame().await?;
        Ok(match reply.payload {
            Payload::ListServices(cpf)
            | Payload::ListIdentity(cpf)
            | Payload::ListInterfaces(cpf)
            | Payload::Legacy(cpf) => cpf,
            _ => None,
        })
    }

    pub async fn list_services(&mut self) -> Result<Option<Cpf>> {
        self.list_command(frame::LIST_SERVICES).await
    }

    pub async fn list_identity(&mut self) -> Result<Option<IdentityItem>> {
        Ok(self.list_command(frame::LIST_IDENTITY).await?.and_then(|cpf| {
            cpf.items.into_iter().find_map(|i| match i {
                CpfItem::Identity(item) => Some(item),
                _ => None,
            })
        }))
    }

    pub async fn list_interfaces(&mut self) -> Result<Option<Cpf>> {
        self.list_command(frame::LIST_INTERFACES).await
    }
}

/// Broadcast a ListIdentity over UDP and collect every reply arriving within
/// the window, each tagged with the responder's address.
pub async fn broadcast_identity(
    broadcast: &str,
    window: Duration,
) -> Result<Vec<(SocketAddr, IdentityItem)>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    let request = Frame::new(frame::LIST_IDENTITY, 0, Payload::ListIdentity(None));
    socket.send_to(&request.encode(), broadcast).await?;
    let mut out = Vec::new();
    let mut buf = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        let remaining = deadline - now;
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Err(e)) => return Err(EnipError::Io(e)),
            Ok(Ok((n, peer))) => match Frame::parse(&buf[..n]) {
                Ok(Frame { payload: Payload::ListIdentity(Some(cpf)), .. }) => {
                    for item in cpf.items {
                        if let CpfItem::Identity(identity) = item {
                            out.push((peer, identity));
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("ignoring malformed identity reply from {}: {}", peer, e),
            },
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_read_operations() {
        let ops = parse_operations(&["SCADA[0-10]", "TAG", "@0x1FF/1/0x1A[99]"]).unwrap();
        assert_eq!(ops[0].method, Method::Read);
        assert_eq!(ops[0].elements, Some(11));
        assert_eq!(
            ops[0].path,
            Epath(vec![Segment::Symbolic("SCADA".into()), Segment::Element(0)])
        );
        assert_eq!(ops[1].elements, None);
        assert_eq!(
            ops[2].path,
            Epath(vec![
                Segment::Class(0x1FF),
                Segment::Instance(1),
                Segment::Attribute(26),
                Segment::Element(99)
            ])
        );
    }

    #[test]
    fn test_parse_write_operations() {
        let ops = parse_operations(&["SCADA[4-7]=1,2,3,4", "Motor=(REAL)5.5", "T[0]=(DINT)42"])
            .unwrap();
        assert_eq!(ops[0].method, Method::Write);
        assert_eq!(ops[0].elements, Some(4));
        assert_eq!(
            ops[0].data,
            vec![CipValue::Int(1), CipValue::Int(2), CipValue::Int(3), CipValue::Int(4)]
        );
        assert_eq!(ops[1].tag_type, Some(CipType::Real.code()));
        assert_eq!(ops[1].data, vec![CipValue::Real(5.5)]);
        assert_eq!(ops[2].data, vec![CipValue::Dint(42)]);
        // Bare decimal implies REAL
        let ops = parse_operations(&["X=2.5"]).unwrap();
        assert_eq!(ops[0].tag_type, Some(CipType::Real.code()));
    }

    #[test]
    fn test_write_element_count_must_match() {
        assert!(parse_operations(&["SCADA[0-3]=1,2"]).is_err());
        // Fragmented writes may carry a partial payload
        assert!(parse_operations(&["SCADA[0-3]+4=2,3"]).is_ok());
    }

    #[test]
    fn test_context_round_trip() {
        for idx in [0usize, 7, 42, 99_999_999] {
            assert_eq!(parse_context(&format_context(idx)).unwrap(), idx);
        }
    }

    #[test]
    fn test_plan_respects_budget() {
        let conn_ops: Vec<Operation> = (0..50)
            .map(|_| {
                Operation::read(
                    Epath(vec![Segment::Symbolic("TAG".into()), Segment::Element(0)]),
                    1,
                )
            })
            .collect();
        let issues = plan(&conn_ops, 250);
        // Read estimate: 22 req / 8 reply; the request side saturates first:
        // 68 + 22*n < 250 allows 8 per bundle
        assert!(issues.len() >= 50 / 8);
        assert!(issues.len() < 50);
        let total: usize = issues.iter().map(|i| i.ops.len()).sum();
        assert_eq!(total, 50);
        // Indices preserved and contiguous
        let mut seen = Vec::new();
        for issue in &issues {
            for (i, _) in &issue.ops {
                seen.push(*i);
            }
        }
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
        // No budget: one issue per operation
        assert_eq!(plan(&conn_ops, 0).len(), 50);
    }

    #[test]
    fn test_get_attribute_ops_never_merge() {
        let mut ops: Vec<Operation> = (0..4)
            .map(|_| Operation::read(Epath(vec![Segment::Symbolic("T".into())]), 1))
            .collect();
        ops.insert(
            2,
            Operation {
                method: Method::GetAttributeSingle,
                path: Epath::logical(1, 1, Some(7)),
                elements: None,
                offset: None,
                tag_type: None,
                data: Vec::new(),
            },
        );
        let issues = plan(&ops, 500);
        // The G_A_S lands alone in its own issue
        let gas_issue = issues
            .iter()
            .find(|i| i.ops.iter().any(|(_, o)| o.method == Method::GetAttributeSingle))
            .unwrap();
        assert_eq!(gas_issue.ops.len(), 1);
    }
}

/// Group operations into issues: without a budget, one wire request per
/// operation; with one, contiguous small operations bundle into a Multiple
/// Service Packet while the request and reply size estimates both stay under
/// the `multiple` byte budget.
fn plan(operations: &[Operation], multiple: usize) -> Vec<Issue> {
    let overhead = 68usize;
    let mut issues: Vec<Issue> = Vec::new();
    let mut pending: Vec<(usize, Operation)> = Vec::new();
    let (mut req_size, mut rpy_size) = (overhead, overhead);
    let mut next_issue = 0usize;
    for (i, op) in operations.iter().enumerate() {
        if multiple == 0 {
            issues.push(Issue { index: next_issue, ops: vec![(i, op.clone())] });
            next_issue += 1;
            continue;
        }
        let (req_est, rpy_est) = op.estimate();
        let fits =
            req_size.saturating_add(req_est).max(rpy_size.saturating_add(rpy_est)) < multiple;
        if !fits && !pending.is_empty() {
            issues.push(Issue { index: next_issue, ops: std::mem::take(&mut pending) });
            next_issue += 1;
            req_size = overhead;
            rpy_size = overhead;
        }
        pending.push((i, op.clone()));
        req_size += req_est;
        rpy_size = rpy_size.saturating_add(rpy_est);
    }
    if !pending.is_empty() {
        issues.push(Issue { index: next_issue, ops: pending });
    }
    issues
}
