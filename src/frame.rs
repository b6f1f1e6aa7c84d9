// frame.rs - EtherNet/IP encapsulation and Common Packet Format codec
//
// The 24-byte encapsulation header carries a command, payload length,
// session handle, status, an opaque 8-byte sender context echoed in replies,
// and options.  Payloads for the send-data commands are CPF item lists.  The
// `FrameMachine` assembles frames incrementally from arbitrary TCP segment
// boundaries by running a machine composed from the primitive codecs.

use crate::automata::{self, ArcAutomaton, Builder, Config, Outcome, Repeat, Runner, Source};
use crate::error::{EnipError, Result};
use crate::tree::Tree;
use crate::types::{
    decode_sstring, encode_sstring, latin1_decode, latin1_encode, CipType, Cursor,
};
use std::net::Ipv4Addr;
use std::sync::Arc;

pub const DEFAULT_PORT: u16 = 44818;

pub const LEGACY_PROBE: u16 = 0x0001;
pub const LIST_SERVICES: u16 = 0x0004;
pub const LIST_IDENTITY: u16 = 0x0063;
pub const LIST_INTERFACES: u16 = 0x0064;
pub const REGISTER_SESSION: u16 = 0x0065;
pub const UNREGISTER_SESSION: u16 = 0x0066;
pub const SEND_RR_DATA: u16 = 0x006F;
pub const SEND_UNIT_DATA: u16 = 0x0070;

/// Encapsulation status: request not understood / framing failure.
pub const STATUS_UNSUPPORTED: u32 = 0x0001;
pub const STATUS_BAD_DATA: u32 = 0x0003;

/// CPF item type ids.
pub const ITEM_NULL_ADDRESS: u16 = 0x0000;
pub const ITEM_LEGACY: u16 = 0x0001;
pub const ITEM_IDENTITY: u16 = 0x000C;
pub const ITEM_CONNECTED_ADDRESS: u16 = 0x00A1;
pub const ITEM_CONNECTED_DATA: u16 = 0x00B1;
pub const ITEM_UNCONNECTED_DATA: u16 = 0x00B2;
pub const ITEM_SERVICES: u16 = 0x0100;

/// ListServices capability flags.
pub const CAP_CIP_ENCAPSULATION: u16 = 1 << 5;
pub const CAP_CIP_UDP: u16 = 1 << 8;

/// The fixed encapsulation header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub command: u16,
    pub length: u16,
    pub session_handle: u32,
    pub status: u32,
    pub sender_context: [u8; 8],
    pub options: u32,
}

pub const HEADER_BYTES: usize = 24;

impl Header {
    pub fn parse(cur: &mut Cursor<'_>) -> Result<Header> {
        let command = cur.u16()?;
        let length = cur.u16()?;
        let session_handle = cur.u32()?;
        let status = cur.u32()?;
        let mut sender_context = [0u8; 8];
        sender_context.copy_from_slice(cur.take(8)?);
        let options = cur.u32()?;
        Ok(Header { command, length, session_handle, status, sender_context, options })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.command.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.session_handle.to_le_bytes());
        out.extend_from_slice(&self.status.to_le_bytes());
        out.extend_from_slice(&self.sender_context);
        out.extend_from_slice(&self.options.to_le_bytes());
    }
}

/// ListServices reply item: the device's communications service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunicationsService {
    pub version: u16,
    pub capability: u16,
    pub service_name: String,
}

impl CommunicationsService {
    pub fn parse(data: &[u8]) -> Result<CommunicationsService> {
        let mut cur = Cursor::new(data);
        let version = cur.u16()?;
        let capability = cur.u16()?;
        let mut name = cur.rest().to_vec();
        if name.last() == Some(&0) {
            name.pop();
        }
        Ok(CommunicationsService { version, capability, service_name: latin1_decode(&name) })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.capability.to_le_bytes());
        out.extend_from_slice(&latin1_encode(&self.service_name));
        out.push(0);
    }
}

/// ListIdentity reply item: address plus Identity object attributes.  The
/// embedded sockaddr fields are big-endian, per the encapsulation spec.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityItem {
    pub protocol_version: u16,
    pub sin_family: u16,
    pub sin_port: u16,
    pub sin_addr: Ipv4Addr,
    pub vendor_id: u16,
    pub device_type: u16,
    pub product_code: u16,
    pub product_revision: u16,
    pub status_word: u16,
    pub serial_number: u32,
    pub product_name: String,
    pub state: u8,
}

impl IdentityItem {
    pub fn parse(data: &[u8]) -> Result<IdentityItem> {
        let mut cur = Cursor::new(data);
        let protocol_version = cur.u16()?;
        let fam = cur.take(2)?;
        let sin_family = u16::from_be_bytes([fam[0], fam[1]]);
        let prt = cur.take(2)?;
        let sin_port = u16::from_be_bytes([prt[0], prt[1]]);
        let adr = cur.take(4)?;
        let sin_addr = Ipv4Addr::new(adr[0], adr[1], adr[2], adr[3]);
        cur.take(8)?; // sockaddr zero padding
        let vendor_id = cur.u16()?;
        let device_type = cur.u16()?;
        let product_code = cur.u16()?;
        let product_revision = cur.u16()?;
        let status_word = cur.u16()?;
        let serial_number = cur.u32()?;
        let product_name = decode_sstring(&mut cur)?;
        let state = cur.u8()?;
        Ok(IdentityItem {
            protocol_version,
            sin_family,
            sin_port,
            sin_addr,
            vendor_id,
            device_type,
            product_code,
            product_revision,
            status_word,
            serial_number,
            product_name,
            state,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.protocol_version.to_le_bytes());
        out.extend_from_slice(&self.sin_family.to_be_bytes());
        out.extend_from_slice(&self.sin_port.to_be_bytes());
        out.extend_from_slice(&self.sin_addr.octets());
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&self.vendor_id.to_le_bytes());
        out.extend_from_slice(&self.device_type.to_le_bytes());
        out.extend_from_slice(&self.product_code.to_le_bytes());
        out.extend_from_slice(&self.product_revision.to_le_bytes());
        out.extend_from_slice(&self.status_word.to_le_bytes());
        out.extend_from_slice(&self.serial_number.to_le_bytes());
        encode_sstring(&self.product_name, None, out);
        out.push(self.state);
    }
}

/// Reply to the undocumented 0x0001 probe: just the responder address.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyAddress {
    pub sin_family: u16,
    pub sin_port: u16,
    pub sin_addr: Ipv4Addr,
}

impl LegacyAddress {
    pub fn parse(data: &[u8]) -> Result<LegacyAddress> {
        let mut cur = Cursor::new(data);
        let fam = cur.take(2)?;
        let sin_family = u16::from_be_bytes([fam[0], fam[1]]);
        let prt = cur.take(2)?;
        let sin_port = u16::from_be_bytes([prt[0], prt[1]]);
        let adr = cur.take(4)?;
        Ok(LegacyAddress {
            sin_family,
            sin_port,
            sin_addr: Ipv4Addr::new(adr[0], adr[1], adr[2], adr[3]),
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sin_family.to_be_bytes());
        out.extend_from_slice(&self.sin_port.to_be_bytes());
        out.extend_from_slice(&self.sin_addr.octets());
    }
}

/// One CPF item, tagged by type id.
#[derive(Debug, Clone, PartialEq)]
pub enum CpfItem {
    NullAddress,
    ConnectedAddress(u32),
    /// CIP request/reply bytes; structure is the CIP dispatcher's concern
    UnconnectedData(Vec<u8>),
    ConnectedData(Vec<u8>),
    Services(CommunicationsService),
    Identity(IdentityItem),
    Legacy(LegacyAddress),
    Unrecognized { type_id: u16, data: Vec<u8> },
}

impl CpfItem {
    pub fn type_id(&self) -> u16 {
        match self {
            CpfItem::NullAddress => ITEM_NULL_ADDRESS,
            CpfItem::ConnectedAddress(_) => ITEM_CONNECTED_ADDRESS,
            CpfItem::UnconnectedData(_) => ITEM_UNCONNECTED_DATA,
            CpfItem::ConnectedData(_) => ITEM_CONNECTED_DATA,
            CpfItem::Services(_) => ITEM_SERVICES,
            CpfItem::Identity(_) => ITEM_IDENTITY,
            CpfItem::Legacy(_) => ITEM_LEGACY,
            CpfItem::Unrecognized { type_id, .. } => *type_id,
        }
    }

    fn parse(type_id: u16, data: &[u8]) -> Result<CpfItem> {
        Ok(match type_id {
            ITEM_NULL_ADDRESS => CpfItem::NullAddress,
            ITEM_CONNECTED_ADDRESS => {
                let mut cur = Cursor::new(data);
                CpfItem::ConnectedAddress(cur.u32()?)
            }
            ITEM_UNCONNECTED_DATA => CpfItem::UnconnectedData(data.to_vec()),
            ITEM_CONNECTED_DATA => CpfItem::ConnectedData(data.to_vec()),
            ITEM_SERVICES => CpfItem::Services(CommunicationsService::parse(data)?),
            ITEM_IDENTITY => CpfItem::Identity(IdentityItem::parse(data)?),
            ITEM_LEGACY => CpfItem::Legacy(LegacyAddress::parse(data)?),
            other => CpfItem::Unrecognized { type_id: other, data: data.to_vec() },
        })
    }

    fn encode_data(&self, out: &mut Vec<u8>) {
        match self {
            CpfItem::NullAddress => {}
            CpfItem::ConnectedAddress(id) => out.extend_from_slice(&id.to_le_bytes()),
            CpfItem::UnconnectedData(d) | CpfItem::ConnectedData(d) => out.extend_from_slice(d),
            CpfItem::Services(s) => s.encode(out),
            CpfItem::Identity(i) => i.encode(out),
            CpfItem::Legacy(l) => l.encode(out),
            CpfItem::Unrecognized { data, .. } => out.extend_from_slice(data),
        }
    }
}

/// A Common Packet Format item list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Cpf {
    pub items: Vec<CpfItem>,
}

impl Cpf {
    pub fn parse(cur: &mut Cursor<'_>) -> Result<Cpf> {
        let count = cur.u16()? as usize;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let type_id = cur.u16()?;
            let length = cur.u16()? as usize;
            let data = cur.take(length)?;
            items.push(CpfItem::parse(type_id, data)?);
        }
        Ok(Cpf { items })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.items.len() as u16).to_le_bytes());
        for item in &self.items {
            out.extend_from_slice(&item.type_id().to_le_bytes());
            let mut data = Vec::new();
            item.encode_data(&mut data);
            out.extend_from_slice(&(data.len() as u16).to_le_bytes());
            out.extend_from_slice(&data);
        }
    }

    /// The CIP request/reply bytes of the unconnected-data item, if present.
    pub fn unconnected_data(&self) -> Option<&[u8]> {
        self.items.iter().find_map(|i| match i {
            CpfItem::UnconnectedData(d) => Some(d.as_slice()),
            _ => None,
        })
    }

    /// The usual request/reply shape: a null address plus the CIP payload.
    pub fn unconnected(request: Vec<u8>) -> Cpf {
        Cpf { items: vec![CpfItem::NullAddress, CpfItem::UnconnectedData(request)] }
    }
}

/// SendRRData/SendUnitData payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SendData {
    pub interface_handle: u32,
    pub timeout: u16,
    pub cpf: Cpf,
}

impl SendData {
    pub fn parse(cur: &mut Cursor<'_>) -> Result<SendData> {
        let interface_handle = cur.u32()?;
        let timeout = cur.u16()?;
        let cpf = Cpf::parse(cur)?;
        Ok(SendData { interface_handle, timeout, cpf })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.interface_handle.to_le_bytes());
        out.extend_from_slice(&self.timeout.to_le_bytes());
        self.cpf.encode(out);
    }
}

/// Command-specific payload.  List-command requests carry no CPF at all
/// (None); replies carry one, possibly with zero items.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    RegisterSession { protocol_version: u16, options: u16 },
    UnregisterSession,
    SendRRData(SendData),
    SendUnitData(SendData),
    ListServices(Option<Cpf>),
    ListIdentity(Option<Cpf>),
    ListInterfaces(Option<Cpf>),
    Legacy(Option<Cpf>),
    Raw(Vec<u8>),
}

/// A complete EtherNet/IP message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: u16,
    pub session_handle: u32,
    pub status: u32,
    pub sender_context: [u8; 8],
    pub options: u32,
    pub payload: Payload,
}

fn list_payload(bytes: &[u8]) -> Result<Option<Cpf>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    let mut cur = Cursor::new(bytes);
    Ok(Some(Cpf::parse(&mut cur)?))
}

impl Frame {
    pub fn new(command: u16, session_handle: u32, payload: Payload) -> Frame {
        Frame {
            command,
            session_handle,
            status: 0,
            sender_context: [0; 8],
            options: 0,
            payload,
        }
    }

    /// Assemble from a parsed header and its complete payload bytes.
    pub fn from_parts(header: &Header, payload: &[u8]) -> Result<Frame> {
        let body = match header.command {
            REGISTER_SESSION => {
                let mut cur = Cursor::new(payload);
                Payload::RegisterSession { protocol_version: cur.u16()?, options: cur.u16()? }
            }
            UNREGISTER_SESSION => Payload::UnregisterSession,
            SEND_RR_DATA => {
                let mut cur = Cursor::new(payload);
                Payload::SendRRData(SendData::parse(&mut cur)?)
            }
            SEND_UNIT_DATA => {
                let mut cur = Cursor::new(payload);
                Payload::SendUnitData(SendData::parse(&mut cur)?)
            }
            LIST_SERVICES => Payload::ListServices(list_payload(payload)?),
            LIST_IDENTITY => Payload::ListIdentity(list_payload(payload)?),
            LIST_INTERFACES => Payload::ListInterfaces(list_payload(payload)?),
            LEGACY_PROBE => Payload::Legacy(list_payload(payload)?),
            _ => Payload::Raw(payload.to_vec()),
        };
        Ok(Frame {
            command: header.command,
            session_handle: header.session_handle,
            status: header.status,
            sender_context: header.sender_context,
            options: header.options,
            payload: body,
        })
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match &self.payload {
            Payload::RegisterSession { protocol_version, options } => {
                out.extend_from_slice(&protocol_version.to_le_bytes());
                out.extend_from_slice(&options.to_le_bytes());
            }
            Payload::UnregisterSession => {}
            Payload::SendRRData(sd) | Payload::SendUnitData(sd) => sd.encode(&mut out),
            Payload::ListServices(cpf)
            | Payload::ListIdentity(cpf)
            | Payload::ListInterfaces(cpf)
            | Payload::Legacy(cpf) => {
                if let Some(cpf) = cpf {
                    cpf.encode(&mut out);
                }
            }
            Payload::Raw(bytes) => out.extend_from_slice(bytes),
        }
        out
    }

    /// Serialize header + payload; the header length field always equals the
    /// serialized payload byte count.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let header = Header {
            command: self.command,
            length: payload.len() as u16,
            session_handle: self.session_handle,
            status: self.status,
            sender_context: self.sender_context,
            options: self.options,
        };
        let mut out = Vec::with_capacity(HEADER_BYTES + payload.len());
        header.encode(&mut out);
        out.extend_from_slice(&payload);
        out
    }

    /// One-shot parse of a complete frame.
    pub fn parse(bytes: &[u8]) -> Result<Frame> {
        let mut cur = Cursor::new(bytes);
        let header = Header::parse(&mut cur)?;
        let payload = cur.take(header.length as usize)?;
        if cur.remaining() != 0 {
            return Err(EnipError::Frame(format!(
                "{} trailing bytes after encapsulated payload",
                cur.remaining()
            )));
        }
        Frame::from_parts(&header, payload)
    }
}

/// The encapsulation grammar as a composed machine: the six header fields in
/// sequence, then a payload collector repeated `enip.length` times.
pub fn enip_machine() -> automata::Automaton {
    let mut b = Builder::new("enip");
    let uint = |ctx: &str| CipType::Uint.machine(ctx).unwrap();
    let udint = |ctx: &str| CipType::Udint.machine(ctx).unwrap();

    let entry = b.state("entry");
    let cmd = b.sub("command", uint("enip.command"));
    let len = b.sub("length", uint("enip.length"));
    let sess = b.sub("sess_hdl", udint("enip.session_handle"));
    let stat = b.sub("status", udint("enip.status"));
    let ctx = b.sub(
        "sndr_ctx",
        automata::octets("sender_context", "enip.sender_context", Repeat::Fixed(8)),
    );
    let opts = b.sub("options", udint("enip.options"));
    let payload = b.sub(
        "payload",
        automata::octets("payload", "enip.input", Repeat::Path("enip.length".into())),
    );
    b.terminal(payload);

    b.eps(entry, cmd);
    b.any(cmd, len);
    b.any(len, sess);
    b.any(sess, stat);
    b.any(stat, ctx);
    b.any(ctx, opts);
    b.eps(opts, payload);

    b.build(
        entry,
        Config {
            context: "enip".to_string(),
            greedy: false,
            terminal: true,
            repeat: None,
            emit: None,
        },
    )
}

/// Incremental frame assembler for a TCP byte stream.  Feed whatever the
/// socket produced; complete frames come out as they are recognized, and a
/// partial frame simply waits for more input.
pub struct FrameMachine {
    runner: Runner,
    source: Source,
    tree: Tree,
}

impl Default for FrameMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameMachine {
    pub fn new() -> FrameMachine {
        let machine: ArcAutomaton = Arc::new(enip_machine());
        FrameMachine { runner: Runner::new(machine), source: Source::new(), tree: Tree::new() }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.source.chain(bytes);
    }

    /// Bytes buffered but not yet consumed by the parse in progress.
    pub fn pending(&self) -> usize {
        self.source.len()
    }

    /// Produce the next complete frame, or None if more input is needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.runner.run(&mut self.source, &mut self.tree, false)? {
            Outcome::Complete => {}
            Outcome::Starved => return Ok(None),
            Outcome::Stalled => {
                return Err(EnipError::Frame("encapsulation framing lost".into()));
            }
        }
        if !self.runner.terminal() {
            return Err(EnipError::Frame("incomplete encapsulation frame".into()));
        }
        let need = |k: &str| -> Result<u64> {
            self.tree
                .get(&format!("enip.{}", k))
                .and_then(|v| v.as_uint())
                .ok_or_else(|| EnipError::Frame(format!("header field {} missing", k)))
        };
        let mut sender_context = [0u8; 8];
        let ctx_bytes = self
            .tree
            .get("enip.sender_context")
            .and_then(|v| v.as_bytes().map(|b| b.to_vec()))
            .ok_or_else(|| EnipError::Frame("sender context missing".into()))?;
        if ctx_bytes.len() != 8 {
            return Err(EnipError::Frame("sender context not 8 bytes".into()));
        }
        sender_context.copy_from_slice(&ctx_bytes);
        let header = Header {
            command: need("command")? as u16,
            length: need("length")? as u16,
            session_handle: need("session_handle")? as u32,
            status: need("status")? as u32,
            sender_context,
            options: need("options")? as u32,
        };
        let payload = self
            .tree
            .get("enip.input")
            .and_then(|v| v.as_bytes().map(|b| b.to_vec()))
            .unwrap_or_default();
        self.runner.reset();
        self.tree = Tree::new();
        Frame::from_parts(&header, &payload).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_request() -> Vec<u8> {
        let mut out = vec![
            0x65, 0x00, 0x04, 0x00, // command, length
            0x00, 0x00, 0x00, 0x00, // session
            0x00, 0x00, 0x00, 0x00, // status
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // context
            0x00, 0x00, 0x00, 0x00, // options
        ];
        out.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]); // version 1, options 0
        out
    }

    #[test]
    fn test_register_frame_round_trip() {
        let wire = register_request();
        let frame = Frame::parse(&wire).unwrap();
        assert_eq!(frame.command, REGISTER_SESSION);
        assert_eq!(
            frame.payload,
            Payload::RegisterSession { protocol_version: 1, options: 0 }
        );
        assert_eq!(frame.encode(), wire);
    }

    #[test]
    fn test_send_rr_data_round_trip() {
        let cip = vec![0x4C, 0x02, 0x20, 0x6B, 0x24, 0x01, 0x01, 0x00];
        let frame = Frame::new(
            SEND_RR_DATA,
            0xDEADBEEF,
            Payload::SendRRData(SendData {
                interface_handle: 0,
                timeout: 5,
                cpf: Cpf::unconnected(cip.clone()),
            }),
        );
        let wire = frame.encode();
        // length field equals serialized payload size
        assert_eq!(
            u16::from_le_bytes([wire[2], wire[3]]) as usize,
            wire.len() - HEADER_BYTES
        );
        let parsed = Frame::parse(&wire).unwrap();
        assert_eq!(parsed, frame);
        match &parsed.payload {
            Payload::SendRRData(sd) => assert_eq!(sd.cpf.unconnected_data(), Some(&cip[..])),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_list_services_reply_item() {
        let frame = Frame::new(
            LIST_SERVICES,
            0,
            Payload::ListServices(Some(Cpf {
                items: vec![CpfItem::Services(CommunicationsService {
                    version: 1,
                    capability: CAP_CIP_ENCAPSULATION,
                    service_name: "Communications".into(),
                })],
            })),
        );
        let wire = frame.encode();
        let parsed = Frame::parse(&wire).unwrap();
        assert_eq!(parsed, frame);
        // Empty request payload parses as no CPF at all
        let req = Frame::new(LIST_SERVICES, 0, Payload::ListServices(None));
        assert_eq!(Frame::parse(&req.encode()).unwrap(), req);
    }

    #[test]
    fn test_identity_item_round_trip() {
        let item = IdentityItem {
            protocol_version: 1,
            sin_family: 2,
            sin_port: 44818,
            sin_addr: Ipv4Addr::new(192, 168, 1, 10),
            vendor_id: 1,
            device_type: 0x000E,
            product_code: 0x36,
            product_revision: 0x0B14,
            status_word: 0x3160,
            serial_number: 0x006C061A,
            product_name: "1756-L61/B LOGIX5561".into(),
            state: 0xFF,
        };
        let frame = Frame::new(
            LIST_IDENTITY,
            0,
            Payload::ListIdentity(Some(Cpf { items: vec![CpfItem::Identity(item)] })),
        );
        assert_eq!(Frame::parse(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_frame_machine_across_segment_boundaries() {
        let wire = register_request();
        let mut fm = FrameMachine::new();
        // Deliver one byte at a time; no frame until the last byte
        for &b in &wire[..wire.len() - 1] {
            fm.feed(&[b]);
            assert!(fm.next_frame().unwrap().is_none());
        }
        fm.feed(&wire[wire.len() - 1..]);
        let frame = fm.next_frame().unwrap().expect("frame should complete");
        assert_eq!(frame.command, REGISTER_SESSION);
        // And a second frame through the same machine
        fm.feed(&wire);
        assert!(fm.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_frame_machine_two_frames_in_one_feed() {
        let mut wire = register_request();
        wire.extend_from_slice(&register_request());
        let mut fm = FrameMachine::new();
        fm.feed(&wire);
        assert!(fm.next_frame().unwrap().is_some());
        assert!(fm.next_frame().unwrap().is_some());
        assert!(fm.next_frame().unwrap().is_none());
        assert_eq!(fm.pending(), 0);
    }

    #[test]
    fn test_zero_length_payload_completes_without_more_input() {
        let frame = Frame::new(UNREGISTER_SESSION, 7, Payload::UnregisterSession);
        let mut fm = FrameMachine::new();
        fm.feed(&frame.encode());
        let parsed = fm.next_frame().unwrap().expect("frame should complete");
        assert_eq!(parsed.payload, Payload::UnregisterSession);
    }
}
