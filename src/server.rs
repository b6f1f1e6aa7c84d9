// server.rs - TCP and UDP listeners with per-connection dispatch
//
// One task per accepted TCP connection; parse, dispatch and respond are
// strictly serialized per session.  UDP answers the list commands and the
// legacy probe datagram-per-request.  An administrative disable flag is
// observed on a 0.1 s tick by the accept loop and every connection.

use crate::cip::{self, Ucmm};
use crate::device::Device;
use crate::epath::Segment;
use crate::error::{EnipError, Result};
use crate::frame::{
    self, CommunicationsService, Cpf, CpfItem, Frame, FrameMachine, IdentityItem, LegacyAddress,
    Payload, SendData,
};
use crate::tree::{Tree, Value};
use log::{debug, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Encapsulation status for an unregistered/invalid session handle.
const STATUS_INVALID_SESSION: u32 = 0x0064;

/// How often the disable flag is observed.
const POLL_TICK: Duration = Duration::from_millis(100);

/// Administrative override for one tag.
#[derive(Debug, Clone)]
pub struct TagControl {
    pub enabled: bool,
    pub delay: Duration,
}

impl Default for TagControl {
    fn default() -> TagControl {
        TagControl { enabled: true, delay: Duration::ZERO }
    }
}

/// Shared administrative state, published through `snapshot`.
#[derive(Default)]
pub struct ServerControl {
    disabled: AtomicBool,
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    requests_served: AtomicU64,
    tags: Mutex<HashMap<String, TagControl>>,
}

impl ServerControl {
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }

    pub fn enable(&self) {
        self.disabled.store(false, Ordering::SeqCst);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Frames this server has serviced, over TCP and UDP.
    pub fn requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::SeqCst)
    }

    pub async fn set_tag(&self, name: &str, control: TagControl) {
        self.tags.lock().await.insert(name.to_string(), control);
    }

    async fn tag(&self, name: &str) -> Option<TagControl> {
        self.tags.lock().await.get(name).cloned()
    }
}

/// An EtherNet/IP device server.
pub struct EnipServer {
    device: Arc<Device>,
    ucmm: Ucmm,
    control: Arc<ServerControl>,
}

impl EnipServer {
    pub fn new(device: Arc<Device>, ucmm: Ucmm) -> EnipServer {
        EnipServer { device, ucmm, control: Arc::new(ServerControl::default()) }
    }

    pub fn control(&self) -> Arc<ServerControl> {
        self.control.clone()
    }

    pub fn device(&self) -> Arc<Device> {
        self.device.clone()
    }

    /// Structured state consumed by the web introspection collaborator.
    pub async fn snapshot(&self) -> Tree {
        let mut t = Tree::new();
        let c = &self.control;
        t.set("server.disabled", Value::Bool(c.is_disabled()));
        t.set("server.connections.total", Value::Uint(c.connections_total.load(Ordering::SeqCst)));
        t.set("server.connections.active", Value::Uint(c.connections_active.load(Ordering::SeqCst)));
        t.set("server.requests", Value::Uint(c.requests_served.load(Ordering::SeqCst)));
        let tags = c.tags.lock().await;
        for name in self.device.tag_names() {
            let ctl = tags.get(name).cloned().unwrap_or_default();
            t.set(&format!("tag.{}.enabled", name), Value::Bool(ctl.enabled));
            t.set(&format!("tag.{}.delay", name), Value::Real(ctl.delay.as_secs_f64()));
        }
        t
    }

    /// Bind and serve until the disable flag is raised.  The `bind` address
    /// covers both TCP and UDP.
    pub async fn run(&self, bind: &str) -> Result<()> {
        let listener = TcpListener::bind(bind).await?;
        let local = listener.local_addr()?;
        let udp = UdpSocket::bind(local).await?;
        udp.set_broadcast(true)?;
        info!("EtherNet/IP server listening on {} (tcp/udp)", local);
        self.serve(listener, udp).await
    }

    /// Serve on pre-bound sockets; exposed so tests can bind port 0.
    pub async fn serve(&self, listener: TcpListener, udp: UdpSocket) -> Result<()> {
        let local = listener.local_addr()?;
        let mut tick = tokio::time::interval(POLL_TICK);
        let mut udp_buf = [0u8; 2048];
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if self.control.is_disabled() {
                        info!("server on {} disabled; closing listeners", local);
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    self.control.connections_total.fetch_add(1, Ordering::SeqCst);
                    self.control.connections_active.fetch_add(1, Ordering::SeqCst);
                    let device = self.device.clone();
                    let ucmm = self.ucmm.clone();
                    let control = self.control.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(device, ucmm, control.clone(), stream, peer, local).await {
                            if e.is_fatal() {
                                debug!("connection {} ended: {}", peer, e);
                            }
                        }
                        control.connections_active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                received = udp.recv_from(&mut udp_buf) => {
                    let (n, peer) = received?;
                    if let Some(reply) = self.datagram(&udp_buf[..n], peer, local).await {
                        if let Err(e) = udp.send_to(&reply, peer).await {
                            warn!("udp reply to {} failed: {}", peer, e);
                        }
                    }
                }
            }
        }
    }

    /// Answer one UDP datagram: the list commands and the legacy probe.
    /// Anything else is ignored, as is a malformed datagram.
    async fn datagram(&self, bytes: &[u8], peer: SocketAddr, local: SocketAddr) -> Option<Vec<u8>> {
        let request = match Frame::parse(bytes) {
            Ok(f) => f,
            Err(e) => {
                debug!("ignoring malformed datagram from {}: {}", peer, e);
                return None;
            }
        };
        self.control.requests_served.fetch_add(1, Ordering::SeqCst);
        let reply = match request.payload {
            Payload::ListServices(None) => list_services_reply(&request),
            Payload::ListIdentity(None) => list_identity_reply(&self.device, &request, local),
            Payload::ListInterfaces(None) => list_interfaces_reply(&request),
            Payload::Legacy(None) => legacy_reply(&self.device, &request, local),
            _ => return None,
        };
        Some(reply.encode())
    }
}

/// The address advertised in identity replies: the configured interface
/// address when present, else the bound address.
fn identity_address(device: &Device, local: SocketAddr) -> (Ipv4Addr, u16) {
    let configured = device.tcpip.interface_configuration.ip_address;
    let bound = match local.ip() {
        std::net::IpAddr::V4(v4) if !v4.is_unspecified() => Some(v4),
        _ => None,
    };
    (configured.or(bound).unwrap_or(Ipv4Addr::LOCALHOST), local.port())
}

fn echo(mut reply: Frame, request: &Frame) -> Frame {
    reply.sender_context = request.sender_context;
    reply
}

fn list_services_reply(request: &Frame) -> Frame {
    echo(
        Frame::new(
            frame::LIST_SERVICES,
            request.session_handle,
            Payload::ListServices(Some(Cpf {
                items: vec![CpfItem::Services(CommunicationsService {
                    version: 1,
                    capability: frame::CAP_CIP_ENCAPSULATION | frame::CAP_CIP_UDP,
                    service_name: "Communications".to_string(),
                })],
            })),
        ),
        request,
    )
}

fn list_identity_reply(device: &Device, request: &Frame, local: SocketAddr) -> Frame {
    let (addr, port) = identity_address(device, local);
    let idc = &device.identity;
    let item = IdentityItem {
        protocol_version: 1,
        sin_family: 2,
        sin_port: port,
        sin_addr: addr,
        vendor_id: idc.vendor,
        device_type: idc.device_type,
        product_code: idc.product_code,
        product_revision: idc.product_revision,
        status_word: idc.status_word,
        serial_number: idc.serial_number,
        product_name: idc.product_name.clone(),
        state: idc.state,
    };
    echo(
        Frame::new(
            frame::LIST_IDENTITY,
            request.session_handle,
            Payload::ListIdentity(Some(Cpf { items: vec![CpfItem::Identity(item)] })),
        ),
        request,
    )
}

fn legacy_reply(device: &Device, request: &Frame, local: SocketAddr) -> Frame {
    let (addr, port) = identity_address(device, local);
    echo(
        Frame::new(
            frame::LEGACY_PROBE,
            request.session_handle,
            Payload::Legacy(Some(Cpf {
                items: vec![CpfItem::Legacy(LegacyAddress {
                    sin_family: 2,
                    sin_port: port,
                    sin_addr: addr,
                })],
            })),
        ),
        request,
    )
}

fn list_interfaces_reply(request: &Frame) -> Frame {
    echo(
        Frame::new(
            frame::LIST_INTERFACES,
            request.session_handle,
            Payload::ListInterfaces(Some(Cpf::default())),
        ),
        request,
    )
}

/// If the request addresses an administratively controlled tag, apply the
/// forced delay and return a ready-made error reply when disabled.
async fn tag_gate(control: &ServerControl, item: &[u8]) -> Option<Vec<u8>> {
    let request_bytes = match cip::parse_unconnected(item) {
        Ok(cip::UnconnectedItem::Send(us)) => us.request,
        Ok(cip::UnconnectedItem::Bare(b)) => b,
        Err(_) => return None,
    };
    let request = cip::parse_request(&request_bytes).ok()?;
    let name = request
        .path
        .0
        .iter()
        .filter_map(|s| match s {
            Segment::Symbolic(t) => Some(t.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(".");
    if name.is_empty() {
        return None;
    }
    let ctl = control.tag(&name).await?;
    if !ctl.delay.is_zero() {
        tokio::time::sleep(ctl.delay).await;
    }
    if !ctl.enabled {
        debug!("tag {} disabled; rejecting", name);
        return Some(cip::produce_reply(&cip::Reply::failure(request.service(), 0x08, vec![])));
    }
    None
}

/// Serve one TCP connection until EOF, UnregisterSession, a framing
/// failure, or administrative disable.
async fn serve_connection(
    device: Arc<Device>,
    ucmm: Ucmm,
    control: Arc<ServerControl>,
    mut stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
) -> Result<()> {
    debug!("connection from {}", peer);
    let mut machine = FrameMachine::new();
    let mut session: Option<u32> = None;
    let mut buf = [0u8; 4096];
    loop {
        // Drain every complete frame before reading again
        loop {
            let frame = match machine.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    // Framing lost: answer with a failed encapsulation
                    // header and drop the session
                    warn!("{}: {}", peer, e);
                    let mut failed = Frame::new(0, session.unwrap_or(0), Payload::Raw(Vec::new()));
                    failed.status = frame::STATUS_BAD_DATA;
                    let _ = stream.write_all(&failed.encode()).await;
                    return Err(e);
                }
            };
            control.requests_served.fetch_add(1, Ordering::SeqCst);
            match respond(&device, &ucmm, &control, &mut session, local, frame).await? {
                Some(reply) => stream.write_all(&reply.encode()).await?,
                None => {
                    debug!("session with {} terminated", peer);
                    return Ok(());
                }
            }
        }
        match timeout(POLL_TICK, stream.read(&mut buf)).await {
            Err(_) => {
                // Poll tick: observe the administrative flag
                if control.is_disabled() {
                    debug!("closing {}: server disabled", peer);
                    return Ok(());
                }
            }
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) => machine.feed(&buf[..n]),
            Ok(Err(e)) => return Err(EnipError::Io(e)),
        }
        if control.is_disabled() {
            debug!("closing {}: server disabled", peer);
            return Ok(());
        }
    }
}

/// Turn one request frame into its reply; None terminates the session.
async fn respond(
    device: &Device,
    ucmm: &Ucmm,
    control: &ServerControl,
    session: &mut Option<u32>,
    local: SocketAddr,
    request: Frame,
) -> Result<Option<Frame>> {
    let reply = match &request.payload {
        Payload::RegisterSession { protocol_version, .. } => {
            if *protocol_version != 1 {
                let mut reply = Frame::new(
                    frame::REGISTER_SESSION,
                    0,
                    Payload::RegisterSession { protocol_version: 1, options: 0 },
                );
                reply.status = frame::STATUS_UNSUPPORTED;
                reply.sender_context = request.sender_context;
                return Ok(Some(reply));
            }
            let handle = loop {
                let h: u32 = rand::thread_rng().gen();
                if h != 0 {
                    break h;
                }
            };
            *session = Some(handle);
            debug!("session 0x{:08X} established", handle);
            let mut reply = Frame::new(
                frame::REGISTER_SESSION,
                handle,
                Payload::RegisterSession { protocol_version: 1, options: 0 },
            );
            reply.sender_context = request.sender_context;
            reply
        }
        Payload::UnregisterSession => return Ok(None),
        Payload::SendRRData(sd) => {
            if session.is_none() || *session != Some(request.session_handle) {
                let mut reply =
                    Frame::new(frame::SEND_RR_DATA, request.session_handle, Payload::Raw(Vec::new()));
                reply.status = STATUS_INVALID_SESSION;
                reply.sender_context = request.sender_context;
                return Ok(Some(reply));
            }
            let item = match sd.cpf.unconnected_data() {
                Some(item) => item,
                None => {
                    let mut reply = Frame::new(
                        frame::SEND_RR_DATA,
                        request.session_handle,
                        Payload::Raw(Vec::new()),
                    );
                    reply.status = frame::STATUS_BAD_DATA;
                    reply.sender_context = request.sender_context;
                    return Ok(Some(reply));
                }
            };
            let reply_bytes = match tag_gate(control, item).await {
                Some(rejected) => rejected,
                None => ucmm.process(device, item).await,
            };
            let mut reply = Frame::new(
                frame::SEND_RR_DATA,
                request.session_handle,
                Payload::SendRRData(SendData {
                    interface_handle: sd.interface_handle,
                    timeout: sd.timeout,
                    cpf: Cpf::unconnected(reply_bytes),
                }),
            );
            reply.sender_context = request.sender_context;
            reply
        }
        Payload::ListServices(None) => list_services_reply(&request),
        Payload::ListIdentity(None) => list_identity_reply(device, &request, local),
        Payload::ListInterfaces(None) => list_interfaces_reply(&request),
        Payload::Legacy(None) => legacy_reply(device, &request, local),
        _ => {
            let mut reply =
                Frame::new(request.command, request.session_handle, Payload::Raw(Vec::new()));
            reply.status = frame::STATUS_UNSUPPORTED;
            reply.sender_context = request.sender_context;
            reply
        }
    };
    Ok(Some(reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_structure() {
        let device = Device::builder().tag_str("SCADA=INT[10]").unwrap().build().unwrap();
        let server = EnipServer::new(device, Ucmm::default());
        server
            .control()
            .set_tag("SCADA", TagControl { enabled: false, delay: Duration::from_millis(50) })
            .await;
        let snap = server.snapshot().await;
        assert_eq!(snap.get("server.disabled"), Some(&Value::Bool(false)));
        assert_eq!(snap.get("tag.SCADA.enabled"), Some(&Value::Bool(false)));
        assert_eq!(snap.get("tag.SCADA.delay"), Some(&Value::Real(0.05)));
        // Serializes for the introspection surface
        let json = snap.to_json();
        assert!(json.get("server").is_some());
    }

    #[tokio::test]
    async fn test_register_respond_flow() {
        let device = Device::builder().build().unwrap();
        let control = ServerControl::default();
        let mut session = None;
        let local: SocketAddr = "127.0.0.1:44818".parse().unwrap();
        let request = Frame::new(
            frame::REGISTER_SESSION,
            0,
            Payload::RegisterSession { protocol_version: 1, options: 0 },
        );
        let reply = respond(&device, &Ucmm::default(), &control, &mut session, local, request)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.command, frame::REGISTER_SESSION);
        assert_ne!(reply.session_handle, 0);
        assert_eq!(session, Some(reply.session_handle));

        // SendRRData with a stale handle is refused
        let bogus = Frame::new(
            frame::SEND_RR_DATA,
            reply.session_handle ^ 1,
            Payload::SendRRData(SendData {
                interface_handle: 0,
                timeout: 5,
                cpf: Cpf::unconnected(vec![0x01, 0x00]),
            }),
        );
        let refused = respond(&device, &Ucmm::default(), &control, &mut session, local, bogus)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refused.status, STATUS_INVALID_SESSION);

        // Unregister terminates
        let done = respond(
            &device,
            &Ucmm::default(),
            &control,
            &mut session,
            local,
            Frame::new(frame::UNREGISTER_SESSION, reply.session_handle, Payload::UnregisterSession),
        )
        .await
        .unwrap();
        assert!(done.is_none());
    }
}
