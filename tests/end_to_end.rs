// end_to_end.rs - Client and server conversing over loopback
//
// Exercises the documented scenarios: session registration and List
// Services, fragmented write/read of a simulated tag, multi-hop routing to
// a second server, pipelined+aggregated polling, administrative disable and
// recovery, and UDP identity discovery.

use enip_stack::client::{broadcast_identity, parse_operations, Connector, OpValue};
use enip_stack::frame::CAP_CIP_ENCAPSULATION;
use enip_stack::proxy::{Parameter, Proxy};
use enip_stack::server::{EnipServer, ServerControl};
use enip_stack::{
    CipType, CipValue, Device, Epath, Link, RouteEntry, RoutePolicy, Segment, Ucmm,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_server(
    device: Arc<Device>,
    ucmm: Ucmm,
) -> (SocketAddr, Arc<ServerControl>, JoinHandle<()>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();
    let udp = UdpSocket::bind(local).await.unwrap();
    let server = EnipServer::new(device, ucmm);
    let control = server.control();
    let handle = tokio::spawn(async move {
        let _ = server.serve(listener, udp).await;
    });
    (local, control, handle)
}

#[tokio::test]
async fn test_register_and_list_services() {
    let device = Device::builder().build().unwrap();
    let (addr, _control, server) = spawn_server(device, Ucmm::default()).await;

    let mut client = Connector::connect("127.0.0.1", Some(addr.port()), TIMEOUT).await.unwrap();
    assert_ne!(client.session, 0);

    let cpf = client.list_services().await.unwrap().expect("services CPF");
    let service = cpf
        .items
        .iter()
        .find_map(|i| match i {
            enip_stack::frame::CpfItem::Services(s) => Some(s),
            _ => None,
        })
        .expect("communications service item");
    assert_eq!(service.version, 1);
    assert_eq!(service.capability, 0x0120);
    assert_ne!(service.capability & CAP_CIP_ENCAPSULATION, 0);
    assert_eq!(service.service_name, "Communications");

    client.unregister().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn test_fragmented_write_then_read() {
    let device = Device::builder().tag_str("SCADA=INT[1000]").unwrap().build().unwrap();
    let (addr, _control, server) = spawn_server(device, Ucmm::default()).await;

    let mut client = Connector::connect("127.0.0.1", Some(addr.port()), TIMEOUT).await.unwrap();

    // Write SCADA[3] = 4 via Write Tag Fragmented (byte offset forces it)
    let result = client.write("SCADA[3]+0=4").await.unwrap();
    assert_eq!(result.status, 0, "write failed: {:?}", result);
    assert_eq!(result.value, OpValue::Written);

    let result = client.read("SCADA[0-10]").await.unwrap();
    assert_eq!(result.status, 0);
    let expect: Vec<CipValue> =
        (0..11).map(|i| CipValue::Int(if i == 3 { 4 } else { 0 })).collect();
    assert_eq!(result.value, OpValue::Data(expect));

    server.abort();
}

#[tokio::test]
async fn test_routed_write_persists_downstream() {
    // Downstream hosts REMOTE; upstream routes 1/1-15 to it
    let downstream_device = Device::builder().tag_str("REMOTE=DINT[10]").unwrap().build().unwrap();
    let (down_addr, _dc, down_srv) = spawn_server(downstream_device.clone(), Ucmm::default()).await;

    let upstream_device = Device::builder().build().unwrap();
    let local_hop = Segment::Port { port: 1, link: Link::Number(0) };
    let ucmm = Ucmm {
        route_path: RoutePolicy::Exact(vec![local_hop.clone()]),
        routes: vec![RouteEntry {
            port: 1,
            link_min: 1,
            link_max: 15,
            link_addr: None,
            target: format!("127.0.0.1:{}", down_addr.port()),
        }],
        forward_timeout: Some(TIMEOUT),
    };
    let (up_addr, _uc, up_srv) = spawn_server(upstream_device, ucmm).await;

    let mut client = Connector::connect("127.0.0.1", Some(up_addr.port()), TIMEOUT).await.unwrap();
    client.route_path = Some(Epath(vec![
        local_hop,
        Segment::Port { port: 1, link: Link::Number(5) },
    ]));

    let result = client.write("REMOTE[0]=(DINT)42").await.unwrap();
    assert_eq!(result.status, 0, "routed write failed: {:?}", result);

    // The value persisted on the downstream server's object model
    let resolved = downstream_device
        .resolve(&Epath(vec![Segment::Symbolic("REMOTE".into())]))
        .unwrap();
    let bytes = downstream_device.read_attribute(&resolved, 0, 4).await.unwrap();
    assert_eq!(bytes, 42i32.to_le_bytes());

    // And reads back through the route
    let result = client.read("REMOTE[0]").await.unwrap();
    assert_eq!(result.value, OpValue::Data(vec![CipValue::Dint(42)]));

    down_srv.abort();
    up_srv.abort();
}

#[tokio::test]
async fn test_pipelined_aggregated_reads() {
    let device = Device::builder().tag_str("TAG=DINT[16]").unwrap().build().unwrap();
    let (addr, control, server) = spawn_server(device, Ucmm::default()).await;

    let mut client = Connector::connect("127.0.0.1", Some(addr.port()), TIMEOUT).await.unwrap();
    let tags: Vec<String> = (0..50).map(|_| "TAG[0]".to_string()).collect();
    let refs: Vec<&str> = tags.iter().map(|s| s.as_str()).collect();
    let ops = parse_operations(&refs).unwrap();

    let results = client.operate(&ops, 20, 250).await.unwrap();
    assert_eq!(results.len(), 50);
    for (i, r) in results.iter().enumerate() {
        assert_eq!(r.index, i);
        assert_eq!(r.status, 0, "operation {} failed: {:?}", i, r);
        assert_eq!(r.value, OpValue::Data(vec![CipValue::Dint(0)]));
    }

    // Aggregation bounded the wire traffic: the register plus the bundled
    // requests, far fewer than 50 frames
    let served = control.requests_served();
    assert!(served <= 10, "server saw {} requests; aggregation failed", served);
    server.abort();
}

#[tokio::test]
async fn test_disable_recovery_through_proxy() {
    let device = Device::builder().tag_str("TAG=DINT[4]").unwrap().build().unwrap();
    let (addr, control, server) = spawn_server(device.clone(), Ucmm::default()).await;

    let mut proxy = Proxy::new("127.0.0.1", Some(addr.port()));
    proxy.timeout = Duration::from_millis(500);
    proxy.define("Counter", Parameter::new("TAG[0]", Some(CipType::Dint), None));

    let results = proxy.read(&["Counter"]).await.unwrap();
    assert!(results[0].1.ok());
    assert!(proxy.is_open());

    // Disable: the server closes its listeners and connections
    control.disable();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The next request fails with an I/O-kind error and the proxy closes
    // its gateway
    let err = proxy.read(&["Counter"]).await.unwrap_err();
    assert!(err.is_fatal(), "expected a fatal I/O error, got {:?}", err);
    assert!(!proxy.is_open());

    // Re-enable and restart; the proxy reopens its gateway and succeeds
    let _ = server.await;
    control.enable();
    let listener = TcpListener::bind(addr).await.unwrap();
    let udp = UdpSocket::bind(addr).await.unwrap();
    let server2 = EnipServer::new(device, Ucmm::default());
    let handle = tokio::spawn(async move {
        let _ = server2.serve(listener, udp).await;
    });

    let results = proxy.read(&["Counter"]).await.unwrap();
    assert!(results[0].1.ok());
    assert!(proxy.is_open());

    handle.abort();
}

#[tokio::test]
async fn test_poller_processes_values() {
    use enip_stack::proxy::Poller;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    let device = Device::builder().tag_str("FLOW=REAL[1]").unwrap().build().unwrap();
    let (addr, _control, server) = spawn_server(device, Ucmm::default()).await;

    let mut proxy = Proxy::new("127.0.0.1", Some(addr.port()));
    proxy.define("Flow Rate", Parameter::new("FLOW[0]", Some(CipType::Real), Some("l/s")));

    let stop = Arc::new(AtomicBool::new(false));
    let polls = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));

    let poller = Poller { cycle: Duration::from_millis(10), ..Poller::default() };
    let stop2 = stop.clone();
    let polls2 = polls.clone();
    let failures2 = failures.clone();
    let runner = tokio::spawn(async move {
        let mut proxy = proxy;
        poller
            .run(
                &mut proxy,
                &["Flow Rate"],
                |_name, _value| {
                    polls2.fetch_add(1, Ordering::SeqCst);
                },
                |_err| {
                    failures2.fetch_add(1, Ordering::SeqCst);
                },
                &stop2,
            )
            .await;
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    stop.store(true, Ordering::SeqCst);
    let _ = runner.await;

    assert!(polls.load(Ordering::SeqCst) >= 2, "poller never delivered values");
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    server.abort();
}

#[tokio::test]
async fn test_udp_identity_discovery() {
    let config = enip_stack::Config::parse(
        "[Identity]\nProduct Name = 1756-L61/B LOGIX5561\n[UCMM]\nRoute Path = null\n",
    )
    .unwrap();
    let device = Device::builder().identity(config.identity).build().unwrap();
    let (addr, _control, server) = spawn_server(device, config.ucmm).await;

    let replies = broadcast_identity(&addr.to_string(), Duration::from_millis(500)).await.unwrap();
    assert!(!replies.is_empty(), "no identity reply received");
    let (peer, identity) = &replies[0];
    assert_eq!(peer.port(), addr.port());
    assert_eq!(identity.product_name, "1756-L61/B LOGIX5561");
    assert_eq!(identity.sin_family, 2);

    server.abort();
}

#[tokio::test]
async fn test_tag_disable_and_delay_controls() {
    let device = Device::builder().tag_str("SLOW=DINT[1]").unwrap().build().unwrap();
    let (addr, control, server) = spawn_server(device, Ucmm::default()).await;

    control
        .set_tag(
            "SLOW",
            enip_stack::TagControl { enabled: false, delay: Duration::from_millis(10) },
        )
        .await;

    let mut client = Connector::connect("127.0.0.1", Some(addr.port()), TIMEOUT).await.unwrap();
    let result = client.read("SLOW[0]").await.unwrap();
    assert_eq!(result.status, 0x08);
    assert_eq!(result.value, OpValue::None);

    control
        .set_tag("SLOW", enip_stack::TagControl { enabled: true, delay: Duration::ZERO })
        .await;
    let result = client.read("SLOW[0]").await.unwrap();
    assert_eq!(result.status, 0);

    server.abort();
}
