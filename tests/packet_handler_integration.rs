//! End-to-end tests driving the packet handler with raw datagram bytes

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use beacon::mdns::buffer::SlicePacketBuffer;
use beacon::mdns::cache::SynchronizedCache;
use beacon::mdns::handler::{PacketHandler, Transport};
use beacon::mdns::interface::{Interface, Ipv4Net, SocketKind};
use beacon::mdns::protocol::{DnsPacket, DnsRecord, RData, RecordType, MDNS_PORT};

struct RecordingTransport {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl RecordingTransport {
    fn new() -> RecordingTransport {
        RecordingTransport {
            sent: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.lock().unwrap().drain(..).collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, dest: SocketAddr, data: &[u8]) -> io::Result<()> {
        self.sent.lock().unwrap().push((dest, data.to_vec()));
        Ok(())
    }
}

fn multicast_v4_iface() -> Interface {
    Interface {
        name: "eth0".to_string(),
        ifindex: 2,
        kind: SocketKind::MulticastV4,
        v4_addrs: vec![Ipv4Net {
            addr: Ipv4Addr::new(192, 168, 1, 100),
            mask: Ipv4Addr::new(255, 255, 255, 0),
        }],
        v6_addrs: Vec::new(),
    }
}

fn setup() -> (Arc<SynchronizedCache>, Arc<RecordingTransport>, PacketHandler) {
    let cache = Arc::new(SynchronizedCache::new());
    let transport = Arc::new(RecordingTransport::new());
    let handler = PacketHandler::new(cache.clone(), transport.clone());
    (cache, transport, handler)
}

#[test]
fn test_ptr_query_end_to_end() {
    let (cache, transport, handler) = setup();

    cache
        .publish(
            DnsRecord::new(
                "_service._tcp.local",
                4500,
                RData::Ptr {
                    target: "unit._service._tcp.local".to_string(),
                },
            ),
            None,
            chrono::Utc::now(),
        )
        .unwrap();

    // one PTR question for _service._tcp.local, no known answers
    let query = vec![
        // DNS header
        0x00, 0x00, // id 0
        0x00, 0x00, // flags: standard query
        0x00, 0x01, // questions: 1
        0x00, 0x00, // answers: 0
        0x00, 0x00, // authorities: 0
        0x00, 0x00, // additionals: 0
        // question section
        0x08, b'_', b's', b'e', b'r', b'v', b'i', b'c', b'e', // _service
        0x04, b'_', b't', b'c', b'p', // _tcp
        0x05, b'l', b'o', b'c', b'a', b'l', // local
        0x00, // root label
        0x00, 0x0C, // type PTR
        0x00, 0x01, // class IN
    ];

    handler.handle_inbound(
        &multicast_v4_iface(),
        "192.168.1.50:5353".parse().unwrap(),
        MDNS_PORT,
        &query,
    );

    let sent = transport.take();
    assert_eq!(1, sent.len());

    let (dest, data) = &sent[0];
    assert_eq!("224.0.0.251:5353".parse::<SocketAddr>().unwrap(), *dest);

    let mut buffer = SlicePacketBuffer::new(data);
    let reply = DnsPacket::from_buffer(&mut buffer).expect("reply must decode");

    assert!(reply.header.response);
    assert!(reply.header.authoritative_answer);
    assert_eq!(0, reply.header.id);
    assert_eq!(1, reply.answers.len());

    let answer = &reply.answers[0];
    assert_eq!("_service._tcp.local", answer.name);
    assert_eq!(4500, answer.ttl.0);
    assert_eq!(
        RData::Ptr {
            target: "unit._service._tcp.local".to_string()
        },
        answer.rdata
    );
}

#[test]
fn test_remote_announcement_is_absorbed() {
    let (cache, transport, handler) = setup();

    // unsolicited response announcing printer._ipp._tcp.local, with the
    // SRV record name compressed against the answer name
    let announcement = vec![
        // DNS header
        0x00, 0x00, // id 0
        0x84, 0x00, // flags: response, authoritative
        0x00, 0x00, // questions: 0
        0x00, 0x02, // answers: 2
        0x00, 0x00, // authorities: 0
        0x00, 0x00, // additionals: 0
        // answer 1: PTR _ipp._tcp.local -> printer._ipp._tcp.local
        0x04, b'_', b'i', b'p', b'p', // offset 12
        0x04, b'_', b't', b'c', b'p', // offset 17
        0x05, b'l', b'o', b'c', b'a', b'l', // offset 22
        0x00, //
        0x00, 0x0C, // type PTR
        0x00, 0x01, // class IN
        0x00, 0x00, 0x11, 0x94, // ttl 4500
        0x00, 0x0A, // rdlength 10
        0x07, b'p', b'r', b'i', b'n', b't', b'e', b'r', // printer
        0xC0, 0x0C, // pointer to _ipp._tcp.local
        // answer 2: SRV printer._ipp._tcp.local
        0xC0, 0x27, // pointer to printer._ipp._tcp.local (offset 39)
        0x00, 0x21, // type SRV
        0x80, 0x01, // class IN, cache-flush
        0x00, 0x00, 0x00, 0x78, // ttl 120
        0x00, 0x10, // rdlength 16
        0x00, 0x00, // priority
        0x00, 0x00, // weight
        0x02, 0x77, // port 631
        0x07, b'p', b'r', b'i', b'n', b't', b'e', b'r', // printer
        0xC0, 0x16, // pointer to local (offset 22)
    ];

    handler.handle_inbound(
        &multicast_v4_iface(),
        "192.168.1.60:5353".parse().unwrap(),
        MDNS_PORT,
        &announcement,
    );

    // responses are cached, never replied to
    assert!(transport.take().is_empty());

    let now = chrono::Utc::now();
    let ptrs = cache.lookup("_ipp._tcp.local", RecordType::Ptr, now);
    assert_eq!(1, ptrs.len());
    assert_eq!(
        RData::Ptr {
            target: "printer._ipp._tcp.local".to_string()
        },
        ptrs[0].rdata
    );

    let srvs = cache.lookup("printer._ipp._tcp.local", RecordType::Srv, now);
    assert_eq!(1, srvs.len());
    assert!(srvs[0].cache_flush);
    assert_eq!(
        RData::Srv {
            priority: 0,
            weight: 0,
            port: 631,
            target: "printer.local".to_string()
        },
        srvs[0].rdata
    );
}

#[test]
fn test_hostile_datagrams_never_disturb_state() {
    let (cache, transport, handler) = setup();

    cache
        .publish(
            DnsRecord::new(
                "unit.local",
                120,
                RData::A {
                    addr: Ipv4Addr::new(192, 168, 1, 100),
                },
            ),
            None,
            chrono::Utc::now(),
        )
        .unwrap();

    let iface = multicast_v4_iface();
    let src: SocketAddr = "192.168.1.50:5353".parse().unwrap();

    // short runt
    handler.handle_inbound(&iface, src, MDNS_PORT, &[0x00, 0x01, 0x02]);
    // header counts far beyond the payload
    let mut bogus_counts = vec![0u8; 12];
    bogus_counts[5] = 0xFF;
    bogus_counts[7] = 0xFF;
    handler.handle_inbound(&iface, src, MDNS_PORT, &bogus_counts);
    // self-referential compression pointer in the question name
    let mut cyclic = vec![0u8; 12];
    cyclic[5] = 0x01;
    cyclic.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01]);
    handler.handle_inbound(&iface, src, MDNS_PORT, &cyclic);

    assert!(transport.take().is_empty());

    // the published record is still served afterwards
    let query = vec![
        0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
        0x04, b'u', b'n', b'i', b't', 0x05, b'l', b'o', b'c', b'a', b'l', 0x00, //
        0x00, 0x01, 0x00, 0x01,
    ];
    handler.handle_inbound(&iface, src, MDNS_PORT, &query);
    assert_eq!(1, transport.take().len());
}
