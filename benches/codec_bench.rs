//! Performance benchmarks for the mDNS wire codec

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use beacon::mdns::buffer::{PacketBuffer, SlicePacketBuffer, VectorPacketBuffer};
use beacon::mdns::protocol::{DnsPacket, DnsQuestion, DnsRecord, RData, RecordType};

fn service_announcement() -> DnsPacket {
    let mut packet = DnsPacket::new();
    packet.header.response = true;
    packet.header.authoritative_answer = true;

    packet.answers.push(DnsRecord::new(
        "_ipp._tcp.local",
        4500,
        RData::Ptr {
            target: "printer._ipp._tcp.local".to_string(),
        },
    ));
    packet.answers.push(DnsRecord::new(
        "printer._ipp._tcp.local",
        120,
        RData::Srv {
            priority: 0,
            weight: 0,
            port: 631,
            target: "printer.local".to_string(),
        },
    ));
    packet.answers.push(DnsRecord::new(
        "printer._ipp._tcp.local",
        4500,
        RData::Txt {
            data: b"\x09txtvers=1\x08paper=a4".to_vec(),
        },
    ));
    packet.answers.push(DnsRecord::new(
        "printer.local",
        120,
        RData::A {
            addr: "192.168.1.9".parse().unwrap(),
        },
    ));

    packet
}

fn encoded_announcement() -> Vec<u8> {
    let mut buffer = VectorPacketBuffer::new();
    service_announcement().write(&mut buffer, 0xFFFF).unwrap();
    buffer.buffer
}

fn bench_decode(c: &mut Criterion) {
    let data = encoded_announcement();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("service_announcement", |b| {
        b.iter(|| {
            let mut buffer = SlicePacketBuffer::new(black_box(&data));
            DnsPacket::from_buffer(&mut buffer).unwrap()
        })
    });
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    c.bench_function("encode/service_announcement", |b| {
        b.iter(|| {
            let mut packet = service_announcement();
            let mut buffer = VectorPacketBuffer::new();
            packet.write(&mut buffer, black_box(0xFFFF)).unwrap();
            buffer.pos()
        })
    });
}

fn bench_query_roundtrip(c: &mut Criterion) {
    c.bench_function("encode_decode/ptr_query", |b| {
        b.iter(|| {
            let mut query = DnsPacket::new();
            query.questions.push(DnsQuestion::new(
                "_ipp._tcp.local".to_string(),
                RecordType::Ptr,
            ));

            let mut buffer = VectorPacketBuffer::new();
            query.write(&mut buffer, 0xFFFF).unwrap();
            buffer.seek(0).unwrap();
            DnsPacket::from_buffer(&mut buffer).unwrap()
        })
    });
}

criterion_group!(benches, bench_decode, bench_encode, bench_query_roundtrip);
criterion_main!(benches);
