//! Inbound datagram processing and query answering
//!
//! `PacketHandler` is the orchestrator between the transport collaborator,
//! the wire codec and the record cache. It is stateless per call: the event
//! loop hands it one datagram at a time together with the interface the
//! datagram arrived on, and all persistent state lives in the cache.
//!
//! Queries are answered from locally published records, with known-answer
//! suppression and the RFC 6762 reply routing rules (unicast-response bit,
//! legacy source ports, unicast interfaces). Responses are absorbed into
//! the cache. Malformed input of any shape is counted and dropped, never
//! surfaced as a fault.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::mdns::buffer::{PacketBuffer, SlicePacketBuffer, VectorPacketBuffer};
use crate::mdns::cache::SynchronizedCache;
use crate::mdns::interface::Interface;
use crate::mdns::protocol::{
    DnsPacket, DnsRecord, RData, RecordType, MAX_LEGACY_TTL, MDNS_PORT,
};

/// Size limit for multicast responses, chosen to fit a typical Ethernet
/// MTU with IP and UDP headers subtracted.
pub const MAX_PACKET_SIZE: usize = 1432;

/// Legacy resolvers only promise to accept 512-byte DNS messages.
pub const MAX_LEGACY_PACKET_SIZE: usize = 512;

/// Capability for transmitting one datagram. The implementation owns the
/// sockets and picks the one matching the destination's address family.
pub trait Transport: Send + Sync {
    fn send(&self, dest: SocketAddr, data: &[u8]) -> io::Result<()>;
}

/// Injected time source, so cache expiry is testable without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time; the production `Clock`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Diagnostic counters. Malformed input is counted here and nowhere else.
#[derive(Default)]
pub struct HandlerStats {
    pub packets_received: AtomicU64,
    pub packets_discarded: AtomicU64,
    pub queries_received: AtomicU64,
    pub records_ingested: AtomicU64,
    pub answers_sent: AtomicU64,
}

/// Decides what to do with each parsed message: cache it, answer it, or
/// discard it.
pub struct PacketHandler {
    cache: Arc<SynchronizedCache>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    pub stats: HandlerStats,
}

impl PacketHandler {
    pub fn new(cache: Arc<SynchronizedCache>, transport: Arc<dyn Transport>) -> PacketHandler {
        PacketHandler::with_clock(cache, transport, Arc::new(SystemClock))
    }

    pub fn with_clock(
        cache: Arc<SynchronizedCache>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> PacketHandler {
        PacketHandler {
            cache,
            transport,
            clock,
            stats: HandlerStats::default(),
        }
    }

    fn discard(&self, reason: &str, src: SocketAddr) {
        self.stats.packets_discarded.fetch_add(1, Ordering::Relaxed);
        log::debug!("discarding packet from {}: {}", src, reason);
    }

    /// Process one received datagram.
    ///
    /// `iface` is the interface the datagram arrived on, `src` the sender
    /// and `dst_port` the local port it was delivered to. Never fails:
    /// hostile input at worst bumps a counter.
    pub fn handle_inbound(&self, iface: &Interface, src: SocketAddr, dst_port: u16, bytes: &[u8]) {
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);

        let mut buffer = SlicePacketBuffer::new(bytes);
        let packet = match DnsPacket::from_buffer(&mut buffer) {
            Ok(x) => x,
            Err(e) => {
                self.discard(&e.to_string(), src);
                return;
            }
        };

        // only standard queries and responses; no dynamic update, no notify
        if packet.header.opcode != 0 {
            self.discard("non-zero opcode", src);
            return;
        }
        if packet.header.rescode != 0 {
            self.discard("non-zero response code", src);
            return;
        }

        if packet.header.response {
            self.handle_response(iface, packet);
        } else {
            self.handle_query(iface, src, dst_port, packet);
        }
    }

    /// Absorb every record of a response into the cache, scoped to the
    /// receiving interface. Responses are never replied to.
    fn handle_response(&self, iface: &Interface, packet: DnsPacket) {
        let now = self.clock.now();

        for rec in packet.records() {
            match self.cache.ingest(rec.clone(), iface.ifindex, now) {
                Ok(()) => {
                    self.stats.records_ingested.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    log::warn!("failed to cache record for {}: {}", rec.name, e);
                }
            }
        }
    }

    fn handle_query(
        &self,
        iface: &Interface,
        src: SocketAddr,
        dst_port: u16,
        packet: DnsPacket,
    ) {
        self.stats.queries_received.fetch_add(1, Ordering::Relaxed);

        let legacy = src.port() != MDNS_PORT;

        let mut unicast_reply = DnsPacket::new();
        let mut multicast_reply = DnsPacket::new();

        for question in &packet.questions {
            let mut answers =
                self.cache
                    .authoritative(&question.name, question.qtype, iface.ifindex);
            answers.retain(|rec| !known_answer_suppressed(rec, &packet.answers));

            if answers.is_empty() {
                continue;
            }

            // direct reply when the querier asked for one, when the query
            // came from a legacy source port or to a unicast socket, or
            // when the interface itself is not multicast-capable
            let direct = question.unicast_response
                || legacy
                || dst_port != MDNS_PORT
                || !iface.is_multicast();

            let reply = if direct {
                &mut unicast_reply
            } else {
                &mut multicast_reply
            };

            if legacy && direct {
                reply.questions.push(question.clone());
            }

            for rec in answers {
                push_unique(&mut reply.answers, rec);
            }
        }

        self.attach_additionals(iface, &mut unicast_reply);
        self.attach_additionals(iface, &mut multicast_reply);

        if !unicast_reply.answers.is_empty() {
            if legacy {
                format_legacy_reply(&mut unicast_reply, packet.header.id);
            }
            self.transmit(unicast_reply, src, legacy);
        }

        if !multicast_reply.answers.is_empty() {
            self.transmit(multicast_reply, iface.multicast_group(), false);
        }
    }

    /// Pull the records a querier will predictably ask for next into the
    /// additional section: SRV and TXT for answered PTRs, addresses for
    /// answered SRVs.
    fn attach_additionals(&self, iface: &Interface, reply: &mut DnsPacket) {
        let mut additionals = Vec::new();

        for rec in &reply.answers {
            if let RData::Ptr { ref target } = rec.rdata {
                for extra in self
                    .cache
                    .authoritative(target, RecordType::Srv, iface.ifindex)
                    .into_iter()
                    .chain(
                        self.cache
                            .authoritative(target, RecordType::Txt, iface.ifindex),
                    )
                {
                    push_unique(&mut additionals, extra);
                }
            }
        }

        let srv_targets: Vec<String> = reply
            .answers
            .iter()
            .chain(additionals.iter())
            .filter_map(|rec| match rec.rdata {
                RData::Srv { ref target, .. } => Some(target.clone()),
                _ => None,
            })
            .collect();

        for target in srv_targets {
            for extra in self
                .cache
                .authoritative(&target, RecordType::A, iface.ifindex)
                .into_iter()
                .chain(
                    self.cache
                        .authoritative(&target, RecordType::Aaaa, iface.ifindex),
                )
            {
                push_unique(&mut additionals, extra);
            }
        }

        for rec in additionals {
            if !reply.answers.iter().any(|a| a.same_data(&rec)) {
                reply.resources.push(rec);
            }
        }
    }

    fn transmit(&self, mut reply: DnsPacket, dest: SocketAddr, legacy: bool) {
        reply.header.response = true;
        reply.header.authoritative_answer = true;

        let max_size = if legacy {
            MAX_LEGACY_PACKET_SIZE
        } else {
            MAX_PACKET_SIZE
        };

        let mut buffer = VectorPacketBuffer::new();
        if let Err(e) = reply.write(&mut buffer, max_size) {
            log::warn!("failed to serialize reply to {}: {}", dest, e);
            return;
        }

        let len = buffer.pos();
        let data = match buffer.get_range(0, len) {
            Ok(x) => x,
            Err(e) => {
                log::warn!("failed to read back reply buffer: {}", e);
                return;
            }
        };

        match self.transport.send(dest, data) {
            Ok(()) => {
                self.stats.answers_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::warn!("failed to send reply to {}: {}", dest, e);
            }
        }
    }
}

/// A candidate answer is suppressed when the query already listed the same
/// record with at least half its authoritative TTL remaining (RFC 6762
/// section 7.1).
fn known_answer_suppressed(candidate: &DnsRecord, known_answers: &[DnsRecord]) -> bool {
    known_answers
        .iter()
        .any(|known| known.same_data(candidate) && known.ttl.0 >= candidate.ttl.0 / 2)
}

fn push_unique(list: &mut Vec<DnsRecord>, rec: DnsRecord) {
    if !list.iter().any(|existing| existing.same_data(&rec)) {
        list.push(rec);
    }
}

/// Legacy unicast responses echo the query id, repeat the question, drop
/// the mDNS cache-flush bit and cap TTLs at ten seconds (RFC 6762
/// section 6.7). The question echo happens during routing; the rest here.
fn format_legacy_reply(reply: &mut DnsPacket, query_id: u16) {
    reply.header.id = query_id;

    for rec in reply
        .answers
        .iter_mut()
        .chain(reply.authorities.iter_mut())
        .chain(reply.resources.iter_mut())
    {
        rec.cache_flush = false;
        if rec.ttl.0 > MAX_LEGACY_TTL {
            rec.ttl.0 = MAX_LEGACY_TTL;
        }
    }
}
