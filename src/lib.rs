//! Beacon mDNS responder core
//!
//! The packet-handling heart of a multicast DNS / DNS-SD responder
//! (RFC 6762, RFC 6763): a transport-agnostic DNS wire codec, a record
//! cache with mDNS time-to-live semantics, and the packet handler that
//! answers queries about locally published services and absorbs answers
//! about remote ones.
//!
//! Sockets, the event loop, interface enumeration and configuration are
//! collaborators injected at the edges: the embedding daemon feeds
//! received datagrams to [`mdns::handler::PacketHandler::handle_inbound`]
//! and provides a [`mdns::handler::Transport`] for outbound replies.

/// mDNS responder core: codec, cache and packet handling
pub mod mdns;
