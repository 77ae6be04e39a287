//! Multicast DNS packet core
//!
//! * `protocol` - DNS wire format with the mDNS class-bit extensions
//! * `buffer` - low-level packet buffer operations
//! * `cache` - record cache with TTL, goodbye and cache-flush semantics
//! * `interface` - read-only network interface descriptors
//! * `handler` - inbound packet dispatch and query answering

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// Record cache with mDNS lifecycle semantics
pub mod cache;

/// Inbound packet dispatch and query answering
pub mod handler;

/// Network interface descriptors
pub mod interface;

/// DNS protocol definitions and packet structures
pub mod protocol;
