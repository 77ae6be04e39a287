//! Record cache with mDNS time-to-live semantics
//!
//! Stores two kinds of entries under one case-folded owner-name key: records
//! learned from the network, which expire when their TTL runs out, and
//! locally published authoritative records, which never expire while
//! published and feed the query-answering path.
//!
//! Remote entries honor the RFC 6762 lifecycle rules: re-observing an
//! identical record refreshes the existing entry instead of duplicating it,
//! a ttl=0 "goodbye" schedules removal after a short grace delay rather
//! than removing instantly, and a record carrying the cache-flush bit
//! displaces older records of the same name and type that hold different
//! data.
//!
//! All operations take the current time as a parameter, so expiry is fully
//! deterministic under test.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use derive_more::{Display, Error};

use crate::mdns::protocol::{DnsRecord, RecordType};

/// Grace delay applied to goodbye removals, tolerating reordered datagrams
/// (RFC 6762 section 10.1).
pub const GOODBYE_GRACE_SECS: i64 = 1;

/// Records older than this are displaced when a cache-flush record with
/// different data arrives (RFC 6762 section 10.2).
const FLUSH_DISPLACE_SECS: i64 = 1;

#[derive(Debug, Display, Error)]
pub enum CacheError {
    #[display(fmt = "cache lock poisoned")]
    PoisonedLock,
}

type Result<T> = std::result::Result<T, CacheError>;

/// Where a cache entry came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordOrigin {
    /// Learned from a response received on the given interface.
    Remote { ifindex: u32 },
    /// Published by this daemon, optionally visible on one interface only.
    Local { scope: Option<u32> },
}

/// A resource record plus the provenance needed to expire and scope it.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub record: DnsRecord,
    pub origin: RecordOrigin,
    pub received_at: DateTime<Utc>,
    /// `None` for published records, which do not expire.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn is_local(&self) -> bool {
        matches!(self.origin, RecordOrigin::Local { .. })
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => now < expiry,
            None => true,
        }
    }

    fn clamp_expiry(&mut self, deadline: DateTime<Utc>) {
        match self.expires_at {
            Some(expiry) if expiry <= deadline => {}
            _ => self.expires_at = Some(deadline),
        }
    }
}

fn matches_qtype(record: &DnsRecord, qtype: RecordType) -> bool {
    qtype == RecordType::Any || record.rtype() == qtype
}

/// The record store. Not synchronized; see `SynchronizedCache`.
#[derive(Default)]
pub struct RecordCache {
    entries: BTreeMap<String, Vec<CacheEntry>>,
}

impl RecordCache {
    pub fn new() -> RecordCache {
        RecordCache {
            entries: BTreeMap::new(),
        }
    }

    /// Total number of entries, local and remote.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Absorb one record from a received response.
    ///
    /// ttl=0 is a goodbye: matching live entries are scheduled for removal
    /// after the grace delay. Otherwise an identical record from the same
    /// interface refreshes in place, and anything else becomes a new entry.
    pub fn ingest(&mut self, record: DnsRecord, ifindex: u32, now: DateTime<Utc>) {
        let key = record.name.to_lowercase();

        if record.ttl.0 == 0 {
            let deadline = now + Duration::seconds(GOODBYE_GRACE_SECS);
            if let Some(list) = self.entries.get_mut(&key) {
                for entry in list.iter_mut() {
                    if !entry.is_local()
                        && entry.is_live(now)
                        && entry.record.rdata == record.rdata
                    {
                        entry.clamp_expiry(deadline);
                    }
                }
            }
            return;
        }

        let list = self.entries.entry(key).or_insert_with(Vec::new);

        if record.cache_flush {
            let displace_before = now - Duration::seconds(FLUSH_DISPLACE_SECS);
            let deadline = now + Duration::seconds(FLUSH_DISPLACE_SECS);
            for entry in list.iter_mut() {
                if !entry.is_local()
                    && entry.is_live(now)
                    && entry.record.rtype() == record.rtype()
                    && entry.record.rdata != record.rdata
                    && entry.received_at < displace_before
                {
                    entry.clamp_expiry(deadline);
                }
            }
        }

        let expiry = now + Duration::seconds(i64::from(record.ttl.0));

        for entry in list.iter_mut() {
            if let RecordOrigin::Remote { ifindex: seen_on } = entry.origin {
                if seen_on == ifindex && entry.record.rdata == record.rdata {
                    entry.record = record;
                    entry.received_at = now;
                    entry.expires_at = Some(expiry);
                    return;
                }
            }
        }

        list.push(CacheEntry {
            record,
            origin: RecordOrigin::Remote { ifindex },
            received_at: now,
            expires_at: Some(expiry),
        });
    }

    /// Return the live records under (name, qtype), evicting any expired
    /// entries encountered along the way.
    pub fn lookup(&mut self, name: &str, qtype: RecordType, now: DateTime<Utc>) -> Vec<DnsRecord> {
        let key = name.to_lowercase();

        let mut result = Vec::new();
        let mut emptied = false;

        if let Some(list) = self.entries.get_mut(&key) {
            list.retain(|entry| entry.is_live(now));

            for entry in list.iter() {
                if matches_qtype(&entry.record, qtype) {
                    result.push(entry.record.clone());
                }
            }

            emptied = list.is_empty();
        }

        if emptied {
            self.entries.remove(&key);
        }

        result
    }

    /// The locally published records answering (name, qtype) on the given
    /// interface.
    pub fn authoritative(&self, name: &str, qtype: RecordType, ifindex: u32) -> Vec<DnsRecord> {
        let key = name.to_lowercase();

        let mut result = Vec::new();
        if let Some(list) = self.entries.get(&key) {
            for entry in list {
                if let RecordOrigin::Local { scope } = entry.origin {
                    let visible = scope.map_or(true, |s| s == ifindex);
                    if visible && matches_qtype(&entry.record, qtype) {
                        result.push(entry.record.clone());
                    }
                }
            }
        }

        result
    }

    /// Register one of this daemon's own records. Published records never
    /// expire and are exempt from goodbye and cache-flush handling.
    pub fn publish(&mut self, record: DnsRecord, scope: Option<u32>, now: DateTime<Utc>) {
        let key = record.name.to_lowercase();
        let list = self.entries.entry(key).or_insert_with(Vec::new);

        for entry in list.iter_mut() {
            if entry.is_local() && entry.record.rdata == record.rdata {
                entry.record = record;
                entry.origin = RecordOrigin::Local { scope };
                return;
            }
        }

        list.push(CacheEntry {
            record,
            origin: RecordOrigin::Local { scope },
            received_at: now,
            expires_at: None,
        });
    }

    /// Remove published records under (name, qtype). `Any` withdraws every
    /// published record for the name.
    pub fn withdraw(&mut self, name: &str, qtype: RecordType) {
        let key = name.to_lowercase();
        let mut emptied = false;

        if let Some(list) = self.entries.get_mut(&key) {
            list.retain(|entry| !(entry.is_local() && matches_qtype(&entry.record, qtype)));
            emptied = list.is_empty();
        }

        if emptied {
            self.entries.remove(&key);
        }
    }

    /// Drop every expired entry. Lookups already evict lazily; this bounds
    /// memory for names that are never queried again.
    pub fn sweep(&mut self, now: DateTime<Utc>) {
        let mut empty_keys = Vec::new();

        for (key, list) in self.entries.iter_mut() {
            list.retain(|entry| entry.is_live(now));
            if list.is_empty() {
                empty_keys.push(key.clone());
            }
        }

        for key in empty_keys {
            self.entries.remove(&key);
        }
    }
}

/// Thread-safe wrapper serializing all cache operations.
#[derive(Default)]
pub struct SynchronizedCache {
    pub cache: RwLock<RecordCache>,
}

impl SynchronizedCache {
    pub fn new() -> SynchronizedCache {
        SynchronizedCache {
            cache: RwLock::new(RecordCache::new()),
        }
    }

    pub fn ingest(&self, record: DnsRecord, ifindex: u32, now: DateTime<Utc>) -> Result<()> {
        let mut cache = self.cache.write().map_err(|_| CacheError::PoisonedLock)?;
        cache.ingest(record, ifindex, now);
        Ok(())
    }

    pub fn lookup(&self, name: &str, qtype: RecordType, now: DateTime<Utc>) -> Vec<DnsRecord> {
        let mut cache = match self.cache.write() {
            Ok(x) => x,
            Err(_) => return Vec::new(),
        };

        cache.lookup(name, qtype, now)
    }

    pub fn authoritative(&self, name: &str, qtype: RecordType, ifindex: u32) -> Vec<DnsRecord> {
        let cache = match self.cache.read() {
            Ok(x) => x,
            Err(_) => return Vec::new(),
        };

        cache.authoritative(name, qtype, ifindex)
    }

    pub fn publish(&self, record: DnsRecord, scope: Option<u32>, now: DateTime<Utc>) -> Result<()> {
        let mut cache = self.cache.write().map_err(|_| CacheError::PoisonedLock)?;
        cache.publish(record, scope, now);
        Ok(())
    }

    pub fn withdraw(&self, name: &str, qtype: RecordType) -> Result<()> {
        let mut cache = self.cache.write().map_err(|_| CacheError::PoisonedLock)?;
        cache.withdraw(name, qtype);
        Ok(())
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> Result<()> {
        let mut cache = self.cache.write().map_err(|_| CacheError::PoisonedLock)?;
        cache.sweep(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use chrono::TimeZone;

    use crate::mdns::protocol::{DnsRecord, RData};

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000, 0).unwrap()
    }

    fn a_record(name: &str, addr: &str, ttl: u32) -> DnsRecord {
        DnsRecord::new(
            name,
            ttl,
            RData::A {
                addr: addr.parse().unwrap(),
            },
        )
    }

    #[test]
    fn test_ttl_expiry() {
        let mut cache = RecordCache::new();
        cache.ingest(a_record("host.local", "192.168.1.9", 120), 2, t0());

        assert_eq!(1, cache.lookup("host.local", RecordType::A, t0()).len());
        assert_eq!(
            1,
            cache
                .lookup("host.local", RecordType::A, t0() + Duration::seconds(119))
                .len()
        );
        assert!(cache
            .lookup("host.local", RecordType::A, t0() + Duration::seconds(120))
            .is_empty());

        // lazy eviction dropped the emptied key
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reingestion_refreshes_in_place() {
        let mut cache = RecordCache::new();
        cache.ingest(a_record("host.local", "192.168.1.9", 120), 2, t0());
        cache.ingest(
            a_record("host.local", "192.168.1.9", 120),
            2,
            t0() + Duration::seconds(100),
        );

        assert_eq!(1, cache.len());

        // alive past the original expiry thanks to the refresh
        assert_eq!(
            1,
            cache
                .lookup("host.local", RecordType::A, t0() + Duration::seconds(200))
                .len()
        );
    }

    #[test]
    fn test_same_record_from_two_interfaces() {
        let mut cache = RecordCache::new();
        cache.ingest(a_record("host.local", "192.168.1.9", 120), 2, t0());
        cache.ingest(a_record("host.local", "192.168.1.9", 120), 3, t0());

        assert_eq!(2, cache.len());
    }

    #[test]
    fn test_goodbye_grace() {
        let mut cache = RecordCache::new();
        cache.ingest(a_record("host.local", "192.168.1.9", 4500), 2, t0());

        let t1 = t0() + Duration::seconds(10);
        cache.ingest(a_record("host.local", "192.168.1.9", 0), 2, t1);

        // still visible inside the grace window
        assert_eq!(1, cache.lookup("host.local", RecordType::A, t1).len());

        // gone once the grace delay has elapsed, long before the original ttl
        assert!(cache
            .lookup("host.local", RecordType::A, t1 + Duration::seconds(2))
            .is_empty());
    }

    #[test]
    fn test_goodbye_for_unknown_record_is_noop() {
        let mut cache = RecordCache::new();
        cache.ingest(a_record("host.local", "192.168.1.9", 0), 2, t0());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_flush_displaces_stale_data() {
        let mut cache = RecordCache::new();
        cache.ingest(a_record("host.local", "192.168.1.9", 4500), 2, t0());

        let mut replacement = a_record("host.local", "192.168.1.10", 4500);
        replacement.cache_flush = true;
        let t1 = t0() + Duration::seconds(30);
        cache.ingest(replacement, 2, t1);

        // the old address survives only the displacement window
        let live = cache.lookup("host.local", RecordType::A, t1 + Duration::seconds(2));
        assert_eq!(1, live.len());
        assert_eq!(
            RData::A {
                addr: "192.168.1.10".parse().unwrap()
            },
            live[0].rdata
        );
    }

    #[test]
    fn test_published_records_do_not_expire() {
        let mut cache = RecordCache::new();
        cache.publish(a_record("unit.local", "192.168.1.5", 120), None, t0());

        let far_future = t0() + Duration::seconds(1_000_000);
        assert_eq!(
            1,
            cache.lookup("unit.local", RecordType::A, far_future).len()
        );

        // goodbyes from the network cannot withdraw published records
        cache.ingest(a_record("unit.local", "192.168.1.5", 0), 2, t0());
        assert_eq!(
            1,
            cache.authoritative("unit.local", RecordType::A, 2).len()
        );

        cache.withdraw("unit.local", RecordType::A);
        assert!(cache.authoritative("unit.local", RecordType::A, 2).is_empty());
    }

    #[test]
    fn test_authoritative_interface_scope() {
        let mut cache = RecordCache::new();
        cache.publish(a_record("unit.local", "192.168.1.5", 120), Some(2), t0());
        cache.publish(a_record("unit.local", "10.0.0.5", 120), Some(3), t0());

        let on_if2 = cache.authoritative("unit.local", RecordType::A, 2);
        assert_eq!(1, on_if2.len());
        assert_eq!(
            RData::A {
                addr: "192.168.1.5".parse().unwrap()
            },
            on_if2[0].rdata
        );
    }

    #[test]
    fn test_any_query_matches_all_types() {
        let mut cache = RecordCache::new();
        cache.ingest(a_record("host.local", "192.168.1.9", 120), 2, t0());
        cache.ingest(
            DnsRecord::new(
                "host.local",
                120,
                RData::Txt {
                    data: b"\x04path".to_vec(),
                },
            ),
            2,
            t0(),
        );

        assert_eq!(2, cache.lookup("host.local", RecordType::Any, t0()).len());
    }

    #[test]
    fn test_sweep_bounds_memory() {
        let mut cache = RecordCache::new();
        cache.ingest(a_record("a.local", "192.168.1.1", 10), 2, t0());
        cache.ingest(a_record("b.local", "192.168.1.2", 10_000), 2, t0());

        cache.sweep(t0() + Duration::seconds(60));

        assert_eq!(1, cache.len());
        assert!(cache
            .lookup("a.local", RecordType::A, t0() + Duration::seconds(60))
            .is_empty());
    }

    #[test]
    fn test_case_insensitive_keying() {
        let mut cache = RecordCache::new();
        cache.publish(a_record("Unit.Local", "192.168.1.5", 120), None, t0());

        assert_eq!(
            1,
            cache.authoritative("UNIT.LOCAL", RecordType::A, 2).len()
        );
    }
}
