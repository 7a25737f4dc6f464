//! Deterministic key-to-server routing.

/// Maps a key to an index into the caller's server list. The only contract
/// is total determinism: the same key, server count, and server set must
/// always yield the same index — callers may swap implementations freely.
pub trait ServerSelector: Send + Sync {
    fn select(&self, key: &[u8], server_count: usize) -> usize;
}

/// Default router: `crc32(key) mod server_count`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Crc32Router;

impl ServerSelector for Crc32Router {
    fn select(&self, key: &[u8], server_count: usize) -> usize {
        assert!(server_count > 0, "cannot route with zero servers");
        (crc32fast::hash(key) as usize) % server_count
    }
}

struct Point {
    value: u32,
    server_index: usize,
}

const POINTS_PER_SERVER: usize = 160;

/// Consistent-hash router with virtual nodes: adding or removing a server
/// remaps only ~1/N of keys rather than rehashing the whole keyspace.
///
/// A continuum of `POINTS_PER_SERVER` blake3-derived points per server,
/// searched by nearest point-at-or-after the key's CRC32 hash. Built fresh
/// from a server *count* rather than owning the servers themselves, since
/// this crate's routing layer is separate from connection ownership
/// (`client::Client` holds the pools; this only picks an index).
pub struct RingRouter {
    continuum: Vec<Point>,
}

impl RingRouter {
    /// `names` should be stable identifiers for each server (addresses are
    /// fine) in the same order as the caller's server list, so the returned
    /// indices line up.
    pub fn new(names: &[String]) -> Self {
        let mut continuum = Vec::with_capacity(names.len() * POINTS_PER_SERVER);
        for (server_index, name) in names.iter().enumerate() {
            for point_idx in 0..POINTS_PER_SERVER {
                let hash = blake3::hash(format!("{name}:{point_idx}").as_bytes()).to_string();
                let value = u32::from_str_radix(&hash[0..7], 16).unwrap();
                continuum.push(Point { value, server_index });
            }
        }
        // Points must be ordered by value for nearest-point binary search
        // to mean anything.
        continuum.sort_by_key(|p| p.value);
        RingRouter { continuum }
    }
}

impl ServerSelector for RingRouter {
    fn select(&self, key: &[u8], server_count: usize) -> usize {
        assert!(server_count > 0, "cannot route with zero servers");
        if self.continuum.is_empty() {
            return 0;
        }
        let hash = crc32fast::hash(key);
        match self.continuum.binary_search_by(|p| p.value.cmp(&hash)) {
            Ok(index) => self.continuum[index].server_index,
            Err(index) if index == self.continuum.len() => self.continuum[0].server_index,
            Err(index) => self.continuum[index].server_index,
        }
    }
}
