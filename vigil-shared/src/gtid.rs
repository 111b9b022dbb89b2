//! Replication progress values: GTID sets and positional binlog coordinates.
//!
//! GTIDs follow the MariaDB `domain-server-sequence` form. A set keeps the
//! highest observed sequence per replication domain, which is all the
//! election and rejoin paths need to compare progress or spot errant
//! transactions.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::exception::{VigilError, VigilResult};

/// A single global transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gtid {
    pub domain: u32,
    pub server_id: u64,
    pub seqno: u64,
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain, self.server_id, self.seqno)
    }
}

impl FromStr for Gtid {
    type Err = VigilError;

    fn from_str(s: &str) -> VigilResult<Self> {
        let mut parts = s.trim().splitn(3, '-');
        let domain = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| VigilError::internal(format!("bad gtid domain in {s:?}")))?;
        let server_id = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| VigilError::internal(format!("bad gtid server id in {s:?}")))?;
        let seqno = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| VigilError::internal(format!("bad gtid seqno in {s:?}")))?;
        Ok(Self {
            domain,
            server_id,
            seqno,
        })
    }
}

/// Highest observed GTID per replication domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    domains: BTreeMap<u32, Gtid>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma-separated GTID list, e.g. `"0-101-500,1-101-22"`.
    pub fn parse(s: &str) -> VigilResult<Self> {
        let mut set = Self::new();
        for part in s.split(',').filter(|p| !p.trim().is_empty()) {
            set.add(part.parse()?);
        }
        Ok(set)
    }

    /// Record a GTID, keeping only the highest sequence per domain.
    pub fn add(&mut self, gtid: Gtid) {
        let entry = self.domains.entry(gtid.domain).or_insert(gtid);
        if gtid.seqno >= entry.seqno {
            *entry = gtid;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gtid> {
        self.domains.values()
    }

    /// True when every domain of `other` is present here at an equal or
    /// higher sequence. An empty `other` is contained by anything.
    pub fn contains(&self, other: &GtidSet) -> bool {
        other.domains.iter().all(|(domain, gtid)| {
            self.domains
                .get(domain)
                .map(|own| own.seqno >= gtid.seqno)
                .unwrap_or(false)
        })
    }

    /// GTIDs present here but never applied on `upstream`: a domain the
    /// upstream does not know, or a sequence beyond the upstream's.
    pub fn errant_against(&self, upstream: &GtidSet) -> Vec<Gtid> {
        self.domains
            .values()
            .filter(|gtid| {
                upstream
                    .domains
                    .get(&gtid.domain)
                    .map(|up| gtid.seqno > up.seqno)
                    .unwrap_or(true)
            })
            .copied()
            .collect()
    }

    /// Scalar progress measure used for candidate ranking. Per-domain
    /// sequences are summed; ties fall through to lag and server-id.
    pub fn weight(&self) -> u64 {
        self.domains.values().map(|g| g.seqno).sum()
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.domains.values().map(|g| g.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Binlog file + offset coordinates, for topologies without GTID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogPos {
    pub file: String,
    pub pos: u64,
}

impl BinlogPos {
    pub fn new(file: impl Into<String>, pos: u64) -> Self {
        Self {
            file: file.into(),
            pos,
        }
    }

    /// Numeric suffix of the binlog file name (`mysql-bin.000042` -> 42).
    fn file_index(&self) -> u64 {
        self.file
            .rsplit('.')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

impl PartialOrd for BinlogPos {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BinlogPos {
    fn cmp(&self, other: &Self) -> Ordering {
        self.file_index()
            .cmp(&other.file_index())
            .then(self.pos.cmp(&other.pos))
    }
}

impl fmt::Display for BinlogPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.pos)
    }
}

/// Replication coordinates handed to `set_replication_source`. GTID
/// auto-position is preferred whenever the candidate advertises a set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationCoord {
    GtidAutoPosition(GtidSet),
    Positional(BinlogPos),
}
