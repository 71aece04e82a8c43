//! Flow steering: which pipe an incoming packet lands on.
//!
//! Traffic matching an installed [`FlowRule`] goes to the rule's pipe. Everything else is spread
//! over the live pipes with an RSS-style hash, which must be deterministic so that a flow keeps
//! hitting the same pipe as long as the set of pipes does not change.

use crate::utils::{FlowKey, IPPROTO_TCP, IPPROTO_UDP};
use color_eyre::eyre::{bail, Result};
use std::hash::{BuildHasher, Hasher};
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Number of leading packet bytes hashed when there is no IPv4 5-tuple to hash.
pub const RSS_WINDOW: usize = 64;

// Fixed so that every process (and every test run) steers identically.
const RSS_SEEDS: [u64; 4] = [
    0x6d5a_56da_255b_0ec2,
    0x4167_253d_43a3_8fb0,
    0xd0ca_2bcb_ae7b_30b4,
    0x77cb_2da3_8030_f20c,
];

/// Which hash spreads unmatched traffic across pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RssHash {
    /// Sum of the IPv4 5-tuple fields, the way the reference NIC computes it.
    Sum,
    /// Seeded ahash over the packet header.
    AHash,
}

impl Default for RssHash {
    fn default() -> Self {
        if cfg!(feature = "hw_rss") {
            RssHash::Sum
        } else {
            RssHash::AHash
        }
    }
}

impl FromStr for RssHash {
    type Err = color_eyre::eyre::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sum" => Ok(RssHash::Sum),
            "ahash" => Ok(RssHash::AHash),
            _ => bail!("Unknown rss hash {:?}, want \"sum\" or \"ahash\"", s),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RssHasher {
    kind: RssHash,
    state: ahash::RandomState,
}

impl RssHasher {
    pub fn new(kind: RssHash) -> Self {
        let [k0, k1, k2, k3] = RSS_SEEDS;
        Self {
            kind,
            state: ahash::RandomState::with_seeds(k0, k1, k2, k3),
        }
    }

    pub fn kind(&self) -> RssHash {
        self.kind
    }

    fn window(pkt: &[u8]) -> &[u8] {
        &pkt[..pkt.len().min(RSS_WINDOW)]
    }

    pub fn hash(&self, pkt: &[u8]) -> u64 {
        match self.kind {
            RssHash::Sum => match FlowKey::parse(pkt) {
                Some(key) => {
                    u32::from(key.src_ip)
                        .wrapping_add(u32::from(key.dst_ip))
                        .wrapping_add(key.src_port as u32)
                        .wrapping_add(key.dst_port as u32)
                        .wrapping_add(key.protocol as u32) as u64
                }
                None => Self::window(pkt).iter().map(|b| *b as u64).sum(),
            },
            RssHash::AHash => {
                let mut h = self.state.build_hasher();
                h.write(Self::window(pkt));
                h.finish()
            }
        }
    }

    /// Index of the pipe among `nb_pipes` live pipes that `pkt` belongs to.
    ///
    /// `None` if there are no pipes.
    pub fn select(&self, pkt: &[u8], nb_pipes: usize) -> Option<usize> {
        if nb_pipes == 0 {
            return None;
        }
        Some((self.hash(pkt) % nb_pipes as u64) as usize)
    }
}

impl Default for RssHasher {
    fn default() -> Self {
        Self::new(RssHash::default())
    }
}

/// A match rule binding traffic to a pipe. Zero fields are wildcards.
#[derive(Debug, PartialEq, Clone, Copy, Eq, Hash)]
pub struct FlowRule {
    pub dst_port: u16,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub src_ip: Ipv4Addr,
    pub protocol: u8,
}

impl Default for FlowRule {
    /// Matches everything.
    fn default() -> Self {
        Self::new(0, Ipv4Addr::UNSPECIFIED, 0)
    }
}

impl FlowRule {
    /// Match on destination address and protocol only.
    pub fn new(dst_port: u16, dst_ip: Ipv4Addr, protocol: u8) -> Self {
        Self {
            dst_port,
            src_port: 0,
            dst_ip,
            src_ip: Ipv4Addr::UNSPECIFIED,
            protocol,
        }
    }

    pub fn udp(dst_port: u16, dst_ip: Ipv4Addr) -> Self {
        Self::new(dst_port, dst_ip, IPPROTO_UDP)
    }

    pub fn tcp(dst_port: u16, dst_ip: Ipv4Addr) -> Self {
        Self::new(dst_port, dst_ip, IPPROTO_TCP)
    }

    pub fn with_src(mut self, src_port: u16, src_ip: Ipv4Addr) -> Self {
        self.src_port = src_port;
        self.src_ip = src_ip;
        self
    }

    pub fn matches(&self, key: &FlowKey) -> bool {
        fn field<T: PartialEq + Default>(rule: T, pkt: T) -> bool {
            rule == T::default() || rule == pkt
        }

        field(self.dst_port, key.dst_port)
            && field(self.src_port, key.src_port)
            && field(u32::from(self.dst_ip), u32::from(key.dst_ip))
            && field(u32::from(self.src_ip), u32::from(key.src_ip))
            && field(self.protocol, key.protocol)
    }
}
