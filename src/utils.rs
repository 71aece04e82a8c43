use byteorder::{ByteOrder, NetworkEndian};
use color_eyre::eyre::{bail, ensure, Result};
use macaddr::MacAddr6;
use std::net::Ipv4Addr;

/// Alignment unit of packets inside a pipe buffer, in bytes.
pub const FLIT_SIZE: usize = 64;
/// Largest packet the NIC will place in a pipe, in flits.
pub const MAX_PKT_FLITS: usize = 24;
pub const MAX_PKT_SIZE: usize = MAX_PKT_FLITS * FLIT_SIZE;

pub const ETHERNET2_HEADER2_SIZE: usize = 14;
pub const IPV4_HEADER2_SIZE: usize = 20;
pub const IPV6_HEADER_SIZE: usize = 40;
pub const UDP_HEADER2_SIZE: usize = 8;
pub const DEFAULT_IPV4_TTL: u8 = 64;
pub const IPV4_IHL_NO_OPTIONS: u8 = 5;
pub const IPV4_VERSION: u8 = 4;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const TOTAL_HEADER_SIZE: usize = ETHERNET2_HEADER2_SIZE + IPV4_HEADER2_SIZE + UDP_HEADER2_SIZE;

#[repr(u16)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EtherType2 {
    Arp = 0x0806,
    Ipv4 = 0x0800,
    Ipv6 = 0x86DD,
}

impl TryFrom<u16> for EtherType2 {
    type Error = color_eyre::eyre::Error;

    fn try_from(n: u16) -> Result<Self> {
        if n == EtherType2::Arp as u16 {
            Ok(EtherType2::Arp)
        } else if n == EtherType2::Ipv4 as u16 {
            Ok(EtherType2::Ipv4)
        } else if n == EtherType2::Ipv6 as u16 {
            Ok(EtherType2::Ipv6)
        } else {
            bail!("Unsupported ether type: {}", n);
        }
    }
}

/// Rounds `len` up to a whole number of flits.
#[inline]
pub const fn flit_align(len: usize) -> usize {
    (len + FLIT_SIZE - 1) / FLIT_SIZE * FLIT_SIZE
}

/// Recovers a packet's length from its own headers.
///
/// This is the framing contract with the NIC: the length is never stored
/// out-of-band, so the consumer reads it from the L3 header. Returns `None`
/// if the bytes do not start with a recognizable IPv4/IPv6 Ethernet frame.
#[inline]
pub fn get_pkt_len(pkt: &[u8]) -> Option<usize> {
    if pkt.len() < ETHERNET2_HEADER2_SIZE {
        return None;
    }

    let ether_type = NetworkEndian::read_u16(&pkt[12..14]);
    let len = match EtherType2::try_from(ether_type).ok()? {
        EtherType2::Ipv4 => {
            let l3 = pkt.get(ETHERNET2_HEADER2_SIZE..ETHERNET2_HEADER2_SIZE + 4)?;
            ETHERNET2_HEADER2_SIZE + NetworkEndian::read_u16(&l3[2..4]) as usize
        }
        EtherType2::Ipv6 => {
            let l3 = pkt.get(ETHERNET2_HEADER2_SIZE..ETHERNET2_HEADER2_SIZE + 6)?;
            ETHERNET2_HEADER2_SIZE + IPV6_HEADER_SIZE + NetworkEndian::read_u16(&l3[4..6]) as usize
        }
        EtherType2::Arp => return None,
    };

    // an IP header that claims a length shorter than itself is garbage.
    if len <= ETHERNET2_HEADER2_SIZE {
        return None;
    }

    Some(len)
}

/// The IPv4 5-tuple of a packet, used for rule matching and RSS.
#[derive(Debug, PartialEq, Clone, Copy, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl FlowKey {
    /// Parses the 5-tuple from an Ethernet/IPv4 frame.
    ///
    /// Ports are only read for TCP and UDP; they are 0 otherwise.
    pub fn parse(pkt: &[u8]) -> Option<Self> {
        if pkt.len() < ETHERNET2_HEADER2_SIZE + IPV4_HEADER2_SIZE {
            return None;
        }
        if NetworkEndian::read_u16(&pkt[12..14]) != EtherType2::Ipv4 as u16 {
            return None;
        }

        let l3 = &pkt[ETHERNET2_HEADER2_SIZE..];
        let ihl = ((l3[0] & 0x0f) as usize) * 4;
        let protocol = l3[9];
        let src_ip = Ipv4Addr::new(l3[12], l3[13], l3[14], l3[15]);
        let dst_ip = Ipv4Addr::new(l3[16], l3[17], l3[18], l3[19]);

        let (src_port, dst_port) = match protocol {
            IPPROTO_TCP | IPPROTO_UDP => match l3.get(ihl..ihl + 4) {
                Some(l4) => (
                    NetworkEndian::read_u16(&l4[0..2]),
                    NetworkEndian::read_u16(&l4[2..4]),
                ),
                None => (0, 0),
            },
            _ => (0, 0),
        };

        Some(FlowKey {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol,
        })
    }
}

#[derive(Debug, PartialEq, Clone, Copy, Eq, Hash)]
pub struct AddressInfo {
    pub udp_port: u16,
    pub ipv4_addr: Ipv4Addr,
    pub ether_addr: MacAddr6,
}

impl Default for AddressInfo {
    fn default() -> AddressInfo {
        AddressInfo {
            udp_port: 12345,
            ipv4_addr: Ipv4Addr::LOCALHOST,
            ether_addr: MacAddr6::nil(),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Default, Copy)]
pub struct HeaderInfo {
    pub src_info: AddressInfo,
    pub dst_info: AddressInfo,
}

#[inline]
pub fn write_udp_hdr(header_info: &HeaderInfo, buf: &mut [u8], data_len: usize) -> Result<()> {
    let fixed_buf: &mut [u8; UDP_HEADER2_SIZE] = (&mut buf[..UDP_HEADER2_SIZE]).try_into()?;
    NetworkEndian::write_u16(&mut fixed_buf[0..2], header_info.src_info.udp_port);
    NetworkEndian::write_u16(&mut fixed_buf[2..4], header_info.dst_info.udp_port);
    NetworkEndian::write_u16(&mut fixed_buf[4..6], (UDP_HEADER2_SIZE + data_len) as u16);
    // no checksum
    NetworkEndian::write_u16(&mut fixed_buf[6..8], 0);
    Ok(())
}

#[inline]
fn ipv4_checksum(buf: &[u8]) -> Result<u16> {
    let buf: &[u8; IPV4_HEADER2_SIZE] = buf.try_into()?;
    let mut state = 0xffffu32;
    for i in 0..5 {
        state += NetworkEndian::read_u16(&buf[(2 * i)..(2 * i + 2)]) as u32;
    }
    // Skip the 5th u16 since octets 10-12 are the header checksum, whose value should be zero when
    // computing a checksum.
    for i in 6..10 {
        state += NetworkEndian::read_u16(&buf[(2 * i)..(2 * i + 2)]) as u32;
    }
    while state > 0xffff {
        state -= 0xffff;
    }
    Ok(!state as u16)
}

#[inline]
pub fn write_ipv4_hdr(
    header_info: &HeaderInfo,
    buf: &mut [u8],
    data_len: usize,
    ip_id: u16,
) -> Result<()> {
    let buf: &mut [u8; IPV4_HEADER2_SIZE] = buf.try_into()?;
    buf[..].copy_from_slice(&[0u8; IPV4_HEADER2_SIZE]);

    buf[0] = (IPV4_VERSION << 4) | IPV4_IHL_NO_OPTIONS; // version IHL
    NetworkEndian::write_u16(&mut buf[2..4], (IPV4_HEADER2_SIZE + data_len) as u16); // total length
    NetworkEndian::write_u16(&mut buf[4..6], ip_id); // IP ID
    buf[8] = DEFAULT_IPV4_TTL; // time to live
    buf[9] = IPPROTO_UDP; // next_proto_id

    buf[12..16].copy_from_slice(&header_info.src_info.ipv4_addr.octets());
    buf[16..20].copy_from_slice(&header_info.dst_info.ipv4_addr.octets());

    let checksum = ipv4_checksum(buf)?;
    NetworkEndian::write_u16(&mut buf[10..12], checksum);
    Ok(())
}

#[inline]
pub fn write_eth_hdr(header_info: &HeaderInfo, buf: &mut [u8]) -> Result<()> {
    let buf: &mut [u8; ETHERNET2_HEADER2_SIZE] = buf.try_into()?;
    buf[0..6].copy_from_slice(header_info.dst_info.ether_addr.as_bytes());
    buf[6..12].copy_from_slice(header_info.src_info.ether_addr.as_bytes());
    NetworkEndian::write_u16(&mut buf[12..14], EtherType2::Ipv4 as u16);
    Ok(())
}

/// Builds a complete Ethernet/IPv4/UDP frame around `payload`.
pub fn build_udp_packet(header_info: &HeaderInfo, payload: &[u8], ip_id: u16) -> Result<Vec<u8>> {
    let len = TOTAL_HEADER_SIZE + payload.len();
    ensure!(
        len <= MAX_PKT_SIZE,
        "UDP payload of {} bytes does not fit in a {} byte packet",
        payload.len(),
        MAX_PKT_SIZE
    );

    let mut pkt = vec![0u8; len];
    write_eth_hdr(header_info, &mut pkt[..ETHERNET2_HEADER2_SIZE])?;
    write_ipv4_hdr(
        header_info,
        &mut pkt[ETHERNET2_HEADER2_SIZE..ETHERNET2_HEADER2_SIZE + IPV4_HEADER2_SIZE],
        UDP_HEADER2_SIZE + payload.len(),
        ip_id,
    )?;
    write_udp_hdr(
        header_info,
        &mut pkt[ETHERNET2_HEADER2_SIZE + IPV4_HEADER2_SIZE..TOTAL_HEADER_SIZE],
        payload.len(),
    )?;
    pkt[TOTAL_HEADER_SIZE..].copy_from_slice(payload);
    Ok(pkt)
}
