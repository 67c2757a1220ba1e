#![allow(dead_code)]

use std::net::Ipv4Addr;

use arpsentry::core::parser::build_arp_frame;
use arpsentry::{ArpOp, MacAddr};

pub const AA: MacAddr = MacAddr([0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa]);
pub const BB: MacAddr = MacAddr([0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb]);
pub const GATEWAY_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

pub fn ip5() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 5)
}

/// Reply from `mac` claiming `ip`, addressed to the gateway
pub fn reply(ip: Ipv4Addr, mac: MacAddr) -> Vec<u8> {
    build_arp_frame(ArpOp::Reply, mac, ip, GATEWAY_MAC, Ipv4Addr::new(10, 0, 0, 1))
}

pub fn request(ip: Ipv4Addr, mac: MacAddr, target: Ipv4Addr) -> Vec<u8> {
    build_arp_frame(ArpOp::Request, mac, ip, MacAddr::ZERO, target)
}

/// Unicast MAC with a distinct last two octets
pub fn host_mac(n: u16) -> MacAddr {
    let [hi, lo] = n.to_be_bytes();
    MacAddr([0x02, 0x00, 0x00, 0x00, hi, lo])
}

pub fn host_ip(n: u16) -> Ipv4Addr {
    let [hi, lo] = n.to_be_bytes();
    Ipv4Addr::new(10, 1, hi, lo)
}
