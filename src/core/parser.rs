//! Frame decoder
//!
//! Parses Ethernet II frames carrying ARP for IPv4. Pure function of the
//! input bytes; non-ARP traffic is reported as `Unsupported` and never
//! classified.

use std::net::Ipv4Addr;

use etherparse::{
    ArpHardwareId, ArpOperation, ArpPacketSlice, EtherType, Ethernet2Header, Ethernet2Slice,
    SingleVlanSlice,
};

use crate::core::event::{ArpEvent, ArpOp, MacAddr, RawFrame};
use crate::error::DecodeError;

const HLEN_ETHERNET: u8 = 6;
const PLEN_IPV4: u8 = 4;

/// Decode a captured frame into an ARP event
pub fn decode(frame: &RawFrame) -> Result<ArpEvent, DecodeError> {
    let payload = arp_payload(&frame.data)?;
    let arp = ArpPacketSlice::from_slice(payload)
        .map_err(|e| DecodeError::Malformed(format!("ARP: {}", e)))?;

    if arp.hw_addr_type() != ArpHardwareId::ETHERNET {
        return Err(DecodeError::Unsupported(format!(
            "hardware type {}",
            arp.hw_addr_type().0
        )));
    }
    if arp.proto_addr_type() != EtherType::IPV4 {
        return Err(DecodeError::Unsupported(format!(
            "protocol type 0x{:04x}",
            arp.proto_addr_type().0
        )));
    }
    if arp.hw_addr_size() != HLEN_ETHERNET || arp.proto_addr_size() != PLEN_IPV4 {
        return Err(DecodeError::Malformed(format!(
            "address lengths {}/{} do not match ethernet/ipv4",
            arp.hw_addr_size(),
            arp.proto_addr_size()
        )));
    }

    let operation = match arp.operation() {
        ArpOperation::REQUEST => ArpOp::Request,
        ArpOperation::REPLY => ArpOp::Reply,
        other => return Err(DecodeError::Unsupported(format!("ARP operation {}", other.0))),
    };

    Ok(ArpEvent {
        operation,
        sender_ip: ipv4(arp.sender_protocol_addr())?,
        sender_mac: mac(arp.sender_hw_addr())?,
        target_ip: ipv4(arp.target_protocol_addr())?,
        target_mac: mac(arp.target_hw_addr())?,
        received_at: frame.timestamp,
        interface: frame.interface.clone(),
    })
}

/// Strip the Ethernet header (and at most one VLAN tag) and return the ARP payload
fn arp_payload(data: &[u8]) -> Result<&[u8], DecodeError> {
    let eth = Ethernet2Slice::from_slice_without_fcs(data)
        .map_err(|e| DecodeError::Malformed(format!("ethernet: {}", e)))?;

    let (ether_type, payload) = match eth.ether_type() {
        EtherType::VLAN_TAGGED_FRAME | EtherType::PROVIDER_BRIDGING => {
            let vlan = SingleVlanSlice::from_slice(eth.payload_slice())
                .map_err(|e| DecodeError::Malformed(format!("VLAN tag: {}", e)))?;
            (vlan.ether_type(), vlan.payload_slice())
        }
        other => (other, eth.payload_slice()),
    };

    if ether_type != EtherType::ARP {
        return Err(DecodeError::Unsupported(format!(
            "ethertype 0x{:04x} is not ARP",
            ether_type.0
        )));
    }
    Ok(payload)
}

fn mac(bytes: &[u8]) -> Result<MacAddr, DecodeError> {
    <[u8; 6]>::try_from(bytes)
        .map(MacAddr)
        .map_err(|_| DecodeError::Malformed(format!("{}-byte hardware address", bytes.len())))
}

fn ipv4(bytes: &[u8]) -> Result<Ipv4Addr, DecodeError> {
    <[u8; 4]>::try_from(bytes)
        .map(Ipv4Addr::from)
        .map_err(|_| DecodeError::Malformed(format!("{}-byte protocol address", bytes.len())))
}

/// Build an Ethernet II ARP frame. Used by tests and the synthetic sources.
pub fn build_arp_frame(
    operation: ArpOp,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let (destination, oper) = match operation {
        ArpOp::Request => (MacAddr::BROADCAST, ArpOperation::REQUEST),
        ArpOp::Reply => (target_mac, ArpOperation::REPLY),
    };
    let eth = Ethernet2Header {
        source: sender_mac.0,
        destination: destination.0,
        ether_type: EtherType::ARP,
    };

    let mut frame = Vec::with_capacity(Ethernet2Header::LEN + 28);
    frame.extend_from_slice(&eth.to_bytes());

    // htype, ptype, hlen, plen, oper, then sender and target address pairs
    frame.extend_from_slice(&ArpHardwareId::ETHERNET.0.to_be_bytes());
    frame.extend_from_slice(&EtherType::IPV4.0.to_be_bytes());
    frame.push(HLEN_ETHERNET);
    frame.push(PLEN_IPV4);
    frame.extend_from_slice(&oper.0.to_be_bytes());
    frame.extend_from_slice(&sender_mac.0);
    frame.extend_from_slice(&sender_ip.octets());
    frame.extend_from_slice(&target_mac.0);
    frame.extend_from_slice(&target_ip.octets());
    frame
}
