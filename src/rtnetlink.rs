//! rtnetlink subscriber for PvD/RDNSS/DNSSL change events.
//!
//! Grounded on `HandleRtNetlink` in
//! `examples/original_source/src/pvdd.c` and the message layouts in
//! `examples/original_source/include/linux/pvd-user.h` (`struct pvdmsg`,
//! `struct rdnssmsg`, `struct dnsslmsg`). These are custom message types
//! carried over the `RTNLGRP_PVD` multicast group added by the PvD kernel
//! patch -- they have no counterpart in `netlink-packet-route`'s standard
//! message catalogue, so this module speaks raw `nlmsghdr` framing over a
//! [`netlink_sys`] socket rather than pulling in a typed packet crate for
//! messages it doesn't know about.

use std::net::Ipv6Addr;

use netlink_sys::{protocols::NETLINK_ROUTE, AsyncSocket, AsyncSocketExt, SocketAddr, TokioSocket};
use tracing::warn;

/// Experimental multicast group carrying PvD change notifications. Not a
/// registered `RTNLGRP_*` constant upstream; the value mirrors the bit
/// position the PvD kernel patch added immediately after the last upstream
/// group at the time pvdd was written.
const RTNLGRP_PVD: u32 = 1 << 28;

const NLMSG_HEADER_LEN: usize = 16;

/// Message types carried on the PvD group, matching the `pvd_state`/
/// `rdnss_state`/`dnssl_state` discriminants in the kernel header.
const RTM_PVDSTATUS: u16 = 200;
const RTM_RDNSS: u16 = 201;
const RTM_DNSSL: u16 = 202;

const PVD_NAME_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PvdState {
    New,
    Update,
    Del,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsEntryState {
    New,
    Del,
}

#[derive(Debug, Clone)]
pub enum RtNetlinkEvent {
    PvdStatus { name: String, state: PvdState },
    Rdnss { name: String, addr: Ipv6Addr, state: DnsEntryState },
    Dnssl { name: String, suffix: String, state: DnsEntryState },
}

pub struct RtNetlinkSocket {
    socket: TokioSocket,
}

impl RtNetlinkSocket {
    /// Opens a netlink socket and joins the PvD multicast group.
    pub fn open() -> std::io::Result<Self> {
        let mut socket = TokioSocket::new(NETLINK_ROUTE)?;
        socket.socket_mut().bind(&SocketAddr::new(0, RTNLGRP_PVD))?;
        Ok(RtNetlinkSocket { socket })
    }

    /// Reads and decodes the next batch of rtnetlink messages.
    pub async fn recv(&mut self) -> std::io::Result<Vec<RtNetlinkEvent>> {
        let (buf, _addr) = self.socket.recv_from_full().await?;
        Ok(decode_messages(&buf))
    }
}

fn read_name(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn decode_messages(buf: &[u8]) -> Vec<RtNetlinkEvent> {
    let mut events = Vec::new();
    let mut offset = 0usize;
    while offset + NLMSG_HEADER_LEN <= buf.len() {
        let header = &buf[offset..offset + NLMSG_HEADER_LEN];
        let msg_len = u32::from_ne_bytes(header[0..4].try_into().unwrap()) as usize;
        let msg_type = u16::from_ne_bytes(header[4..6].try_into().unwrap());
        if msg_len < NLMSG_HEADER_LEN || offset + msg_len > buf.len() {
            warn!("truncated or malformed rtnetlink message, stopping decode");
            break;
        }
        let payload = &buf[offset + NLMSG_HEADER_LEN..offset + msg_len];
        match msg_type {
            RTM_PVDSTATUS if payload.len() >= PVD_NAME_SIZE + 4 => {
                let name = read_name(&payload[..PVD_NAME_SIZE]);
                let state = match i32::from_ne_bytes(
                    payload[PVD_NAME_SIZE..PVD_NAME_SIZE + 4].try_into().unwrap(),
                ) {
                    0 => PvdState::New,
                    1 => PvdState::Update,
                    _ => PvdState::Del,
                };
                events.push(RtNetlinkEvent::PvdStatus { name, state });
            }
            RTM_RDNSS if payload.len() >= PVD_NAME_SIZE + 16 + 4 => {
                let name = read_name(&payload[..PVD_NAME_SIZE]);
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&payload[PVD_NAME_SIZE..PVD_NAME_SIZE + 16]);
                let state = match i32::from_ne_bytes(
                    payload[PVD_NAME_SIZE + 16..PVD_NAME_SIZE + 20]
                        .try_into()
                        .unwrap(),
                ) {
                    0 => DnsEntryState::New,
                    _ => DnsEntryState::Del,
                };
                events.push(RtNetlinkEvent::Rdnss {
                    name,
                    addr: Ipv6Addr::from(octets),
                    state,
                });
            }
            RTM_DNSSL if payload.len() >= PVD_NAME_SIZE + 256 + 4 => {
                let name = read_name(&payload[..PVD_NAME_SIZE]);
                let suffix = read_name(&payload[PVD_NAME_SIZE..PVD_NAME_SIZE + 256]);
                let state = match i32::from_ne_bytes(
                    payload[PVD_NAME_SIZE + 256..PVD_NAME_SIZE + 260]
                        .try_into()
                        .unwrap(),
                ) {
                    0 => DnsEntryState::New,
                    _ => DnsEntryState::Del,
                };
                events.push(RtNetlinkEvent::Dnssl {
                    name,
                    suffix,
                    state,
                });
            }
            other => {
                warn!("ignoring unrecognized or malformed rtnetlink message type {other}");
            }
        }
        offset += msg_len;
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nlmsg(msg_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let total_len = (NLMSG_HEADER_LEN + payload.len()) as u32;
        out.extend_from_slice(&total_len.to_ne_bytes());
        out.extend_from_slice(&msg_type.to_ne_bytes());
        out.extend_from_slice(&0u16.to_ne_bytes());
        out.extend_from_slice(&0u32.to_ne_bytes());
        out.extend_from_slice(&0u32.to_ne_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn decodes_pvd_del_event() {
        let mut payload = vec![0u8; PVD_NAME_SIZE + 4];
        payload[..12].copy_from_slice(b"test.example");
        payload[PVD_NAME_SIZE..].copy_from_slice(&2i32.to_ne_bytes());
        let msg = nlmsg(RTM_PVDSTATUS, &payload);
        let events = decode_messages(&msg);
        assert_eq!(events.len(), 1);
        match &events[0] {
            RtNetlinkEvent::PvdStatus { name, state } => {
                assert_eq!(name, "test.example");
                assert_eq!(*state, PvdState::Del);
            }
            _ => panic!("wrong event type"),
        }
    }
}
