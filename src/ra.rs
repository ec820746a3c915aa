//! ICMPv6 Router Advertisement option parser.
//!
//! Grounded on `process_ra` in
//! `examples/original_source/src/pvdid-netlink.c`. Option lengths in an RA
//! are counted in units of 8 octets including the 2-byte type/length header,
//! hence `optlen = opt_str[1] << 3` in the source; this port keeps that
//! arithmetic. Lowercase `rdnss`/`dnssl` attribute names follow the newer
//! `PVD_` dialect (`pvdd.c`) rather than this file's own uppercase
//! `RDNSS`/`DNSSL` names, to match spec.md and the wire dialect chosen in
//! SPEC_FULL.md section 6.

use std::net::Ipv6Addr;

use tracing::{debug, warn};

const ND_ROUTER_ADVERT: u8 = 134;
const ICMP6_HEADER_LEN: usize = 16;

const ND_OPT_SOURCE_LINKADDR: u8 = 1;
const ND_OPT_TARGET_LINKADDR: u8 = 2;
const ND_OPT_PREFIX_INFORMATION: u8 = 3;
const ND_OPT_REDIRECTED_HEADER: u8 = 4;
const ND_OPT_MTU: u8 = 5;
const ND_OPT_ROUTE_INFORMATION: u8 = 24;
const ND_OPT_RDNSS_INFORMATION: u8 = 25;
const ND_OPT_RTR_ADV_INTERVAL: u8 = 7;
const ND_OPT_HOME_AGENT_INFO: u8 = 8;
const ND_OPT_DNSSL_INFORMATION: u8 = 31;
/// Pending IANA attribution, per spec.md 4.4 and the original source.
const ND_OPT_PVDID: u8 = 253;

#[derive(Debug, Clone)]
pub struct PrefixInfo {
    pub prefix: Ipv6Addr,
    pub prefix_len: u8,
}

/// The fully decoded contents of one Router Advertisement relevant to PvD
/// registration.
#[derive(Debug, Clone)]
pub struct ParsedRa {
    pub pvd_name: String,
    pub sequence: u8,
    pub h_flag: bool,
    pub l_flag: bool,
    pub lifetime: u32,
    pub router_lifetime: u16,
    pub rdnss: Vec<Ipv6Addr>,
    pub dnssl: Vec<String>,
    pub prefixes: Vec<PrefixInfo>,
}

/// Parses a raw ICMPv6 datagram. Returns `Ok(None)` when the RA carries no
/// PvD-ID option (the RA is a "PvD orphan" and is dropped, per spec.md 4.4).
pub fn parse_ra(msg: &[u8]) -> Result<Option<ParsedRa>, String> {
    if msg.len() < ICMP6_HEADER_LEN {
        return Err(format!(
            "icmpv6 packet too short: {} bytes",
            msg.len()
        ));
    }
    if msg[0] != ND_ROUTER_ADVERT {
        return Err(format!("not a router advertisement (type {})", msg[0]));
    }
    let router_lifetime = u16::from_be_bytes([msg[6], msg[7]]);

    let mut opts = &msg[ICMP6_HEADER_LEN..];

    let mut pvd_name: Option<String> = None;
    let mut sequence = 0u8;
    let mut h_flag = false;
    let mut l_flag = false;
    let mut lifetime = 0u32;
    let mut rdnss = Vec::new();
    let mut dnssl = Vec::new();
    let mut prefixes = Vec::new();

    while !opts.is_empty() {
        if opts.len() < 2 {
            warn!("trailing garbage in RA");
            break;
        }
        let opt_type = opts[0];
        let opt_len = (opts[1] as usize) * 8;
        if opt_len == 0 {
            warn!("zero length option in RA");
            break;
        }
        if opt_len > opts.len() {
            warn!(
                "option length ({opt_len}) greater than remaining RA length ({})",
                opts.len()
            );
            break;
        }
        let body = &opts[..opt_len];

        match opt_type {
            ND_OPT_MTU => {
                debug!("ND_OPT_MTU present in RA");
            }
            ND_OPT_PREFIX_INFORMATION => {
                if body.len() < 32 {
                    return Err("truncated prefix information option".to_string());
                }
                let prefix_len = body[2];
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[16..32]);
                prefixes.push(PrefixInfo {
                    prefix: Ipv6Addr::from(octets),
                    prefix_len,
                });
            }
            ND_OPT_ROUTE_INFORMATION => {
                debug!("ND_OPT_ROUTE_INFORMATION present in RA");
            }
            ND_OPT_SOURCE_LINKADDR => {
                debug!("ND_OPT_SOURCE_LINKADDR present in RA");
            }
            ND_OPT_TARGET_LINKADDR | ND_OPT_REDIRECTED_HEADER => {
                warn!("invalid option {opt_type} in RA for this context");
            }
            ND_OPT_RTR_ADV_INTERVAL | ND_OPT_HOME_AGENT_INFO => {
                debug!("mobile IPv6 extension option {opt_type} present in RA");
            }
            ND_OPT_RDNSS_INFORMATION => {
                if body.len() < 8 {
                    return Err("truncated RDNSS information option".to_string());
                }
                let words = body[1] as usize;
                let addr_count = ((words.saturating_sub(1)) / 2).min(3);
                for i in 0..addr_count {
                    let start = 8 + i * 16;
                    if body.len() < start + 16 {
                        break;
                    }
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&body[start..start + 16]);
                    rdnss.push(Ipv6Addr::from(octets));
                }
            }
            ND_OPT_DNSSL_INFORMATION => {
                if body.len() < 8 {
                    return Err("truncated DNSSL information option".to_string());
                }
                let labels = &body[8..];
                let mut current = String::new();
                let mut offset = 0usize;
                while offset < labels.len() {
                    let label_len = labels[offset] as usize;
                    offset += 1;
                    if label_len == 0 {
                        if !current.is_empty() {
                            dnssl.push(std::mem::take(&mut current));
                        }
                        continue;
                    }
                    if offset + label_len > labels.len() {
                        warn!("oversized suffix in DNSSL option, aborting option");
                        break;
                    }
                    if !current.is_empty() {
                        current.push('.');
                    }
                    current.push_str(&String::from_utf8_lossy(&labels[offset..offset + label_len]));
                    offset += label_len;
                }
            }
            ND_OPT_PVDID => {
                if pvd_name.is_some() {
                    debug!("PvD-ID option already seen in this RA, ignoring subsequent one");
                } else if body.len() < 8 {
                    return Err("truncated PvD-ID option".to_string());
                } else {
                    sequence = body[2] & 0x0f;
                    h_flag = (body[2] & 0x10) != 0;
                    l_flag = (body[2] & 0x20) != 0;
                    lifetime = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
                    match decode_labels(&body[8..]) {
                        Some(name) if !name.is_empty() => pvd_name = Some(name),
                        _ => debug!("empty PvD-ID name, ignoring option"),
                    }
                }
            }
            other => {
                debug!("unknown RA option {other}, ignoring");
            }
        }

        opts = &opts[opt_len..];
    }

    let Some(pvd_name) = pvd_name else {
        return Ok(None);
    };

    Ok(Some(ParsedRa {
        pvd_name,
        sequence,
        h_flag,
        l_flag,
        lifetime,
        router_lifetime,
        rdnss,
        dnssl,
        prefixes,
    }))
}

/// Decodes a DNS-style length-prefixed label sequence into a dotted name.
fn decode_labels(buf: &[u8]) -> Option<String> {
    let mut labels = Vec::new();
    let mut offset = 0usize;
    loop {
        if offset >= buf.len() {
            break;
        }
        let label_len = buf[offset] as usize;
        offset += 1;
        if label_len == 0 {
            break;
        }
        if offset + label_len > buf.len() {
            break;
        }
        labels.push(String::from_utf8_lossy(&buf[offset..offset + label_len]).into_owned());
        offset += label_len;
    }
    if labels.is_empty() {
        None
    } else {
        Some(labels.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label_encode(name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out
    }

    fn build_pvdid_option(name: &str, seq: u8, h: bool, l: bool, lifetime: u32) -> Vec<u8> {
        let mut labels = label_encode(name);
        let mut body = vec![ND_OPT_PVDID, 0, seq | (h as u8) << 4 | (l as u8) << 5, 0];
        body.extend_from_slice(&lifetime.to_be_bytes());
        body.append(&mut labels);
        while body.len() % 8 != 0 {
            body.push(0);
        }
        body[1] = (body.len() / 8) as u8;
        body
    }

    fn build_ra(router_lifetime: u16, opts: &[u8]) -> Vec<u8> {
        let mut msg = vec![ND_ROUTER_ADVERT, 0, 0, 0, 0, 0];
        msg.extend_from_slice(&router_lifetime.to_be_bytes());
        msg.extend_from_slice(&[0u8; 8]);
        msg.extend_from_slice(opts);
        msg
    }

    #[test]
    fn ra_without_pvdid_is_orphan() {
        let ra = build_ra(1800, &[]);
        assert!(parse_ra(&ra).unwrap().is_none());
    }

    #[test]
    fn decodes_pvdid_and_flags() {
        let opt = build_pvdid_option("test.example", 3, true, false, 1800);
        let ra = build_ra(1800, &opt);
        let parsed = parse_ra(&ra).unwrap().unwrap();
        assert_eq!(parsed.pvd_name, "test.example");
        assert_eq!(parsed.sequence, 3);
        assert!(parsed.h_flag);
        assert!(!parsed.l_flag);
    }

    #[test]
    fn second_pvdid_option_is_ignored() {
        let mut opts = build_pvdid_option("first.example", 1, false, false, 100);
        opts.extend(build_pvdid_option("second.example", 2, false, false, 100));
        let ra = build_ra(1800, &opts);
        let parsed = parse_ra(&ra).unwrap().unwrap();
        assert_eq!(parsed.pvd_name, "first.example");
    }

    #[test]
    fn zero_router_lifetime_is_reported() {
        let opt = build_pvdid_option("test.example", 0, false, false, 0);
        let ra = build_ra(0, &opt);
        let parsed = parse_ra(&ra).unwrap().unwrap();
        assert_eq!(parsed.router_lifetime, 0);
    }
}
