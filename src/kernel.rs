//! Kernel socket-option integration: PvD enumeration, attribute fetch,
//! creation and flag updates on a PvD-aware kernel.
//!
//! Grounded on the `getsockopt`/`setsockopt` call sites in
//! `examples/original_source/src/pvdd.c` (`RegisterPvd` callers around
//! `SO_GETPVDLIST`) and the wire structures in
//! `examples/original_source/include/linux/pvd-user.h`
//! (`struct net_pvd_attribute`, `struct pvd_list`, `struct create_pvd`).
//! These `SO_*` option numbers are specific to the experimental PvD kernel
//! patch this daemon targets; they are not present in upstream
//! `libc::SOL_SOCKET`, so they are declared locally the way the original's
//! headers declare them out of `asm-generic/socket.h`.

use std::net::Ipv6Addr;
use std::os::fd::AsRawFd;

use tracing::{debug, warn};

use crate::registry::{KernelPvdAttributes, KernelRoute};

/// Experimental socket-option numbers for the PvD-aware kernel patch.
/// Values follow the patch's placement immediately after the last upstream
/// `SO_*` constant at the time pvdd was written; a real deployment pins
/// these against the target kernel's `asm-generic/socket.h`.
mod sockopt {
    pub const SO_GETPVDLIST: libc::c_int = 55;
    pub const SO_GETPVDATTRIBUTES: libc::c_int = 56;
    pub const SO_CREATEPVD: libc::c_int = 57;
    pub const SO_SETPVDATTR: libc::c_int = 58;
}

pub const PVD_NAME_SIZE: usize = 256;
const MAX_PVD: usize = 1024;

pub const PVD_ATTR_SEQNUMBER: i32 = 0x01;
pub const PVD_ATTR_HFLAG: i32 = 0x02;
pub const PVD_ATTR_LFLAG: i32 = 0x04;
pub const PVD_ATTR_DEPRECATED: i32 = 0x08;

/// Whether the running kernel understands the PvD socket options. Resolved
/// once at startup by probing `SO_GETPVDLIST`, per spec.md 4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelCapability {
    PvdAware,
    Unsupported,
}

fn throwaway_socket() -> std::io::Result<socket2::Socket> {
    socket2::Socket::new(socket2::Domain::IPV6, socket2::Type::DGRAM, None)
}

/// Probes the kernel for PvD awareness via `getsockopt(SO_GETPVDLIST)`.
/// `ENOPROTOOPT` means "not PvD-aware"; any other errno is logged and also
/// treated as unsupported, since the daemon must still fall back to RA
/// parsing rather than fail startup (spec.md 4.5/7).
pub fn probe_kernel_capability() -> KernelCapability {
    let sock = match throwaway_socket() {
        Ok(sock) => sock,
        Err(err) => {
            warn!("could not allocate probe socket: {err}");
            return KernelCapability::Unsupported;
        }
    };
    match list_pvds(&sock) {
        Ok(_) => KernelCapability::PvdAware,
        Err(err) if err.raw_os_error() == Some(libc::ENOPROTOOPT) => {
            debug!("kernel is not PvD-aware (ENOPROTOOPT)");
            KernelCapability::Unsupported
        }
        Err(err) => {
            warn!("unexpected error probing PvD kernel support: {err}");
            KernelCapability::Unsupported
        }
    }
}

/// Enumerates PvD names known to the kernel (`SO_GETPVDLIST`).
pub fn list_pvds(sock: &socket2::Socket) -> std::io::Result<Vec<String>> {
    #[repr(C)]
    struct PvdList {
        npvd: libc::c_int,
        pvds: [[u8; PVD_NAME_SIZE]; MAX_PVD],
    }
    let mut buf: Box<PvdList> = Box::new(PvdList {
        npvd: MAX_PVD as libc::c_int,
        pvds: [[0u8; PVD_NAME_SIZE]; MAX_PVD],
    });
    let mut len = std::mem::size_of::<PvdList>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            sockopt::SO_GETPVDLIST,
            buf.as_mut() as *mut PvdList as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let count = buf.npvd.max(0) as usize;
    let mut names = Vec::with_capacity(count);
    for slot in buf.pvds.iter().take(count) {
        let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
        names.push(String::from_utf8_lossy(&slot[..end]).into_owned());
    }
    Ok(names)
}

/// Fetches the kernel attribute bundle for a single PvD
/// (`SO_GETPVDATTRIBUTES`), mirroring `struct net_pvd_attribute`.
pub fn get_pvd_attributes(
    sock: &socket2::Socket,
    name: &str,
) -> std::io::Result<KernelPvdAttributes> {
    #[repr(C)]
    struct NetPvdRoute {
        dst: [u8; 16],
        gateway: [u8; 16],
        dev_name: [u8; libc::IF_NAMESIZE],
    }
    #[repr(C)]
    struct NetPvdAttribute {
        name: [u8; PVD_NAME_SIZE],
        index: libc::c_int,
        sequence_number: libc::c_int,
        h_flag: libc::c_int,
        l_flag: libc::c_int,
        implicit_flag: libc::c_int,
        lla: [u8; 16],
        dev: [u8; libc::IF_NAMESIZE],
        nroutes: libc::c_int,
        routes: [NetPvdRoute; 32],
        naddresses: libc::c_int,
        addresses: [[u8; 16]; 32],
        addr_prefix_len: [libc::c_int; 32],
        ndnssl: libc::c_int,
        dnssl: [[u8; 256]; 4],
        nrdnss: libc::c_int,
        rdnss: [[u8; 16]; 4],
    }

    let mut name_buf = [0u8; PVD_NAME_SIZE];
    let bytes = name.as_bytes();
    let copy_len = bytes.len().min(PVD_NAME_SIZE - 1);
    name_buf[..copy_len].copy_from_slice(&bytes[..copy_len]);

    let mut buf: Box<NetPvdAttribute> = Box::new(unsafe { std::mem::zeroed() });
    buf.name = name_buf;
    let mut len = std::mem::size_of::<NetPvdAttribute>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            sockopt::SO_GETPVDATTRIBUTES,
            buf.as_mut() as *mut NetPvdAttribute as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let addresses = (0..buf.naddresses.max(0) as usize)
        .map(|i| {
            (
                Ipv6Addr::from(buf.addresses[i]),
                buf.addr_prefix_len[i] as u8,
            )
        })
        .collect();

    let routes = (0..buf.nroutes.max(0) as usize)
        .map(|i| {
            let r = &buf.routes[i];
            let end = r.dev_name.iter().position(|&b| b == 0).unwrap_or(r.dev_name.len());
            KernelRoute {
                destination: Ipv6Addr::from(r.dst),
                prefix_len: 64,
                gateway: Some(Ipv6Addr::from(r.gateway)).filter(|g| !g.is_unspecified()),
                device: String::from_utf8_lossy(&r.dev_name[..end]).into_owned(),
            }
        })
        .collect();

    let dnssl = (0..buf.ndnssl.max(0) as usize)
        .map(|i| {
            let slot = &buf.dnssl[i];
            let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
            String::from_utf8_lossy(&slot[..end]).into_owned()
        })
        .collect();

    let rdnss = (0..buf.nrdnss.max(0) as usize)
        .map(|i| Ipv6Addr::from(buf.rdnss[i]))
        .collect();

    Ok(KernelPvdAttributes {
        index: buf.index as u32,
        sequence_number: buf.sequence_number as u8,
        h_flag: buf.h_flag != 0,
        l_flag: buf.l_flag != 0,
        addresses,
        routes,
        rdnss,
        dnssl,
    })
}

/// Issues `SO_CREATEPVD` for `name` with optional initial flags.
pub fn create_pvd(sock: &socket2::Socket, name: &str) -> std::io::Result<()> {
    #[repr(C)]
    struct CreatePvd {
        pvdname: [u8; PVD_NAME_SIZE],
        flag: libc::c_int,
        sequence_number: libc::c_int,
        h_flag: libc::c_int,
        l_flag: libc::c_int,
        deprecated: libc::c_int,
    }
    let mut pvdname = [0u8; PVD_NAME_SIZE];
    let bytes = name.as_bytes();
    let copy_len = bytes.len().min(PVD_NAME_SIZE - 1);
    pvdname[..copy_len].copy_from_slice(&bytes[..copy_len]);
    let req = CreatePvd {
        pvdname,
        flag: 0,
        sequence_number: 0,
        h_flag: 0,
        l_flag: 0,
        deprecated: 0,
    };
    let rc = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            sockopt::SO_CREATEPVD,
            &req as *const CreatePvd as *const libc::c_void,
            std::mem::size_of::<CreatePvd>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Pushes an `hFlag`/`lFlag`/`sequenceNumber`/deprecation update for `name`
/// down to the kernel via `SO_SETPVDATTR`. The registry write for these
/// three attributes happens only on the subsequent rtnetlink echo, per
/// spec.md 4.2.
pub fn set_pvd_attr(
    sock: &socket2::Socket,
    name: &str,
    mask: i32,
    sequence_number: i32,
    h_flag: bool,
    l_flag: bool,
    deprecated: bool,
) -> std::io::Result<()> {
    #[repr(C)]
    struct CreatePvd {
        pvdname: [u8; PVD_NAME_SIZE],
        flag: libc::c_int,
        sequence_number: libc::c_int,
        h_flag: libc::c_int,
        l_flag: libc::c_int,
        deprecated: libc::c_int,
    }
    let mut pvdname = [0u8; PVD_NAME_SIZE];
    let bytes = name.as_bytes();
    let copy_len = bytes.len().min(PVD_NAME_SIZE - 1);
    pvdname[..copy_len].copy_from_slice(&bytes[..copy_len]);
    let req = CreatePvd {
        pvdname,
        flag: mask,
        sequence_number,
        h_flag: h_flag as libc::c_int,
        l_flag: l_flag as libc::c_int,
        deprecated: deprecated as libc::c_int,
    };
    let rc = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            sockopt::SO_SETPVDATTR,
            &req as *const CreatePvd as *const libc::c_void,
            std::mem::size_of::<CreatePvd>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probing_on_a_non_pvd_kernel_falls_back_gracefully() {
        // On any kernel lacking this experimental patch (i.e. every CI
        // runner) the probe must resolve to Unsupported rather than panic.
        assert_eq!(probe_kernel_capability(), KernelCapability::Unsupported);
    }
}
