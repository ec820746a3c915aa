//! Kernel-bind API: socket/thread/process binding to a PvD via socket
//! options.
//!
//! Grounded on `struct bind_to_pvd` and the `PVD_BIND_SCOPE_*` constants in
//! `examples/original_source/include/linux/pvd-user.h`, and the
//! `SO_BINDTOPVD` call sites implied by `libpvd.c`/`libpvdid.c`. Ships as a
//! library surface of this crate (spec.md 2 lists it daemon-adjacent, not
//! daemon-internal) so a client binary linking against this crate can bind
//! itself without reimplementing the struct layout.

use std::os::fd::AsRawFd;

/// Experimental socket option for get/set PvD binding, placed the way the
/// kernel patch places it relative to the standard `SO_*` numbers.
const SO_BINDTOPVD: libc::c_int = 59;

const PVD_NAME_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindScope {
    Socket,
    Thread,
    Process,
}

impl BindScope {
    fn as_raw(self) -> libc::c_int {
        match self {
            BindScope::Socket => 0,
            BindScope::Thread => 1,
            BindScope::Process => 2,
        }
    }
}

/// The three bind types spec.md 4.7 describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindRequest {
    /// Clear any binding, inheriting the parent scope's.
    Inherit,
    /// Force the socket/thread/process to have no PvD.
    NoPvd,
    /// Force binding to a specific named PvD.
    OnePvd(String),
}

#[repr(C)]
struct RawBindToPvd {
    scope: libc::c_int,
    npvd: libc::c_int,
    pvdname: [u8; PVD_NAME_SIZE],
}

fn encode(scope: BindScope, request: &BindRequest) -> RawBindToPvd {
    let mut pvdname = [0u8; PVD_NAME_SIZE];
    let npvd = match request {
        BindRequest::Inherit => -1,
        BindRequest::NoPvd => 0,
        BindRequest::OnePvd(name) => {
            let bytes = name.as_bytes();
            let copy_len = bytes.len().min(PVD_NAME_SIZE - 1);
            pvdname[..copy_len].copy_from_slice(&bytes[..copy_len]);
            1
        }
    };
    RawBindToPvd {
        scope: scope.as_raw(),
        npvd,
        pvdname,
    }
}

/// Binds `sock`'s scope to `request`.
pub fn bind_to_pvd(sock: &socket2::Socket, scope: BindScope, request: &BindRequest) -> std::io::Result<()> {
    let raw = encode(scope, request);
    let rc = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            SO_BINDTOPVD,
            &raw as *const RawBindToPvd as *const libc::c_void,
            std::mem::size_of::<RawBindToPvd>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Queries the current binding. Returns `Ok(None)` for "unbound", using the
/// source's "relaxed" getter convention that distinguishes unbound (0) from
/// error (-1) at the application level, per spec.md 4.7.
pub fn get_pvd_binding(sock: &socket2::Socket, scope: BindScope) -> std::io::Result<Option<String>> {
    let mut raw = RawBindToPvd {
        scope: scope.as_raw(),
        npvd: 0,
        pvdname: [0u8; PVD_NAME_SIZE],
    };
    let mut len = std::mem::size_of::<RawBindToPvd>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            SO_BINDTOPVD,
            &mut raw as *mut RawBindToPvd as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    if raw.npvd <= 0 {
        return Ok(None);
    }
    let end = raw
        .pvdname
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(raw.pvdname.len());
    Ok(Some(String::from_utf8_lossy(&raw.pvdname[..end]).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_one_pvd_request_with_npvd_one() {
        let raw = encode(BindScope::Socket, &BindRequest::OnePvd("test.example".into()));
        assert_eq!(raw.npvd, 1);
        assert_eq!(&raw.pvdname[..12], b"test.example");
    }

    #[test]
    fn encodes_inherit_as_negative_one() {
        let raw = encode(BindScope::Thread, &BindRequest::Inherit);
        assert_eq!(raw.npvd, -1);
    }
}
