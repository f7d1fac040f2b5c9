// Linux live capture: AF_PACKET raw sockets.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::IgmpError;
use crate::igmp::Timestamp;
use crate::packet::LinkType;

use super::filter::BpfInsn;
use super::{CapturedPacket, PacketSource};

// ---------------------------------------------------------------------------
// AF_PACKET constants
// ---------------------------------------------------------------------------

const ETH_P_ALL: u16 = 0x0003;
const SOL_PACKET: i32 = 263;
const PACKET_ADD_MEMBERSHIP: i32 = 1;
const PACKET_MR_PROMISC: u16 = 1;
const SIOCGSTAMP: u64 = 0x8906;

const FRAME_BUFFER: usize = 65536;

#[repr(C)]
struct sock_fprog {
    len: u16,
    filter: *const BpfInsn,
}

#[repr(C)]
struct packet_mreq {
    mr_ifindex: i32,
    mr_type: u16,
    mr_alen: u16,
    mr_address: [u8; 8],
}

/// Live capture from one interface, including frames the host sends.
pub struct AfPacketSource {
    fd: OwnedFd,
    buffer: Vec<u8>,
    interface: String,
}

impl AfPacketSource {
    /// Open a raw socket bound to `interface` in promiscuous mode, with
    /// `filter` attached when given.
    pub fn open(interface: &str, filter: Option<&[BpfInsn]>) -> Result<Self, IgmpError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                ETH_P_ALL.to_be() as i32,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EPERM) {
                return Err(IgmpError::InsufficientPermission(format!(
                    "raw socket on {interface} needs root or CAP_NET_RAW"
                )));
            }
            return Err(IgmpError::CaptureDevice(format!(
                "socket(AF_PACKET) failed: {err}"
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let if_index = if_nametoindex(interface)?;

        // Attach the filter before binding so nothing unfiltered is queued.
        if let Some(program) = filter {
            install_filter(&fd, program)?;
        }

        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = ETH_P_ALL.to_be();
        sll.sll_ifindex = if_index as i32;

        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(IgmpError::CaptureDevice(format!(
                "bind(AF_PACKET, {}) failed: {}",
                interface,
                io::Error::last_os_error()
            )));
        }

        let mreq = packet_mreq {
            mr_ifindex: if_index as i32,
            mr_type: PACKET_MR_PROMISC,
            mr_alen: 0,
            mr_address: [0u8; 8],
        };
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                SOL_PACKET,
                PACKET_ADD_MEMBERSHIP,
                &mreq as *const packet_mreq as *const libc::c_void,
                std::mem::size_of::<packet_mreq>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            log::warn!(
                "PACKET_MR_PROMISC failed on {}: {} (continuing without promiscuous mode)",
                interface,
                io::Error::last_os_error()
            );
        }

        log::info!(
            "AF_PACKET capture on {} (if_index={}, filter={} insns)",
            interface,
            if_index,
            filter.map_or(0, <[BpfInsn]>::len)
        );

        Ok(Self {
            fd,
            buffer: vec![0u8; FRAME_BUFFER],
            interface: interface.to_string(),
        })
    }

    /// Kernel receive time of the last frame read, falling back to now.
    fn last_timestamp(&self) -> Timestamp {
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let ret = unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                SIOCGSTAMP as _,
                &mut tv as *mut libc::timeval,
            )
        };
        if ret == 0 {
            return tv.tv_sec as u64 * 1_000_000 + tv.tv_usec as u64;
        }
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as Timestamp)
            .unwrap_or(0)
    }
}

impl PacketSource for AfPacketSource {
    fn poll_packet(&mut self, timeout: Duration) -> Result<Option<CapturedPacket>, IgmpError> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(None);
            }
            return Err(IgmpError::CaptureDevice(format!(
                "poll on {} failed: {}",
                self.interface, err
            )));
        }
        if ret == 0 {
            return Ok(None);
        }

        let n = unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                self.buffer.as_mut_ptr() as *mut libc::c_void,
                self.buffer.len(),
                libc::MSG_DONTWAIT,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN)
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                || err.raw_os_error() == Some(libc::EINTR)
            {
                return Ok(None);
            }
            return Err(IgmpError::CaptureDevice(format!(
                "recvfrom on {} failed: {}",
                self.interface, err
            )));
        }

        let timestamp = self.last_timestamp();
        Ok(Some(CapturedPacket {
            timestamp,
            data: self.buffer[..n as usize].to_vec(),
        }))
    }

    fn link_type(&self) -> LinkType {
        LinkType::Ethernet
    }

    fn interface(&self) -> &str {
        &self.interface
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Check that raw link-layer sockets can be opened.
pub fn check_capture_access() -> Result<(), IgmpError> {
    if unsafe { libc::getuid() } == 0 {
        return Ok(());
    }

    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW,
            ETH_P_ALL.to_be() as i32,
        )
    };
    if fd >= 0 {
        unsafe { libc::close(fd) };
        return Ok(());
    }

    Err(IgmpError::InsufficientPermission(
        "igmpcheck requires raw socket access. Either:\n  \
         1. Run with sudo: sudo igmpcheck ...\n  \
         2. Grant the capability: sudo setcap cap_net_raw+ep $(which igmpcheck)"
            .to_string(),
    ))
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

pub(crate) fn if_nametoindex(name: &str) -> Result<u32, IgmpError> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| IgmpError::CaptureDevice("invalid interface name".to_string()))?;
    let idx = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if idx == 0 {
        return Err(IgmpError::CaptureDevice(format!(
            "if_nametoindex({}) failed: {}",
            name,
            io::Error::last_os_error()
        )));
    }
    Ok(idx)
}

fn install_filter(fd: &OwnedFd, program: &[BpfInsn]) -> Result<(), IgmpError> {
    let len = u16::try_from(program.len())
        .map_err(|_| IgmpError::CaptureDevice("filter program too long".to_string()))?;
    let prog = sock_fprog {
        len,
        filter: program.as_ptr(),
    };

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            &prog as *const sock_fprog as *const libc::c_void,
            std::mem::size_of::<sock_fprog>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(IgmpError::CaptureDevice(format!(
            "SO_ATTACH_FILTER failed: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}
