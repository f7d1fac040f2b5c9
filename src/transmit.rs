// Raw link-layer transmission of crafted frames (queries towards the DUT).

use crate::error::IgmpError;

/// Parse a colon-separated MAC address such as `00:11:22:33:44:55`.
pub fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.trim().split(':');
    for byte in &mut mac {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

/// Hardware address of `interface`, read from sysfs.
pub fn interface_mac(interface: &str) -> Result<[u8; 6], IgmpError> {
    let path = format!("/sys/class/net/{interface}/address");
    let text = std::fs::read_to_string(&path)
        .map_err(|e| IgmpError::CaptureDevice(format!("read {path}: {e}")))?;
    parse_mac(&text)
        .ok_or_else(|| IgmpError::CaptureDevice(format!("{path}: bad MAC address '{}'", text.trim())))
}

/// Whether `interface` reports an operational link, from sysfs.
pub fn link_is_up(interface: &str) -> Result<bool, IgmpError> {
    let path = format!("/sys/class/net/{interface}/operstate");
    let state = std::fs::read_to_string(&path)
        .map_err(|e| IgmpError::CaptureDevice(format!("read {path}: {e}")))?;
    // Virtual interfaces often report "unknown" while passing traffic.
    Ok(matches!(state.trim(), "up" | "unknown"))
}

#[cfg(target_os = "linux")]
pub use self::linux::FrameSender;

/// Frame transmission is only implemented for Linux.
#[cfg(not(target_os = "linux"))]
pub struct FrameSender;

#[cfg(not(target_os = "linux"))]
impl FrameSender {
    pub fn open(interface: &str) -> Result<Self, IgmpError> {
        Err(IgmpError::CaptureDevice(format!(
            "sending on {interface} is only supported on Linux"
        )))
    }

    pub fn send(&self, _frame: &[u8]) -> Result<(), IgmpError> {
        Err(IgmpError::CaptureDevice(
            "sending is only supported on Linux".to_string(),
        ))
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use crate::capture::if_nametoindex;
    use crate::error::IgmpError;

    /// AF_PACKET socket that writes complete Ethernet frames to one interface.
    pub struct FrameSender {
        fd: OwnedFd,
        interface: String,
    }

    impl FrameSender {
        pub fn open(interface: &str) -> Result<Self, IgmpError> {
            // Protocol 0: send only, nothing is queued for reading.
            let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, 0) };
            if fd < 0 {
                return Err(IgmpError::CaptureDevice(format!(
                    "socket(AF_PACKET) for sending failed: {}",
                    io::Error::last_os_error()
                )));
            }
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };

            let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
            sll.sll_family = libc::AF_PACKET as u16;
            sll.sll_ifindex = if_nametoindex(interface)? as i32;
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

            Ok(Self {
                fd,
                interface: interface.to_string(),
            })
        }

        /// Send one frame as-is.
        pub fn send(&self, frame: &[u8]) -> Result<(), IgmpError> {
            let n = unsafe {
                libc::send(
                    self.fd.as_raw_fd(),
                    frame.as_ptr() as *const libc::c_void,
                    frame.len(),
                    0,
                )
            };
            if n < 0 {
                return Err(IgmpError::CaptureDevice(format!(
                    "send on {} failed: {}",
                    self.interface,
                    io::Error::last_os_error()
                )));
            }
            if n as usize != frame.len() {
                return Err(IgmpError::CaptureDevice(format!(
                    "short send on {}: {} of {} bytes",
                    self.interface,
                    n,
                    frame.len()
                )));
            }
            log::debug!("sent {} byte frame on {}", frame.len(), self.interface);
            Ok(())
        }

        pub fn interface(&self) -> &str {
            &self.interface
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parsing() {
        assert_eq!(
            parse_mac("00:1b:21:3a:4f:ff\n"),
            Some([0x00, 0x1b, 0x21, 0x3a, 0x4f, 0xff])
        );
        assert_eq!(parse_mac("00:1b:21:3a:4f"), None);
        assert_eq!(parse_mac("00:1b:21:3a:4f:ff:00"), None);
        assert_eq!(parse_mac("zz:1b:21:3a:4f:ff"), None);
    }

    #[test]
    fn unknown_interface_has_no_mac() {
        assert!(matches!(
            interface_mac("igmpcheck-none0"),
            Err(IgmpError::CaptureDevice(_))
        ));
    }
}
