//! Raw AF_PACKET endpoint bound to one interface, promiscuous, with
//! PACKET_AUXDATA enabled so VLAN tags the kernel stripped on receive can
//! be reinserted before the frame is forwarded.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use super::{wait_readable, NioError, RECV_POLL_TIMEOUT};

const VLAN_HEADER_LEN: usize = 4;
// Offset of the EtherType field, right after the two MAC addresses.
const MAC_HEADER_LEN: usize = 12;

const TP_STATUS_VLAN_VALID: u32 = 1 << 4;
const TP_STATUS_VLAN_TPID_VALID: u32 = 1 << 6;

pub struct LinuxRawNio {
    fd: OwnedFd,
    ifindex: libc::c_int,
}

impl LinuxRawNio {
    pub fn new(device: &str) -> Result<Self, NioError> {
        if device.len() >= libc::IFNAMSIZ {
            return Err(NioError::InvalidParameter(format!(
                "device name '{device}' too long"
            )));
        }
        let ifindex = interface_index(device)?;
        let fd = open_packet_socket(ifindex)?;
        Ok(Self { fd, ifindex })
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let mut sa: libc::sockaddr_ll = unsafe { mem::zeroed() };
        sa.sll_family = libc::AF_PACKET as libc::sa_family_t;
        sa.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        sa.sll_hatype = libc::ARPHRD_ETHER;
        sa.sll_halen = libc::ETH_ALEN as u8;
        sa.sll_ifindex = self.ifindex;

        // Safety: buf and sa are valid for the duration of the call.
        let sent = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                buf.as_ptr().cast(),
                buf.len(),
                0,
                (&sa as *const libc::sockaddr_ll).cast(),
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as usize)
    }

    /// Receives one frame. The returned length can exceed `buf.len()` when
    /// the kernel truncated the frame (MSG_TRUNC); callers drop such frames.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        wait_readable(self.fd.as_raw_fd(), RECV_POLL_TIMEOUT)?;

        #[repr(C)]
        union CmsgBuf {
            hdr: libc::cmsghdr,
            buf: [u8; 64],
        }

        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            // Reserve room for a reinserted VLAN tag.
            iov_len: buf.len() - VLAN_HEADER_LEN,
        };
        let mut cmsg_buf = CmsgBuf { buf: [0u8; 64] };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        // Safety: cmsg_buf is valid, properly aligned control-message space.
        msg.msg_control = unsafe { cmsg_buf.buf.as_mut_ptr().cast() };
        msg.msg_controllen = mem::size_of::<CmsgBuf>();

        // Safety: msg points at valid iovec/control buffers.
        let received = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, libc::MSG_TRUNC) };
        if received < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut received = received as usize;
        if received > iov.iov_len {
            // Kernel truncated the frame; report the full length so the
            // forwarder can drop it.
            return Ok(received);
        }

        // Safety: msg was filled in by recvmsg; CMSG_* walk its control area.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_PACKET
                    && (*cmsg).cmsg_type == libc::PACKET_AUXDATA
                    && (*cmsg).cmsg_len
                        >= libc::CMSG_LEN(mem::size_of::<libc::tpacket_auxdata>() as u32) as usize
                {
                    let aux = &*(libc::CMSG_DATA(cmsg) as *const libc::tpacket_auxdata);
                    if aux.tp_vlan_tci != 0 || aux.tp_status & TP_STATUS_VLAN_VALID != 0 {
                        received = reinsert_vlan_tag(buf, received, aux);
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        Ok(received)
    }
}

/// Shifts everything after the MAC addresses right and inserts the 802.1Q
/// tag the kernel reported through the auxdata control message.
fn reinsert_vlan_tag(buf: &mut [u8], received: usize, aux: &libc::tpacket_auxdata) -> usize {
    if received < MAC_HEADER_LEN || received + VLAN_HEADER_LEN > buf.len() {
        return received;
    }
    buf.copy_within(
        MAC_HEADER_LEN..received,
        MAC_HEADER_LEN + VLAN_HEADER_LEN,
    );
    let tpid = if aux.tp_vlan_tpid != 0 || aux.tp_status & TP_STATUS_VLAN_TPID_VALID != 0 {
        aux.tp_vlan_tpid
    } else {
        libc::ETH_P_8021Q as u16
    };
    buf[MAC_HEADER_LEN..MAC_HEADER_LEN + 2].copy_from_slice(&tpid.to_be_bytes());
    buf[MAC_HEADER_LEN + 2..MAC_HEADER_LEN + 4].copy_from_slice(&aux.tp_vlan_tci.to_be_bytes());
    received + VLAN_HEADER_LEN
}

fn interface_index(device: &str) -> Result<libc::c_int, NioError> {
    // Safety: a plain stream socket just to carry the ioctl.
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // Safety: raw is a freshly opened, owned descriptor.
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(device.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    // Safety: ifr holds a NUL-terminated interface name.
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFINDEX, &mut ifr) } < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // Safety: SIOCGIFINDEX filled in the index member of the union.
    Ok(unsafe { ifr.ifr_ifru.ifru_ifindex })
}

fn open_packet_socket(ifindex: libc::c_int) -> Result<OwnedFd, NioError> {
    // Safety: plain socket creation.
    let raw = unsafe {
        libc::socket(
            libc::PF_PACKET,
            libc::SOCK_RAW,
            (libc::ETH_P_ALL as u16).to_be() as libc::c_int,
        )
    };
    if raw < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // Safety: raw is a freshly opened, owned descriptor.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut sa: libc::sockaddr_ll = unsafe { mem::zeroed() };
    sa.sll_family = libc::AF_PACKET as libc::sa_family_t;
    sa.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
    sa.sll_hatype = libc::ARPHRD_ETHER;
    sa.sll_halen = libc::ETH_ALEN as u8;
    sa.sll_ifindex = ifindex;
    // Safety: sa is a valid sockaddr_ll.
    if unsafe {
        libc::bind(
            fd.as_raw_fd(),
            (&sa as *const libc::sockaddr_ll).cast(),
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    } < 0
    {
        return Err(io::Error::last_os_error().into());
    }

    let mut mreq: libc::packet_mreq = unsafe { mem::zeroed() };
    mreq.mr_ifindex = ifindex;
    mreq.mr_type = libc::PACKET_MR_PROMISC as libc::c_ushort;
    // Safety: mreq is a valid packet_mreq.
    if unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_PACKET,
            libc::PACKET_ADD_MEMBERSHIP,
            (&mreq as *const libc::packet_mreq).cast(),
            mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
        )
    } < 0
    {
        return Err(io::Error::last_os_error().into());
    }

    let enable: libc::c_int = 1;
    // Safety: enable is a valid int option value.
    if unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_PACKET,
            libc::PACKET_AUXDATA,
            (&enable as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    } < 0
    {
        return Err(io::Error::last_os_error().into());
    }

    Ok(fd)
}
