//! Minimal rtnetlink client covering the link operations the control
//! plane needs: veth pair creation, link deletion, namespace moves and
//! bringing interfaces up. Messages are packed by hand; every request
//! asks for an ACK and the reply's nlmsgerr decides the outcome.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

const NLMSG_ERROR: u16 = 2;

const IFLA_IFNAME: u16 = 3;
const IFLA_NET_NS_PID: u16 = 19;
const IFLA_LINKINFO: u16 = 18;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;

const NLA_HDR_LEN: usize = 4;

fn align(len: usize) -> usize {
    (len + 3) & !3
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct IfInfoMsg {
    ifi_family: u8,
    ifi_pad: u8,
    ifi_type: u16,
    ifi_index: i32,
    ifi_flags: u32,
    ifi_change: u32,
}

/// An RTM_* request under construction. The buffer always starts with an
/// nlmsghdr followed by an ifinfomsg.
struct LinkRequest {
    buf: Vec<u8>,
}

impl LinkRequest {
    fn new(msg_type: u16, flags: u16, ifinfo: IfInfoMsg) -> Self {
        let mut buf = vec![0u8; mem::size_of::<libc::nlmsghdr>()];
        let header = libc::nlmsghdr {
            nlmsg_len: 0,
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            nlmsg_seq: 1,
            nlmsg_pid: 0,
        };
        // Safety: nlmsghdr is plain old data.
        buf.copy_from_slice(unsafe {
            std::slice::from_raw_parts(
                (&header as *const libc::nlmsghdr).cast::<u8>(),
                mem::size_of::<libc::nlmsghdr>(),
            )
        });
        let mut request = Self { buf };
        request.push_raw(&ifinfo);
        request
    }

    fn push_raw<T: Copy>(&mut self, value: &T) {
        // Safety: T is plain old data passed by reference.
        let bytes = unsafe {
            std::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>())
        };
        self.buf.extend_from_slice(bytes);
        self.pad();
    }

    fn pad(&mut self) {
        self.buf.resize(align(self.buf.len()), 0);
    }

    fn add_attr(&mut self, kind: u16, payload: &[u8]) {
        let len = (NLA_HDR_LEN + payload.len()) as u16;
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.pad();
    }

    fn add_string_attr(&mut self, kind: u16, value: &str) -> io::Result<()> {
        let value = CString::new(value).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        self.add_attr(kind, value.as_bytes_with_nul());
        Ok(())
    }

    /// Opens a nested attribute; returns the offset to pass to
    /// [`LinkRequest::end_nested`].
    fn begin_nested(&mut self, kind: u16) -> usize {
        let offset = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        offset
    }

    fn end_nested(&mut self, offset: usize) {
        let len = (self.buf.len() - offset) as u16;
        self.buf[offset..offset + 2].copy_from_slice(&len.to_ne_bytes());
    }

    fn finish(&mut self) -> &[u8] {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        &self.buf
    }
}

fn open_route_socket() -> io::Result<OwnedFd> {
    // Safety: plain socket creation.
    let raw = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_ROUTE) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: raw is a freshly opened, owned descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Sends the request to the kernel and turns the ACK/nlmsgerr reply into a
/// result.
fn transaction(request: &mut LinkRequest) -> io::Result<()> {
    let sock = open_route_socket()?;

    let mut kernel: libc::sockaddr_nl = unsafe { mem::zeroed() };
    kernel.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    let payload = request.finish();
    // Safety: payload and kernel are valid for the duration of the call.
    let sent = unsafe {
        libc::sendto(
            sock.as_raw_fd(),
            payload.as_ptr().cast(),
            payload.len(),
            0,
            (&kernel as *const libc::sockaddr_nl).cast(),
            mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut reply = [0u8; 4096];
    // Safety: reply is a valid writable buffer.
    let received = unsafe {
        libc::recv(
            sock.as_raw_fd(),
            reply.as_mut_ptr().cast(),
            reply.len(),
            0,
        )
    };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }
    let received = received as usize;
    if received < mem::size_of::<libc::nlmsghdr>() {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }

    // nlmsg_type sits at offset 4; an NLMSG_ERROR payload is the errno.
    let msg_type = u16::from_ne_bytes(reply[4..6].try_into().expect("slice is two bytes"));
    if msg_type == NLMSG_ERROR {
        let error_offset = mem::size_of::<libc::nlmsghdr>();
        if received < error_offset + 4 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        let errno = i32::from_ne_bytes(
            reply[error_offset..error_offset + 4]
                .try_into()
                .expect("slice is four bytes"),
        );
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(-errno));
        }
    }
    Ok(())
}

pub fn interface_index(name: &str) -> io::Result<u32> {
    let c_name = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // Safety: c_name is a valid NUL-terminated string.
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(index)
}

/// Creates a veth pair `first`/`second` in one RTM_NEWLINK request.
pub fn create_veth_pair(first: &str, second: &str) -> io::Result<()> {
    let mut request = LinkRequest::new(
        libc::RTM_NEWLINK,
        (libc::NLM_F_REQUEST | libc::NLM_F_CREATE | libc::NLM_F_EXCL | libc::NLM_F_ACK) as u16,
        IfInfoMsg::default(),
    );

    let linkinfo = request.begin_nested(IFLA_LINKINFO);
    request.add_string_attr(IFLA_INFO_KIND, "veth")?;
    let data = request.begin_nested(IFLA_INFO_DATA);
    let peer = request.begin_nested(VETH_INFO_PEER);
    // The peer attribute payload is a full link message of its own.
    request.push_raw(&IfInfoMsg::default());
    request.add_string_attr(IFLA_IFNAME, second)?;
    request.end_nested(peer);
    request.end_nested(data);
    request.end_nested(linkinfo);
    request.add_string_attr(IFLA_IFNAME, first)?;

    transaction(&mut request)
}

pub fn delete_link(name: &str) -> io::Result<()> {
    let index = interface_index(name)?;
    let mut request = LinkRequest::new(
        libc::RTM_DELLINK,
        (libc::NLM_F_REQUEST | libc::NLM_F_ACK) as u16,
        IfInfoMsg {
            ifi_index: index as i32,
            ..Default::default()
        },
    );
    transaction(&mut request)
}

pub fn set_link_up(name: &str) -> io::Result<()> {
    let index = interface_index(name)?;
    let mut request = LinkRequest::new(
        libc::RTM_NEWLINK,
        (libc::NLM_F_REQUEST | libc::NLM_F_ACK) as u16,
        IfInfoMsg {
            ifi_index: index as i32,
            ifi_flags: libc::IFF_UP as u32,
            ifi_change: libc::IFF_UP as u32,
            ..Default::default()
        },
    );
    transaction(&mut request)
}

/// Moves `name` into the network namespace of `pid`, renaming it to
/// `destination_name` on the way.
pub fn move_link_to_ns(name: &str, pid: u32, destination_name: &str) -> io::Result<()> {
    let index = interface_index(name)?;
    let mut request = LinkRequest::new(
        libc::RTM_NEWLINK,
        (libc::NLM_F_REQUEST | libc::NLM_F_ACK) as u16,
        IfInfoMsg {
            ifi_index: index as i32,
            ..Default::default()
        },
    );
    request.add_string_attr(IFLA_IFNAME, destination_name)?;
    request.add_attr(IFLA_NET_NS_PID, &pid.to_ne_bytes());
    transaction(&mut request)
}
