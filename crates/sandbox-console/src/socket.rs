//! Passing a descriptor over a UNIX socket.
//!
//! Each message carries exactly one descriptor in `SCM_RIGHTS` and the
//! descriptor's name as payload.

use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::{mem, ptr};

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use sandbox_core::{Result, SandboxError};

/// Longest name accepted alongside a descriptor
pub const MAX_NAME_LEN: usize = 4096;

/// Send `fd` over `socket`, labelled with `name`
pub fn send_fd<S: AsRawFd, F: AsRawFd>(socket: &S, name: &str, fd: &F) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(SandboxError::Console(format!(
            "descriptor name is {} bytes, limit is {}",
            name.len(),
            MAX_NAME_LEN
        )));
    }

    send_raw_fd(socket.as_raw_fd(), name.as_bytes(), fd.as_raw_fd())
        .map_err(|e| SandboxError::syscall("sendmsg", e))
}

/// Room for one `SCM_RIGHTS` descriptor, aligned like a `cmsghdr`
#[repr(C, align(8))]
struct ControlBuffer([u8; 32]);

/// [`send_fd`] on raw descriptors.
///
/// The control message lives on the stack, so this does not allocate and
/// can run in a child between `clone` and `execve`.
pub fn send_raw_fd(socket: RawFd, name: &[u8], fd: RawFd) -> nix::Result<()> {
    let data_len = mem::size_of::<libc::c_int>() as libc::c_uint;

    let mut control = ControlBuffer([0; 32]);
    let mut iov = libc::iovec {
        iov_base: name.as_ptr() as *mut libc::c_void,
        iov_len: name.len(),
    };
    // SAFETY: all-zero is a valid msghdr
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(data_len) } as _;
    if msg.msg_controllen as usize > control.0.len() {
        return Err(Errno::EOVERFLOW);
    }

    // SAFETY: msg_control points at a buffer of msg_controllen bytes, which
    // holds exactly one header and its data
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(Errno::EINVAL);
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(data_len) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::c_int, fd);
    }

    let sent = unsafe { libc::sendmsg(socket, &msg, 0) };
    Errno::result(sent).map(drop)
}

/// Receive one descriptor and its name from `socket`.
///
/// Fails if the peer closes the socket before sending, or if the message
/// does not carry exactly one descriptor. The received descriptor is
/// close-on-exec.
pub fn recv_fd<S: AsRawFd>(socket: &S) -> Result<(OwnedFd, String)> {
    let mut name = vec![0u8; MAX_NAME_LEN];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);

    let (bytes, raw_fds) = {
        let mut iov = [IoSliceMut::new(&mut name)];
        let msg = recvmsg::<()>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )
        .map_err(|e| SandboxError::syscall("recvmsg", e))?;

        let mut raw_fds: Vec<RawFd> = Vec::new();
        for cmsg in msg
            .cmsgs()
            .map_err(|e| SandboxError::syscall("recvmsg", e))?
        {
            if let ControlMessageOwned::ScmRights(mut fds) = cmsg {
                raw_fds.append(&mut fds);
            }
        }
        (msg.bytes, raw_fds)
    };

    let mut fds: Vec<OwnedFd> = raw_fds
        .into_iter()
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();

    if fds.is_empty() {
        if bytes == 0 {
            return Err(SandboxError::Console(
                "peer closed the socket before sending a descriptor".to_string(),
            ));
        }
        return Err(SandboxError::Console(
            "message carried no descriptor".to_string(),
        ));
    }
    if fds.len() > 1 {
        return Err(SandboxError::Console(format!(
            "expected one descriptor, received {}",
            fds.len()
        )));
    }

    name.truncate(bytes);
    let name = String::from_utf8_lossy(&name).into_owned();
    Ok((fds.remove(0), name))
}
