// src/syscalls.rs
use crate::error::WeirResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

/// 16 MiB socket buffers so large uploads keep the pipe full.
pub const SOCKET_BUF_SIZE: c_int = 16 * 1024 * 1024;

// ---- Socket operations ----

/// Create a non-blocking TCP listener bound to INADDR_ANY.
///
/// SO_REUSEADDR lets a restarted server rebind immediately; SO_LINGER is
/// applied per the `-o` flag (a one-second lingering close when enabled).
pub fn create_listen_socket(port: u16, opt_linger: bool) -> WeirResult<RawFd> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let tmp = if opt_linger {
            libc::linger {
                l_onoff: 1,
                l_linger: 1,
            }
        } else {
            libc::linger {
                l_onoff: 0,
                l_linger: 1,
            }
        };
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &tmp as *const _ as *const c_void,
            mem::size_of_val(&tmp) as socklen_t,
        );

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        set_socket_buffers(fd);

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(Ipv4Addr::UNSPECIFIED).to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::listen(fd, 65535) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Port the socket actually bound to (needed when bound to port 0).
pub fn local_port(fd: RawFd) -> WeirResult<u16> {
    unsafe {
        let mut sin: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        if libc::getsockname(fd, &mut sin as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(u16::from_be(sin.sin_port))
    }
}

/// 16 MiB send/receive buffers on a socket.
pub fn set_socket_buffers(fd: RawFd) {
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &SOCKET_BUF_SIZE as *const _ as *const c_void,
            mem::size_of_val(&SOCKET_BUF_SIZE) as socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &SOCKET_BUF_SIZE as *const _ as *const c_void,
            mem::size_of_val(&SOCKET_BUF_SIZE) as socklen_t,
        );
    }
}

/// Accept one connection. `Ok(None)` on would-block.
pub fn accept_connection(listen_fd: RawFd) -> WeirResult<Option<(RawFd, SocketAddr)>> {
    unsafe {
        let mut sin: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut sin as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            let port = u16::from_be(sin.sin_port);
            Ok(Some((fd, SocketAddr::V4(SocketAddrV4::new(ip, port)))))
        }
    }
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Epoll operations ----

pub use libc::{epoll_event, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

/// Build the event mask for a connection registration.
pub fn event_mask(interest: i32, edge_triggered: bool, one_shot: bool) -> u32 {
    let mut events = (interest | EPOLLRDHUP) as u32;
    if edge_triggered {
        events |= libc::EPOLLET as u32;
    }
    if one_shot {
        events |= libc::EPOLLONESHOT as u32;
    }
    events
}

pub struct Epoll {
    pub fd: RawFd,
}

impl Epoll {
    pub fn new() -> WeirResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    pub fn add(&self, fd: RawFd, events: u32) -> WeirResult<()> {
        let mut event = epoll_event {
            events,
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, events: u32) -> WeirResult<()> {
        let mut event = epoll_event {
            events,
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> WeirResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Wait for events. A signal interruption reports zero events so the
    /// caller re-enters the loop and observes the self-pipe.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> WeirResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }
            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Raw I/O ----

/// One `read` call; would-block and interruption surface as `io::Error`.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Vectored write of the header/body descriptor pair in one syscall.
pub fn writev_fd(fd: RawFd, bufs: &[&[u8]; 2]) -> io::Result<usize> {
    let iovecs = [
        libc::iovec {
            iov_base: bufs[0].as_ptr() as *mut c_void,
            iov_len: bufs[0].len(),
        },
        libc::iovec {
            iov_base: bufs[1].as_ptr() as *mut c_void,
            iov_len: bufs[1].len(),
        },
    ];
    unsafe {
        let res = libc::writev(fd, iovecs.as_ptr(), 2);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Best-effort blocking-ish send of a short message (interim responses,
/// the "server busy" notice). Short writes and transient errors are not
/// retried beyond EINTR.
pub fn send_all(fd: RawFd, data: &[u8]) {
    let mut sent = 0;
    while sent < data.len() {
        let res = unsafe {
            libc::send(
                fd,
                data[sent..].as_ptr() as *const c_void,
                data.len() - sent,
                libc::MSG_NOSIGNAL,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        sent += res as usize;
    }
}

/// Write a brief notice and close the just-accepted descriptor.
pub fn show_busy(fd: RawFd, info: &str) {
    send_all(fd, info.as_bytes());
    close_fd(fd);
}

// ---- Self-pipe and signal forwarding ----

/// Write end of the self-pipe, published for the signal handler.
static SIGNAL_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

/// Connected descriptor pair: `(read_end, write_end)`. The write end is
/// non-blocking so a handler can never stall the process.
pub fn create_signal_pair() -> WeirResult<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::socketpair(libc::PF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        set_nonblocking(fds[0]);
        set_nonblocking(fds[1]);
    }
    Ok((fds[0], fds[1]))
}

pub fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

/// Async-signal-safe forwarder: exactly one write of the signal number.
extern "C" fn forward_signal(sig: c_int) {
    unsafe {
        let saved = *libc::__errno_location();
        let fd = SIGNAL_PIPE_WR.load(Ordering::Relaxed);
        if fd >= 0 {
            let byte = sig as u8;
            libc::send(fd, &byte as *const u8 as *const c_void, 1, libc::MSG_NOSIGNAL);
        }
        *libc::__errno_location() = saved;
    }
}

fn add_signal(sig: c_int, handler: libc::sighandler_t) -> WeirResult<()> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handler;
        libc::sigfillset(&mut sa.sa_mask);
        if libc::sigaction(sig, &sa, ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Install SIGALRM and SIGTERM forwarders over the self-pipe and ignore
/// SIGPIPE. Must run before the first `alarm`.
pub fn install_signal_handlers(pipe_wr: RawFd) -> WeirResult<()> {
    SIGNAL_PIPE_WR.store(pipe_wr, Ordering::SeqCst);
    add_signal(libc::SIGPIPE, libc::SIG_IGN)?;
    add_signal(libc::SIGALRM, forward_signal as usize)?;
    add_signal(libc::SIGTERM, forward_signal as usize)?;
    Ok(())
}

pub fn arm_alarm(seconds: u32) {
    unsafe {
        libc::alarm(seconds);
    }
}

// ---- Worker completion eventfd ----

/// Non-blocking eventfd used to surface worker close requests as
/// ordinary multiplexer events.
pub fn create_eventfd() -> WeirResult<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(fd)
}

/// Bump the eventfd counter. EAGAIN means a wakeup is already pending,
/// which is all we need.
pub fn eventfd_notify(fd: RawFd) {
    let val: u64 = 1;
    unsafe {
        libc::write(fd, &val as *const u64 as *const c_void, mem::size_of::<u64>());
    }
}

/// Reset the eventfd counter.
pub fn eventfd_drain(fd: RawFd) {
    let mut val: u64 = 0;
    unsafe {
        libc::read(fd, &mut val as *mut u64 as *mut c_void, mem::size_of::<u64>());
    }
}
