// src/server.rs
//! Event-loop dispatcher: owns the multiplexer, the listener, the
//! self-pipe, the connection table, the timer list and the worker pool.
//! Accepts connections, forwards signals, dispatches ready descriptors,
//! drains worker close requests, and ticks the timer list on alarm.

use crate::config::{Config, TIMESLOT};
use crate::conn::{Conn, WriteOutcome};
use crate::error::{WeirError, WeirResult};
use crate::pool::Pool;
use crate::stats::{normalize_ip, Stats};
use crate::syscalls::{
    self, epoll_event, Epoll, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP,
};
use crate::timer::TimerList;
use crate::users::{CredentialStore, UserTable};
use crate::worker::{Intent, Task, WorkerPool};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

/// Connection table bound; also the connection-count cap.
pub const MAX_FD: usize = 65536;
/// Epoll batch size.
pub const MAX_EVENT_NUMBER: usize = 10000;

const BUSY_MESSAGE: &str = "Internal server busy";

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Shared state workers receive from the dispatcher. Process-wide
/// singletons are handed in at construction, never fetched lazily.
pub struct ServerCtx {
    pub epoll: Epoll,
    pub conn_et: bool,
    pub docroot: PathBuf,
    pub stats: Arc<Stats>,
    pub users: Arc<UserTable>,
    pub store_pool: Arc<Pool<Arc<dyn CredentialStore>>>,
    close_requests: Mutex<VecDeque<RawFd>>,
    close_efd: RawFd,
}

impl ServerCtx {
    /// Ask the dispatcher to close a connection. Workers never touch the
    /// timer list directly; the request travels over the completion
    /// eventfd and the dispatcher performs the close.
    pub fn request_close(&self, fd: RawFd) {
        self.close_requests.lock().unwrap().push_back(fd);
        syscalls::eventfd_notify(self.close_efd);
    }
}

/// Writes the stop byte into the self-pipe, exactly as the SIGTERM
/// handler would.
#[derive(Clone, Copy)]
pub struct ShutdownHandle {
    pipe_wr: RawFd,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        syscalls::send_all(self.pipe_wr, &[libc::SIGTERM as u8]);
    }
}

pub struct Server {
    cfg: Config,
    ctx: Arc<ServerCtx>,
    listen_fd: RawFd,
    pipe_rd: RawFd,
    pipe_wr: RawFd,
    port: u16,
    conns: Vec<Option<Arc<Conn>>>,
    timers: TimerList,
    workers: WorkerPool,
}

impl Server {
    /// Bind the listener, create the multiplexer, self-pipe and
    /// completion eventfd, install the signal forwarders, arm the first
    /// alarm, and spawn the worker pool.
    pub fn bind(
        cfg: Config,
        users: Arc<UserTable>,
        store_pool: Arc<Pool<Arc<dyn CredentialStore>>>,
        stats: Arc<Stats>,
    ) -> WeirResult<Self> {
        let listen_fd = syscalls::create_listen_socket(cfg.port, cfg.opt_linger == 1)?;
        let port = syscalls::local_port(listen_fd)?;

        let epoll = Epoll::new()?;
        epoll.add(
            listen_fd,
            syscalls::event_mask(EPOLLIN, cfg.listen_et(), false),
        )?;

        let (pipe_rd, pipe_wr) = syscalls::create_signal_pair()?;
        epoll.add(pipe_rd, syscalls::event_mask(EPOLLIN, false, false))?;

        let close_efd = syscalls::create_eventfd()?;
        epoll.add(close_efd, syscalls::event_mask(EPOLLIN, false, false))?;

        let ctx = Arc::new(ServerCtx {
            epoll,
            conn_et: cfg.conn_et(),
            docroot: cfg.docroot(),
            stats,
            users,
            store_pool,
            close_requests: Mutex::new(VecDeque::new()),
            close_efd,
        });

        syscalls::install_signal_handlers(pipe_wr)?;
        syscalls::arm_alarm(TIMESLOT);

        let workers = WorkerPool::new(10000);
        workers.spawn(cfg.worker_count(), ctx.clone());

        info!(
            "listening on port {} (docroot {}, trigger {}+{}, {} workers, {})",
            port,
            ctx.docroot.display(),
            if cfg.listen_et() { "ET" } else { "LT" },
            if cfg.conn_et() { "ET" } else { "LT" },
            cfg.worker_count(),
            if cfg.reactor() {
                "workers read"
            } else {
                "main thread reads"
            },
        );

        let mut conns = Vec::with_capacity(MAX_FD);
        conns.resize_with(MAX_FD, || None);

        Ok(Self {
            cfg,
            ctx,
            listen_fd,
            pipe_rd,
            pipe_wr,
            port,
            conns,
            timers: TimerList::new(),
            workers,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            pipe_wr: self.pipe_wr,
        }
    }

    /// Main dispatch loop; returns after a stop request.
    pub fn run(&mut self) -> WeirResult<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENT_NUMBER];
        let mut timeout = false;
        let mut stop = false;

        while !stop {
            let n = match self.ctx.epoll.wait(&mut events, -1) {
                Ok(n) => n,
                Err(WeirError::Io(e)) => {
                    error!("epoll failure: {}", e);
                    return Err(WeirError::Io(e));
                }
                Err(e) => return Err(e),
            };

            for event in &events[..n] {
                let fd = event.u64 as RawFd;
                let ev = event.events;

                if fd == self.listen_fd {
                    self.accept_all();
                } else if fd == self.pipe_rd {
                    self.drain_signals(&mut timeout, &mut stop);
                } else if fd == self.ctx.close_efd {
                    self.drain_close_requests();
                } else if ev & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0 {
                    self.close_with_timer(fd);
                } else if ev & EPOLLIN as u32 != 0 {
                    self.on_read_ready(fd);
                } else if ev & EPOLLOUT as u32 != 0 {
                    self.on_write_ready(fd);
                }
            }

            if timeout {
                for fd in self.timers.tick(unix_now()) {
                    info!("idle timeout on fd {}", fd);
                    self.close_with_timer(fd);
                }
                syscalls::arm_alarm(TIMESLOT);
                timeout = false;
            }
        }

        syscalls::close_fd(self.listen_fd);
        info!("dispatcher stopped");
        Ok(())
    }

    /// LT accepts exactly one connection per event; ET drains the accept
    /// queue until would-block.
    fn accept_all(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => {
                    if fd as usize >= MAX_FD || self.ctx.stats.live_connections() >= MAX_FD {
                        warn!("connection cap reached, refusing fd {}", fd);
                        syscalls::show_busy(fd, BUSY_MESSAGE);
                    } else {
                        self.init_connection(fd, peer);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("accept error: {}", e);
                    break;
                }
            }
            if !self.cfg.listen_et() {
                break;
            }
        }
    }

    fn init_connection(&mut self, fd: RawFd, peer: std::net::SocketAddr) {
        syscalls::set_socket_buffers(fd);
        let ip = normalize_ip(&peer.ip().to_string());
        self.ctx.stats.on_connect(&ip);
        self.conns[fd as usize] = Some(Arc::new(Conn::new(fd, peer, ip)));

        if let Err(e) = self
            .ctx
            .epoll
            .add(fd, syscalls::event_mask(EPOLLIN, self.cfg.conn_et(), true))
        {
            error!("epoll add failed for fd {}: {}", fd, e);
            let conn = self.conns[fd as usize].take();
            if let Some(conn) = conn {
                self.ctx.stats.on_close(&conn.current_ip());
            }
            syscalls::close_fd(fd);
            return;
        }
        self.timers.add(fd, unix_now() + 3 * TIMESLOT as i64);
    }

    /// Read up to 1 KiB of forwarded signal numbers from the self-pipe.
    fn drain_signals(&mut self, timeout: &mut bool, stop: &mut bool) {
        let mut signals = [0u8; 1024];
        let n = match syscalls::read_fd(self.pipe_rd, &mut signals) {
            Ok(n) => n,
            Err(_) => return,
        };
        for &sig in &signals[..n] {
            if sig == libc::SIGALRM as u8 {
                *timeout = true;
            } else if sig == libc::SIGTERM as u8 {
                *stop = true;
            }
        }
    }

    /// Worker close requests arrive as completion events on the eventfd.
    fn drain_close_requests(&mut self) {
        syscalls::eventfd_drain(self.ctx.close_efd);
        let pending: Vec<RawFd> = self.ctx.close_requests.lock().unwrap().drain(..).collect();
        for fd in pending {
            self.close_with_timer(fd);
        }
    }

    fn on_read_ready(&mut self, fd: RawFd) {
        let Some(conn) = self.conns.get(fd as usize).and_then(|c| c.clone()) else {
            return;
        };

        if self.cfg.reactor() {
            self.timers.adjust(fd, unix_now() + 3 * TIMESLOT as i64);
            if !self.workers.append(Task {
                conn,
                intent: Intent::Read,
            }) {
                warn!("worker queue full, dropping read event on fd {}", fd);
            }
            return;
        }

        // Main thread performs the read drain, workers just process.
        let drained = conn.state.lock().unwrap().read_drain(fd);
        match drained {
            Ok(true) => {
                self.timers.adjust(fd, unix_now() + 3 * TIMESLOT as i64);
                if !self.workers.append(Task {
                    conn,
                    intent: Intent::Process,
                }) {
                    warn!("worker queue full, dropping task for fd {}", fd);
                }
            }
            Ok(false) => self.close_with_timer(fd),
            Err(_) => self.close_with_timer(fd),
        }
    }

    fn on_write_ready(&mut self, fd: RawFd) {
        let Some(conn) = self.conns.get(fd as usize).and_then(|c| c.clone()) else {
            return;
        };

        if self.cfg.reactor() {
            self.timers.adjust(fd, unix_now() + 3 * TIMESLOT as i64);
            if !self.workers.append(Task {
                conn,
                intent: Intent::Write,
            }) {
                warn!("worker queue full, dropping write event on fd {}", fd);
            }
            return;
        }

        let outcome = conn
            .state
            .lock()
            .unwrap()
            .write_response(fd, &self.ctx.epoll, self.cfg.conn_et());
        match outcome {
            WriteOutcome::Continue | WriteOutcome::KeepAlive => {
                self.timers.adjust(fd, unix_now() + 3 * TIMESLOT as i64);
            }
            WriteOutcome::Close => self.close_with_timer(fd),
        }
    }

    /// Close path shared by hangups, timeouts, worker requests and
    /// dispatcher-side failures: IP bookkeeping, multiplexer
    /// deregistration, descriptor close, timer unlink.
    fn close_with_timer(&mut self, fd: RawFd) {
        let Some(slot) = self.conns.get_mut(fd as usize) else {
            return;
        };
        let Some(conn) = slot.take() else {
            return;
        };
        let ip = conn.current_ip();
        let _ = self.ctx.epoll.delete(fd);
        syscalls::close_fd(fd);
        self.ctx.stats.on_close(&ip);
        self.timers.remove(fd);
        info!("close fd {}", fd);
    }
}
