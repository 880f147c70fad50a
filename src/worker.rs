// src/worker.rs
//! Worker pool: N detached threads draining a bounded FIFO of
//! (connection, intent) tasks. The queue is a mutex-guarded deque paired
//! with a counting semaphore posted exactly once per successful push; a
//! worker never holds the queue mutex across request processing.

use crate::conn::{Conn, HttpState, WriteOutcome};
use crate::http::RequestOutcome;
use crate::parser::{self, ParseResult};
use crate::routes::{self, RouteCtx};
use crate::server::ServerCtx;
use crate::sync::Semaphore;
use crate::syscalls::{self, EPOLLIN, EPOLLOUT};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, warn};

/// What the worker is asked to do with the borrowed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Drain the socket, then parse and respond (workers-read mode).
    Read,
    /// Drive the response writer (workers-write mode).
    Write,
    /// Parse and respond over already-filled bytes (main-reads mode).
    Process,
}

pub struct Task {
    pub conn: Arc<Conn>,
    pub intent: Intent,
}

struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    ready: Semaphore,
    capacity: usize,
}

pub struct WorkerPool {
    queue: Arc<TaskQueue>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(TaskQueue {
                tasks: Mutex::new(VecDeque::new()),
                ready: Semaphore::new(0),
                capacity,
            }),
        }
    }

    /// Fail-fast append; the semaphore is posted once per success.
    pub fn append(&self, task: Task) -> bool {
        {
            let mut tasks = self.queue.tasks.lock().unwrap();
            if tasks.len() >= self.queue.capacity {
                return false;
            }
            tasks.push_back(task);
        }
        self.queue.ready.release();
        true
    }

    pub fn len(&self) -> usize {
        self.queue.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the detached worker threads, pinned round-robin to cores
    /// when the platform exposes them.
    pub fn spawn(&self, count: usize, ctx: Arc<ServerCtx>) {
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        for i in 0..count {
            let queue = self.queue.clone();
            let ctx = ctx.clone();
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[i % core_ids.len()])
            };
            let _ = thread::Builder::new()
                .name(format!("weir-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        core_affinity::set_for_current(id);
                    }
                    loop {
                        queue.ready.acquire();
                        let task = queue.tasks.lock().unwrap().pop_front();
                        let Some(task) = task else { continue };
                        run_task(&ctx, task);
                    }
                });
        }
    }
}

fn run_task(ctx: &ServerCtx, task: Task) {
    let fd = task.conn.fd;
    match task.intent {
        Intent::Read => {
            let mut state = task.conn.state.lock().unwrap();
            match state.read_drain(fd) {
                Ok(true) => process_request(ctx, &task.conn, &mut state),
                Ok(false) => ctx.request_close(fd),
                Err(e) => {
                    debug!("read error on fd {}: {}", fd, e);
                    ctx.request_close(fd);
                }
            }
        }
        Intent::Write => {
            let mut state = task.conn.state.lock().unwrap();
            match state.write_response(fd, &ctx.epoll, ctx.conn_et) {
                WriteOutcome::Close => ctx.request_close(fd),
                WriteOutcome::Continue | WriteOutcome::KeepAlive => {}
            }
        }
        Intent::Process => {
            let mut state = task.conn.state.lock().unwrap();
            process_request(ctx, &task.conn, &mut state);
        }
    }
}

/// Run the parser over the buffered bytes and, on a complete request,
/// route it and stage the response. The side finishing a transition
/// re-arms the one-shot registration: read interest while the request is
/// incomplete, write interest once a response is staged.
pub fn process_request(ctx: &ServerCtx, conn: &Arc<Conn>, state: &mut HttpState) {
    let fd = conn.fd;
    // Credential-store handle held for the duration of routing.
    let handle = ctx.store_pool.acquire();

    let outcome = match parser::process_read(conn, state, &ctx.stats, fd) {
        ParseResult::Incomplete => {
            let _ = ctx
                .epoll
                .modify(fd, syscalls::event_mask(EPOLLIN, ctx.conn_et, true));
            return;
        }
        ParseResult::Bad => RequestOutcome::Bad,
        ParseResult::Oversize => {
            // Policy responses close after writing.
            state.linger = false;
            RequestOutcome::Dynamic
        }
        ParseResult::Complete => {
            let route_ctx = RouteCtx {
                users: &*ctx.users,
                store: &**handle,
                stats: &*ctx.stats,
                docroot: ctx.docroot.as_path(),
            };
            routes::do_request(state, &route_ctx)
        }
    };

    if matches!(outcome, RequestOutcome::Bad | RequestOutcome::Internal) {
        state.linger = false;
    }

    ctx.stats.inc_requests();

    if !state.stage_response(outcome) {
        warn!("response head overflow on fd {}", fd);
        ctx.request_close(fd);
        return;
    }
    let _ = ctx
        .epoll
        .modify(fd, syscalls::event_mask(EPOLLOUT, ctx.conn_et, true));
}
