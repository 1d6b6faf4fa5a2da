//! Accept loop: one task per accepted connection, all pinned to the current
//! thread (spec.md §4.1, §5).
//!
//! Grounded on the teacher's `system/protocol/server.rs` accept loop
//! (`TcpListener::accept` in a loop, one task per connection, a shutdown
//! flag checked each iteration) but using `spawn_local`/`LocalSet` instead
//! of `tokio::spawn`, since a `Follower`'s `Rc<RefCell<_>>` peer reference
//! is not `Send`.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::unix::io::FromRawFd;
use std::rc::Rc;

use tokio::net::TcpListener;
use tokio::task::LocalSet;

/// Resolve the upstream `host:port` to a concrete address, once, at startup
/// (spec.md §4.1: "resolves the upstream address once at startup") — every
/// accepted connection then `connect`s to this same `SocketAddr` instead of
/// re-resolving the hostname on every accept.
async fn resolve_upstream(args: &Args) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host((args.upstream_host.as_str(), args.upstream_port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!(
                    "could not resolve upstream address {}:{}",
                    args.upstream_host, args.upstream_port
                ),
            )
        })
}

use crate::config::Args;
use crate::connection::Connection;
use crate::timer::TimerSet;
use crate::trace::TraceWriter;

/// Bind a listen socket on loopback with `SO_REUSEADDR` set and the
/// platform's maximum backlog (spec.md §4.1, §6) — `tokio::net::TcpListener`
/// alone doesn't expose either knob, so the socket is built with raw libc
/// calls and handed to tokio via `from_std`, the way a systems proxy reaches
/// past the portable wrapper for options it doesn't expose.
fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    use std::io;

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let reuse: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuse as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }

    let sockaddr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(match addr.ip() {
                std::net::IpAddr::V4(v4) => v4.octets(),
                std::net::IpAddr::V6(_) => {
                    unsafe { libc::close(fd) };
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "only IPv4 loopback is supported",
                    ));
                }
            }),
        },
        sin_zero: [0; 8],
    };

    let rc = unsafe {
        libc::bind(
            fd,
            &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }

    let rc = unsafe { libc::listen(fd, libc::SOMAXCONN) };
    if rc < 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }

    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
    if rc < 0 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }

    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    TcpListener::from_std(std_listener)
}

pub struct Proxy {
    args: Args,
    trace: Rc<RefCell<TraceWriter<std::io::Stdout>>>,
    timers: Rc<RefCell<TimerSet>>,
}

impl Proxy {
    pub fn new(args: Args, timers: Rc<RefCell<TimerSet>>) -> Proxy {
        Proxy {
            args,
            trace: Rc::new(RefCell::new(TraceWriter::new(std::io::stdout()))),
            timers,
        }
    }

    /// Bind the listen address and accept connections until the given
    /// shutdown signal resolves (spec.md §6).
    pub async fn run(self, local: &LocalSet, shutdown: impl std::future::Future<Output = ()>) {
        let listener = match bind_listener(self.args.listen_addr()) {
            Ok(l) => l,
            Err(e) => {
                log::error!("failed to bind {}: {e}", self.args.listen_addr());
                return;
            }
        };
        let upstream_addr = match resolve_upstream(&self.args).await {
            Ok(a) => a,
            Err(e) => {
                log::error!("failed to resolve upstream {}: {e}", self.args.upstream_host_header());
                return;
            }
        };
        log::info!(
            "listening on {}, forwarding to {} ({upstream_addr})",
            self.args.listen_addr(),
            self.args.upstream_host_header()
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    log::info!("shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((client, peer)) => self.spawn_connection(local, client, peer, upstream_addr),
                        Err(e) => log::warn!("accept failed: {e}"),
                    }
                }
            }
        }
    }

    fn spawn_connection(
        &self,
        local: &LocalSet,
        client: tokio::net::TcpStream,
        peer: std::net::SocketAddr,
        upstream_addr: SocketAddr,
    ) {
        let conn_id = crate::id::next_connection_id();
        let trace = self.trace.clone();
        let timers = self.timers.clone();
        let args = self.args.clone();

        local.spawn_local(async move {
            let upstream = match tokio::net::TcpStream::connect(upstream_addr).await {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("conn {conn_id}: failed to connect to upstream {upstream_addr}: {e}");
                    return;
                }
            };
            log::debug!("conn {conn_id}: accepted from {peer}");
            let conn = Connection::new(conn_id, client, upstream, &args, trace, timers.clone());
            conn.run(timers).await;
            log::debug!("conn {conn_id}: closed");
        });
    }
}
