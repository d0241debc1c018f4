//! The raw TCP layer: non-blocking connect, listen/accept, read/write with
//! waittype re-arm, and graceful disconnect.
//!
//! Hosts here must be IP literals; hostname resolution belongs to the
//! DNS-aware connector in [`netdns`](super::netdns).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use log::trace;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::IoError;
use crate::event::{CapsMask, EventType, Timer, WaitMask};

use super::{posix, Io, IoKind, IoState, Layer, LayerCtx};

pub(crate) const LAYER_NAME: &str = "NET";

/// Address family selection for clients and listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetType {
    /// IPv4 or IPv6, whichever the address (or system) provides.
    Any,
    Ipv4,
    Ipv6,
}

/// Per-object TCP tunables, inherited by accepted children and the
/// connector's race attempts.
#[derive(Debug, Clone)]
pub struct NetSettings {
    pub connect_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    /// Delay before the Happy-Eyeballs connector starts its next parallel
    /// attempt.
    pub connect_failover_ms: u64,

    pub ka_enable: bool,
    pub ka_idle_time_s: u64,
    pub ka_retry_time_s: u64,
    pub ka_retry_cnt: u64,

    pub nagle_enable: bool,
}

impl Default for NetSettings {
    fn default() -> NetSettings {
        NetSettings {
            connect_timeout_ms: 10_000,
            disconnect_timeout_ms: 10_000,
            connect_failover_ms: 100,
            ka_enable: false,
            ka_idle_time_s: 0,
            ka_retry_time_s: 0,
            ka_retry_cnt: 0,
            nagle_enable: false,
        }
    }
}

/// Parse an IP literal into a connectable/bindable address. Hostnames are
/// rejected here by design.
fn addr2peer(addr: &str, port: u16) -> Option<(SocketAddr, NetType)> {
    let ip: IpAddr = addr.parse().ok()?;
    let net_type = match ip {
        IpAddr::V4(_) => NetType::Ipv4,
        IpAddr::V6(_) => NetType::Ipv6,
    };
    Some((SocketAddr::new(ip, port), net_type))
}

pub(crate) struct NetLayer {
    host: String,
    port: u16,
    eport: u16,
    net_type: NetType,
    state: IoState,
    pub(crate) settings: NetSettings,
    sock: Option<Socket>,
    last_error_sys: i32,
    last_error: IoError,
    /// Set once a fatal read/write error closed the handle; guards the
    /// sanity checks in read/write.
    hard_down: bool,
    /// A terminal Disconnected/Error already went up; later ones are
    /// consumed so the user sees the transition exactly once.
    notify_down: bool,
    server_ipaddr: Option<String>,
    timer: Option<Timer>,
}

impl NetLayer {
    fn new(host: &str, port: u16, net_type: NetType) -> NetLayer {
        NetLayer {
            host: host.to_string(),
            port,
            eport: 0,
            net_type,
            state: IoState::Init,
            settings: NetSettings::default(),
            sock: None,
            last_error_sys: 0,
            last_error: IoError::Success,
            hard_down: false,
            notify_down: false,
            server_ipaddr: None,
            timer: None,
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.sock.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1)
    }

    fn record_error(&mut self, err: &std::io::Error) -> IoError {
        self.last_error_sys = err.raw_os_error().unwrap_or(0);
        self.last_error = IoError::from_io_error(err);
        self.last_error
    }

    fn record_errno(&mut self, errno: i32) -> IoError {
        self.last_error_sys = errno;
        self.last_error = IoError::from_errno(errno);
        self.last_error
    }

    /// Close the handle, removing it from the loop and stopping any timer.
    fn handle_close(&mut self, ctx: &mut LayerCtx<'_>) {
        if matches!(
            self.state,
            IoState::Connected | IoState::Connecting | IoState::Disconnecting
        ) {
            self.state = IoState::Disconnected;
        }

        if let Some(sock) = self.sock.take() {
            ctx.handle_del(sock.as_raw_fd());
        }
        if let Some(timer) = self.timer.as_ref() {
            timer.remove();
        }
        self.timer = None;
    }

    fn read_int(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        let fd = self.raw_fd();
        if fd == -1 {
            return Err(IoError::Error);
        }

        let res = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if res == 0 {
            self.last_error_sys = 0;
            self.last_error = IoError::Disconnect;
            return Err(IoError::Disconnect);
        }
        if res < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(self.record_errno(errno));
        }
        Ok(res as usize)
    }

    fn write_int(&mut self, buf: &[u8]) -> Result<usize, IoError> {
        if self.state != IoState::Connected {
            if self.state == IoState::Disconnected {
                return Err(IoError::Disconnect);
            }
            return Err(IoError::Error);
        }

        let fd = self.raw_fd();
        #[cfg(not(any(target_os = "ios", target_os = "macos")))]
        let flags = libc::MSG_NOSIGNAL;
        // Apple platforms have no MSG_NOSIGNAL; SO_NOSIGPIPE is set on the
        // socket instead.
        #[cfg(any(target_os = "ios", target_os = "macos"))]
        let flags = 0;

        let res = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags) };
        if res == 0 {
            self.last_error = IoError::Disconnect;
            return Err(IoError::Disconnect);
        }
        if res < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(self.record_errno(errno));
        }
        Ok(res as usize)
    }

    /// Post-op waittype bookkeeping shared by read and write.
    fn readwrite_err(
        &mut self,
        ctx: &mut LayerCtx<'_>,
        is_read: bool,
        res: &Result<usize, IoError>,
        request_len: usize,
    ) {
        let fd = self.raw_fd();
        match res {
            Err(err) if !err.is_transient() => {
                // Fatal: stop waiting on everything.
                self.handle_close(ctx);
                self.state = if *err == IoError::Disconnect {
                    IoState::Disconnected
                } else {
                    IoState::Error
                };
                self.hard_down = true;
            }
            Err(_) => {
                let wt = if is_read { WaitMask::READ } else { WaitMask::WRITE };
                ctx.waittype_add(fd, wt);
            }
            Ok(n) => {
                if is_read && *n > 0 {
                    // Always re-arm reads on success: with bytes still
                    // buffered past a peer close, an unarmed read waittype
                    // would swallow the disconnect notification.
                    ctx.waittype_add(fd, WaitMask::READ);
                } else if !is_read && request_len > *n {
                    ctx.waittype_add(fd, WaitMask::WRITE);
                } else {
                    let wt = if is_read { WaitMask::READ } else { WaitMask::WRITE };
                    ctx.waittype_del_mask(fd, wt);
                }
            }
        }
    }

    fn set_ephemeral_port(&mut self) {
        let addr = self
            .sock
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .and_then(|a| a.as_socket());
        if let Some(addr) = addr {
            self.eport = addr.port();
        }
    }

    /// Options applied once the stream is up.
    fn set_sockopts(&mut self) {
        let sock = match self.sock.as_ref() {
            Some(s) => s,
            None => return,
        };

        // Nagle enabled means TCP_NODELAY off.
        if let Err(err) = sock.set_nodelay(!self.settings.nagle_enable) {
            trace!("set_nodelay failed: {}", err);
        }

        #[cfg(any(target_os = "ios", target_os = "macos"))]
        if let Err(err) = sock.set_nosigpipe(true) {
            trace!("set_nosigpipe failed: {}", err);
        }

        // Graceful close relies on shutdown(2); linger stays off.
        if let Err(err) = sock.set_linger(None) {
            trace!("set_linger failed: {}", err);
        }

        if self.settings.ka_enable {
            let ka = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(self.settings.ka_idle_time_s))
                .with_interval(Duration::from_secs(self.settings.ka_retry_time_s))
                .with_retries(self.settings.ka_retry_cnt.min(u32::MAX as u64) as u32);
            if let Err(err) = sock.set_tcp_keepalive(&ka) {
                trace!("set_tcp_keepalive failed: {}", err);
            }
        }
    }

    fn start_connect(&mut self, ctx: &mut LayerCtx<'_>, peer: SocketAddr) -> bool {
        let domain = Domain::for_address(peer);
        let sock = match Socket::new(domain, Type::STREAM, Some(Protocol::TCP)) {
            Ok(s) => s,
            Err(err) => {
                self.record_error(&err);
                return false;
            }
        };
        if let Err(err) = sock.set_nonblocking(true) {
            self.record_error(&err);
            return false;
        }

        self.state = IoState::Connecting;

        match sock.connect(&SockAddr::from(peer)) {
            Ok(()) => {
                self.sock = Some(sock);
                self.set_ephemeral_port();
                self.state = IoState::Connected;
                ctx.softevent_add(true, EventType::Connected, IoError::Success);
                ctx.handle_add(
                    self.raw_fd(),
                    WaitMask::READ,
                    CapsMask::READ | CapsMask::WRITE,
                );
                true
            }
            Err(err) => {
                let mapped = self.record_error(&err);
                if mapped != IoError::WouldBlock {
                    self.state = IoState::Error;
                    return false;
                }
                self.sock = Some(sock);
                self.set_ephemeral_port();
                true
            }
        }
    }

    fn init_stream(&mut self, ctx: &mut LayerCtx<'_>) -> bool {
        self.timer = ctx.timer_create();

        if self.state == IoState::Connected {
            // Accepted child being attached.
            ctx.softevent_add(false, EventType::Connected, IoError::Success);
            return ctx.handle_add(
                self.raw_fd(),
                WaitMask::READ,
                CapsMask::READ | CapsMask::WRITE,
            );
        }

        if self.state == IoState::Init {
            let (peer, net_type) = match addr2peer(&self.host, self.port) {
                Some(p) => p,
                None => {
                    // Not reachable through the public constructors, which
                    // validate the literal up front.
                    self.last_error = IoError::Invalid;
                    self.last_error_sys = libc::EADDRNOTAVAIL;
                    return false;
                }
            };
            self.net_type = net_type;
            if !self.start_connect(ctx, peer) {
                ctx.softevent_add(false, EventType::Error, self.last_error);
                return true;
            }
        }

        if self.state == IoState::Connecting {
            if !ctx.handle_add(
                self.raw_fd(),
                WaitMask::WRITE,
                CapsMask::READ | CapsMask::WRITE,
            ) {
                return false;
            }
            if self.settings.connect_timeout_ms != 0 {
                if let Some(timer) = self.timer.as_ref() {
                    timer.set_firecount(1);
                    timer.reset(self.settings.connect_timeout_ms);
                }
            }
        }

        if self.state == IoState::Disconnecting {
            // Re-attached mid-close; all that remains is waiting out the
            // peer.
            if !ctx.handle_add(
                self.raw_fd(),
                WaitMask::READ,
                CapsMask::READ | CapsMask::WRITE,
            ) {
                return false;
            }
            if let Some(timer) = self.timer.as_ref() {
                timer.set_firecount(1);
                timer.reset(self.settings.disconnect_timeout_ms);
            }
        }

        true
    }

    fn init_listener(&mut self, ctx: &mut LayerCtx<'_>) -> bool {
        if self.state == IoState::Listening {
            return ctx.handle_add(self.raw_fd(), WaitMask::READ, CapsMask::READ);
        }
        true
    }

    /// Resolve the outcome of a non-blocking connect once the socket
    /// signals. Zero `SO_ERROR` promotes to Connected; anything else is
    /// fatal.
    fn process_connecting(&mut self, ctx: &mut LayerCtx<'_>, ty: &mut EventType) -> bool {
        match *ty {
            EventType::Write | EventType::Read | EventType::Disconnected | EventType::Error => {}
            // Nothing else can legitimately happen mid-connect.
            _ => return true,
        }

        let so_error = self
            .sock
            .as_ref()
            .and_then(|s| s.take_error().ok())
            .flatten();
        match so_error {
            None => {
                self.last_error_sys = 0;
                self.last_error = IoError::Success;
            }
            Some(err) => {
                self.record_error(&err);
            }
        }

        if matches!(*ty, EventType::Write | EventType::Read) && self.last_error_sys == 0 {
            let fd = self.raw_fd();
            ctx.waittype_del_mask(fd, WaitMask::WRITE);
            ctx.waittype_add(fd, WaitMask::READ);

            if *ty == EventType::Read {
                // This readiness doubles as data; queue a fresh Read since
                // this event is being rewritten to Connected.
                ctx.softevent_add(false, EventType::Read, IoError::Success);
            }
            *ty = EventType::Connected;
            self.state = IoState::Connected;
            if let Some(timer) = self.timer.as_ref() {
                timer.stop();
            }
            return false;
        }

        if self.last_error_sys == 0 {
            // Seen under load on macOS: EOF during connect with no error
            // recorded.
            self.last_error_sys = libc::ECONNABORTED;
        }
        self.last_error = IoError::from_errno(self.last_error_sys);

        *ty = EventType::Error;
        self.state = IoState::Error;
        self.handle_close(ctx);
        ctx.set_error(self.last_error);
        false
    }
}

impl Layer for NetLayer {
    fn name(&self) -> &'static str {
        LAYER_NAME
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn init(&mut self, ctx: &mut LayerCtx<'_>) -> bool {
        if ctx.kind() == IoKind::Listener {
            self.init_listener(ctx)
        } else {
            self.init_stream(ctx)
        }
    }

    fn accept(&mut self, new_io: &Arc<Io>, _ctx: &mut LayerCtx<'_>) -> Result<(), IoError> {
        let listener = match self.sock.as_ref() {
            Some(s) => s,
            None => return Err(IoError::NotConnected),
        };

        let (sock, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(err) => return Err(self.record_error(&err)),
        };
        if let Err(err) = sock.set_nonblocking(true) {
            return Err(self.record_error(&err));
        }

        let mut child = NetLayer::new("", self.port, self.net_type);
        child.settings = self.settings.clone();
        child.state = IoState::Connected;

        if let Some(server) = sock.local_addr().ok().and_then(|a| a.as_socket()) {
            child.server_ipaddr = Some(rewrite_v4_mapped(server.ip()).0.to_string());
        }
        if let Some(peer) = peer.as_socket() {
            let (ip, net_type) = rewrite_v4_mapped(peer.ip());
            child.host = ip.to_string();
            child.net_type = net_type;
            child.eport = peer.port();
        }

        child.sock = Some(sock);
        new_io.add_layer(Box::new(child));
        Ok(())
    }

    fn read(&mut self, ctx: &mut LayerCtx<'_>, buf: &mut [u8]) -> Option<Result<usize, IoError>> {
        if self.hard_down
            && self.state != IoState::Connected
            && self.state != IoState::Disconnecting
        {
            return Some(Err(IoError::NotConnected));
        }

        let request_len = buf.len();
        let res = self.read_int(buf);
        self.readwrite_err(ctx, true, &res, request_len);
        Some(res)
    }

    fn write(&mut self, ctx: &mut LayerCtx<'_>, buf: &[u8]) -> Option<Result<usize, IoError>> {
        if self.state != IoState::Connected {
            return Some(Err(IoError::NotConnected));
        }

        let request_len = buf.len();
        let res = self.write_int(buf);
        self.readwrite_err(ctx, false, &res, request_len);
        Some(res)
    }

    fn process_event(&mut self, ctx: &mut LayerCtx<'_>, ty: &mut EventType) -> bool {
        // Once down, only pass the terminal events through, and only one
        // of them.
        if self.state == IoState::Disconnected || self.state == IoState::Error {
            let fd = self.raw_fd();
            if fd != -1 {
                ctx.waittype_del_mask(fd, WaitMask::READ | WaitMask::WRITE);
            }
            if matches!(*ty, EventType::Disconnected | EventType::Error) && !self.notify_down {
                self.notify_down = true;
                return false;
            }
            return true;
        }

        if self.state == IoState::Disconnecting && *ty == EventType::Write {
            return true;
        }
        if self.state == IoState::Disconnecting && *ty == EventType::Error {
            *ty = EventType::Disconnected;
        }

        if ctx.kind() == IoKind::Stream && self.state == IoState::Connecting {
            if self.process_connecting(ctx, ty) {
                return true;
            }
            // Fall through so a freshly Connected event picks up the
            // post-connect socket options below.
        }

        if ctx.kind() == IoKind::Listener {
            if matches!(*ty, EventType::Read | EventType::Accept) {
                *ty = EventType::Accept;
                return false;
            }
            return true;
        }

        // Mid-close, the peer's remaining payload is drained and thrown
        // away; only the close itself is interesting.
        if self.state == IoState::Disconnecting && *ty == EventType::Read {
            let mut buf = [0u8; 1024];
            let ioerr = loop {
                let request_len = buf.len();
                let res = self.read_int(&mut buf);
                self.readwrite_err(ctx, true, &res, request_len);
                match res {
                    Ok(n) if n == request_len => continue,
                    Ok(_) => break IoError::Success,
                    Err(err) => break err,
                }
            };

            if ioerr == IoError::Disconnect {
                *ty = EventType::Disconnected;
            } else if ioerr != IoError::Success && !ioerr.is_transient() {
                *ty = EventType::Error;
            } else {
                return true;
            }
        }

        match *ty {
            EventType::Connected => {
                self.set_sockopts();
            }
            EventType::Error => {
                if self.state == IoState::Connected && self.last_error_sys == 0 {
                    // The kernel gave no specific cause; reset-by-peer is
                    // the closest portable statement.
                    self.last_error_sys = libc::ECONNRESET;
                }
                self.state = IoState::Error;
                self.notify_down = true;
                self.last_error = IoError::from_errno(self.last_error_sys);
                ctx.set_error(self.last_error);
                // The handle stays open; the owner decides when to close.
            }
            EventType::Disconnected => {
                self.state = IoState::Disconnected;
                self.notify_down = true;
            }
            EventType::Read => {
                if self.state == IoState::Connected {
                    ctx.waittype_del_mask(self.raw_fd(), WaitMask::READ);
                }
            }
            EventType::Write => {
                if self.state == IoState::Connected {
                    ctx.waittype_del_mask(self.raw_fd(), WaitMask::WRITE);
                }
            }
            _ => {}
        }

        false
    }

    fn unregister(&mut self, ctx: &mut LayerCtx<'_>) {
        let fd = self.raw_fd();
        if fd != -1 {
            ctx.handle_del(fd);
        }
        if let Some(timer) = self.timer.take() {
            timer.remove();
        }
    }

    fn disconnect(&mut self, ctx: &mut LayerCtx<'_>) -> bool {
        if self.state != IoState::Connected || ctx.kind() != IoKind::Stream {
            // A close already in progress needs more time.
            return self.state != IoState::Disconnecting;
        }

        self.state = IoState::Disconnecting;

        let shut = self
            .sock
            .as_ref()
            .map(|s| s.shutdown(Shutdown::Write))
            .unwrap_or_else(|| Err(std::io::Error::from_raw_os_error(libc::ENOTCONN)));
        if shut.is_err() {
            // Can't close gracefully; call it disconnected.
            return true;
        }

        // The peer's close arrives as a read event.
        ctx.waittype_add(self.raw_fd(), WaitMask::READ);

        if let Some(timer) = self.timer.as_ref() {
            timer.set_firecount(1);
            timer.reset(self.settings.disconnect_timeout_ms);
        }
        false
    }

    fn timer_fired(&mut self, ctx: &mut LayerCtx<'_>) {
        match self.state {
            IoState::Connecting => {
                self.record_errno(libc::ETIMEDOUT);
                self.handle_close(ctx);
                self.state = IoState::Error;
                ctx.softevent_add(false, EventType::Error, IoError::TimedOut);
            }
            IoState::Disconnecting => {
                // The peer never finished the close handshake.
                self.handle_close(ctx);
                self.state = IoState::Disconnected;
                ctx.softevent_add(false, EventType::Disconnected, IoError::Disconnect);
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.sock = None;
        self.state = IoState::Init;
        self.hard_down = false;
        self.notify_down = false;
        self.last_error_sys = 0;
        self.last_error = IoError::Success;
        self.eport = 0;
        self.server_ipaddr = None;
        self.timer = None;
    }

    fn state(&self) -> IoState {
        self.state
    }

    fn error_msg(&self) -> Option<String> {
        if self.state == IoState::Disconnected {
            return Some("Gracefully Closed Connection".to_string());
        }
        posix::errormsg(self.last_error_sys)
    }
}

/// Rewrite an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) to plain IPv4.
fn rewrite_v4_mapped(ip: IpAddr) -> (IpAddr, NetType) {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => (IpAddr::V4(v4), NetType::Ipv4),
            None => (ip, NetType::Ipv6),
        },
        IpAddr::V4(_) => (ip, NetType::Ipv4),
    }
}

/* - - - - - constructors - - - - - */

/// Create an unattached TCP client targeting an IP literal.
pub fn client_create(host: &str, port: u16, net_type: NetType) -> Result<Arc<Io>, IoError> {
    if host.is_empty() || port == 0 {
        return Err(IoError::Invalid);
    }

    let ip: IpAddr = host.parse().map_err(|_| IoError::Invalid)?;
    let actual = match ip {
        IpAddr::V4(_) => NetType::Ipv4,
        IpAddr::V6(_) => NetType::Ipv6,
    };
    match (net_type, actual) {
        (NetType::Any, t) => t,
        (NetType::Ipv4, NetType::Ipv4) => NetType::Ipv4,
        (NetType::Ipv6, NetType::Ipv6) => NetType::Ipv6,
        _ => return Err(IoError::Invalid),
    };

    let io = Io::new(IoKind::Stream);
    io.add_layer(Box::new(NetLayer::new(host, port, actual)));
    Ok(io)
}

fn listen_bind_int(layer: &mut NetLayer) -> Result<(), IoError> {
    let mut bindip = layer.host.clone();
    if bindip.is_empty() {
        bindip = match layer.net_type {
            NetType::Any | NetType::Ipv6 => "::".to_string(),
            NetType::Ipv4 => "0.0.0.0".to_string(),
        };
    }

    let (sa, aftype) = addr2peer(&bindip, layer.port).ok_or(IoError::Invalid)?;

    // An explicit family request must match the bind address family.
    if layer.net_type == NetType::Ipv6 && aftype != NetType::Ipv6 {
        return Err(IoError::Invalid);
    }
    if layer.net_type == NetType::Ipv4 && aftype != NetType::Ipv4 {
        return Err(IoError::Invalid);
    }

    // ANY plus a concrete (non-wildcard) bind address narrows the family.
    if layer.net_type == NetType::Any && !layer.host.is_empty() && layer.host != "::" {
        layer.net_type = aftype;
    }

    let domain = Domain::for_address(sa);
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(|err| {
        layer.record_error(&err)
    })?;

    // Allow fast rebinding of our own ports; never SO_REUSEPORT, which
    // would let another process steal the bind.
    let _ = sock.set_reuse_address(true);

    if aftype == NetType::Ipv6 {
        // Some systems default V6ONLY on; state our intent either way.
        let only_v6 = layer.net_type == NetType::Ipv6;
        let _ = sock.set_only_v6(only_v6);
    }

    if let Err(err) = sock.bind(&SockAddr::from(sa)) {
        return Err(layer.record_error(&err));
    }

    layer.sock = Some(sock);

    // Port 0 means the OS picks; read back and publish the real one.
    if layer.port == 0 {
        layer.set_ephemeral_port();
        layer.port = layer.eport;
    }

    if let Err(err) = layer
        .sock
        .as_ref()
        .map(|s| s.listen(512))
        .unwrap_or_else(|| Err(std::io::Error::from_raw_os_error(libc::EBADF)))
    {
        let mapped = layer.record_error(&err);
        layer.sock = None;
        return Err(mapped);
    }

    layer.state = IoState::Listening;
    if let Some(sock) = layer.sock.as_ref() {
        let _ = sock.set_nonblocking(true);
    }
    Ok(())
}

fn listen_bind(layer: &mut NetLayer) -> Result<(), IoError> {
    match listen_bind_int(layer) {
        Ok(()) => Ok(()),
        Err(err) => {
            // IPv6 may be administratively disabled; ANY really meant any.
            if layer.net_type == NetType::Any {
                layer.sock = None;
                layer.net_type = NetType::Ipv4;
                return listen_bind_int(layer);
            }
            Err(err)
        }
    }
}

/// Create a bound, listening TCP server. Binding happens here so address
/// errors surface immediately rather than at attach time.
pub fn server_create(port: u16, bind_ip: Option<&str>, net_type: NetType) -> Result<Arc<Io>, IoError> {
    let mut layer = NetLayer::new(bind_ip.unwrap_or(""), port, net_type);
    listen_bind(&mut layer)?;

    let io = Io::new(IoKind::Listener);
    io.add_layer(Box::new(layer));
    Ok(io)
}

/* - - - - - accessors - - - - - */

fn with_net<R>(io: &Arc<Io>, f: impl FnOnce(&mut NetLayer) -> R) -> Option<R> {
    super::with_layer(io, 0, LAYER_NAME, |layer, _ctx| {
        layer.as_any_mut().downcast_mut::<NetLayer>().map(f)
    })
    .flatten()
}

pub(crate) fn set_settings(io: &Arc<Io>, settings: &NetSettings) {
    with_net(io, |net| net.settings = settings.clone());
}

pub(crate) fn update_net_settings(io: &Arc<Io>, f: &dyn Fn(&mut NetSettings)) -> bool {
    with_net(io, |net| f(&mut net.settings)).is_some()
}

/// The configured host (an IP literal, or the peer address for accepted
/// children).
pub fn get_host(io: &Arc<Io>) -> Option<String> {
    match with_net(io, |net| net.host.clone()) {
        Some(host) => Some(host),
        None => super::netdns::get_host(io),
    }
}

/// The IP address this object is (or was) talking to.
pub fn get_ipaddr(io: &Arc<Io>) -> Option<String> {
    match with_net(io, |net| net.host.clone()) {
        Some(host) => Some(host),
        None => super::netdns::get_ipaddr(io),
    }
}

/// The listener-side address an accepted connection arrived on.
pub fn get_server_ipaddr(io: &Arc<Io>) -> Option<String> {
    with_net(io, |net| net.server_ipaddr.clone()).flatten()
}

/// The configured (or ephemeral-resolved) port.
pub fn get_port(io: &Arc<Io>) -> u16 {
    match with_net(io, |net| net.port) {
        Some(port) => port,
        None => super::netdns::get_port(io).unwrap_or(0),
    }
}

/// The OS-assigned local port.
pub fn get_ephemeral_port(io: &Arc<Io>) -> u16 {
    match with_net(io, |net| net.eport) {
        Some(port) => port,
        None => super::netdns::get_ephemeral_port(io).unwrap_or(0),
    }
}

pub fn get_type(io: &Arc<Io>) -> Option<NetType> {
    match with_net(io, |net| net.net_type) {
        Some(t) => Some(t),
        None => super::netdns::get_type(io),
    }
}

/// Enable TCP keepalives; applied at the next connect.
pub fn set_keepalives(io: &Arc<Io>, idle_time_s: u64, retry_time_s: u64, retry_cnt: u64) -> bool {
    let apply = |s: &mut NetSettings| {
        s.ka_enable = true;
        s.ka_idle_time_s = idle_time_s;
        s.ka_retry_time_s = retry_time_s;
        s.ka_retry_cnt = retry_cnt;
    };
    if with_net(io, |net| apply(&mut net.settings)).is_some() {
        return true;
    }
    super::netdns::update_settings(io, apply)
}

pub fn set_nagle(io: &Arc<Io>, nagle_enable: bool) -> bool {
    let apply = move |s: &mut NetSettings| s.nagle_enable = nagle_enable;
    if with_net(io, |net| apply(&mut net.settings)).is_some() {
        return true;
    }
    super::netdns::update_settings(io, apply)
}

pub fn set_connect_timeout_ms(io: &Arc<Io>, mut timeout_ms: u64) -> bool {
    if timeout_ms == 0 {
        timeout_ms = 10;
    }
    let apply = move |s: &mut NetSettings| s.connect_timeout_ms = timeout_ms;
    if with_net(io, |net| apply(&mut net.settings)).is_some() {
        return true;
    }
    super::netdns::update_settings(io, apply)
}

pub fn get_connect_timeout_ms(io: &Arc<Io>) -> u64 {
    match with_net(io, |net| net.settings.connect_timeout_ms) {
        Some(ms) => ms,
        None => super::netdns::get_connect_timeout_ms(io).unwrap_or(0),
    }
}

/// Binary form of an IP literal: 4 bytes for IPv4, 16 for IPv6.
pub fn ipaddr_to_bin(ipaddr: &str) -> Option<Vec<u8>> {
    let ip: IpAddr = ipaddr.parse().ok()?;
    Some(match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    })
}

/// Canonical text form of a binary IP address.
pub fn bin_to_ipaddr(bin: &[u8]) -> Option<String> {
    match bin.len() {
        4 => {
            let octets: [u8; 4] = bin.try_into().ok()?;
            Some(Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = bin.try_into().ok()?;
            Some(Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr2peer_rejects_hostnames() {
        assert!(addr2peer("localhost", 80).is_none());
        assert!(addr2peer("example.com", 80).is_none());
        assert!(addr2peer("127.0.0.1", 80).is_some());
        assert!(addr2peer("::1", 80).is_some());
    }

    #[test]
    fn ip_bin_round_trip() {
        for s in ["127.0.0.1", "192.0.2.2", "2001:db8::1", "::1", "fe80::1"] {
            let bin = ipaddr_to_bin(s).unwrap();
            assert_eq!(bin_to_ipaddr(&bin).unwrap(), s);
        }
        assert_eq!(ipaddr_to_bin("127.0.0.1").unwrap().len(), 4);
        assert_eq!(ipaddr_to_bin("2001:db8::1").unwrap().len(), 16);
        assert!(ipaddr_to_bin("not-an-ip").is_none());
        assert!(bin_to_ipaddr(&[0u8; 5]).is_none());
    }

    #[test]
    fn v4_mapped_rewrite() {
        let (ip, ty) = rewrite_v4_mapped("::ffff:10.1.2.3".parse().unwrap());
        assert_eq!(ip.to_string(), "10.1.2.3");
        assert_eq!(ty, NetType::Ipv4);

        let (ip, ty) = rewrite_v4_mapped("2001:db8::1".parse().unwrap());
        assert_eq!(ip.to_string(), "2001:db8::1");
        assert_eq!(ty, NetType::Ipv6);
    }

    #[test]
    fn client_create_validates_family() {
        assert!(client_create("", 80, NetType::Any).is_err());
        assert!(client_create("127.0.0.1", 0, NetType::Any).is_err());
        assert!(client_create("127.0.0.1", 80, NetType::Ipv6).is_err());
        assert!(client_create("2001:db8::1", 80, NetType::Ipv4).is_err());
        assert!(client_create("127.0.0.1", 80, NetType::Any).is_ok());
    }
}
