//! The DNS-aware TCP connector: resolve, then race connection attempts
//! across the returned addresses (RFC 6555/8305 Happy Eyeballs).
//!
//! Each address gets its own raw net object; attempts start staggered by
//! `connect_failover_ms`. The first to connect wins and is adopted as this
//! object's transport; everything else is torn down and the per-address
//! outcomes feed the resolver's Happy-Eyeballs cache.

use std::sync::{Arc, Weak};
use std::time::Instant;

use log::trace;

use crate::dns::{Dns, DnsQuery, DnsResult, HeStatus};
use crate::error::IoError;
use crate::event::{EventLoop, EventType, Timer};
use crate::time::elapsed_ms;

use super::net::{self, NetSettings, NetType};
use super::{Io, IoKind, IoState, Layer, LayerCtx};

const LAYER_NAME: &str = "NET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Init,
    Resolving,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
}

pub(crate) struct NetDnsLayer {
    host: String,
    port: u16,
    net_type: NetType,
    state: ConnState,
    pub(crate) settings: NetSettings,
    dns: Dns,

    /// One candidate object per resolved address, in race order. Slots go
    /// `None` as attempts die.
    io_try: Vec<Option<Arc<Io>>>,
    try_idx: usize,
    /// The winning transport once connected (or the last failure, kept for
    /// its error details).
    io: Option<Arc<Io>>,
    dns_query: Option<DnsQuery>,

    error: String,
    hard_down: bool,
    timer: Option<Timer>,

    query_start: Option<Instant>,
    query_time_ms: u64,
    connect_start: Option<Instant>,
    connect_time_ms: u64,
}

impl NetDnsLayer {
    fn next_io_idx(&self) -> Option<usize> {
        ((self.try_idx + 1)..self.io_try.len()).find(|&i| self.io_try[i].is_some())
    }

    fn io_count_valid(&self) -> usize {
        self.io_try.iter().filter(|io| io.is_some()).count()
    }

    fn find_io(&self, realio: &Arc<Io>) -> usize {
        for i in 0..=self.try_idx.min(self.io_try.len().saturating_sub(1)) {
            if let Some(io) = &self.io_try[i] {
                if Arc::ptr_eq(io, realio) {
                    return i;
                }
            }
        }
        0
    }

    /// Re-arm (or disarm) the stagger timer depending on whether another
    /// candidate is waiting.
    fn happyeyeballs_timer(&mut self, ctx: &mut LayerCtx<'_>) {
        if self.timer.is_none() {
            self.timer = ctx.timer_create();
        }
        let timer = match self.timer.as_ref() {
            Some(t) => t,
            None => return,
        };

        if self.next_io_idx().is_none() {
            timer.stop();
            return;
        }
        timer.set_firecount(1);
        timer.reset(self.settings.connect_failover_ms);
    }

    /// Kick off the next candidate attempt; false when none remain.
    fn next_io_start(&mut self, ctx: &mut LayerCtx<'_>) -> bool {
        let rv = match self.next_io_idx() {
            Some(nextidx) => {
                self.try_idx = nextidx;
                if let (Some(ev), Some(parent)) = (ctx.event(), ctx.io()) {
                    if let Some(child) = &self.io_try[nextidx] {
                        attach_child(&ev, child, &parent);
                    }
                }
                true
            }
            None => false,
        };

        // Even a failed start re-evaluates the timer; it may only need
        // disarming.
        self.happyeyeballs_timer(ctx);
        rv
    }

    fn init_connect(&mut self, ctx: &mut LayerCtx<'_>) -> bool {
        let first_idx = match self.io_try.iter().position(|io| io.is_some()) {
            Some(i) => i,
            None => return false,
        };

        self.state = ConnState::Connecting;
        self.connect_start = Some(Instant::now());

        self.try_idx = first_idx;
        if let (Some(ev), Some(parent)) = (ctx.event(), ctx.io()) {
            if let Some(child) = &self.io_try[first_idx] {
                attach_child(&ev, child, &parent);
            }
        }
        self.happyeyeballs_timer(ctx);
        true
    }

    /// First attempt to report Connected wins the race.
    fn handle_connect(&mut self, ctx: &mut LayerCtx<'_>, realio: &Arc<Io>) {
        let idx = self.find_io(realio);

        // Older siblings were given a head start and lost: mark them slow.
        for i in 0..idx {
            if let Some(io) = self.io_try[i].take() {
                if let Some(ip) = net::get_ipaddr(&io) {
                    self.dns.happyeyeballs_update(&ip, HeStatus::Slow);
                }
                io.destroy();
            }
        }
        // Younger siblings never got a chance; no verdict on them.
        for i in (idx + 1)..self.io_try.len() {
            if let Some(io) = self.io_try[i].take() {
                io.destroy();
            }
        }

        if let Some(timer) = self.timer.as_ref() {
            timer.stop();
        }

        if let Some(ip) = net::get_ipaddr(realio) {
            self.dns.happyeyeballs_update(&ip, HeStatus::Good);
        }
        self.io = Some(Arc::clone(realio));
        self.state = ConnState::Connected;
        self.connect_time_ms = self.connect_start.as_ref().map(elapsed_ms).unwrap_or(0);
        ctx.softevent_add(true, EventType::Connected, IoError::Success);

        self.io_try.clear();
        self.try_idx = 0;
    }

    fn handle_connect_error(&mut self, ctx: &mut LayerCtx<'_>, realio: &Arc<Io>) {
        let idx = self.find_io(realio);

        if let Some(ip) = net::get_ipaddr(realio) {
            self.dns.happyeyeballs_update(&ip, HeStatus::Bad);
        }

        if !self.next_io_start(ctx) && self.io_count_valid() == 1 {
            // That was the last one; keep the object so its error details
            // remain readable.
            let err = realio.last_error();
            self.io = Some(Arc::clone(realio));
            self.state = ConnState::Error;
            self.connect_time_ms = self.connect_start.as_ref().map(elapsed_ms).unwrap_or(0);
            ctx.softevent_add(true, EventType::Error, err);

            self.io_try.clear();
            self.try_idx = 0;
            return;
        }

        if let Some(io) = self.io_try.get_mut(idx).and_then(|s| s.take()) {
            io.destroy();
        }
    }

    /// Events from a candidate (or the adopted) net object.
    fn realio_event(&mut self, ctx: &mut LayerCtx<'_>, ty: EventType, realio: &Arc<Io>) {
        if self.state == ConnState::Disconnected || self.state == ConnState::Error {
            return;
        }

        match ty {
            EventType::Connected => self.handle_connect(ctx, realio),
            EventType::Read | EventType::Write => {
                // Relayed to self (not the sibling) so ordering against the
                // disconnect relay below is preserved.
                ctx.softevent_add(false, ty, IoError::Success);
            }
            EventType::Disconnected => {
                // State changes only once the event comes back through
                // process_event, which re-orders a pending Read first so
                // buffered bytes can be drained.
                ctx.softevent_add(false, EventType::Disconnected, IoError::Disconnect);
            }
            EventType::Error => {
                if self.state == ConnState::Connecting {
                    self.handle_connect_error(ctx, realio);
                } else {
                    ctx.softevent_add(false, EventType::Error, realio.last_error());
                }
            }
            EventType::Accept | EventType::Other => {}
        }
    }

    fn dns_response(&mut self, ctx: &mut LayerCtx<'_>, result: DnsResult, ips: Vec<String>) {
        self.dns_query = None;
        self.query_time_ms = self.query_start.as_ref().map(elapsed_ms).unwrap_or(0);

        if result != DnsResult::Success && result != DnsResult::SuccessCache {
            self.state = ConnState::Error;
            self.error = match result {
                DnsResult::ServFail => "DNS Server Failure".to_string(),
                DnsResult::NotFound => "Host not found".to_string(),
                DnsResult::Timeout => "DNS Timeout".to_string(),
                DnsResult::Invalid => "DNS Invalid Request".to_string(),
                DnsResult::Success | DnsResult::SuccessCache => String::new(),
            };
            ctx.softevent_add(true, EventType::Error, IoError::NotFound);
            return;
        }

        self.io_try = ips
            .iter()
            .map(|ip| {
                let io = net::client_create(ip, self.port, NetType::Any).ok();
                if let Some(io) = &io {
                    net::set_settings(io, &self.settings);
                }
                io
            })
            .collect();

        if !self.init_connect(ctx) {
            self.state = ConnState::Error;
            self.error = "Unable to start IP connection".to_string();
            ctx.softevent_add(true, EventType::Error, IoError::NotFound);
        }
    }
}

/// Register a candidate with the loop, relaying its events back into the
/// parent connector layer.
fn attach_child(ev: &EventLoop, child: &Arc<Io>, parent: &Arc<Io>) {
    let weak = Arc::downgrade(parent);
    ev.add(child, move |_ev, ty, realio| {
        realio_cb(&weak, ty, realio);
    });
}

fn realio_cb(parent: &Weak<Io>, ty: EventType, realio: &Arc<Io>) {
    let parent = match parent.upgrade() {
        Some(p) => p,
        None => return,
    };
    super::with_layer(&parent, 0, LAYER_NAME, |layer, ctx| {
        if let Some(nd) = layer.as_any_mut().downcast_mut::<NetDnsLayer>() {
            nd.realio_event(ctx, ty, realio);
        }
    });
}

impl Layer for NetDnsLayer {
    fn name(&self) -> &'static str {
        LAYER_NAME
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn init(&mut self, ctx: &mut LayerCtx<'_>) -> bool {
        match self.state {
            ConnState::Init => {
                let (ev, parent) = match (ctx.event(), ctx.io()) {
                    (Some(ev), Some(io)) => (ev, io),
                    _ => return false,
                };
                self.state = ConnState::Resolving;
                self.query_start = Some(Instant::now());
                trace!("resolving {}", self.host);

                // The response always lands via a queued task so the reply
                // never re-enters this object while it is being set up.
                let weak = Arc::downgrade(&parent);
                let relay_ev = ev.clone();
                self.dns_query = self.dns.gethostbyname(
                    &ev,
                    &self.host,
                    self.port,
                    self.net_type,
                    move |result, ips| {
                        let weak = weak.clone();
                        let mut once = Some((result, ips));
                        relay_ev.queue_task(move |_| {
                            let (result, ips) = match once.take() {
                                Some(v) => v,
                                None => return,
                            };
                            let parent = match weak.upgrade() {
                                Some(p) => p,
                                None => return,
                            };
                            super::with_layer(&parent, 0, LAYER_NAME, |layer, ctx| {
                                if let Some(nd) =
                                    layer.as_any_mut().downcast_mut::<NetDnsLayer>()
                                {
                                    nd.dns_response(ctx, result, ips);
                                }
                            });
                        });
                    },
                );
            }
            ConnState::Connecting => {
                // Re-attached mid-race: re-bind every live candidate.
                if !self.init_connect(ctx) {
                    return false;
                }
            }
            ConnState::Connected => {
                ctx.softevent_add(true, EventType::Connected, IoError::Success);
                if let (Some(ev), Some(parent), Some(child)) =
                    (ctx.event(), ctx.io(), self.io.clone())
                {
                    attach_child(&ev, &child, &parent);
                }
            }
            ConnState::Disconnecting => {
                if let (Some(ev), Some(parent), Some(child)) =
                    (ctx.event(), ctx.io(), self.io.clone())
                {
                    attach_child(&ev, &child, &parent);
                }
            }
            ConnState::Resolving | ConnState::Disconnected | ConnState::Error => {}
        }
        true
    }

    fn read(&mut self, _ctx: &mut LayerCtx<'_>, buf: &mut [u8]) -> Option<Result<usize, IoError>> {
        let child = match &self.io {
            Some(io) => Arc::clone(io),
            None => return Some(Err(IoError::Invalid)),
        };

        if self.hard_down && self.state != ConnState::Connected {
            if self.state == ConnState::Disconnected {
                return Some(Err(IoError::Disconnect));
            }
            return Some(Err(IoError::Error));
        }

        let res = child.read(buf);
        if let Err(err) = &res {
            if !err.is_transient() {
                self.state = if *err == IoError::Disconnect {
                    ConnState::Disconnected
                } else {
                    ConnState::Error
                };
                self.hard_down = true;
            }
        }
        Some(res)
    }

    fn write(&mut self, _ctx: &mut LayerCtx<'_>, buf: &[u8]) -> Option<Result<usize, IoError>> {
        let child = match &self.io {
            Some(io) => Arc::clone(io),
            None => return Some(Err(IoError::Invalid)),
        };

        if self.state != ConnState::Connected && self.state != ConnState::Disconnecting {
            if self.state == ConnState::Disconnected {
                return Some(Err(IoError::Disconnect));
            }
            return Some(Err(IoError::Error));
        }

        let res = child.write(buf);
        if let Err(err) = &res {
            if !err.is_transient() {
                self.hard_down = true;
                self.state = if *err == IoError::Disconnect {
                    ConnState::Disconnected
                } else {
                    ConnState::Error
                };
            }
        }
        Some(res)
    }

    fn process_event(&mut self, _ctx: &mut LayerCtx<'_>, ty: &mut EventType) -> bool {
        // Only soft events arrive here (the OS handles belong to the
        // children); filter what the user shouldn't see.
        if self.state == ConnState::Disconnecting && *ty == EventType::Write {
            return true;
        }

        if *ty == EventType::Disconnected {
            self.state = ConnState::Disconnected;
        }
        if *ty == EventType::Error {
            self.state = ConnState::Error;
        }
        false
    }

    fn unregister(&mut self, ctx: &mut LayerCtx<'_>) {
        if let Some(timer) = self.timer.take() {
            timer.remove();
        }

        let ev = ctx.event();

        if self.state == ConnState::Connecting {
            if let Some(ev) = &ev {
                for slot in self.io_try.iter().flatten() {
                    ev.remove(slot);
                }
            }
        }

        if let (Some(ev), Some(child)) = (&ev, &self.io) {
            ev.remove(child);
        }

        if self.state == ConnState::Resolving {
            self.state = ConnState::Init;
            if let Some(query) = self.dns_query.take() {
                query.cancel();
            }
        }
    }

    fn disconnect(&mut self, _ctx: &mut LayerCtx<'_>) -> bool {
        let child = match &self.io {
            Some(io) if self.state == ConnState::Connected => Arc::clone(io),
            _ => return self.state != ConnState::Disconnecting,
        };

        self.state = ConnState::Disconnecting;
        child.disconnect();
        false
    }

    fn reset(&mut self) {
        for slot in self.io_try.drain(..).flatten() {
            slot.destroy();
        }
        if let Some(io) = self.io.take() {
            io.destroy();
        }
        if let Some(query) = self.dns_query.take() {
            query.cancel();
        }
        self.state = ConnState::Init;
        self.hard_down = false;
        self.try_idx = 0;
        self.query_start = None;
        self.query_time_ms = 0;
        self.connect_start = None;
        self.connect_time_ms = 0;
        self.error.clear();
    }

    fn state(&self) -> IoState {
        match self.state {
            ConnState::Init => IoState::Init,
            ConnState::Resolving | ConnState::Connecting => IoState::Connecting,
            ConnState::Connected => IoState::Connected,
            ConnState::Disconnecting => IoState::Disconnecting,
            ConnState::Disconnected => IoState::Disconnected,
            ConnState::Error => IoState::Error,
        }
    }

    fn error_msg(&self) -> Option<String> {
        // The adopted object saw the failure; let it speak.
        if let Some(io) = &self.io {
            return Some(io.error_string());
        }
        if self.state != ConnState::Error {
            return None;
        }
        Some(self.error.clone())
    }

    fn timer_fired(&mut self, ctx: &mut LayerCtx<'_>) {
        if self.state == ConnState::Connecting {
            self.next_io_start(ctx);
        }
    }
}

/// Create an unattached DNS-aware TCP client. Resolution starts when the
/// object is added to an event loop.
pub fn client_create(dns: &Dns, host: &str, port: u16, net_type: NetType) -> Result<Arc<Io>, IoError> {
    if host.is_empty() || port == 0 {
        return Err(IoError::Invalid);
    }

    let layer = NetDnsLayer {
        host: host.to_string(),
        port,
        net_type,
        state: ConnState::Init,
        settings: NetSettings::default(),
        dns: dns.clone(),
        io_try: Vec::new(),
        try_idx: 0,
        io: None,
        dns_query: None,
        error: String::new(),
        hard_down: false,
        timer: None,
        query_start: None,
        query_time_ms: 0,
        connect_start: None,
        connect_time_ms: 0,
    };

    let io = Io::new(IoKind::Stream);
    io.add_layer(Box::new(layer));
    Ok(io)
}

/* - - - - - accessors - - - - - */

fn with_netdns<R>(io: &Arc<Io>, f: impl FnOnce(&mut NetDnsLayer) -> R) -> Option<R> {
    super::with_layer(io, 0, LAYER_NAME, |layer, _ctx| {
        layer.as_any_mut().downcast_mut::<NetDnsLayer>().map(f)
    })
    .flatten()
}

pub(crate) fn get_host(io: &Arc<Io>) -> Option<String> {
    with_netdns(io, |nd| nd.host.clone())
}

pub(crate) fn get_ipaddr(io: &Arc<Io>) -> Option<String> {
    let child = with_netdns(io, |nd| nd.io.clone()).flatten()?;
    net::get_ipaddr(&child)
}

pub(crate) fn get_port(io: &Arc<Io>) -> Option<u16> {
    with_netdns(io, |nd| nd.port)
}

pub(crate) fn get_ephemeral_port(io: &Arc<Io>) -> Option<u16> {
    let child = with_netdns(io, |nd| nd.io.clone()).flatten()?;
    Some(net::get_ephemeral_port(&child))
}

pub(crate) fn get_type(io: &Arc<Io>) -> Option<NetType> {
    let (net_type, child) = with_netdns(io, |nd| (nd.net_type, nd.io.clone()))?;
    match child {
        Some(child) => net::get_type(&child),
        None => Some(net_type),
    }
}

pub(crate) fn get_connect_timeout_ms(io: &Arc<Io>) -> Option<u64> {
    with_netdns(io, |nd| nd.settings.connect_timeout_ms)
}

pub(crate) fn update_settings(io: &Arc<Io>, f: impl Fn(&mut NetSettings)) -> bool {
    let child = match with_netdns(io, |nd| {
        f(&mut nd.settings);
        nd.io.clone()
    }) {
        Some(child) => child,
        None => return false,
    };
    if let Some(child) = child {
        net::update_net_settings(&child, &f);
    }
    true
}

/// Milliseconds the DNS phase took (or has taken so far).
pub fn time_dns_ms(io: &Arc<Io>) -> u64 {
    with_netdns(io, |nd| {
        if nd.state == ConnState::Resolving {
            nd.query_start.as_ref().map(elapsed_ms).unwrap_or(0)
        } else {
            nd.query_time_ms
        }
    })
    .unwrap_or(0)
}

/// Milliseconds the connect phase took (or has taken so far).
pub fn time_connect_ms(io: &Arc<Io>) -> u64 {
    with_netdns(io, |nd| {
        if nd.state == ConnState::Connecting {
            nd.connect_start.as_ref().map(elapsed_ms).unwrap_or(0)
        } else {
            nd.connect_time_ms
        }
    })
    .unwrap_or(0)
}
