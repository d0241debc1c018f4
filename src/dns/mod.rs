//! Asynchronous DNS with a query cache and Happy-Eyeballs outcome
//! tracking.
//!
//! A [`Dns`] handle owns resolver *channels* (one per server-configuration
//! generation, so a config reload never drops in-flight queries), a query
//! cache with TTL aging, and the Happy-Eyeballs per-address outcome cache.
//! Queries run over non-blocking UDP sockets (TCP on truncation) pumped by
//! a small event object on the resolver's event loop; completion callbacks
//! are queued back onto the loop that asked.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, trace};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::IoError;
use crate::event::{
    CapsMask, Event, EventLoop, EventType, ModOp, Timer, WaitMask, TIMEOUT_INF,
};
use crate::io::net::NetType;
use crate::io::{Io, IoKind, IoState, Layer, LayerCtx};
use crate::time::now;

mod message;
pub mod punycode;
mod resolv;

use message::{QTYPE_A, QTYPE_AAAA, RCODE_NOERROR, RCODE_NXDOMAIN};

const DNS_PORT: u16 = 53;

/// How a lookup concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsResult {
    Success,
    /// Served from the query cache.
    SuccessCache,
    ServFail,
    NotFound,
    Timeout,
    Invalid,
}

/// Happy-Eyeballs outcome for one address, ordered best-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HeStatus {
    Good = 0,
    Unknown = 1,
    Slow = 2,
    Bad = 3,
}

pub type DnsCallback = Box<dyn FnOnce(DnsResult, Vec<String>) + Send>;

struct CacheEntry {
    ts: i64,
    ttl: i64,
    addrs: Vec<String>,
}

struct HeResult {
    ts: i64,
    status: HeStatus,
}

struct Channel {
    id: u64,
    load_ts: i64,
    servers: Vec<IpAddr>,
    tries: u32,
    timeout_per_try_ms: u64,
    queries_pending: usize,
    destroy_pending: bool,
}

enum Transport {
    Udp {
        sock: Socket,
    },
    Tcp {
        sock: Socket,
        wbuf: Vec<u8>,
        wpos: usize,
        rbuf: Vec<u8>,
    },
}

struct WireQuery {
    qid: u16,
    channel_id: u64,
    job_id: u64,
    qtype: u16,
    name: String,
    server_idx: usize,
    attempt: u32,
    deadline: Instant,
    transport: Transport,
}

struct Job {
    hostname: String,
    net_type: NetType,
    remaining: u8,
    v4_addrs: Vec<(String, u32)>,
    v6_addrs: Vec<(String, u32)>,
    results: Vec<DnsResult>,
    event: EventLoop,
    cb: Option<DnsCallback>,
}

struct DnsState {
    event: Option<EventLoop>,
    pump_io: Option<Arc<Io>>,
    timer: Option<Timer>,
    thread: Option<JoinHandle<()>>,

    channels: Vec<Channel>,
    next_channel_id: u64,
    next_job_id: u64,
    next_qid: u16,
    jobs: HashMap<u64, Job>,
    wire: Vec<WireQuery>,

    cache: HashMap<String, CacheEntry>,
    cache_order: VecDeque<String>,
    happyeb: HashMap<String, HeResult>,
    happyeb_order: VecDeque<String>,

    query_timeout_ms: u64,
    server_cache_timeout_s: u64,
    query_cache_max_s: u64,
    happyeyeballs_cache_max_s: u64,
}

pub(crate) struct DnsInner {
    state: Mutex<DnsState>,
}

/// Shared resolver handle.
#[derive(Clone)]
pub struct Dns {
    inner: Arc<DnsInner>,
}

impl std::fmt::Debug for Dns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dns").finish_non_exhaustive()
    }
}

/// Cancels its lookup when asked; completion after cancel is discarded.
pub struct DnsQuery {
    inner: Weak<DnsInner>,
    job_id: u64,
}

impl std::fmt::Debug for DnsQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsQuery").field("job_id", &self.job_id).finish()
    }
}

impl DnsQuery {
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut st = lock_state(&inner);
            if let Some(job) = st.jobs.get_mut(&self.job_id) {
                job.cb = None;
            }
        }
    }
}

fn lock_state(inner: &DnsInner) -> MutexGuard<'_, DnsState> {
    match inner.state.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

impl Dns {
    /// Create a resolver bound to `event`; with `None` a private loop is
    /// spun up on its own thread.
    pub fn create(event: Option<&Event>) -> std::io::Result<Dns> {
        let inner = Arc::new(DnsInner {
            state: Mutex::new(DnsState {
                event: None,
                pump_io: None,
                timer: None,
                thread: None,
                channels: Vec::new(),
                next_channel_id: 0,
                next_job_id: 0,
                next_qid: 1,
                jobs: HashMap::new(),
                wire: Vec::new(),
                cache: HashMap::new(),
                cache_order: VecDeque::new(),
                happyeb: HashMap::new(),
                happyeb_order: VecDeque::new(),
                query_timeout_ms: 5_000,
                server_cache_timeout_s: 120,
                query_cache_max_s: 3_600,
                happyeyeballs_cache_max_s: 600,
            }),
        });

        let (ev, thread) = match event {
            Some(e) => (e.distribute(), None),
            None => {
                let l = EventLoop::create(crate::event::EventFlags::NONE)?;
                let runner = l.clone();
                let handle = std::thread::Builder::new()
                    .name("evio-dns".to_string())
                    .spawn(move || {
                        runner.run(TIMEOUT_INF);
                    })?;
                (l, Some(handle))
            }
        };

        let pump_io = Io::new(IoKind::Stream);
        pump_io.add_layer(Box::new(DnsPumpLayer {
            dns: Arc::downgrade(&inner),
            isup: true,
        }));
        ev.add_internal(&pump_io, None);

        let timer = {
            let weak = Arc::downgrade(&inner);
            ev.timer_add(move |_ev| {
                if let Some(inner) = weak.upgrade() {
                    pump(&inner);
                }
            })
        };
        timer.set_firecount(1);

        {
            let mut st = lock_state(&inner);
            st.event = Some(ev);
            st.pump_io = Some(pump_io);
            st.timer = Some(timer);
            st.thread = thread;
            reload_server(&mut *st, false);
        }

        Ok(Dns { inner })
    }

    /// Record a Happy-Eyeballs connection outcome for an address.
    pub fn happyeyeballs_update(&self, ipaddr: &str, status: HeStatus) {
        let mut st = lock_state(&self.inner);
        let key = ipaddr.to_lowercase();
        if st.happyeb.contains_key(&key) {
            st.happyeb_order.retain(|k| k != &key);
        }
        st.happyeb.insert(key.clone(), HeResult { ts: now(), status });
        st.happyeb_order.push_back(key);
    }

    pub fn set_query_timeout(&self, mut timeout_ms: u64) {
        if timeout_ms == 0 {
            timeout_ms = 5_000;
        }
        let mut st = lock_state(&self.inner);
        st.query_timeout_ms = timeout_ms;
        force_reload_task(&self.inner, &mut *st);
    }

    pub fn set_cache_timeout(&self, mut max_timeout_s: u64) {
        if max_timeout_s == 0 {
            max_timeout_s = 3_600;
        }
        let mut st = lock_state(&self.inner);
        st.query_cache_max_s = max_timeout_s;
        force_reload_task(&self.inner, &mut *st);
    }

    /// Resolve `hostname`, delivering the result callback on `event`'s
    /// dispatcher. IP literals and cache hits answer synchronously (the
    /// callback runs before this returns).
    pub fn gethostbyname(
        &self,
        event: &EventLoop,
        hostname: &str,
        port: u16,
        net_type: NetType,
        cb: impl FnOnce(DnsResult, Vec<String>) + Send + 'static,
    ) -> Option<DnsQuery> {
        let _ = port;
        let cb: DnsCallback = Box::new(cb);

        if hostname.is_empty() {
            cb(DnsResult::Invalid, Vec::new());
            return None;
        }

        // An IP literal short-circuits the resolver entirely.
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            let ok = match (ip, net_type) {
                (IpAddr::V4(_), NetType::Ipv6) => false,
                (IpAddr::V6(_), NetType::Ipv4) => false,
                _ => true,
            };
            if !ok {
                cb(DnsResult::Invalid, Vec::new());
            } else {
                cb(DnsResult::Success, vec![hostname.to_string()]);
            }
            return None;
        }

        // Lookups are ASCII-only; international names go over the wire in
        // punycode.
        let hostname = match punycode::idna_hostname(hostname) {
            Some(h) => h,
            None => {
                cb(DnsResult::Invalid, Vec::new());
                return None;
            }
        };

        let mut st = lock_state(&self.inner);
        purge_stale_cache(&mut *st);
        let key = cache_key(&hostname, net_type);
        if let Some(entry) = st.cache.get(&key) {
            if entry.ts + entry.ttl > now() {
                let addrs = entry.addrs.clone();
                let sorted = he_sort(&mut *st, &addrs);
                drop(st);
                cb(DnsResult::SuccessCache, sorted);
                return None;
            }
        }

        let job_id = st.next_job_id;
        st.next_job_id += 1;
        let remaining = match net_type {
            NetType::Any => 2,
            _ => 1,
        };
        st.jobs.insert(
            job_id,
            Job {
                hostname: hostname.clone(),
                net_type,
                remaining,
                v4_addrs: Vec::new(),
                v6_addrs: Vec::new(),
                results: Vec::new(),
                event: event.clone(),
                cb: Some(cb),
            },
        );

        let dns_loop = match st.event.clone() {
            Some(l) => l,
            None => return None,
        };
        drop(st);

        let weak = Arc::downgrade(&self.inner);
        dns_loop.queue_task(move |_ev| {
            if let Some(inner) = weak.upgrade() {
                start_job(&inner, job_id);
            }
        });

        Some(DnsQuery { inner: Arc::downgrade(&self.inner), job_id })
    }
}

impl Drop for DnsInner {
    fn drop(&mut self) {
        let (event, pump_io, timer, thread) = {
            let mut st = match self.state.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            for wq in std::mem::take(&mut st.wire) {
                deregister_raw(&st, wire_sock_fd(&wq));
            }
            st.channels.clear();
            st.jobs.clear();
            (st.event.take(), st.pump_io.take(), st.timer.take(), st.thread.take())
        };

        if let Some(timer) = timer {
            timer.remove();
        }
        if let (Some(event), Some(pump_io)) = (&event, &pump_io) {
            event.remove(pump_io);
        }
        if let (Some(event), Some(thread)) = (event, thread) {
            event.done();
            let _ = thread.join();
        }
    }
}

/* - - - - - cache - - - - - */

fn cache_key(hostname: &str, net_type: NetType) -> String {
    let af = match net_type {
        NetType::Any => 0,
        NetType::Ipv4 => 4,
        NetType::Ipv6 => 6,
    };
    format!("{}:{}", af, hostname.to_lowercase())
}

fn purge_stale_cache(st: &mut DnsState) {
    let t = now();
    // Entries age in insertion order; TTL alone does not evict so a DNS
    // blip can still be answered from a stale entry.
    while let Some(key) = st.cache_order.front().cloned() {
        let expired = st
            .cache
            .get(&key)
            .map(|e| e.ts + st.query_cache_max_s as i64 <= t)
            .unwrap_or(true);
        if !expired {
            break;
        }
        st.cache.remove(&key);
        st.cache_order.pop_front();
    }
}

fn cache_remove(st: &mut DnsState, key: &str) {
    if st.cache.remove(key).is_some() {
        st.cache_order.retain(|k| k != key);
    }
}

fn cache_insert(st: &mut DnsState, key: &str, addrs: Vec<String>, min_ttl: i64) {
    cache_remove(st, key);
    let ttl = min_ttl.clamp(1, st.query_cache_max_s as i64);
    st.cache.insert(key.to_string(), CacheEntry { ts: now(), ttl, addrs });
    st.cache_order.push_back(key.to_string());
}

/* - - - - - happy eyeballs - - - - - */

fn he_purge_expired(st: &mut DnsState) {
    let t = now();
    while let Some(key) = st.happyeb_order.front().cloned() {
        let expired = st
            .happyeb
            .get(&key)
            .map(|r| r.ts + (st.happyeyeballs_cache_max_s as i64) < t)
            .unwrap_or(true);
        if !expired {
            break;
        }
        st.happyeb.remove(&key);
        st.happyeb_order.pop_front();
    }
}

fn he_status(st: &DnsState, addr: &str) -> HeStatus {
    st.happyeb
        .get(&addr.to_lowercase())
        .map(|r| r.status)
        .unwrap_or(HeStatus::Unknown)
}

/// Interleave IPv6/IPv4 in returned preference order, then stably sort by
/// prior outcome (best first) keeping the interleave for ties. This is the
/// list the connector races.
fn he_sort(st: &mut DnsState, addrs: &[String]) -> Vec<String> {
    he_purge_expired(st);

    let v6: Vec<&String> = addrs.iter().filter(|a| a.contains(':')).collect();
    let v4: Vec<&String> = addrs.iter().filter(|a| !a.contains(':')).collect();

    let mut list: Vec<(HeStatus, usize, &String)> = Vec::with_capacity(addrs.len());
    let (mut i6, mut i4) = (0usize, 0usize);
    for i in 0..addrs.len() {
        let (idx, addr) = if (i % 2 == 0 && i6 < v6.len()) || (i % 2 != 0 && i4 >= v4.len()) {
            let out = (i6, v6[i6]);
            i6 += 1;
            out
        } else {
            let out = (i4, v4[i4]);
            i4 += 1;
            out
        };
        list.push((he_status(st, addr), idx, addr));
    }

    list.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    list.into_iter().map(|(_, _, a)| a.clone()).collect()
}

/* - - - - - channels - - - - - */

fn reload_server(st: &mut DnsState, force: bool) {
    if let Some(last) = st.channels.last() {
        if !force && now() < last.load_ts + st.server_cache_timeout_s as i64 {
            return;
        }
    }

    let servers = resolv::nameservers();
    let num_servers = servers.len().max(1) as u64;
    let tries = 2u32;
    let timeout_per_try_ms = (st.query_timeout_ms / (num_servers * u64::from(tries))).max(1);

    // The old channel keeps serving its in-flight queries and is dropped
    // once the last one drains.
    if let Some(last) = st.channels.last_mut() {
        last.destroy_pending = true;
    }
    st.channels.retain(|c| !c.destroy_pending || c.queries_pending > 0);

    st.next_channel_id += 1;
    let id = st.next_channel_id;
    debug!("dns channel {} loaded with {} server(s)", id, servers.len());
    st.channels.push(Channel {
        id,
        load_ts: now(),
        servers,
        tries,
        timeout_per_try_ms,
        queries_pending: 0,
        destroy_pending: false,
    });
}

fn force_reload_task(inner: &Arc<DnsInner>, st: &mut DnsState) {
    if let Some(ev) = st.event.clone() {
        let weak = Arc::downgrade(inner);
        ev.queue_task(move |_| {
            if let Some(inner) = weak.upgrade() {
                let mut st = lock_state(&inner);
                reload_server(&mut *st, true);
            }
        });
    }
}

/* - - - - - wire queries - - - - - */

fn server_addr(server: IpAddr) -> SocketAddr {
    SocketAddr::new(server, DNS_PORT)
}

fn udp_socket(server: IpAddr) -> std::io::Result<Socket> {
    let domain = match server {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_nonblocking(true)?;
    sock.connect(&SockAddr::from(server_addr(server)))?;
    Ok(sock)
}

fn tcp_socket(server: IpAddr) -> std::io::Result<Socket> {
    let domain = match server {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    sock.set_nonblocking(true)?;
    if let Err(err) = sock.connect(&SockAddr::from(server_addr(server))) {
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
    }
    Ok(sock)
}

fn register_fd(st: &DnsState, sock: &Socket) {
    if let (Some(ev), Some(pump_io)) = (&st.event, &st.pump_io) {
        ev.handle_modify(
            ModOp::AddHandle,
            Some(pump_io),
            sock.as_raw_fd(),
            WaitMask::READ,
            CapsMask::READ | CapsMask::WRITE,
        );
    }
}

fn alloc_qid(st: &mut DnsState) -> u16 {
    loop {
        let qid = st.next_qid;
        st.next_qid = st.next_qid.wrapping_add(1).max(1);
        if !st.wire.iter().any(|w| w.qid == qid) {
            return qid;
        }
    }
}

/// Send (or resend) a wire query over UDP to its current server.
fn wire_send_udp(st: &mut DnsState, mut wq: WireQuery) -> Result<WireQuery, ()> {
    let channel = match st.channels.iter().find(|c| c.id == wq.channel_id) {
        Some(c) => c,
        None => return Err(()),
    };
    let server = match channel.servers.get(wq.server_idx).copied() {
        Some(s) => s,
        None => return Err(()),
    };
    let query = match message::build_query(wq.qid, &wq.name, wq.qtype) {
        Some(q) => q,
        None => return Err(()),
    };

    let sock = match udp_socket(server) {
        Ok(s) => s,
        Err(_) => return Err(()),
    };
    // A send failure here is non-fatal; the retry timer moves to the next
    // server.
    let _ = sock.send(&query);
    register_fd(st, &sock);

    wq.deadline = Instant::now() + Duration::from_millis(wq_timeout(st, wq.channel_id));
    wq.transport = Transport::Udp { sock };
    Ok(wq)
}

fn wq_timeout(st: &DnsState, channel_id: u64) -> u64 {
    st.channels
        .iter()
        .find(|c| c.id == channel_id)
        .map(|c| c.timeout_per_try_ms)
        .unwrap_or(1_000)
}

fn start_wire_query(st: &mut DnsState, job_id: u64, qtype: u16, name: &str) {
    let channel_id = match st.channels.last_mut() {
        Some(c) => {
            c.queries_pending += 1;
            c.id
        }
        None => {
            part_done(st, job_id, qtype, DnsResult::ServFail, Vec::new());
            return;
        }
    };

    let qid = alloc_qid(st);
    let wq = WireQuery {
        qid,
        channel_id,
        job_id,
        qtype,
        name: name.to_string(),
        server_idx: 0,
        attempt: 0,
        deadline: Instant::now(),
        transport: Transport::Udp {
            // Placeholder replaced by wire_send_udp; an unconnected socket
            // is never registered.
            sock: match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)) {
                Ok(s) => s,
                Err(_) => {
                    channel_release(st, channel_id);
                    part_done(st, job_id, qtype, DnsResult::ServFail, Vec::new());
                    return;
                }
            },
        },
    };

    match wire_send_udp(st, wq) {
        Ok(wq) => st.wire.push(wq),
        Err(()) => {
            channel_release(st, channel_id);
            part_done(st, job_id, qtype, DnsResult::ServFail, Vec::new());
        }
    }
}

fn channel_release(st: &mut DnsState, channel_id: u64) {
    if let Some(c) = st.channels.iter_mut().find(|c| c.id == channel_id) {
        c.queries_pending = c.queries_pending.saturating_sub(1);
    }
    st.channels
        .retain(|c| !c.destroy_pending || c.queries_pending > 0);
}

fn start_job(inner: &Arc<DnsInner>, job_id: u64) {
    let mut guard = lock_state(inner);
    let st = &mut *guard;
    reload_server(st, false);

    let (name, net_type) = match st.jobs.get(&job_id) {
        Some(job) => (job.hostname.clone(), job.net_type),
        None => return,
    };

    match net_type {
        NetType::Ipv4 => start_wire_query(st, job_id, QTYPE_A, &name),
        NetType::Ipv6 => start_wire_query(st, job_id, QTYPE_AAAA, &name),
        NetType::Any => {
            start_wire_query(st, job_id, QTYPE_AAAA, &name);
            start_wire_query(st, job_id, QTYPE_A, &name);
        }
    }

    update_timer(st);
}

/* - - - - - completion - - - - - */

fn part_done(st: &mut DnsState, job_id: u64, qtype: u16, result: DnsResult, answers: Vec<(IpAddr, u32)>) {
    let finalize = {
        let job = match st.jobs.get_mut(&job_id) {
            Some(j) => j,
            None => return,
        };
        for (ip, ttl) in answers {
            let rec = (ip.to_string(), ttl);
            if qtype == QTYPE_AAAA {
                job.v6_addrs.push(rec);
            } else {
                job.v4_addrs.push(rec);
            }
        }
        job.results.push(result);
        job.remaining = job.remaining.saturating_sub(1);
        job.remaining == 0
    };

    if finalize {
        finalize_job(st, job_id);
    }
}

fn finalize_job(st: &mut DnsState, job_id: u64) {
    let mut job = match st.jobs.remove(&job_id) {
        Some(j) => j,
        None => return,
    };

    let mut addrs: Vec<String> = Vec::new();
    let mut min_ttl = i64::MAX;
    for (addr, ttl) in job.v6_addrs.iter().chain(job.v4_addrs.iter()) {
        addrs.push(addr.clone());
        min_ttl = min_ttl.min(i64::from(*ttl));
    }

    let mut result = if !addrs.is_empty() {
        DnsResult::Success
    } else if job.results.iter().all(|r| *r == DnsResult::NotFound) {
        DnsResult::NotFound
    } else if job.results.contains(&DnsResult::Timeout) {
        DnsResult::Timeout
    } else {
        DnsResult::ServFail
    };

    let key = cache_key(&job.hostname, job.net_type);
    match result {
        DnsResult::Success => cache_insert(st, &key, addrs.clone(), min_ttl),
        DnsResult::NotFound => cache_remove(st, &key),
        _ => {
            // Server trouble: a cached (even TTL-expired) answer beats no
            // answer.
            if let Some(entry) = st.cache.get(&key) {
                addrs = entry.addrs.clone();
                result = DnsResult::SuccessCache;
            }
        }
    }

    let sorted = if addrs.is_empty() {
        Vec::new()
    } else {
        he_sort(st, &addrs)
    };

    if let Some(cb) = job.cb.take() {
        let mut once = Some((cb, result, sorted));
        job.event.queue_task(move |_| {
            if let Some((cb, result, sorted)) = once.take() {
                cb(result, sorted);
            }
        });
    }
}

/* - - - - - the pump - - - - - */

enum WireOutcome {
    Keep(WireQuery),
    Retry(WireQuery),
    Done {
        wq: WireQuery,
        result: DnsResult,
        answers: Vec<(IpAddr, u32)>,
    },
    TcpFallback(WireQuery),
}

fn rcode_to_result(rcode: u8, has_answers: bool) -> DnsResult {
    if rcode == RCODE_NOERROR {
        if has_answers {
            DnsResult::Success
        } else {
            // NoData: the name exists with no records of this type.
            DnsResult::NotFound
        }
    } else if rcode == RCODE_NXDOMAIN {
        DnsResult::NotFound
    } else {
        DnsResult::ServFail
    }
}

enum PumpStep {
    Pending,
    Answered(DnsResult, Vec<(IpAddr, u32)>),
    Truncated,
}

fn pump_one(mut wq: WireQuery, now_ts: Instant) -> WireOutcome {
    let qid = wq.qid;
    let step = match &mut wq.transport {
        Transport::Udp { sock } => pump_udp(sock, qid),
        Transport::Tcp { sock, wbuf, wpos, rbuf } => pump_tcp(sock, wbuf, wpos, rbuf, qid),
    };

    match step {
        PumpStep::Answered(result, answers) => WireOutcome::Done { wq, result, answers },
        PumpStep::Truncated => WireOutcome::TcpFallback(wq),
        PumpStep::Pending => {
            if now_ts >= wq.deadline {
                WireOutcome::Retry(wq)
            } else {
                WireOutcome::Keep(wq)
            }
        }
    }
}

fn pump_udp(sock: &mut Socket, qid: u16) -> PumpStep {
    let mut buf = [std::mem::MaybeUninit::<u8>::uninit(); 1500];
    loop {
        match sock.recv(&mut buf) {
            Ok(n) => {
                // SAFETY: recv initialized the first n bytes.
                let data = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, n) };
                let resp = match message::parse_response(data) {
                    Some(r) => r,
                    None => continue,
                };
                if resp.qid != qid {
                    continue;
                }
                if resp.truncated {
                    return PumpStep::Truncated;
                }
                let result = rcode_to_result(resp.rcode, !resp.answers.is_empty());
                return PumpStep::Answered(result, resp.answers);
            }
            Err(_) => return PumpStep::Pending,
        }
    }
}

fn pump_tcp(
    sock: &mut Socket,
    wbuf: &[u8],
    wpos: &mut usize,
    rbuf: &mut Vec<u8>,
    qid: u16,
) -> PumpStep {
    while *wpos < wbuf.len() {
        match sock.send(&wbuf[*wpos..]) {
            Ok(n) => *wpos += n,
            Err(_) => return PumpStep::Pending,
        }
    }

    let mut buf = [std::mem::MaybeUninit::<u8>::uninit(); 4096];
    loop {
        match sock.recv(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                // SAFETY: recv initialized the first n bytes.
                let data = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, n) };
                rbuf.extend_from_slice(data);
            }
            Err(_) => break,
        }
    }

    if rbuf.len() >= 2 {
        let need = usize::from(u16::from_be_bytes([rbuf[0], rbuf[1]]));
        if rbuf.len() >= 2 + need {
            if let Some(resp) = message::parse_response(&rbuf[2..2 + need]) {
                if resp.qid == qid {
                    let result = rcode_to_result(resp.rcode, !resp.answers.is_empty());
                    return PumpStep::Answered(result, resp.answers);
                }
            }
        }
    }
    PumpStep::Pending
}

pub(crate) fn pump(inner: &Arc<DnsInner>) {
    let mut guard = lock_state(inner);
    let st = &mut *guard;
    let now_ts = Instant::now();

    let wire = std::mem::take(&mut st.wire);
    for wq in wire {
        match pump_one(wq, now_ts) {
            WireOutcome::Keep(wq) => st.wire.push(wq),
            WireOutcome::Done { wq, result, answers } => {
                deregister_raw(st, wire_sock_fd(&wq));
                channel_release(st, wq.channel_id);
                part_done(st, wq.job_id, wq.qtype, result, answers);
            }
            WireOutcome::TcpFallback(mut wq) => {
                trace!("dns response truncated; retrying over tcp");
                let server = st
                    .channels
                    .iter()
                    .find(|c| c.id == wq.channel_id)
                    .and_then(|c| c.servers.get(wq.server_idx).copied());
                deregister_raw(st, wire_sock_fd(&wq));

                let fallback = server.and_then(|server| {
                    let sock = tcp_socket(server).ok()?;
                    let query = message::build_query(wq.qid, &wq.name, wq.qtype)?;
                    let mut wbuf = Vec::with_capacity(query.len() + 2);
                    wbuf.extend_from_slice(&(query.len() as u16).to_be_bytes());
                    wbuf.extend_from_slice(&query);
                    Some((sock, wbuf))
                });
                match fallback {
                    Some((sock, wbuf)) => {
                        register_fd(st, &sock);
                        wq.deadline =
                            Instant::now() + Duration::from_millis(wq_timeout(st, wq.channel_id));
                        wq.transport = Transport::Tcp { sock, wbuf, wpos: 0, rbuf: Vec::new() };
                        st.wire.push(wq);
                    }
                    None => {
                        channel_release(st, wq.channel_id);
                        part_done(st, wq.job_id, wq.qtype, DnsResult::ServFail, Vec::new());
                    }
                }
            }
            WireOutcome::Retry(mut wq) => {
                deregister_raw(st, wire_sock_fd(&wq));

                let (exhausted, num_servers) = match st
                    .channels
                    .iter()
                    .find(|c| c.id == wq.channel_id)
                {
                    Some(c) => {
                        let total = (c.servers.len().max(1) as u32) * c.tries;
                        (wq.attempt + 1 >= total, c.servers.len().max(1))
                    }
                    None => (true, 1),
                };

                if exhausted {
                    channel_release(st, wq.channel_id);
                    part_done(st, wq.job_id, wq.qtype, DnsResult::Timeout, Vec::new());
                } else {
                    wq.attempt += 1;
                    wq.server_idx = (wq.server_idx + 1) % num_servers;
                    let (channel_id, job_id, qtype) = (wq.channel_id, wq.job_id, wq.qtype);
                    match wire_send_udp(st, wq) {
                        Ok(wq) => st.wire.push(wq),
                        Err(()) => {
                            channel_release(st, channel_id);
                            part_done(st, job_id, qtype, DnsResult::ServFail, Vec::new());
                        }
                    }
                }
            }
        }
    }

    update_timer(st);
}

fn wire_sock_fd(wq: &WireQuery) -> i32 {
    match &wq.transport {
        Transport::Udp { sock } => sock.as_raw_fd(),
        Transport::Tcp { sock, .. } => sock.as_raw_fd(),
    }
}

fn deregister_raw(st: &DnsState, fd: i32) {
    if let Some(ev) = &st.event {
        ev.handle_modify(ModOp::DelHandle, None, fd, WaitMask::NONE, CapsMask::default());
    }
}

fn update_timer(st: &mut DnsState) {
    let timer = match &st.timer {
        Some(t) => t.clone(),
        None => return,
    };

    let now_ts = Instant::now();
    let min = st
        .wire
        .iter()
        .map(|w| w.deadline.saturating_duration_since(now_ts).as_millis() as u64)
        .min();

    match min {
        // +1ms so a deadline isn't woken just short of due.
        Some(ms) => {
            timer.reset(ms + 1);
        }
        None => {
            timer.stop();
        }
    }
}

/* - - - - - the pump layer - - - - - */

struct DnsPumpLayer {
    dns: Weak<DnsInner>,
    isup: bool,
}

impl Layer for DnsPumpLayer {
    fn name(&self) -> &'static str {
        "DNS"
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn process_event(&mut self, ctx: &mut LayerCtx<'_>, ty: &mut EventType) -> bool {
        if *ty == EventType::Disconnected && !self.isup {
            // Tear down: the pump object is going away.
            if let Some(inner) = self.dns.upgrade() {
                let mut st = lock_state(&inner);
                for wq in std::mem::take(&mut st.wire) {
                    deregister_raw(&*st, wire_sock_fd(&wq));
                }
                st.channels.clear();
                if let Some(timer) = st.timer.take() {
                    timer.remove();
                }
            }
            if let (Some(ev), Some(io)) = (ctx.event(), ctx.io()) {
                // Removal can't happen from inside our own callback.
                ev.queue_task(move |ev| ev.remove(&io));
            }
            return false;
        }

        // Any readiness just pumps every in-flight query; there are few
        // enough sockets that per-fd dispatch isn't worth the bookkeeping.
        if let Some(inner) = self.dns.upgrade() {
            pump(&inner);
        }
        true
    }

    fn disconnect(&mut self, ctx: &mut LayerCtx<'_>) -> bool {
        if !self.isup {
            return true;
        }
        self.isup = false;
        ctx.softevent_add(false, EventType::Disconnected, IoError::Disconnect);
        false
    }

    fn state(&self) -> IoState {
        if self.isup {
            IoState::Connected
        } else {
            IoState::Disconnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> DnsState {
        DnsState {
            event: None,
            pump_io: None,
            timer: None,
            thread: None,
            channels: Vec::new(),
            next_channel_id: 0,
            next_job_id: 0,
            next_qid: 1,
            jobs: HashMap::new(),
            wire: Vec::new(),
            cache: HashMap::new(),
            cache_order: VecDeque::new(),
            happyeb: HashMap::new(),
            happyeb_order: VecDeque::new(),
            query_timeout_ms: 5_000,
            server_cache_timeout_s: 120,
            query_cache_max_s: 3_600,
            happyeyeballs_cache_max_s: 600,
        }
    }

    fn he_set(st: &mut DnsState, addr: &str, status: HeStatus) {
        st.happyeb
            .insert(addr.to_lowercase(), HeResult { ts: now(), status });
        st.happyeb_order.push_back(addr.to_lowercase());
    }

    #[test]
    fn sort_interleaves_v6_first() {
        let mut st = test_state();
        let addrs = vec![
            "2001:db8::1".to_string(),
            "2001:db8::2".to_string(),
            "192.0.2.1".to_string(),
            "192.0.2.2".to_string(),
        ];
        let sorted = he_sort(&mut st, &addrs);
        assert_eq!(
            sorted,
            vec!["2001:db8::1", "192.0.2.1", "2001:db8::2", "192.0.2.2"]
        );
    }

    #[test]
    fn sort_prefers_known_good() {
        let mut st = test_state();
        he_set(&mut st, "2001:db8::1", HeStatus::Bad);
        he_set(&mut st, "192.0.2.1", HeStatus::Good);

        let addrs = vec![
            "2001:db8::1".to_string(),
            "192.0.2.1".to_string(),
            "192.0.2.2".to_string(),
        ];
        let sorted = he_sort(&mut st, &addrs);
        // Good first, Unknown next, Bad last.
        assert_eq!(sorted, vec!["192.0.2.1", "2001:db8::1", "192.0.2.2"]);
    }

    #[test]
    fn sort_ranks_slow_above_bad() {
        // After a failed race that left [2001:db8::1 → Slow,
        // 192.0.2.2 → Bad], a later sort puts the slow address first.
        let mut st = test_state();
        he_set(&mut st, "2001:db8::1", HeStatus::Slow);
        he_set(&mut st, "192.0.2.2", HeStatus::Bad);

        let addrs = vec!["2001:db8::1".to_string(), "192.0.2.2".to_string()];
        let sorted = he_sort(&mut st, &addrs);
        assert_eq!(sorted, vec!["2001:db8::1", "192.0.2.2"]);
    }

    #[test]
    fn cache_expiry_by_insertion_order() {
        let mut st = test_state();
        st.query_cache_max_s = 0; // everything is instantly stale
        cache_insert(&mut st, "0:stale.example", vec!["192.0.2.9".into()], 60);
        purge_stale_cache(&mut st);
        assert!(st.cache.is_empty());
        assert!(st.cache_order.is_empty());
    }

    #[test]
    fn rcode_mapping() {
        assert_eq!(rcode_to_result(RCODE_NOERROR, true), DnsResult::Success);
        assert_eq!(rcode_to_result(RCODE_NOERROR, false), DnsResult::NotFound);
        assert_eq!(rcode_to_result(RCODE_NXDOMAIN, false), DnsResult::NotFound);
        assert_eq!(rcode_to_result(2, false), DnsResult::ServFail);
    }
}
