//! The single-socket UDP multiplexer.

use crate::{
    endpoint::ProxyAddr,
    error::{Error, ErrorKind},
    socks::{SocksProxy, SocksUdpSocket},
    wheel::{TimeWheel, Timer, WheelConfig},
};

use hashbrown::HashMap;
use hickory_proto::op::{Message, MessageType, OpCode, Query as Question};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use lazy_static::lazy_static;
use log::{info, warn};
use mio::{net::UdpSocket, Events, Poll, PollOpt, Ready, Token};
use serde::{Deserialize, Serialize};

use std::{
    collections::VecDeque,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    panic::{self, AssertUnwindSafe},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

/// The per-(request, nameserver) deadline used when none is configured.
pub const DEFAULT_TIMEOUT: u64 = 30;
/// The UDP destination port used when none is configured.
pub const DEFAULT_PORT: u16 = 53;

const SOCKET_TOKEN: Token = Token(0);
const MAX_DATAGRAM_SIZE: usize = 65_535;

lazy_static! {
    static ref SYSTEM_NAMESERVERS: Vec<IpAddr> = read_system_nameservers();
}

fn read_system_nameservers() -> Vec<IpAddr> {
    let contents = match std::fs::read("/etc/resolv.conf") {
        Ok(contents) => contents,
        Err(err) => {
            warn!("fail to read the resolver configuration, {}", err);
            return Vec::new();
        }
    };

    match resolv_conf::Config::parse(&contents) {
        Ok(config) => config
            .nameservers
            .iter()
            .map(|scoped| match scoped {
                resolv_conf::ScopedIp::V4(ip) => IpAddr::V4(*ip),
                resolv_conf::ScopedIp::V6(ip, _) => IpAddr::V6(*ip),
            })
            .collect(),
        Err(err) => {
            warn!("fail to parse the resolver configuration, {}", err);
            Vec::new()
        }
    }
}

/// The nameservers of the host's resolver configuration.
///
/// Read and parsed once per process, then cached.
pub fn system_nameservers() -> &'static [IpAddr] {
    &SYSTEM_NAMESERVERS
}

/// The outcome delivered to a callback for one nameserver: a response
/// packet, or the error that terminated the request.
pub type Answer = Result<Message, Error>;

/// A callback invoked exactly once per target nameserver.
pub type Callback = Arc<dyn Fn(SocketAddr, Answer) + Send + Sync + 'static>;

/// A question and the targets it is asked of.
///
/// # Example
/// ```
/// # use failure::Error;
/// #
/// # fn main() -> Result<(), Error> {
/// use asyncdns::{dns::RecordType, Query};
///
/// let mut query = Query::new("example.com")?;
/// query.set_rdtype(RecordType::MX);
/// query.set_timeout(5);
///
/// // The qname was made absolute.
/// assert_eq!("example.com.", query.qname().to_utf8());
/// #
/// #     Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    qname: Name,
    rdtype: RecordType,
    rdclass: DNSClass,
    timeout: Option<u64>,
    nameservers: Option<Vec<IpAddr>>,
    port: Option<u16>,
}

impl Query {
    /// An `A`/`IN` question for `qname`, normalized to an absolute domain
    /// name.
    pub fn new(qname: &str) -> Result<Self, Error> {
        let name = Name::from_utf8(qname).map_err(|_| {
            Error::new(ErrorKind::InvalidInput {
                msg: "unable to parse domain name",
            })
        })?;

        Ok(Self::with_name(name))
    }

    /// A question for an already parsed name.
    pub fn with_name(mut qname: Name) -> Self {
        if !qname.is_fqdn() {
            qname.set_fqdn(true);
        }

        Self {
            qname,
            rdtype: RecordType::A,
            rdclass: DNSClass::IN,
            timeout: None,
            nameservers: None,
            port: None,
        }
    }

    pub fn qname(&self) -> &Name {
        &self.qname
    }

    pub fn rdtype(&self) -> RecordType {
        self.rdtype
    }

    pub fn set_rdtype(&mut self, rdtype: RecordType) -> &mut Self {
        self.rdtype = rdtype;
        self
    }

    /// Set the record type from its presentation text, e.g. `"MX"`.
    pub fn set_rdtype_str(&mut self, rdtype: &str) -> Result<&mut Self, Error> {
        let rdtype = RecordType::from_str(rdtype).map_err(|_| {
            Error::new(ErrorKind::InvalidInput {
                msg: "unable to parse record type",
            })
        })?;
        Ok(self.set_rdtype(rdtype))
    }

    pub fn rdclass(&self) -> DNSClass {
        self.rdclass
    }

    pub fn set_rdclass(&mut self, rdclass: DNSClass) -> &mut Self {
        self.rdclass = rdclass;
        self
    }

    pub fn timeout(&self) -> Option<u64> {
        self.timeout
    }

    pub fn set_timeout(&mut self, seconds: u64) -> &mut Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn nameservers(&self) -> Option<&[IpAddr]> {
        self.nameservers.as_ref().map(Vec::as_slice)
    }

    pub fn set_nameservers(&mut self, nameservers: Vec<IpAddr>) -> &mut Self {
        self.nameservers = Some(nameservers);
        self
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn set_port(&mut self, port: u16) -> &mut Self {
        self.port = Some(port);
        self
    }

    /// Build the wire-format request, with a fresh random transaction id.
    fn build_request(&self) -> Message {
        let mut request = Message::new();
        request.set_id(rand::random::<u16>());
        request.set_message_type(MessageType::Query);
        request.set_op_code(OpCode::Query);
        request.set_recursion_desired(true);

        let mut question = Question::query(self.qname.clone(), self.rdtype);
        question.set_query_class(self.rdclass);
        request.add_query(question);

        request
    }
}

/// Whether `response` answers `request`: a response packet carrying the
/// request's exact transaction id and question.
fn is_response(request: &Message, response: &Message) -> bool {
    response.message_type() == MessageType::Response
        && response.id() == request.id()
        && response.queries() == request.queries()
}

fn invoke_callback(
    callback: &Callback,
    nameserver: SocketAddr,
    answer: Answer,
) {
    let call = AssertUnwindSafe(|| (**callback)(nameserver, answer));

    if let Err(cause) = panic::catch_unwind(call) {
        warn!("fail to execute query callback, {:?}", cause);
    }
}

struct Task {
    request: Arc<Message>,
    wire: Arc<Vec<u8>>,
    timeout: u64,
    callback: Callback,
    nameserver: SocketAddr,
}

struct PendingTask {
    token: u64,
    request: Arc<Message>,
    callback: Callback,
    timer: Timer,
}

type PendingTable = HashMap<SocketAddr, Vec<PendingTask>>;

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    pending: Mutex<PendingTable>,
    terminated: AtomicBool,
    next_token: AtomicU64,
}

fn remove_pending(
    pending: &mut PendingTable,
    nameserver: SocketAddr,
    token: u64,
) -> Option<PendingTask> {
    let bucket = pending.get_mut(&nameserver)?;
    let index = bucket.iter().position(|task| task.token == token)?;
    let task = bucket.remove(index);

    if bucket.is_empty() {
        pending.remove(&nameserver);
    }

    Some(task)
}

/// The UDP socket, bare or tunneled through a SOCKS5 relay.
enum Transport {
    Plain(UdpSocket),
    Proxied(SocksUdpSocket),
}

impl Transport {
    fn socket(&self) -> &UdpSocket {
        match self {
            Transport::Plain(socket) => socket,
            Transport::Proxied(socket) => socket.get_ref(),
        }
    }

    fn send_to(
        &self,
        data: &[u8],
        target: SocketAddr,
    ) -> Result<usize, Error> {
        match self {
            Transport::Plain(socket) => {
                Ok(socket.send_to(data, &target)?)
            }
            Transport::Proxied(socket) => socket.send_to(data, target),
        }
    }

    /// Receive one datagram. `Ok(None)` means it was dropped before
    /// reaching the DNS layer, with a warning already logged.
    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> Result<Option<(usize, SocketAddr)>, Error> {
        match self {
            Transport::Plain(socket) => {
                let received = socket.recv_from(buf)?;
                Ok(Some(received))
            }
            Transport::Proxied(socket) => {
                let (len, host, port) = match socket.recv_from(buf) {
                    Ok(unwrapped) => unwrapped,
                    Err(err) => match err.kind() {
                        ErrorKind::WouldBlock
                        | ErrorKind::Interrupted => return Err(err),
                        _ => {
                            warn!("drop malformed relay datagram, {}", err);
                            return Ok(None);
                        }
                    },
                };

                match host.ip() {
                    Some(ip) => Ok(Some((len, SocketAddr::new(ip, port)))),
                    None => {
                        warn!(
                            "drop relay datagram from unresolved origin \
                             {}:{}",
                            host, port
                        );
                        Ok(None)
                    }
                }
            }
        }
    }
}

/// A parallel DNS query engine over a single UDP socket.
///
/// One event-loop thread owns the socket: it drains the task queue into
/// `sendto` calls, correlates incoming datagrams back to their pending
/// request, and hands per-request deadlines to a [`TimeWheel`]. For every
/// `(request, nameserver)` pair the callback runs exactly once, from the
/// response path or from the timeout path.
///
/// # Example
/// ```no_run
/// # use failure::Error;
/// #
/// # fn main() -> Result<(), Error> {
/// use asyncdns::{Pipeline, Query};
///
/// let pipeline = Pipeline::new()?;
///
/// let (nameserver, response) = pipeline.query(&Query::new("example.com")?)?;
/// println!("{} answered {:?}", nameserver, response.answers());
/// #
/// #     Ok(())
/// # }
/// ```
///
/// [`TimeWheel`]: struct.TimeWheel.html
pub struct Pipeline {
    shared: Arc<Shared>,
    wheel: Arc<TimeWheel>,
    handle: Option<thread::JoinHandle<()>>,
    io: Option<IoParts>,
    default_timeout: u64,
    default_port: u16,
    default_nameservers: Option<Vec<IpAddr>>,
}

struct IoParts {
    transport: Transport,
    poll: Poll,
}

impl Pipeline {
    /// A pipeline with the default configuration: direct UDP, a fresh
    /// wheel with inline delivery, the system resolver list.
    pub fn new() -> Result<Self, Error> {
        PipelineConfig::new().build()
    }

    fn with_config(config: &PipelineConfig) -> Result<Self, Error> {
        let mut pipeline = Self::assemble(config)?;
        pipeline.start()?;

        Ok(pipeline)
    }

    /// Build every part but do not spawn the event loop yet.
    fn assemble(config: &PipelineConfig) -> Result<Self, Error> {
        let wheel = Arc::new(config.wheel.build()?);

        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let socket = UdpSocket::bind(&bind)?;

        // The SOCKS handshake runs synchronously, before any UDP traffic.
        let transport = match &config.proxy {
            Some(proxy_addr) => {
                let proxy = SocksProxy::connect(proxy_addr)?;
                Transport::Proxied(proxy.wrap(socket)?)
            }
            None => Transport::Plain(socket),
        };

        let poll = Poll::new()?;
        poll.register(
            transport.socket(),
            SOCKET_TOKEN,
            Ready::readable(),
            PollOpt::level(),
        )?;

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashMap::default()),
            terminated: AtomicBool::new(false),
            next_token: AtomicU64::new(0),
        });

        Ok(Self {
            shared,
            wheel,
            handle: None,
            io: Some(IoParts { transport, poll }),
            default_timeout: config.timeout.unwrap_or(DEFAULT_TIMEOUT),
            default_port: config.port.unwrap_or(DEFAULT_PORT),
            default_nameservers: config.nameservers.clone(),
        })
    }

    /// Spawn the event loop. Idempotent once started.
    fn start(&mut self) -> Result<(), Error> {
        let io = match self.io.take() {
            Some(io) => io,
            None => return Ok(()),
        };

        let shared = self.shared.clone();
        let wheel = self.wheel.clone();
        let handle = thread::Builder::new()
            .name("asyncdns-pipeline".to_owned())
            .spawn(move || run_loop(io, &shared, &wheel))?;
        self.handle = Some(handle);

        Ok(())
    }

    /// The number of tasks enqueued but not yet written to the socket.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// The number of in-flight requests awaiting a response or a timeout.
    pub fn pending(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap()
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Queued plus pending.
    pub fn len(&self) -> usize {
        self.queued() + self.pending()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    /// The wheel that tracks this pipeline's deadlines.
    pub fn wheel(&self) -> &TimeWheel {
        &self.wheel
    }

    fn targets(&self, query: &Query) -> Result<Vec<SocketAddr>, Error> {
        let port = query.port.unwrap_or(self.default_port);
        let ips = query
            .nameservers
            .clone()
            .or_else(|| self.default_nameservers.clone())
            .unwrap_or_else(|| system_nameservers().to_vec());

        if ips.is_empty() {
            return Err(Error::new(ErrorKind::InvalidInput {
                msg: "no nameservers configured",
            }));
        }

        Ok(ips
            .into_iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect())
    }

    /// Fan the question out to every target and return immediately.
    ///
    /// The wire-format request is built once; bit-identical bytes go to
    /// each nameserver. The callback fires exactly once per target, with
    /// the response or with the error that terminated the request.
    pub fn submit<F>(&self, query: &Query, callback: F) -> Result<(), Error>
    where
        F: Fn(SocketAddr, Answer) + Send + Sync + 'static,
    {
        let targets = self.targets(query)?;
        self.enqueue(query, targets, Arc::new(callback))
    }

    /// Fan the question out and block until the first successful
    /// response, up to the query timeout.
    ///
    /// Returns the earliest `(nameserver, response)` pair; when every
    /// target failed, the last error observed.
    pub fn query(
        &self,
        query: &Query,
    ) -> Result<(SocketAddr, Message), Error> {
        let timeout = query.timeout.unwrap_or(self.default_timeout);
        let targets = self.targets(query)?;
        let first_target = targets[0];
        let expected = targets.len();

        let state: Arc<(Mutex<Vec<(SocketAddr, Answer)>>, Condvar)> =
            Arc::new((Mutex::new(Vec::new()), Condvar::new()));

        let callback: Callback = {
            let state = state.clone();
            Arc::new(move |nameserver, answer| {
                let (results, cond) = &*state;
                let mut results = results.lock().unwrap();

                let wake =
                    answer.is_ok() || results.len() + 1 == expected;
                results.push((nameserver, answer));

                if wake {
                    cond.notify_all();
                }
            })
        };

        self.enqueue(query, targets, callback)?;

        let (results, cond) = &*state;
        let deadline = Instant::now() + Duration::from_secs(timeout);
        let mut results = results.lock().unwrap();

        loop {
            let settled = results.len() == expected
                || results.iter().any(|(_, answer)| answer.is_ok());
            if settled {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let (guard, _) =
                cond.wait_timeout(results, deadline - now).unwrap();
            results = guard;
        }

        let outcomes = std::mem::replace(&mut *results, Vec::new());
        drop(results);

        let mut last_error = None;
        let mut success = None;
        for (nameserver, answer) in outcomes {
            match answer {
                Ok(response) => {
                    if success.is_none() {
                        success = Some((nameserver, response));
                    }
                }
                Err(err) => last_error = Some(err),
            }
        }

        match success {
            Some(found) => Ok(found),
            None => Err(last_error.unwrap_or_else(|| {
                Error::new(ErrorKind::Timeout {
                    nameserver: first_target,
                    seconds: timeout,
                })
            })),
        }
    }

    fn enqueue(
        &self,
        query: &Query,
        targets: Vec<SocketAddr>,
        callback: Callback,
    ) -> Result<(), Error> {
        let timeout = query.timeout.unwrap_or(self.default_timeout);
        let request = query.build_request();
        let wire = Arc::new(request.to_vec()?);
        let request = Arc::new(request);

        info!(
            "query name servers {:?} for type {} and class {} record of \
             domain {} in {} seconds",
            targets, query.rdtype, query.rdclass, query.qname, timeout
        );

        let mut queue = self.shared.queue.lock().unwrap();
        for nameserver in targets {
            queue.push_back(Task {
                request: request.clone(),
                wire: wire.clone(),
                timeout,
                callback: callback.clone(),
                nameserver,
            });
        }

        Ok(())
    }

    /// Stop the event loop and the owned wheel. The loop observes the
    /// flag within one poll timeout; both threads have exited when the
    /// call returns.
    pub fn terminate(&mut self) {
        self.shared.terminated.store(true, Ordering::SeqCst);

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.wheel.terminate();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn run_loop(io: IoParts, shared: &Arc<Shared>, wheel: &TimeWheel) {
    let IoParts { transport, poll } = io;

    let mut events = Events::with_capacity(8);
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut write_interest = false;

    while !shared.terminated.load(Ordering::SeqCst) {
        // Mirror the task queue onto the writable interest, so an idle
        // pipeline sleeps on readable events alone.
        let want_write = !shared.queue.lock().unwrap().is_empty();
        if want_write != write_interest {
            let interest = if want_write {
                Ready::readable() | Ready::writable()
            } else {
                Ready::readable()
            };

            match poll.reregister(
                transport.socket(),
                SOCKET_TOKEN,
                interest,
                PollOpt::level(),
            ) {
                Ok(()) => write_interest = want_write,
                Err(err) => {
                    warn!("fail to update socket interest, {}", err);
                }
            }
        }

        match poll.poll(&mut events, Some(Duration::from_secs(1))) {
            Ok(_) => {}
            Err(err) => {
                let err = Error::from(err);
                match err.kind() {
                    ErrorKind::Interrupted => continue,
                    _ => {
                        warn!("fail to run the query pipeline, {}", err);
                        break;
                    }
                }
            }
        }

        for event in events.iter() {
            let readiness = event.readiness();

            if readiness.is_writable() {
                handle_write(&transport, shared, wheel);
            }
            if readiness.is_readable() {
                handle_read(&transport, shared, &mut buf);
            }
        }
    }
}

/// Dequeue one task, write it out, and move it to the pending table with
/// a live timer.
fn handle_write(
    transport: &Transport,
    shared: &Arc<Shared>,
    wheel: &TimeWheel,
) {
    let task = match shared.queue.lock().unwrap().pop_front() {
        Some(task) => task,
        None => return,
    };

    match transport.send_to(&task.wire, task.nameserver) {
        Ok(_sent) => register_pending(shared, wheel, task),
        Err(err) => match err.kind() {
            // Not sent; retried by the next writable pass.
            ErrorKind::WouldBlock => {
                shared.queue.lock().unwrap().push_front(task);
            }
            _ => {
                warn!(
                    "fail to send query to {}, {}",
                    task.nameserver, err
                );
                let nameserver = task.nameserver;
                invoke_callback(
                    &task.callback,
                    nameserver,
                    Err(Error::new(ErrorKind::SendFailure { nameserver })),
                );
            }
        },
    }
}

fn register_pending(
    shared: &Arc<Shared>,
    wheel: &TimeWheel,
    task: Task,
) {
    let token = shared.next_token.fetch_add(1, Ordering::SeqCst);
    let nameserver = task.nameserver;
    let seconds = task.timeout;

    // The timer is scheduled under the pending lock: were its deadline to
    // pass immediately, the timeout closure blocks on this same lock
    // until the entry is in place, so the callback cannot be skipped.
    let mut pending = shared.pending.lock().unwrap();

    let timer = {
        let weak = Arc::downgrade(shared);
        let callback = task.callback.clone();

        wheel.schedule(
            move || {
                let shared = match weak.upgrade() {
                    Some(shared) => shared,
                    None => return,
                };

                let removed = {
                    let mut pending = shared.pending.lock().unwrap();
                    remove_pending(&mut pending, nameserver, token)
                };

                // Lost to the response path; it already ran the callback.
                if removed.is_none() {
                    return;
                }

                invoke_callback(
                    &callback,
                    nameserver,
                    Err(Error::new(ErrorKind::Timeout {
                        nameserver,
                        seconds,
                    })),
                );
            },
            seconds,
        )
    };

    pending
        .entry(nameserver)
        .or_insert_with(Vec::new)
        .push(PendingTask {
            token,
            request: task.request,
            callback: task.callback,
            timer,
        });
}

/// Drain one datagram and hand it to the request it answers.
fn handle_read(
    transport: &Transport,
    shared: &Arc<Shared>,
    buf: &mut [u8],
) {
    let (len, nameserver) = match transport.recv_from(buf) {
        Ok(Some(received)) => received,
        Ok(None) => return,
        Err(err) => {
            match err.kind() {
                ErrorKind::WouldBlock | ErrorKind::Interrupted => {}
                _ => warn!("fail to receive response, {}", err),
            }
            return;
        }
    };

    let response = match Message::from_vec(&buf[..len]) {
        Ok(response) => response,
        Err(err) => {
            warn!("drop malformed packet from {}, {}", nameserver, err);
            return;
        }
    };

    let matched = {
        let mut pending = shared.pending.lock().unwrap();

        match pending.get_mut(&nameserver) {
            Some(bucket) => {
                let found = bucket
                    .iter()
                    .position(|task| is_response(&task.request, &response));

                match found {
                    Some(index) => {
                        let task = bucket.remove(index);
                        if bucket.is_empty() {
                            pending.remove(&nameserver);
                        }
                        Some(task)
                    }
                    None => None,
                }
            }
            None => None,
        }
    };

    match matched {
        Some(task) => {
            task.timer.cancel();
            invoke_callback(&task.callback, nameserver, Ok(response));
        }
        None => warn!("drop unknown response from {}", nameserver),
    }
}

/// Configuration of a [`Pipeline`].
///
/// Especially helpfull in config files.
///
/// # Example
/// ```no_run
/// # use failure::Error;
/// #
/// # fn main() -> Result<(), Error> {
/// use asyncdns::config::PipelineConfig;
///
/// let pipeline = PipelineConfig::new()
///     .timeout(10)
///     .nameservers(vec!["9.9.9.9".parse()?])
///     .build()?;
/// #
/// #     Ok(())
/// # }
/// ```
///
/// [`Pipeline`]: struct.Pipeline.html
#[derive(
    Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct PipelineConfig {
    timeout: Option<u64>,
    nameservers: Option<Vec<IpAddr>>,
    port: Option<u16>,
    #[serde(default)]
    wheel: WheelConfig,
    proxy: Option<ProxyAddr>,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// The default per-(request, nameserver) deadline; 30 seconds
    /// otherwise.
    pub fn timeout(&mut self, seconds: u64) -> &mut Self {
        self.timeout = Some(seconds);
        self
    }

    /// The default target list; the system resolver list otherwise.
    pub fn nameservers(&mut self, nameservers: Vec<IpAddr>) -> &mut Self {
        self.nameservers = Some(nameservers);
        self
    }

    /// The default UDP destination port; 53 otherwise.
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.port = Some(port);
        self
    }

    /// The configuration of the owned wheel.
    pub fn wheel(&mut self, wheel: WheelConfig) -> &mut Self {
        self.wheel = wheel;
        self
    }

    /// Tunnel every datagram through this SOCKS5 proxy.
    pub fn proxy(&mut self, proxy: ProxyAddr) -> &mut Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn build(&self) -> Result<Pipeline, Error> {
        Pipeline::with_config(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crossbeam_channel::unbounded;
    use hickory_proto::rr::{rdata::A, RData, Record};

    use std::net::UdpSocket as StdUdpSocket;

    /// A loopback nameserver answering every query with one A record.
    fn answering_nameserver() -> (SocketAddr, thread::JoinHandle<()>) {
        let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();

        let handle = thread::spawn(move || {
            socket
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();

            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(_) => return,
            };
            let request = Message::from_vec(&buf[..len]).unwrap();

            let mut response = Message::new();
            response.set_id(request.id());
            response.set_message_type(MessageType::Response);
            response.set_op_code(OpCode::Query);
            for question in request.queries() {
                response.add_query(question.clone());
            }
            let name = request.queries()[0].name().clone();
            response.add_answer(Record::from_rdata(
                name,
                300,
                RData::A(A::new(93, 184, 216, 34)),
            ));

            socket
                .send_to(&response.to_vec().unwrap(), from)
                .unwrap();
        });

        (addr, handle)
    }

    fn wait_until<F>(deadline: Duration, predicate: F) -> bool
    where
        F: Fn() -> bool,
    {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        predicate()
    }

    #[test]
    fn test_query_is_normalized() {
        let query = Query::new("www.example.com").unwrap();
        assert!(query.qname().is_fqdn());
        assert_eq!(RecordType::A, query.rdtype());
        assert_eq!(DNSClass::IN, query.rdclass());
    }

    #[test]
    fn test_request_reuses_one_packet() {
        let query = Query::new("example.com").unwrap();
        let request = query.build_request();

        // One question, recursion desired, and a serializable packet.
        assert_eq!(1, request.queries().len());
        assert!(request.recursion_desired());
        let wire = request.to_vec().unwrap();
        assert_eq!(wire, request.to_vec().unwrap());
    }

    #[test]
    fn test_is_response_demands_exact_id() {
        let query = Query::new("example.com").unwrap();
        let request = query.build_request();

        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        for question in request.queries() {
            response.add_query(question.clone());
        }
        assert!(is_response(&request, &response));

        response.set_id(request.id().wrapping_add(1));
        assert!(!is_response(&request, &response));

        response.set_id(request.id());
        response.set_message_type(MessageType::Query);
        assert!(!is_response(&request, &response));
    }

    #[test]
    fn test_fanout_counts_and_timeouts() {
        // Two distinct loopback addresses; nothing listens on either.
        let targets = vec![
            "127.0.0.1".parse::<IpAddr>().unwrap(),
            "127.0.0.2".parse::<IpAddr>().unwrap(),
        ];

        let mut pipeline =
            Pipeline::assemble(&PipelineConfig::new()).unwrap();

        let mut query = Query::new("example.com").unwrap();
        query
            .set_nameservers(targets)
            .set_port(9)
            .set_timeout(2);

        let (tx, rx) = unbounded();
        pipeline
            .submit(&query, move |nameserver, answer| {
                tx.send((nameserver, answer)).unwrap();
            })
            .unwrap();

        // The loop is not running yet: both tasks are queued, none
        // pending.
        assert_eq!(2, pipeline.queued());
        assert_eq!(0, pipeline.pending());
        assert_eq!(2, pipeline.len());

        pipeline.start().unwrap();

        // Once written, the tasks move to the pending table.
        assert!(wait_until(Duration::from_secs(5), || {
            pipeline.queued() == 0 && pipeline.pending() == 2
        }));

        // Exactly one timeout callback per nameserver.
        for _ in 0..2 {
            let (nameserver, answer) =
                rx.recv_timeout(Duration::from_secs(10)).unwrap();
            let err = answer.unwrap_err();
            match err.kind() {
                ErrorKind::Timeout { seconds, .. } => {
                    assert_eq!(2, seconds);
                }
                kind => panic!("unexpected error kind: {:?}", kind),
            }
            assert_eq!(9, nameserver.port());
        }
        assert!(rx
            .recv_timeout(Duration::from_secs(1))
            .is_err());

        assert_eq!(0, pipeline.len());
        assert_eq!(0, pipeline.wheel().len());

        pipeline.terminate();
        assert!(pipeline.is_terminated());
    }

    #[test]
    fn test_blocking_query_first_success() {
        let (nameserver, handle) = answering_nameserver();

        let pipeline = Pipeline::new().unwrap();

        let mut query = Query::new("example.com").unwrap();
        query
            .set_nameservers(vec![nameserver.ip()])
            .set_port(nameserver.port())
            .set_timeout(5);

        let (from, response) = pipeline.query(&query).unwrap();
        assert_eq!(nameserver, from);
        assert_eq!(1, response.answers().len());

        handle.join().unwrap();
    }

    #[test]
    fn test_blocking_query_timeout() {
        let pipeline = Pipeline::new().unwrap();

        let mut query = Query::new("example.com").unwrap();
        query
            .set_nameservers(vec!["127.0.0.1".parse().unwrap()])
            .set_port(9)
            .set_timeout(2);

        let err = pipeline.query(&query).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_callback_mode_returns_immediately() {
        let (nameserver, handle) = answering_nameserver();

        let pipeline = Pipeline::new().unwrap();

        let mut query = Query::new("example.com").unwrap();
        query
            .set_nameservers(vec![nameserver.ip()])
            .set_port(nameserver.port())
            .set_timeout(5);

        let (tx, rx) = unbounded();
        pipeline
            .submit(&query, move |nameserver, answer| {
                tx.send((nameserver, answer)).unwrap();
            })
            .unwrap();

        let (from, answer) =
            rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(nameserver, from);
        assert_eq!(1, answer.unwrap().answers().len());

        handle.join().unwrap();
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let (nameserver, handle) = answering_nameserver();

        let pipeline = Pipeline::new().unwrap();

        let mut query = Query::new("example.com").unwrap();
        query
            .set_nameservers(vec![nameserver.ip()])
            .set_port(nameserver.port())
            .set_timeout(5);

        pipeline
            .submit(&query, |_, _| panic!("boom"))
            .unwrap();

        // The loop must survive the panic and keep serving queries.
        assert!(wait_until(Duration::from_secs(10), || {
            pipeline.is_empty()
        }));

        handle.join().unwrap();
    }
}
