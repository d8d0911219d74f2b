use hashbrown::HashMap;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::shared::{ErrorType, NetworkError, NetworkResult};

/// Result of blocking on the network for inbound traffic.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WaitOutcome {
    /// At least one datagram is ready to be received.
    Ready,
    /// An `Interrupter` fired.
    Interrupt,
    Timeout,
}

/// Wakes a host blocked inside `Network::wait` from any thread.
#[derive(Clone)]
pub struct Interrupter {
    wake: Arc<dyn Fn() + Send + Sync>,
}

impl Interrupter {
    #[inline]
    pub fn interrupt(&self) {
        (self.wake)()
    }
}

/// The socket surface the engine runs on. Implementations are non-blocking apart
/// from `wait`, which is the host's single suspension point.
pub trait Network {
    fn local_addr(&self) -> SocketAddr;

    fn send_to(&mut self, payload: &[u8], addr: SocketAddr) -> NetworkResult<usize>;

    /// Receives one datagram, or `NetworkError::Wait` when nothing is queued.
    fn recv_from(&mut self, buf: &mut [u8]) -> NetworkResult<(usize, SocketAddr)>;

    fn wait(&mut self, timeout: Option<Duration>) -> NetworkResult<WaitOutcome>;

    fn interrupter(&self) -> Interrupter;

    /// Sets the IP don't-fragment flag where the backend supports it.
    fn set_dont_fragment(&mut self, enabled: bool) -> NetworkResult<()>;
}

const SOCKET_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Real OS sockets driven through a mio poll.
pub struct UdpNetwork {
    socket: UdpSocket,
    poll: Poll,
    events: Events,
    interrupted: Arc<AtomicBool>,
    waker: Arc<Waker>,
    local: SocketAddr,
}

impl UdpNetwork {
    pub fn bind(addr: SocketAddr) -> NetworkResult<UdpNetwork> {
        let mut socket = UdpSocket::bind(addr)?;
        let poll = Poll::new()?;

        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let local = socket.local_addr()?;

        Ok(UdpNetwork {
            socket,
            poll,
            events: Events::with_capacity(64),
            interrupted: Arc::new(AtomicBool::new(false)),
            waker,
            local,
        })
    }
}

impl Network for UdpNetwork {
    #[inline]
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    #[inline]
    fn send_to(&mut self, payload: &[u8], addr: SocketAddr) -> NetworkResult<usize> {
        self.socket.send_to(payload, addr).map_err(Into::into)
    }

    #[inline]
    fn recv_from(&mut self, buf: &mut [u8]) -> NetworkResult<(usize, SocketAddr)> {
        self.socket.recv_from(buf).map_err(Into::into)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> NetworkResult<WaitOutcome> {
        self.poll.poll(&mut self.events, timeout)?;

        if self.interrupted.swap(false, Ordering::AcqRel) {
            return Ok(WaitOutcome::Interrupt);
        }

        for event in self.events.iter() {
            if event.token() == SOCKET_TOKEN {
                return Ok(WaitOutcome::Ready);
            }
        }

        Ok(WaitOutcome::Timeout)
    }

    fn interrupter(&self) -> Interrupter {
        let interrupted = self.interrupted.clone();
        let waker = self.waker.clone();

        Interrupter {
            wake: Arc::new(move || {
                interrupted.store(true, Ordering::Release);
                let _ = waker.wake();
            }),
        }
    }

    #[cfg(unix)]
    fn set_dont_fragment(&mut self, enabled: bool) -> NetworkResult<()> {
        use std::os::unix::io::AsRawFd;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let value: libc::c_int = if enabled {
                libc::IP_PMTUDISC_DO
            } else {
                libc::IP_PMTUDISC_DONT
            };

            let result = unsafe {
                libc::setsockopt(
                    self.socket.as_raw_fd(),
                    libc::IPPROTO_IP,
                    libc::IP_MTU_DISCOVER,
                    &value as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };

            if result != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            let _ = enabled;
            let _ = self.socket.as_raw_fd();
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn set_dont_fragment(&mut self, _enabled: bool) -> NetworkResult<()> {
        Ok(())
    }
}

type MeshState = (Mutex<MeshInner>, Condvar);

struct MeshInner {
    queues: HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
}

/// An in-process mesh of address-keyed datagram queues. Hosts created from the same
/// mesh can talk to each other without touching the OS network stack, including from
/// different threads.
#[derive(Clone)]
pub struct MemoryMesh {
    state: Arc<MeshState>,
}

impl MemoryMesh {
    pub fn new() -> MemoryMesh {
        MemoryMesh {
            state: Arc::new((
                Mutex::new(MeshInner {
                    queues: HashMap::new(),
                }),
                Condvar::new(),
            )),
        }
    }

    /// Registers a queue for `addr` and returns the endpoint bound to it.
    pub fn endpoint(&self, addr: SocketAddr) -> NetworkResult<MemoryNetwork> {
        let mut inner = self.state.0.lock().expect("Mesh lock poisoned");

        if inner.queues.contains_key(&addr) {
            return Err(NetworkError::Fatal(ErrorType::Io(
                std::io::ErrorKind::AddrInUse,
            )));
        }

        inner.queues.insert(addr, VecDeque::new());

        Ok(MemoryNetwork {
            state: self.state.clone(),
            interrupted: Arc::new(AtomicBool::new(false)),
            addr,
        })
    }
}

pub struct MemoryNetwork {
    state: Arc<MeshState>,
    interrupted: Arc<AtomicBool>,
    addr: SocketAddr,
}

impl Drop for MemoryNetwork {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.state.0.lock() {
            inner.queues.remove(&self.addr);
        }
    }
}

impl Network for MemoryNetwork {
    #[inline]
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn send_to(&mut self, payload: &[u8], addr: SocketAddr) -> NetworkResult<usize> {
        let mut inner = self.state.0.lock().expect("Mesh lock poisoned");

        // An unroutable address swallows the datagram, like UDP would
        if let Some(queue) = inner.queues.get_mut(&addr) {
            queue.push_back((self.addr, payload.to_vec()));
            self.state.1.notify_all();
        }

        Ok(payload.len())
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> NetworkResult<(usize, SocketAddr)> {
        let mut inner = self.state.0.lock().expect("Mesh lock poisoned");

        let queue = inner
            .queues
            .get_mut(&self.addr)
            .ok_or(NetworkError::Fatal(ErrorType::Io(std::io::ErrorKind::NotConnected)))?;

        match queue.pop_front() {
            Some((from, payload)) => {
                let count = payload.len().min(buf.len());
                buf[..count].copy_from_slice(&payload[..count]);
                Ok((count, from))
            }
            None => Err(NetworkError::Wait),
        }
    }

    fn wait(&mut self, timeout: Option<Duration>) -> NetworkResult<WaitOutcome> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut inner = self.state.0.lock().expect("Mesh lock poisoned");

        loop {
            if self.interrupted.swap(false, Ordering::AcqRel) {
                return Ok(WaitOutcome::Interrupt);
            }

            if inner
                .queues
                .get(&self.addr)
                .map(|queue| !queue.is_empty())
                .unwrap_or(false)
            {
                return Ok(WaitOutcome::Ready);
            }

            inner = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(WaitOutcome::Timeout);
                    }

                    let (guard, _) = self
                        .state
                        .1
                        .wait_timeout(inner, deadline - now)
                        .expect("Mesh lock poisoned");
                    guard
                }
                None => self.state.1.wait(inner).expect("Mesh lock poisoned"),
            };
        }
    }

    fn interrupter(&self) -> Interrupter {
        let interrupted = self.interrupted.clone();
        let state = self.state.clone();

        Interrupter {
            wake: Arc::new(move || {
                interrupted.store(true, Ordering::Release);
                let _ = state.0.lock().map(|_| state.1.notify_all());
            }),
        }
    }

    fn set_dont_fragment(&mut self, _enabled: bool) -> NetworkResult<()> {
        Ok(())
    }
}

/// Outgoing interference knobs; factors are probabilities in [0, 1].
#[derive(Debug, Copy, Clone)]
pub struct InterferenceConfig {
    pub loss_factor: f64,
    pub duplicate_factor: f64,
    pub bit_flip_factor: f64,
    pub latency_ms: u64,
    pub jitter_ms: u64,
    pub seed: u64,
}

impl Default for InterferenceConfig {
    fn default() -> InterferenceConfig {
        InterferenceConfig {
            loss_factor: 0.0,
            duplicate_factor: 0.0,
            bit_flip_factor: 0.0,
            latency_ms: 0,
            jitter_ms: 0,
            seed: 0x5DEE_CE66,
        }
    }
}

struct XorShift64(u64);

impl XorShift64 {
    fn new(seed: u64) -> XorShift64 {
        XorShift64(seed.max(1))
    }

    fn next_u64(&mut self) -> u64 {
        let mut value = self.0;
        value ^= value << 13;
        value ^= value >> 7;
        value ^= value << 17;
        self.0 = value;
        value
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// Wraps another network and mangles outgoing datagrams: loss, duplication, bit
/// flips, latency and jitter, all driven by a seeded deterministic generator.
pub struct InterferenceNetwork {
    inner: Box<dyn Network>,
    config: InterferenceConfig,
    rng: XorShift64,
    delayed: VecDeque<(Instant, SocketAddr, Vec<u8>)>,
}

impl InterferenceNetwork {
    pub fn new(inner: Box<dyn Network>, config: InterferenceConfig) -> InterferenceNetwork {
        InterferenceNetwork {
            inner,
            rng: XorShift64::new(config.seed),
            config,
            delayed: VecDeque::new(),
        }
    }

    fn transmit(&mut self, payload: &[u8], addr: SocketAddr) -> NetworkResult<usize> {
        if self.config.loss_factor > 0.0 && self.rng.next_f64() < self.config.loss_factor {
            return Ok(payload.len());
        }

        let mut mangled;
        let mut outgoing = payload;

        if self.config.bit_flip_factor > 0.0 && self.rng.next_f64() < self.config.bit_flip_factor {
            mangled = payload.to_vec();
            if !mangled.is_empty() {
                let byte = (self.rng.next_u64() as usize) % mangled.len();
                let bit = (self.rng.next_u64() % 8) as u8;
                mangled[byte] ^= 1 << bit;
            }
            outgoing = &mangled;
        }

        let copies = if self.config.duplicate_factor > 0.0
            && self.rng.next_f64() < self.config.duplicate_factor
        {
            2
        } else {
            1
        };

        for _ in 0..copies {
            if self.config.latency_ms > 0 || self.config.jitter_ms > 0 {
                let jitter = if self.config.jitter_ms > 0 {
                    self.rng.next_u64() % (self.config.jitter_ms + 1)
                } else {
                    0
                };
                let release =
                    Instant::now() + Duration::from_millis(self.config.latency_ms + jitter);
                self.delayed.push_back((release, addr, outgoing.to_vec()));
            } else {
                self.inner.send_to(outgoing, addr)?;
            }
        }

        Ok(payload.len())
    }

    fn flush_delayed(&mut self) -> NetworkResult<()> {
        let now = Instant::now();

        while let Some((release, _, _)) = self.delayed.front() {
            if *release > now {
                break;
            }

            let (_, addr, payload) = self.delayed.pop_front().unwrap();
            self.inner.send_to(&payload, addr)?;
        }

        Ok(())
    }
}

impl Network for InterferenceNetwork {
    #[inline]
    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    fn send_to(&mut self, payload: &[u8], addr: SocketAddr) -> NetworkResult<usize> {
        self.flush_delayed()?;
        self.transmit(payload, addr)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> NetworkResult<(usize, SocketAddr)> {
        self.flush_delayed()?;
        self.inner.recv_from(buf)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> NetworkResult<WaitOutcome> {
        self.flush_delayed()?;

        // Cap the wait so delayed datagrams still drain on schedule
        let capped = match self.delayed.front() {
            Some((release, _, _)) => {
                let until = release.saturating_duration_since(Instant::now());
                Some(timeout.map_or(until, |timeout| timeout.min(until)))
            }
            None => timeout,
        };

        self.inner.wait(capped)
    }

    fn interrupter(&self) -> Interrupter {
        self.inner.interrupter()
    }

    fn set_dont_fragment(&mut self, enabled: bool) -> NetworkResult<()> {
        self.inner.set_dont_fragment(enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_memory_mesh_roundtrip() {
        let mesh = MemoryMesh::new();
        let mut alpha = mesh.endpoint(addr(1)).unwrap();
        let mut beta = mesh.endpoint(addr(2)).unwrap();

        alpha.send_to(b"ahoy", addr(2)).unwrap();

        let mut buf = [0u8; 16];
        let (count, from) = beta.recv_from(&mut buf).unwrap();

        assert_eq!(&buf[..count], b"ahoy");
        assert_eq!(from, addr(1));

        assert_eq!(beta.recv_from(&mut buf).unwrap_err(), NetworkError::Wait);
    }

    #[test]
    fn test_memory_mesh_rejects_duplicate_bind() {
        let mesh = MemoryMesh::new();
        let _alpha = mesh.endpoint(addr(1)).unwrap();
        assert!(mesh.endpoint(addr(1)).is_err());
    }

    #[test]
    fn test_memory_mesh_unroutable_is_silent() {
        let mesh = MemoryMesh::new();
        let mut alpha = mesh.endpoint(addr(1)).unwrap();
        assert_eq!(alpha.send_to(b"void", addr(9)).unwrap(), 4);
    }

    #[test]
    fn test_memory_wait_ready_and_timeout() {
        let mesh = MemoryMesh::new();
        let mut alpha = mesh.endpoint(addr(1)).unwrap();
        let mut beta = mesh.endpoint(addr(2)).unwrap();

        assert_eq!(
            beta.wait(Some(Duration::from_millis(5))).unwrap(),
            WaitOutcome::Timeout
        );

        alpha.send_to(b"x", addr(2)).unwrap();
        assert_eq!(
            beta.wait(Some(Duration::from_millis(5))).unwrap(),
            WaitOutcome::Ready
        );
    }

    #[test]
    fn test_memory_interrupter_wakes_wait() {
        let mesh = MemoryMesh::new();
        let mut alpha = mesh.endpoint(addr(1)).unwrap();

        let interrupter = alpha.interrupter();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            interrupter.interrupt();
        });

        let outcome = alpha.wait(Some(Duration::from_secs(5))).unwrap();
        handle.join().unwrap();

        assert_eq!(outcome, WaitOutcome::Interrupt);
    }

    #[test]
    fn test_interference_drops_roughly_half() {
        let mesh = MemoryMesh::new();
        let alpha = mesh.endpoint(addr(1)).unwrap();
        let mut beta = mesh.endpoint(addr(2)).unwrap();

        let mut lossy = InterferenceNetwork::new(
            Box::new(alpha),
            InterferenceConfig {
                loss_factor: 0.5,
                ..InterferenceConfig::default()
            },
        );

        for _ in 0..1000 {
            lossy.send_to(b"x", addr(2)).unwrap();
        }

        let mut buf = [0u8; 4];
        let mut received = 0;
        while beta.recv_from(&mut buf).is_ok() {
            received += 1;
        }

        assert!(received > 300 && received < 700, "received {}", received);
    }

    #[test]
    fn test_interference_bit_flip_corrupts() {
        let mesh = MemoryMesh::new();
        let alpha = mesh.endpoint(addr(1)).unwrap();
        let mut beta = mesh.endpoint(addr(2)).unwrap();

        let mut flipping = InterferenceNetwork::new(
            Box::new(alpha),
            InterferenceConfig {
                bit_flip_factor: 1.0,
                ..InterferenceConfig::default()
            },
        );

        flipping.send_to(&[0u8; 8], addr(2)).unwrap();

        let mut buf = [0u8; 8];
        let (count, _) = beta.recv_from(&mut buf).unwrap();

        assert_eq!(count, 8);
        assert_ne!(&buf[..], &[0u8; 8][..]);
    }

    #[test]
    fn test_interference_duplicates() {
        let mesh = MemoryMesh::new();
        let alpha = mesh.endpoint(addr(1)).unwrap();
        let mut beta = mesh.endpoint(addr(2)).unwrap();

        let mut doubling = InterferenceNetwork::new(
            Box::new(alpha),
            InterferenceConfig {
                duplicate_factor: 1.0,
                ..InterferenceConfig::default()
            },
        );

        doubling.send_to(b"twice", addr(2)).unwrap();

        let mut buf = [0u8; 8];
        assert!(beta.recv_from(&mut buf).is_ok());
        assert!(beta.recv_from(&mut buf).is_ok());
        assert_eq!(beta.recv_from(&mut buf).unwrap_err(), NetworkError::Wait);
    }
}
