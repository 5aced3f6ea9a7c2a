//! Owns the agent, its UDP socket, and the event loop driving both (spec §4.5).
//!
//! The agent and transport are not `Sync`; the dispatcher is the only thread
//! that ever touches them. Other threads talk to a running dispatcher through
//! a [`DispatcherHandle`]'s `mpsc::Sender`, paired with an `mio::Waker` so
//! `mio::Poll::poll` returns immediately instead of blocking until the next
//! scheduled tick. Grounded on the `mio`+`socket2` combination
//! `firezone-firezone/rust/relay/server` uses for its own UDP relay loop.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Token};
use sdp_types::IceCandidate as WireCandidate;

use crate::agent::{IceAgent, IceCredentials, IceEvent, ReceivedPkt};
use crate::error::IceError;
use crate::transport::{BindConfig, UdpTransport};

const SOCKET_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const MAX_DATAGRAM: usize = 2048;

/// The dispatcher re-polls the agent on this cadence regardless of socket
/// activity, so its own retransmit/keepalive/nomination timers still fire.
const POLL_TICK: Duration = Duration::from_millis(50);

/// How a [`Dispatcher`] binds its socket and whether it accepts cross-thread
/// commands. `single_threaded` is the `NO_ATOMICS` open question's resolution
/// (see `DESIGN.md`): when set, no command queue or waker is constructed at
/// all and [`Dispatcher::handle`] returns `None`.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub bind: BindConfig,
    pub single_threaded: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            bind: BindConfig::default(),
            single_threaded: true,
        }
    }
}

/// A cross-thread request for the dispatcher loop to apply to its agent.
pub enum Command {
    SetRemoteCredentials(IceCredentials),
    AddRemoteCandidate(WireCandidate),
    AddStunServer(SocketAddr),
    AddTurnServer {
        server: SocketAddr,
        username: String,
        password: String,
    },
    Shutdown,
}

/// The `Agent::submit` entry point: a cheaply-cloneable handle other threads
/// use to reach a running [`Dispatcher`] without touching its agent directly.
#[derive(Clone)]
pub struct DispatcherHandle {
    commands: Sender<Command>,
    waker: Arc<mio::Waker>,
}

impl DispatcherHandle {
    pub fn submit(&self, command: Command) -> Result<(), IceError> {
        self.commands
            .send(command)
            .map_err(|_| IceError::Internal("dispatcher thread is gone".into()))?;
        self.waker.wake().map_err(IceError::SocketError)
    }
}

/// Single-threaded `mio::Poll` event loop over one agent and its UDP socket.
pub struct Dispatcher {
    poll: mio::Poll,
    events: Events,
    transport: UdpTransport,
    agent: IceAgent,
    deadlines: BinaryHeap<Reverse<Instant>>,
    commands_tx: Option<Sender<Command>>,
    commands_rx: Option<Receiver<Command>>,
    waker: Option<Arc<mio::Waker>>,
    on_event: Box<dyn FnMut(IceEvent)>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        agent: IceAgent,
        on_event: impl FnMut(IceEvent) + 'static,
    ) -> Result<Self, IceError> {
        let mut transport = UdpTransport::bind(config.bind)?;
        let poll = mio::Poll::new().map_err(IceError::SocketError)?;
        poll.registry()
            .register(transport.mio_socket(), SOCKET_TOKEN, Interest::READABLE)
            .map_err(IceError::SocketError)?;

        let (commands_tx, commands_rx, waker) = if config.single_threaded {
            (None, None, None)
        } else {
            let (tx, rx) = mpsc::channel();
            let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER_TOKEN).map_err(IceError::SocketError)?);
            (Some(tx), Some(rx), Some(waker))
        };

        let mut dispatcher = Self {
            poll,
            events: Events::with_capacity(128),
            transport,
            agent,
            deadlines: BinaryHeap::new(),
            commands_tx,
            commands_rx,
            waker,
            on_event: Box::new(on_event),
        };
        dispatcher.schedule_poll_at(Instant::now());
        Ok(dispatcher)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn agent(&self) -> &IceAgent {
        &self.agent
    }

    /// `None` in single-threaded mode: there is no queue or waker to hand out.
    pub fn handle(&self) -> Option<DispatcherHandle> {
        Some(DispatcherHandle {
            commands: self.commands_tx.clone()?,
            waker: self.waker.clone()?,
        })
    }

    /// Blocks in `mio::Poll::poll` until socket/waker activity or `timeout`
    /// elapses, then drains it. Returns `true` once `Command::Shutdown` has
    /// been processed.
    pub fn step(&mut self, timeout: Option<Duration>) -> Result<bool, IceError> {
        self.poll.poll(&mut self.events, timeout).map_err(IceError::SocketError)?;
        let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();

        let mut shutdown = false;
        for token in tokens {
            match token {
                SOCKET_TOKEN => self.drain_socket()?,
                WAKER_TOKEN => shutdown |= self.drain_commands(),
                _ => {}
            }
        }

        self.run_due_timers();
        Ok(shutdown)
    }

    /// Runs until a `Command::Shutdown` arrives. Only useful with a
    /// [`DispatcherHandle`] in hand on some other thread; in single-threaded
    /// mode, drive the loop with repeated [`Dispatcher::step`] calls instead.
    pub fn run(&mut self) -> Result<(), IceError> {
        loop {
            let timeout = self.next_timeout();
            if self.step(timeout)? {
                return Ok(());
            }
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        self.deadlines
            .peek()
            .map(|Reverse(at)| at.saturating_duration_since(Instant::now()))
    }

    fn schedule_poll_at(&mut self, at: Instant) {
        self.deadlines.push(Reverse(at));
    }

    fn run_due_timers(&mut self) {
        let now = Instant::now();
        let mut due = false;
        while matches!(self.deadlines.peek(), Some(Reverse(at)) if *at <= now) {
            self.deadlines.pop();
            due = true;
        }
        if !due {
            return;
        }

        let agent = &mut self.agent;
        let transport = &self.transport;
        let on_event = &mut self.on_event;
        agent.poll(now, &mut |event| dispatch_event(event, transport, on_event));
        self.schedule_poll_at(now + POLL_TICK);
    }

    /// Datagrams are classified by leading byte inside `IceAgent::receive`
    /// itself (TURN ChannelData vs. STUN vs. application payload); this just
    /// owns the socket read loop.
    fn drain_socket(&mut self) -> Result<(), IceError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, source) = match self.transport.recv_from(&mut buf) {
                Ok(result) => result,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(IceError::SocketError(err)),
            };

            let pkt = ReceivedPkt {
                data: buf[..len].to_vec(),
                source,
                destination: self.transport.local_addr(),
            };

            let agent = &mut self.agent;
            let transport = &self.transport;
            let on_event = &mut self.on_event;
            agent.receive(&pkt, Instant::now(), &mut |event| dispatch_event(event, transport, on_event));
        }
    }

    fn drain_commands(&mut self) -> bool {
        let Some(rx) = &self.commands_rx else {
            return false;
        };

        let mut shutdown = false;
        while let Ok(command) = rx.try_recv() {
            match command {
                Command::SetRemoteCredentials(credentials) => self.agent.set_remote_credentials(credentials),
                Command::AddRemoteCandidate(candidate) => self.agent.add_remote_candidate(&candidate),
                Command::AddStunServer(server) => self.agent.add_stun_server(server),
                Command::AddTurnServer { server, username, password } => {
                    self.agent.add_turn_server(server, username, password)
                }
                Command::Shutdown => shutdown = true,
            }
        }
        shutdown
    }
}

/// `IceEvent::Transmit` never leaves the dispatcher: it's handed straight to
/// the socket. Everything else is forwarded to the application callback.
fn dispatch_event(event: IceEvent, transport: &UdpTransport, on_event: &mut dyn FnMut(IceEvent)) {
    if let IceEvent::Transmit { data, target } = &event {
        if let Err(err) = transport.send_to(data, *target) {
            log::warn!("dropping outbound datagram to {target}: {err}");
        }
        return;
    }
    on_event(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::IceCredentials as Credentials;

    fn dispatcher(single_threaded: bool) -> Dispatcher {
        let agent = IceAgent::new(Credentials::random(), true, "127.0.0.1:0".parse().unwrap());
        let config = DispatcherConfig {
            bind: BindConfig {
                bind_address: Some("127.0.0.1".parse().unwrap()),
                port_range: (0, 0),
            },
            single_threaded,
        };
        Dispatcher::new(config, agent, |_event| {}).unwrap()
    }

    #[test]
    fn single_threaded_dispatcher_has_no_handle() {
        let dispatcher = dispatcher(true);
        assert!(dispatcher.handle().is_none());
    }

    #[test]
    fn multi_threaded_dispatcher_hands_out_a_working_handle() {
        let mut dispatcher = dispatcher(false);
        let handle = dispatcher.handle().expect("handle available in multi-threaded mode");

        handle.submit(Command::SetRemoteCredentials(Credentials::random())).unwrap();
        handle.submit(Command::Shutdown).unwrap();

        dispatcher.run().unwrap();
    }

    #[test]
    fn step_binds_a_real_ephemeral_port() {
        let dispatcher = dispatcher(true);
        assert!(dispatcher.local_addr().port() > 0);
    }
}
