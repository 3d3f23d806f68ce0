//! Session and cooperative event loop
//!
//! A [`Session`] owns a set of registered I/O sources and drives them with
//! a single-threaded cooperative wait: compute the minimum pending timeout,
//! wait for readiness, then dispatch each due source exactly once per
//! wake-up, in registration order. Datafeed packets emitted by sources fan
//! out synchronously to subscribers in subscription order.
//!
//! Engines must not block inside [`EventSource::dispatch`]; they perform at
//! most one bounded-size read per invocation and return control to the
//! loop.

use std::collections::HashMap;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use tracing::{debug, info, trace, warn};

use crate::device::DeviceId;
use crate::packet::Packet;
use crate::{Error, Result};

/// Granularity of the readiness sweep while waiting.
const POLL_QUANTUM: Duration = Duration::from_millis(1);

/// Opaque key identifying a registered source. Allocate via
/// [`Session::next_handle`], or reuse a previous handle to replace that
/// registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceHandle(pub u64);

impl fmt::Display for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "src{}", self.0)
    }
}

/// Events of interest for a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READ: Interest = Interest(0x1);
    pub const WRITE: Interest = Interest(0x2);

    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Why a source's callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent {
    /// The source reported readiness.
    Ready,
    /// The source's timeout elapsed without readiness.
    Timeout,
}

/// Returned from [`EventSource::dispatch`] to control the registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceAction {
    /// Keep the source registered with its current timeout.
    Continue,
    /// Keep the source registered but change its timeout. `None` waits
    /// indefinitely; `Some(Duration::ZERO)` makes the source poll-only.
    Reschedule(Option<Duration>),
    /// Unregister the source.
    Remove,
}

/// A registered I/O source: a transport wrapped in its receive routine.
pub trait EventSource: Send {
    /// Non-blocking readiness probe. An `Err` here is treated as ready so
    /// the failure surfaces through `dispatch`.
    fn ready(&mut self) -> Result<bool>;

    /// Handle one readiness or timeout event. Must not block; performs at
    /// most one bounded read. Errors are logged by the loop and the source
    /// stays registered; sources that want out return
    /// [`SourceAction::Remove`] (emitting `End` first if mid-acquisition).
    fn dispatch(&mut self, event: SourceEvent, feed: &mut Datafeed) -> Result<SourceAction>;
}

/// Identifies a datafeed subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(usize);

type DatafeedCallback = Box<dyn FnMut(DeviceId, &Packet) + Send>;

#[derive(Default)]
struct FeedState {
    started: bool,
    ended: bool,
    triggers: usize,
}

/// The packet fan-out half of a session, handed to source callbacks.
///
/// Subscribers are invoked synchronously, in subscription order, with a
/// borrowed packet valid only for the duration of the callback.
pub struct Datafeed {
    subscribers: Vec<(SubscriberId, DatafeedCallback)>,
    next_subscriber: usize,
    stop_requested: bool,
    states: HashMap<DeviceId, FeedState>,
}

impl Datafeed {
    fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            next_subscriber: 0,
            stop_requested: false,
            states: HashMap::new(),
        }
    }

    pub fn subscribe(&mut self, callback: DatafeedCallback) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        self.subscribers.push((id, callback));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> Result<()> {
        let pos = self
            .subscribers
            .iter()
            .position(|(sid, _)| *sid == id)
            .ok_or_else(|| Error::Arg(format!("no subscriber {id:?}")))?;
        self.subscribers.remove(pos);
        Ok(())
    }

    /// Send a packet from `device` to every subscriber.
    ///
    /// Enforces stream ordering: a packet arriving after `End` is a driver
    /// bug and is dropped rather than delivered.
    pub fn send(&mut self, device: DeviceId, packet: &Packet) {
        let state = self.states.entry(device).or_default();
        match packet {
            Packet::Header(_) => {
                if state.started && !state.ended {
                    warn!("{device}: duplicate header packet");
                }
                state.started = true;
                state.ended = false;
                state.triggers = 0;
            }
            _ if state.ended => {
                warn!(
                    "{device}: {} packet after end dropped (driver bug)",
                    packet.kind_name()
                );
                return;
            }
            Packet::End => {
                state.ended = true;
            }
            Packet::Trigger => {
                state.triggers += 1;
                if state.triggers > 1 {
                    warn!("{device}: multiple trigger packets in one acquisition");
                }
            }
            _ => {
                if !state.started {
                    warn!("{device}: {} packet before header", packet.kind_name());
                }
            }
        }

        trace!("{device}: feeding {} packet", packet.kind_name());
        for (_, callback) in self.subscribers.iter_mut() {
            callback(device, packet);
        }
    }

    /// Ask the session loop to terminate. The current iteration's callbacks
    /// are drained before the loop returns.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }
}

struct RegisteredSource {
    handle: SourceHandle,
    #[allow(dead_code)]
    interest: Interest,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    source: Box<dyn EventSource>,
}

/// Single-threaded cooperative session loop.
pub struct Session {
    sources: Vec<RegisteredSource>,
    feed: Datafeed,
    next_handle: u64,
}

impl Session {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            feed: Datafeed::new(),
            next_handle: 0,
        }
    }

    pub fn feed(&self) -> &Datafeed {
        &self.feed
    }

    pub fn feed_mut(&mut self) -> &mut Datafeed {
        &mut self.feed
    }

    /// Allocate a fresh source handle.
    pub fn next_handle(&mut self) -> SourceHandle {
        let handle = SourceHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// Register a source. `timeout` of `None` waits indefinitely;
    /// `Some(Duration::ZERO)` makes the source poll-only. Registering an
    /// existing handle replaces that registration in place.
    pub fn source_add(
        &mut self,
        handle: SourceHandle,
        interest: Interest,
        timeout: Option<Duration>,
        source: Box<dyn EventSource>,
    ) {
        let deadline = timeout.map(|t| Instant::now() + t);
        let entry = RegisteredSource {
            handle,
            interest,
            timeout,
            deadline,
            source,
        };
        if let Some(existing) = self.sources.iter_mut().find(|s| s.handle == handle) {
            debug!("session: replacing source {handle}");
            *existing = entry;
        } else {
            debug!("session: added source {handle} (timeout {timeout:?})");
            self.sources.push(entry);
        }
    }

    pub fn source_remove(&mut self, handle: SourceHandle) -> Result<()> {
        let pos = self
            .sources
            .iter()
            .position(|s| s.handle == handle)
            .ok_or_else(|| Error::Arg(format!("no source {handle}")))?;
        self.sources.remove(pos);
        debug!("session: removed source {handle}");
        Ok(())
    }

    pub fn has_source(&self, handle: SourceHandle) -> bool {
        self.sources.iter().any(|s| s.handle == handle)
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    /// Subscribe a channel to the datafeed. Packets are cloned into a
    /// bounded channel so a frontend on another thread can consume the
    /// feed; if the channel is full the packet is dropped rather than
    /// blocking the loop.
    pub fn datafeed_channel(&mut self, capacity: usize) -> Receiver<(DeviceId, Packet)> {
        let (tx, rx) = bounded(capacity);
        self.feed.subscribe(Box::new(move |device, packet| {
            if tx.try_send((device, packet.clone())).is_err() {
                trace!("{device}: datafeed channel full, packet dropped");
            }
        }));
        rx
    }

    /// Ask the loop to terminate after the current iteration.
    pub fn stop(&mut self) {
        self.feed.request_stop();
    }

    /// Run the loop until no sources remain or a stop is requested.
    pub fn run(&mut self) -> Result<()> {
        info!("session: starting main loop with {} source(s)", self.sources.len());
        while !self.sources.is_empty() && !self.feed.stop_requested() {
            self.run_once()?;
        }
        info!("session: main loop finished");
        Ok(())
    }

    /// One wait-and-dispatch cycle: wait until a source is ready or the
    /// nearest deadline passes, then dispatch every due source exactly
    /// once, in registration order.
    pub fn run_once(&mut self) -> Result<()> {
        if self.sources.is_empty() {
            return Ok(());
        }
        self.wait_phase();
        self.dispatch_phase();
        Ok(())
    }

    fn wait_phase(&mut self) {
        loop {
            let mut any_ready = false;
            for s in self.sources.iter_mut() {
                // An erroring readiness probe counts as ready so the
                // failure surfaces through dispatch.
                if s.source.ready().unwrap_or(true) {
                    any_ready = true;
                }
            }
            if any_ready {
                return;
            }

            let now = Instant::now();
            if self
                .sources
                .iter()
                .any(|s| s.deadline.is_some_and(|d| d <= now))
            {
                return;
            }

            // Sleep one quantum towards the nearest deadline. With only
            // indefinite sources we keep sweeping readiness at the same
            // granularity.
            let nap = self
                .sources
                .iter()
                .filter_map(|s| s.deadline)
                .min()
                .map(|d| d.saturating_duration_since(now).min(POLL_QUANTUM))
                .unwrap_or(POLL_QUANTUM);
            thread::sleep(nap);
        }
    }

    fn dispatch_phase(&mut self) {
        let now = Instant::now();
        let mut removals: Vec<SourceHandle> = Vec::new();

        let Self { sources, feed, .. } = self;
        for s in sources.iter_mut() {
            let ready = s.source.ready().unwrap_or(true);
            let timed_out = s.deadline.is_some_and(|d| d <= now);
            if !ready && !timed_out {
                continue;
            }
            let event = if ready {
                SourceEvent::Ready
            } else {
                SourceEvent::Timeout
            };

            match s.source.dispatch(event, feed) {
                Ok(SourceAction::Continue) => {
                    s.deadline = s.timeout.map(|t| Instant::now() + t);
                }
                Ok(SourceAction::Reschedule(timeout)) => {
                    s.timeout = timeout;
                    s.deadline = timeout.map(|t| Instant::now() + t);
                }
                Ok(SourceAction::Remove) => {
                    removals.push(s.handle);
                }
                Err(e) => {
                    // The loop itself never aborts on a callback failure.
                    warn!("session: source {} callback failed: {e}", s.handle);
                    s.deadline = s.timeout.map(|t| Instant::now() + t);
                }
            }
        }

        for handle in removals {
            let _ = self.source_remove(handle);
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
