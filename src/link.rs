//! One task per BMS: connect, poll, reassemble, decode, store.

use crate::battery::Battery;
use crate::config::LinkConfig;
use crate::protocol::{BmsProtocol, Reply, Request};
use crate::snapshot::{BatterySnapshot, DataClass};
use crate::transport::BleTransport;
use crate::watchdog::Watchdog;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Connection bookkeeping, published read-only to everything outside the loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkState {
    pub connected: bool,
    pub last_update: [Option<Instant>; 2],
    /// Failed connect attempts since the last successful one
    pub retry_count: u32,
}

impl LinkState {
    pub fn last_update(&self, class: DataClass) -> Option<Instant> {
        self.last_update[class.index()]
    }
}

#[derive(Debug, Default)]
struct LinkData {
    snapshot: BatterySnapshot,
    /// Data classes decoded at least once
    seen: [bool; 2],
}

fn lock(shared: &Mutex<LinkData>) -> MutexGuard<'_, LinkData> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ConnectionLoop<T, P> {
    address: String,
    transport: T,
    protocol: P,
    config: LinkConfig,
    shared: Arc<Mutex<LinkData>>,
    state: watch::Sender<LinkState>,
    watchdog: Option<Arc<Watchdog>>,
    running: Arc<AtomicBool>,
    connected: bool,
}

impl<T, P> ConnectionLoop<T, P>
where
    T: BleTransport,
    P: BmsProtocol,
{
    /// Runs until the running flag is cleared; checked once per iteration.
    pub async fn run(mut self) {
        log::debug!("Link {} started", self.address);
        while self.running.load(Ordering::Relaxed) {
            if !self.connected {
                if let Err(err) = self.connect().await {
                    log::info!("Connection to {} failed: {err}", self.address);
                    let _ = self.transport.disconnect().await;
                    self.protocol.reset();
                    self.connected = false;
                    self.state.send_modify(|state| {
                        state.connected = false;
                        state.retry_count += 1;
                    });
                    tokio::time::sleep(self.config.retry_delay).await;
                    continue;
                }
            }
            if let Err(err) = self.poll().await {
                self.drop_connection(err).await;
            }
        }
        if self.connected {
            let _ = self.transport.disconnect().await;
            self.connected = false;
            self.state.send_modify(|state| state.connected = false);
        }
        log::debug!("Link {} stopped", self.address);
    }

    async fn connect(&mut self) -> Result<()> {
        log::info!("Connecting {}", self.address);
        let profile = self.protocol.gatt_profile();
        self.transport.connect(&self.address, &profile).await?;
        self.protocol.reset();
        self.connected = true;
        self.state.send_modify(|state| {
            *state = LinkState {
                connected: true,
                ..LinkState::default()
            }
        });
        log::info!("Connected {}", self.address);

        for request in self.protocol.connect_requests() {
            if !self.exchange(&request).await? {
                log::warn!(
                    "{}: no reply to {:02X?}, continuing without it",
                    self.address,
                    request.frame
                );
            }
        }
        Ok(())
    }

    async fn drop_connection(&mut self, err: Error) {
        log::info!("Disconnected {}: {err}", self.address);
        let _ = self.transport.disconnect().await;
        self.protocol.reset();
        self.connected = false;
        self.state.send_modify(|state| state.connected = false);
        tokio::time::sleep(self.config.reconnect_delay).await;
    }

    /// One poll cycle: requests in strict turn, then listen until the interval is over.
    async fn poll(&mut self) -> Result<()> {
        let next_poll = Instant::now() + self.config.poll_interval;
        for request in self.protocol.poll_requests() {
            if !self.exchange(&request).await? {
                log::debug!("{}: no reply to {:02X?}", self.address, request.frame);
            }
        }
        // listen at least once per cycle
        loop {
            let wait = next_poll
                .saturating_duration_since(Instant::now())
                .min(self.config.notification_wait);
            self.receive(wait).await?;
            if !self.running.load(Ordering::Relaxed) || Instant::now() >= next_poll {
                return Ok(());
            }
        }
    }

    /// Writes `request` and waits, bounded, until a frame satisfies its expectation.
    ///
    /// Returns false on timeout; only transport failures are errors.
    async fn exchange(&mut self, request: &Request) -> Result<bool> {
        log::trace!("{}: request {:02X?}", self.address, request.frame);
        self.transport
            .write(&request.frame, request.with_response)
            .await?;
        self.protocol.on_request_sent(request);
        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let wait = (deadline - now).min(self.config.notification_wait);
            if let Some(reply) = self.receive(wait).await? {
                if request.expect.is_satisfied_by(&reply) {
                    return Ok(true);
                }
            }
        }
    }

    async fn receive(&mut self, timeout: std::time::Duration) -> Result<Option<Reply>> {
        match self.transport.wait_for_notification(timeout).await? {
            Some(fragment) => Ok(self.handle_fragment(&fragment)),
            None => Ok(None),
        }
    }

    /// Feeds a fragment through the protocol and stores what it decoded.
    ///
    /// Decode failures cost only the frame and are not propagated.
    fn handle_fragment(&mut self, fragment: &[u8]) -> Option<Reply> {
        let update = match self.protocol.on_fragment(fragment) {
            Ok(Some(update)) => update,
            Ok(None) => return None,
            Err(err) => {
                log::debug!("{}: frame dropped: {err}", self.address);
                return None;
            }
        };
        let reply = P::reply(&update);

        let applied = {
            let mut data = lock(&self.shared);
            let result = self.protocol.apply(update, &mut data.snapshot);
            if result.is_ok() {
                for class in reply.refreshed() {
                    data.seen[class.index()] = true;
                }
            }
            result
        };
        if let Err(err) = applied {
            log::warn!("{}: {err}", self.address);
            return Some(reply);
        }

        let now = Instant::now();
        for class in reply.refreshed() {
            if let Some(watchdog) = &self.watchdog {
                watchdog.stamp_at(*class, now);
            }
        }
        if !reply.refreshed().is_empty() {
            self.state.send_modify(|state| {
                for class in reply.refreshed() {
                    state.last_update[class.index()] = Some(now);
                }
            });
        }
        Some(reply)
    }
}

/// Stops and awaits a link task.
pub struct LinkController {
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl LinkController {
    /// Asks the loop to stop at its next iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub async fn join(self) {
        if let Err(err) = self.task.await {
            log::error!("Link task failed: {err}");
        }
    }
}

/// Read side of one link.
#[derive(Clone)]
pub struct BatteryHandle {
    address: String,
    shared: Arc<Mutex<LinkData>>,
    state: watch::Receiver<LinkState>,
}

impl BatteryHandle {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn link_state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    /// Copy of the most recently stored snapshot.
    pub fn latest(&self) -> BatterySnapshot {
        lock(&self.shared).snapshot.clone()
    }
}

impl Battery for BatteryHandle {
    fn get_settings(&mut self) -> bool {
        lock(&self.shared).seen[DataClass::GeneralInfo.index()]
    }

    fn refresh_data(&mut self) -> bool {
        lock(&self.shared).seen.iter().all(|seen| *seen)
    }

    fn get_current_snapshot(&self) -> BatterySnapshot {
        self.latest()
    }
}

/// Starts the connection loop for `address` on the runtime.
pub fn spawn_link<T, P>(
    address: impl Into<String>,
    transport: T,
    protocol: P,
    config: LinkConfig,
    watchdog: Option<Arc<Watchdog>>,
) -> (BatteryHandle, LinkController)
where
    T: BleTransport + 'static,
    P: BmsProtocol + 'static,
{
    let address = address.into();
    let shared = Arc::new(Mutex::new(LinkData {
        snapshot: BatterySnapshot::new(protocol.battery_type(), address.clone()),
        seen: [false; 2],
    }));
    let (state_tx, state_rx) = watch::channel(LinkState::default());
    let running = Arc::new(AtomicBool::new(true));

    let connection = ConnectionLoop {
        address: address.clone(),
        transport,
        protocol,
        config,
        shared: shared.clone(),
        state: state_tx,
        watchdog,
        running: running.clone(),
        connected: false,
    };
    let task = tokio::spawn(connection.run());

    (
        BatteryHandle {
            address,
            shared,
            state: state_rx,
        },
        LinkController { running, task },
    )
}
