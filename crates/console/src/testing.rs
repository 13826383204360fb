//! Test utilities for usbasp-console
//!
//! Provides an in-memory USBasp, a capturing sink and a shared journal that
//! records lifecycle steps in the order they happen, so tests can assert on
//! ordering across threads.
//!
//! # Example
//!
//! ```
//! use console::testing::FakeTransport;
//! use console::usb::{Transport, UsbaspDevice};
//! use protocol::USBASP;
//!
//! let fake = FakeTransport::new();
//! fake.plug();
//! fake.push_uart(b"ABC");
//!
//! let handle = fake.open_by_identity(&USBASP).unwrap().unwrap();
//! let device = UsbaspDevice::new(handle);
//! assert_eq!(device.get_string().unwrap().as_deref(), Some("ABC"));
//! ```

use crate::sink::ConsoleSink;
use crate::usb::transport::{Transport, UsbHandle};
use common::{EventSender, SessionEvent};
use protocol::commands::{self, join_baud_rate};
use protocol::{ControlSetup, DeviceIdentity, Result, TransferError, USBASP, UsbError};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle steps observed by the fakes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEntry {
    DeviceOpened,
    KernelDriverDetached,
    InterfaceClaimed,
    BaudRateSet(u32),
    InterfaceReleased,
    KernelDriverAttached,
    HandleClosed,
    HotplugRegistered,
    HotplugDeregistered,
    /// `handle_events` ran with no hotplug registration alive
    EventsAfterDeregister,
    SinkActivated,
    SinkClosed,
}

/// Ordered record shared between fakes
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: JournalEntry) {
        lock(&self.entries).push(entry);
    }

    pub fn count(&self, entry: JournalEntry) -> usize {
        lock(&self.entries).iter().filter(|e| **e == entry).count()
    }

    /// Index of the last occurrence of `entry`
    pub fn last_position(&self, entry: JournalEntry) -> Option<usize> {
        lock(&self.entries).iter().rposition(|e| *e == entry)
    }
}

#[derive(Debug)]
struct FakeState {
    identity: DeviceIdentity,
    present: bool,
    hotplug_supported: bool,
    kernel_driver_active: bool,
    claimed: bool,
    leaked_claims: usize,
    open_handles: usize,
    uart: VecDeque<u8>,
    reported_count: Option<u8>,
    baud_rate: Option<u32>,
    fail_claim: Option<TransferError>,
    fail_release: Option<TransferError>,
    fail_baud_rate: Option<TransferError>,
    fail_transfers: Option<TransferError>,
    pump_error: Option<UsbError>,
    transfers: HashMap<u8, usize>,
    events: Option<EventSender>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            identity: USBASP,
            present: false,
            hotplug_supported: true,
            kernel_driver_active: false,
            claimed: false,
            leaked_claims: 0,
            open_handles: 0,
            uart: VecDeque::new(),
            reported_count: None,
            baud_rate: None,
            fail_claim: None,
            fail_release: None,
            fail_baud_rate: None,
            fail_transfers: None,
            pump_error: None,
            transfers: HashMap::new(),
            events: None,
        }
    }
}

/// In-memory USBasp and host context
///
/// Clones share the same device, so a test keeps one clone to drive the
/// device while the code under test owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
    journal: Journal,
}

impl FakeTransport {
    /// Unplugged USBasp on a host with hotplug support
    pub fn new() -> Self {
        Self::default()
    }

    /// Same as [`new`](Self::new) but recording into an existing journal
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            state: Arc::default(),
            journal,
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        lock(&self.state)
    }

    /// Connect the device, firing an arrival if hotplug is registered
    pub fn plug(&self) {
        let (events, identity) = {
            let mut state = self.state();
            state.present = true;
            (state.events.clone(), state.identity)
        };
        if let Some(events) = events {
            let _ = events.notify(SessionEvent::DeviceArrived {
                vendor_id: identity.vendor_id,
                product_id: identity.product_id,
            });
        }
    }

    /// Disconnect the device, firing a departure if hotplug is registered
    pub fn unplug(&self) {
        let (events, identity) = {
            let mut state = self.state();
            state.present = false;
            (state.events.clone(), state.identity)
        };
        if let Some(events) = events {
            let _ = events.notify(SessionEvent::DeviceLeft {
                vendor_id: identity.vendor_id,
                product_id: identity.product_id,
            });
        }
    }

    /// Fire an arrival without changing presence (duplicate notification)
    pub fn fire_arrival(&self) {
        let (events, identity) = {
            let state = self.state();
            (state.events.clone(), state.identity)
        };
        if let Some(events) = events {
            let _ = events.notify(SessionEvent::DeviceArrived {
                vendor_id: identity.vendor_id,
                product_id: identity.product_id,
            });
        }
    }

    pub fn set_hotplug_supported(&self, supported: bool) {
        self.state().hotplug_supported = supported;
    }

    pub fn set_kernel_driver_active(&self, active: bool) {
        self.state().kernel_driver_active = active;
    }

    pub fn kernel_driver_active(&self) -> bool {
        self.state().kernel_driver_active
    }

    /// Append bytes to the device's UART receive buffer
    pub fn push_uart(&self, bytes: &[u8]) {
        self.state().uart.extend(bytes.iter().copied());
    }

    /// Override the next byte count reply (one shot)
    pub fn set_reported_count(&self, count: Option<u8>) {
        self.state().reported_count = count;
    }

    pub fn fail_claim(&self, error: Option<TransferError>) {
        self.state().fail_claim = error;
    }

    pub fn fail_release(&self, error: Option<TransferError>) {
        self.state().fail_release = error;
    }

    pub fn fail_baud_rate(&self, error: Option<TransferError>) {
        self.state().fail_baud_rate = error;
    }

    /// Make every control transfer fail
    pub fn fail_transfers(&self, error: Option<TransferError>) {
        self.state().fail_transfers = error;
    }

    /// Make the next `handle_events` call fail
    pub fn fail_event_pump(&self, error: UsbError) {
        self.state().pump_error = Some(error);
    }

    /// Last baud rate written to the device
    pub fn baud_rate(&self) -> Option<u32> {
        self.state().baud_rate
    }

    /// Number of transfers issued with the given command code
    pub fn transfer_count(&self, command: u8) -> usize {
        self.state().transfers.get(&command).copied().unwrap_or(0)
    }

    pub fn total_transfers(&self) -> usize {
        self.state().transfers.values().sum()
    }

    pub fn open_handles(&self) -> usize {
        self.state().open_handles
    }

    pub fn is_claimed(&self) -> bool {
        self.state().claimed
    }

    /// Handles closed while their interface was still claimed
    pub fn leaked_claims(&self) -> usize {
        self.state().leaked_claims
    }

    pub fn is_hotplug_registered(&self) -> bool {
        self.state().events.is_some()
    }
}

impl Transport for FakeTransport {
    type Handle = FakeHandle;
    type Registration = FakeRegistration;

    fn has_hotplug(&self) -> bool {
        self.state().hotplug_supported
    }

    fn open_by_identity(&self, identity: &DeviceIdentity) -> Result<Option<FakeHandle>> {
        let mut state = self.state();
        if !state.present
            || !state
                .identity
                .matches(identity.vendor_id, identity.product_id)
        {
            return Ok(None);
        }

        state.open_handles += 1;
        self.journal.record(JournalEntry::DeviceOpened);
        Ok(Some(FakeHandle {
            state: Arc::clone(&self.state),
            journal: self.journal.clone(),
            claimed: false,
        }))
    }

    fn register_hotplug(
        &self,
        _identity: &DeviceIdentity,
        events: EventSender,
    ) -> Result<FakeRegistration> {
        let (present, identity) = {
            let mut state = self.state();
            if !state.hotplug_supported {
                return Err(UsbError::Hotplug("not supported".to_string()));
            }
            state.events = Some(events.clone());
            (state.present, state.identity)
        };
        self.journal.record(JournalEntry::HotplugRegistered);

        if present {
            let _ = events.notify(SessionEvent::DeviceArrived {
                vendor_id: identity.vendor_id,
                product_id: identity.product_id,
            });
        }

        Ok(FakeRegistration {
            state: Arc::clone(&self.state),
            journal: self.journal.clone(),
        })
    }

    fn handle_events(&self, timeout: Duration) -> Result<()> {
        {
            let mut state = self.state();
            if state.events.is_none() {
                self.journal.record(JournalEntry::EventsAfterDeregister);
            }
            if let Some(error) = state.pump_error.take() {
                return Err(error);
            }
        }
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(())
    }
}

/// Hotplug registration handed out by [`FakeTransport`]
#[derive(Debug)]
pub struct FakeRegistration {
    state: Arc<Mutex<FakeState>>,
    journal: Journal,
}

impl Drop for FakeRegistration {
    fn drop(&mut self) {
        lock(&self.state).events = None;
        self.journal.record(JournalEntry::HotplugDeregistered);
    }
}

/// Open handle on the fake USBasp
#[derive(Debug)]
pub struct FakeHandle {
    state: Arc<Mutex<FakeState>>,
    journal: Journal,
    claimed: bool,
}

impl FakeHandle {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        lock(&self.state)
    }
}

impl UsbHandle for FakeHandle {
    fn kernel_driver_active(&self, _interface: u8) -> Result<bool> {
        Ok(self.state().kernel_driver_active)
    }

    fn detach_kernel_driver(&mut self, _interface: u8) -> Result<()> {
        self.state().kernel_driver_active = false;
        self.journal.record(JournalEntry::KernelDriverDetached);
        Ok(())
    }

    fn attach_kernel_driver(&mut self, _interface: u8) -> Result<()> {
        self.state().kernel_driver_active = true;
        self.journal.record(JournalEntry::KernelDriverAttached);
        Ok(())
    }

    fn claim_interface(&mut self, interface: u8) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.fail_claim {
            return Err(UsbError::Claim { interface, reason });
        }
        if state.claimed {
            return Err(UsbError::Claim {
                interface,
                reason: TransferError::Busy,
            });
        }
        state.claimed = true;
        drop(state);

        self.claimed = true;
        self.journal.record(JournalEntry::InterfaceClaimed);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<()> {
        let mut state = lock(&self.state);
        if !self.claimed {
            return Err(UsbError::Release {
                interface,
                reason: TransferError::NotFound,
            });
        }
        // The claim is gone either way, as with libusb on a vanished device
        state.claimed = false;
        self.claimed = false;
        if let Some(reason) = state.fail_release {
            return Err(UsbError::Release { interface, reason });
        }
        drop(state);

        self.journal.record(JournalEntry::InterfaceReleased);
        Ok(())
    }

    fn control_transfer(
        &self,
        setup: ControlSetup,
        buffer: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        let mut state = self.state();
        *state.transfers.entry(setup.request).or_insert(0) += 1;

        if let Some(error) = state.fail_transfers {
            return Err(UsbError::Transfer(error));
        }
        if !state.present {
            return Err(UsbError::Transfer(TransferError::NoDevice));
        }

        match setup.request {
            commands::UART_GETBYTECOUNT => {
                let count = match state.reported_count.take() {
                    Some(count) => count,
                    None => state.uart.len().min(usize::from(u8::MAX)) as u8,
                };
                buffer[0] = count;
                Ok(1)
            }
            commands::UART_GETBYTE => match state.uart.pop_front() {
                Some(byte) => {
                    buffer[0] = byte;
                    Ok(1)
                }
                None => Ok(0),
            },
            commands::UART_SETBAUDRATE => {
                if let Some(error) = state.fail_baud_rate {
                    return Err(UsbError::Transfer(error));
                }
                let baud_rate = join_baud_rate(setup.value, setup.index);
                state.baud_rate = Some(baud_rate);
                drop(state);
                self.journal.record(JournalEntry::BaudRateSet(baud_rate));
                Ok(0)
            }
            commands::TEST_CMD1 | commands::TEST_CMD2 | commands::TEST_CMD3 => {
                buffer[0] = setup.request;
                Ok(1)
            }
            _ => Err(UsbError::Transfer(TransferError::NotSupported)),
        }
    }
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        let mut state = self.state();
        state.open_handles = state.open_handles.saturating_sub(1);
        if self.claimed {
            state.claimed = false;
            state.leaked_claims += 1;
        }
        drop(state);
        self.journal.record(JournalEntry::HandleClosed);
    }
}

#[derive(Debug, Default)]
struct MemorySinkState {
    text: String,
    writes: usize,
    activations: usize,
    content_changes: usize,
    closed: bool,
    fail_writes: bool,
}

/// Sink capturing everything written to it
///
/// Clones share the captured text.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
    journal: Option<Journal>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            state: Arc::default(),
            journal: Some(journal),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemorySinkState> {
        lock(&self.state)
    }

    pub fn text(&self) -> String {
        self.state().text.clone()
    }

    /// Number of successful writes
    pub fn writes(&self) -> usize {
        self.state().writes
    }

    pub fn activations(&self) -> usize {
        self.state().activations
    }

    /// Number of completed drain cycles reported to the sink
    pub fn content_changes(&self) -> usize {
        self.state().content_changes
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    fn record(&self, entry: JournalEntry) {
        if let Some(journal) = &self.journal {
            journal.record(entry);
        }
    }
}

impl ConsoleSink for MemorySink {
    fn activate(&mut self) {
        self.state().activations += 1;
        self.record(JournalEntry::SinkActivated);
    }

    fn write(&mut self, text: &str) -> io::Result<()> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(io::Error::other("display unavailable"));
        }
        state.text.push_str(text);
        state.writes += 1;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn content_changed(&mut self) {
        self.state().content_changes += 1;
    }

    fn close(&mut self) -> io::Result<()> {
        self.state().closed = true;
        self.record(JournalEntry::SinkClosed);
        Ok(())
    }
}
