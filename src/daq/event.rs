//-----------------------------------------------------------------------------
// Module daq::event
// Ergonomic measurement-event facade: `XcpEvent` (a lightweight event handle)
// and `DaqEvent<N>` (a fixed-capacity capture buffer bump-allocated by
// application code at startup, then triggered every cycle).

use std::sync::atomic::{AtomicU16, Ordering};

#[allow(unused_imports)]
use log::{trace, warn};

/// Reserved id meaning "no event".
pub const XCP_UNDEFINED_EVENT_ID: u16 = 0xFFFF;

/// A registered measurement event. Cheap to copy and share between threads;
/// the id is the only thing that matters to the DAQ engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XcpEvent {
    id: u16,
}

impl XcpEvent {
    pub(crate) fn new(id: u16) -> XcpEvent {
        XcpEvent { id }
    }

    pub fn get_id(&self) -> u16 {
        self.id
    }

    pub fn is_undefined(&self) -> bool {
        self.id == XCP_UNDEFINED_EVENT_ID
    }
}

/// Registry of every event created via [`crate::Xcp::create_event`],
/// assigning ids sequentially (DAQ lists bind to an event by id).
pub struct EventRegistry {
    next_id: AtomicU16,
    names: parking_lot::Mutex<Vec<String>>,
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRegistry {
    pub fn new() -> EventRegistry {
        EventRegistry { next_id: AtomicU16::new(0), names: parking_lot::Mutex::new(Vec::new()) }
    }

    pub fn create_event(&self, name: &str) -> XcpEvent {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.names.lock().push(name.to_string());
        XcpEvent::new(id)
    }

    pub fn name_of(&self, event: XcpEvent) -> Option<String> {
        self.names.lock().get(event.id as usize).cloned()
    }

    pub fn count(&self) -> u16 {
        self.next_id.load(Ordering::Relaxed)
    }
}

/// A fixed-capacity capture buffer an application fills once per cycle and
/// triggers through its bound [`XcpEvent`]. `N` bounds how many bytes of
/// measurement variables can be bump-allocated into it via
/// [`DaqEvent::add_capture`].
pub struct DaqEvent<const N: usize> {
    event: XcpEvent,
    buffer: [u8; N],
    len: usize,
}

impl<const N: usize> DaqEvent<N> {
    pub fn new(event: XcpEvent) -> DaqEvent<N> {
        DaqEvent { event, buffer: [0u8; N], len: 0 }
    }

    pub fn get_event(&self) -> XcpEvent {
        self.event
    }

    /// Bump-allocate `size` bytes for a measurement variable, returning its
    /// offset into the capture buffer (used as the `DYN` address offset
    /// registered with `WRITE_DAQ`).
    pub fn allocate(&mut self, size: usize) -> i16 {
        assert!(self.len + size <= N, "DaqEvent buffer capacity exceeded");
        let offset = self.len as i16;
        self.len += size;
        offset
    }

    /// Copy `data` into the buffer at `offset`, previously obtained from
    /// [`DaqEvent::allocate`].
    pub fn capture(&mut self, data: &[u8], offset: i16) {
        let offset = offset as usize;
        self.buffer[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Allocate space for and capture `data` in one call, returning the
    /// offset for registration.
    pub fn add_capture(&mut self, data: &[u8]) -> i16 {
        let offset = self.allocate(data.len());
        self.capture(data, offset);
        offset
    }

    pub fn buffer_ptr(&self) -> *const u8 {
        self.buffer.as_ptr()
    }

    pub fn buffer_len(&self) -> usize {
        self.len
    }
}

/// Create a process-wide event and bind a `DaqEvent<N>` to it, in one
/// expression.
#[macro_export]
macro_rules! daq_create_event {
    ($name:expr) => {
        $crate::daq::event::DaqEvent::<256>::new($crate::Xcp::get().create_event($name))
    };
    ($name:expr, $capacity:expr) => {
        $crate::daq::event::DaqEvent::<$capacity>::new($crate::Xcp::get().create_event($name))
    };
}

/// Register a measurement variable on a `DaqEvent`, returning the byte
/// offset assigned to it within the event's capture buffer - callers keep
/// that offset themselves when they need it for `WRITE_DAQ`.
#[macro_export]
macro_rules! daq_register {
    ($var:expr, $event:expr) => {
        $event.add_capture(unsafe {
            ::std::slice::from_raw_parts((&$var as *const _) as *const u8, ::std::mem::size_of_val(&$var))
        })
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_assigned_sequential_ids() {
        let registry = EventRegistry::new();
        let a = registry.create_event("mainloop");
        let b = registry.create_event("background");
        assert_eq!(a.get_id(), 0);
        assert_eq!(b.get_id(), 1);
        assert_eq!(registry.name_of(a).as_deref(), Some("mainloop"));
    }

    #[test]
    fn daq_event_allocates_offsets_in_order() {
        let mut daq_event = DaqEvent::<64>::new(XcpEvent::new(0));
        let off_a = daq_event.add_capture(&[1u8, 2, 3, 4]);
        let off_b = daq_event.add_capture(&[5u8, 6]);
        assert_eq!(off_a, 0);
        assert_eq!(off_b, 4);
        assert_eq!(daq_event.buffer_len(), 6);
    }

    #[test]
    #[should_panic(expected = "capacity exceeded")]
    fn daq_event_panics_on_capacity_overflow() {
        let mut daq_event = DaqEvent::<2>::new(XcpEvent::new(0));
        daq_event.allocate(3);
    }
}
