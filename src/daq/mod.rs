//-----------------------------------------------------------------------------
// Module daq
// DAQ (data acquisition / measurement) engine: DAQ list / ODT / ODT-entry
// tables, the STOPPED -> PREPARED -> RUNNING state machine, and the event
// trigger algorithm that turns a fired event into one transport queue entry
// per ODT.

pub mod event;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, trace, warn};
use parking_lot::RwLock;
use thiserror::Error;

use crate::address::{self, MemoryLocation, XCP_ADDR_EXT_DYN, XCP_ADDR_EXT_REL};
use crate::cal::CalSegmentManager;
use crate::platform::Clock;
use crate::queue::Queue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DaqState {
    Stopped = 0,
    Prepared = 1,
    Running = 2,
}

impl From<u8> for DaqState {
    fn from(v: u8) -> DaqState {
        match v {
            1 => DaqState::Prepared,
            2 => DaqState::Running,
            _ => DaqState::Stopped,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DaqError {
    #[error("DAQ list index out of range")]
    DaqListNotValid,
    #[error("ODT index out of range for this DAQ list")]
    OdtNotValid,
    #[error("ODT entry index out of range for this ODT")]
    OdtEntryNotValid,
    #[error("command not valid while a measurement is running")]
    Sequence,
    #[error("memory allocation for DAQ tables would overflow configured limits")]
    MemoryOverflow,
}

/// A single measured variable's location, as registered by `WRITE_DAQ`.
#[derive(Debug, Clone, Copy)]
pub struct OdtEntry {
    pub ext: u8,
    pub addr: u32,
    pub length: u8,
}

#[derive(Default)]
struct Odt {
    entries: Vec<OdtEntry>,
}

struct DaqList {
    event_id: Option<u16>,
    timestamps_enabled: bool,
    running: AtomicBool,
    odts: Vec<Odt>,
}

impl DaqList {
    fn new() -> DaqList {
        DaqList { event_id: None, timestamps_enabled: true, running: AtomicBool::new(false), odts: Vec::new() }
    }
}

/// Current position of the `SET_DAQ_PTR` cursor, consumed by `WRITE_DAQ`.
#[derive(Debug, Clone, Copy, Default)]
struct DaqPtr {
    daq_list: usize,
    odt: usize,
    entry: usize,
}

/// Resolves addresses that are not event-relative (extensions
/// other than `REL`/`DYN`), so the DAQ engine does not need to know about
/// calibration segments or application state directly.
pub trait MemoryReader: Send + Sync {
    /// Fill `out` with `out.len()` bytes read from `location`. Returns
    /// `false` if the location cannot currently be resolved (the engine
    /// substitutes zero bytes and counts it, but does not abort the
    /// acquisition).
    fn read(&self, location: MemoryLocation, out: &mut [u8]) -> bool;
}

/// Reads segment-relative addresses from a [`CalSegmentManager`].
pub struct CalSegmentReader(pub Arc<CalSegmentManager>);

impl MemoryReader for CalSegmentReader {
    fn read(&self, location: MemoryLocation, out: &mut [u8]) -> bool {
        if let MemoryLocation::Segment { seg_index, offset } = location {
            if let Ok(bytes) = self.0.xcp_read(seg_index as usize, offset, out.len()) {
                out.copy_from_slice(&bytes);
                return true;
            }
        }
        false
    }
}

pub struct TriggerOutcome {
    /// Number of ODTs emitted as transport queue entries.
    pub odts_sent: u32,
    /// Number of ODTs skipped because the queue was full; the remaining
    /// ODTs for this event are skipped once an overrun is hit.
    pub odts_overrun: u32,
}

/// Owns every DAQ list configured by the client. One instance is shared
/// between the protocol layer (which mutates tables in response to
/// `ALLOC_DAQ`/`WRITE_DAQ`/etc.) and the event-trigger call path.
pub struct DaqEngine {
    state: AtomicU8,
    lists: RwLock<Vec<DaqList>>,
    ptr: RwLock<DaqPtr>,
}

impl Default for DaqEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DaqEngine {
    pub fn new() -> DaqEngine {
        DaqEngine {
            state: AtomicU8::new(DaqState::Stopped as u8),
            lists: RwLock::new(Vec::new()),
            ptr: RwLock::new(DaqPtr::default()),
        }
    }

    pub fn state(&self) -> DaqState {
        self.state.load(Ordering::Acquire).into()
    }

    /// Spec open-question resolution: a DAQ table mutation that arrives
    /// mid-measurement is rejected outright rather than silently queued for
    /// the next start/stop boundary.
    fn require_not_running(&self) -> Result<(), DaqError> {
        if self.state() == DaqState::Running {
            Err(DaqError::Sequence)
        } else {
            Ok(())
        }
    }

    /// `FREE_DAQ` / `ALLOC_DAQ`: discard all tables and allocate `count`
    /// fresh, empty DAQ lists. Moves the engine to `Prepared`.
    pub fn alloc_daq(&self, count: u16) -> Result<(), DaqError> {
        self.require_not_running()?;
        let mut lists = self.lists.write();
        lists.clear();
        lists.extend((0..count).map(|_| DaqList::new()));
        self.state.store(DaqState::Prepared as u8, Ordering::Release);
        Ok(())
    }

    pub fn free_daq(&self) -> Result<(), DaqError> {
        self.require_not_running()?;
        self.lists.write().clear();
        self.state.store(DaqState::Stopped as u8, Ordering::Release);
        Ok(())
    }

    pub fn alloc_odt(&self, daq_list: u16, odt_count: u8) -> Result<(), DaqError> {
        self.require_not_running()?;
        let mut lists = self.lists.write();
        let list = lists.get_mut(daq_list as usize).ok_or(DaqError::DaqListNotValid)?;
        list.odts = (0..odt_count).map(|_| Odt::default()).collect();
        Ok(())
    }

    pub fn alloc_odt_entry(&self, daq_list: u16, odt: u8, entry_count: u8) -> Result<(), DaqError> {
        self.require_not_running()?;
        let mut lists = self.lists.write();
        let list = lists.get_mut(daq_list as usize).ok_or(DaqError::DaqListNotValid)?;
        let odt_entry = list.odts.get_mut(odt as usize).ok_or(DaqError::OdtNotValid)?;
        odt_entry.entries = vec![OdtEntry { ext: address::XCP_ADDR_EXT_UNDEF, addr: 0, length: 0 }; entry_count as usize];
        Ok(())
    }

    pub fn set_daq_ptr(&self, daq_list: u16, odt: u8, entry: u8) -> Result<(), DaqError> {
        self.require_not_running()?;
        let lists = self.lists.read();
        let list = lists.get(daq_list as usize).ok_or(DaqError::DaqListNotValid)?;
        let odt_ref = list.odts.get(odt as usize).ok_or(DaqError::OdtNotValid)?;
        if entry as usize >= odt_ref.entries.len() && !odt_ref.entries.is_empty() {
            return Err(DaqError::OdtEntryNotValid);
        }
        *self.ptr.write() = DaqPtr { daq_list: daq_list as usize, odt: odt as usize, entry: entry as usize };
        Ok(())
    }

    /// `WRITE_DAQ`: register one measured variable at the current
    /// `SET_DAQ_PTR` cursor, then advance the cursor to the next entry.
    pub fn write_daq(&self, ext: u8, addr: u32, length: u8) -> Result<(), DaqError> {
        self.require_not_running()?;
        let mut ptr = self.ptr.write();
        let mut lists = self.lists.write();
        let list = lists.get_mut(ptr.daq_list).ok_or(DaqError::DaqListNotValid)?;
        let odt = list.odts.get_mut(ptr.odt).ok_or(DaqError::OdtNotValid)?;
        let slot = odt.entries.get_mut(ptr.entry).ok_or(DaqError::OdtEntryNotValid)?;
        *slot = OdtEntry { ext, addr, length };
        ptr.entry += 1;
        Ok(())
    }

    pub fn set_daq_list_mode(&self, daq_list: u16, event_id: u16, timestamps_enabled: bool) -> Result<(), DaqError> {
        let mut lists = self.lists.write();
        let list = lists.get_mut(daq_list as usize).ok_or(DaqError::DaqListNotValid)?;
        list.event_id = Some(event_id);
        list.timestamps_enabled = timestamps_enabled;
        Ok(())
    }

    pub fn get_daq_list_mode(&self, daq_list: u16) -> Result<(Option<u16>, bool, bool), DaqError> {
        let lists = self.lists.read();
        let list = lists.get(daq_list as usize).ok_or(DaqError::DaqListNotValid)?;
        Ok((list.event_id, list.timestamps_enabled, list.running.load(Ordering::Acquire)))
    }

    /// `START_STOP_DAQ_LIST`: toggle one list's own running flag. Only takes
    /// effect on triggering once the engine as a whole is `Running`.
    pub fn start_stop_daq_list(&self, daq_list: u16, start: bool) -> Result<(), DaqError> {
        let lists = self.lists.read();
        let list = lists.get(daq_list as usize).ok_or(DaqError::DaqListNotValid)?;
        list.running.store(start, Ordering::Release);
        Ok(())
    }

    /// `START_STOP_SYNCH`: start all lists whose own running flag is set, or
    /// stop every list and return the engine to `Stopped`.
    pub fn start_stop_synch(&self, start: bool) {
        if start {
            self.state.store(DaqState::Running as u8, Ordering::Release);
        } else {
            self.state.store(DaqState::Stopped as u8, Ordering::Release);
            for list in self.lists.read().iter() {
                list.running.store(false, Ordering::Release);
            }
        }
    }

    /// Fire every DAQ list bound to `event_id`. `base` is the triggering
    /// event's own capture buffer, used to resolve `REL`/`DYN` addressed
    /// entries; `reader` resolves everything else.
    pub fn trigger(
        &self,
        event_id: u16,
        base: *const u8,
        clock: &Clock,
        queue: &Queue,
        reader: Option<&dyn MemoryReader>,
    ) -> TriggerOutcome {
        let mut outcome = TriggerOutcome { odts_sent: 0, odts_overrun: 0 };
        if self.state() != DaqState::Running {
            return outcome;
        }
        let timestamp = clock.now_32();
        let lists = self.lists.read();
        for list in lists.iter() {
            if list.event_id != Some(event_id) || !list.running.load(Ordering::Acquire) {
                continue;
            }
            for (odt_number, odt) in list.odts.iter().enumerate() {
                let has_timestamp = odt_number == 0 && list.timestamps_enabled;
                let data_len: usize = odt.entries.iter().map(|e| e.length as usize).sum();
                let payload_len = 1 + if has_timestamp { 4 } else { 0 } + data_len;

                let mut buf = match queue.acquire(payload_len) {
                    Some(buf) => buf,
                    None => {
                        outcome.odts_overrun += (list.odts.len() - odt_number) as u32;
                        break;
                    }
                };
                let payload = buf.payload_mut();
                payload[0] = 0xAAu8.wrapping_add(odt_number as u8);
                let mut cursor = 1;
                if has_timestamp {
                    payload[cursor..cursor + 4].copy_from_slice(&timestamp.to_le_bytes());
                    cursor += 4;
                }
                for entry in &odt.entries {
                    let len = entry.length as usize;
                    if len == 0 {
                        continue;
                    }
                    let slot = &mut payload[cursor..cursor + len];
                    if !self.resolve_entry(entry, base, reader, slot) {
                        slot.fill(0);
                    }
                    cursor += len;
                }
                buf.commit(odt_number + 1 == list.odts.len());
                outcome.odts_sent += 1;
            }
        }
        outcome
    }

    fn resolve_entry(&self, entry: &OdtEntry, base: *const u8, reader: Option<&dyn MemoryReader>, out: &mut [u8]) -> bool {
        match entry.ext {
            XCP_ADDR_EXT_REL => {
                if base.is_null() {
                    return false;
                }
                let offset = entry.addr as i32;
                // SAFETY: `base` is the event's own capture buffer, sized by
                // the application to cover every offset it registers.
                unsafe {
                    let src = base.offset(offset as isize);
                    std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
                }
                true
            }
            XCP_ADDR_EXT_DYN => {
                if base.is_null() {
                    return false;
                }
                let offset = (entry.addr & 0xFFFF) as u16 as i16;
                unsafe {
                    let src = base.offset(offset as isize);
                    std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
                }
                true
            }
            _ => {
                if let Ok(loc) = address::decode(entry.ext, entry.addr, None) {
                    if let Some(reader) = reader {
                        return reader.read(loc, out);
                    }
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_single_entry_list(engine: &DaqEngine, event_id: u16, ext: u8, addr: u32, length: u8) {
        engine.alloc_daq(1).unwrap();
        engine.alloc_odt(0, 1).unwrap();
        engine.alloc_odt_entry(0, 0, 1).unwrap();
        engine.set_daq_ptr(0, 0, 0).unwrap();
        engine.write_daq(ext, addr, length).unwrap();
        engine.set_daq_list_mode(0, event_id, true).unwrap();
        engine.start_stop_daq_list(0, true).unwrap();
    }

    #[test]
    fn trigger_is_a_no_op_until_the_engine_is_running() {
        let engine = DaqEngine::new();
        setup_single_entry_list(&engine, 1, XCP_ADDR_EXT_DYN, 1 << 16, 4);
        let (queue, mut consumer) = Queue::new(1024, 64);
        let clock = Clock::new(crate::platform::ClockUnit::Microseconds);
        let value: u32 = 42;
        let outcome = engine.trigger(1, &value as *const u32 as *const u8, &clock, &queue, None);
        assert_eq!(outcome.odts_sent, 0);
        assert!(consumer.peek(2048).is_none());
    }

    #[test]
    fn trigger_emits_one_queue_entry_per_odt_with_timestamp_on_the_first() {
        let engine = DaqEngine::new();
        setup_single_entry_list(&engine, 1, XCP_ADDR_EXT_DYN, (1u32 << 16) | 0, 4);
        engine.start_stop_synch(true);
        let (queue, mut consumer) = Queue::new(1024, 64);
        let clock = Clock::new(crate::platform::ClockUnit::Microseconds);
        let value: u32 = 0xAABBCCDD;
        let outcome = engine.trigger(1, &value as *const u32 as *const u8, &clock, &queue, None);
        assert_eq!(outcome.odts_sent, 1);
        assert_eq!(outcome.odts_overrun, 0);
        let (seg, bytes) = consumer.peek(2048).unwrap();
        // 4-byte transport header + (odt number(1) + timestamp(4) + value(4) = 9), aligned to 16.
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[4], 0xAA); // packet identifier: 0xAA + odt number(0)
        assert_eq!(&bytes[9..13], &value.to_le_bytes());
        consumer.release(seg);
    }

    #[test]
    fn queue_overrun_skips_remaining_odts_for_the_event() {
        let engine = DaqEngine::new();
        engine.alloc_daq(1).unwrap();
        engine.alloc_odt(0, 3).unwrap();
        for odt in 0..3u8 {
            engine.alloc_odt_entry(0, odt, 1).unwrap();
            engine.set_daq_ptr(0, odt, 0).unwrap();
            engine.write_daq(XCP_ADDR_EXT_DYN, 1 << 16, 4).unwrap();
        }
        engine.set_daq_list_mode(0, 1, true).unwrap();
        engine.start_stop_daq_list(0, true).unwrap();
        engine.start_stop_synch(true);

        // Leave too little free space for even the first ODT (needs 16 bytes).
        let (queue, mut consumer) = Queue::new(32, 32);
        let filler = queue.acquire(16).unwrap();
        filler.commit(false);

        let clock = Clock::new(crate::platform::ClockUnit::Microseconds);
        let value: u32 = 1;
        let outcome = engine.trigger(1, &value as *const u32 as *const u8, &clock, &queue, None);
        assert_eq!(outcome.odts_sent, 0);
        assert_eq!(outcome.odts_overrun, 3);
        let (seg, _) = consumer.peek(2048).expect("the filler entry is still there");
        consumer.release(seg);
    }

    #[test]
    fn alloc_daq_is_rejected_while_running() {
        let engine = DaqEngine::new();
        engine.alloc_daq(1).unwrap();
        engine.start_stop_synch(true);
        assert_eq!(engine.alloc_daq(2), Err(DaqError::Sequence));
    }

    #[test]
    fn set_daq_ptr_and_write_daq_are_rejected_while_running() {
        let engine = DaqEngine::new();
        setup_single_entry_list(&engine, 1, XCP_ADDR_EXT_DYN, 1 << 16, 4);
        engine.start_stop_synch(true);
        assert_eq!(engine.set_daq_ptr(0, 0, 0), Err(DaqError::Sequence));
        assert_eq!(engine.write_daq(XCP_ADDR_EXT_DYN, 1 << 16, 4), Err(DaqError::Sequence));
    }
}
