//-----------------------------------------------------------------------------
// Module cal
// Calibration-segment manager: dual-page (working RAM / reference FLASH)
// storage per segment, a page selector for the ECU side and one for the XCP
// client side, ECU-side page pinning via lock()/unlock(), freeze/init, and
// the XCP_ADD_44 checksum used by BUILD_CHECKSUM.
//
// The RAM working page is an `ArcSwap<Vec<u8>>`: `ecu_read`/`xcp_read` load
// the current page with a single atomic pointer read and never block, even
// against a concurrent writer. Writers (`xcp_write`, `end_transaction`,
// `copy_cal_page`) serialize against each other through a per-segment
// `write_lock`, clone-modify-store a whole new page, and publish it with one
// `store`, so a reader never observes a partially-applied write. Page
// *pinning* for a locked reader is not tracked here: it lives on the
// `CalSeg<T>` handle itself (see `cal_seg`), since two clones of the same
// segment must be able to pin independently.

pub mod cal_seg;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
#[allow(unused_imports)]
use log::{debug, trace, warn};
use parking_lot::RwLock;
use thiserror::Error;

/// Which page a byte slot currently lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CalPageKind {
    Ram = 0,
    Flash = 1,
}

impl From<u8> for CalPageKind {
    fn from(v: u8) -> CalPageKind {
        if v == 1 {
            CalPageKind::Flash
        } else {
            CalPageKind::Ram
        }
    }
}

/// `GET_CAL_PAGE`/`SET_CAL_PAGE` address either the ECU's own view or the
/// view the XCP client's memory transfer commands operate on; they can
/// differ: the ECU and XCP page selectors are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTarget {
    Ecu,
    Xcp,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CalError {
    #[error("calibration segment index out of range")]
    SegmentNotValid,
    #[error("access out of the segment's bounds")]
    OutOfRange,
    #[error("writes are only permitted to the RAM page")]
    AccessDenied,
    #[error("segment is locked by the ECU and cannot be swapped")]
    Locked,
    #[error("an atomic calibration transaction is already open")]
    Active,
}

struct SegmentState {
    name: String,
    flash: Box<[u8]>,
    ram: ArcSwap<Vec<u8>>,
    /// Serializes `xcp_write`/`end_transaction`/`copy_cal_page` against each
    /// other; never taken by a reader.
    write_lock: parking_lot::Mutex<()>,
}

/// A single staged write, recorded while a `USER_CMD(0x01)` atomic
/// calibration transaction is open; writes are staged and applied
/// atomically on transaction end.
struct StagedWrite {
    seg_index: usize,
    offset: u32,
    data: Vec<u8>,
}

/// Owns every calibration segment created by the application. Shared behind
/// an `Arc` between the protocol layer (DOWNLOAD/UPLOAD/GET_SET_CAL_PAGE/
/// COPY_CAL_PAGE/BUILD_CHECKSUM handlers) and every `CalSeg<T>` facade handed
/// out to application code.
pub struct CalSegmentManager {
    segments: RwLock<Vec<SegmentState>>,
    ecu_page: AtomicU8,
    xcp_page: AtomicU8,
    /// `None` outside a transaction; `Some(staged)` between `USER_CMD(0x01)`
    /// and `USER_CMD(0x02)`.
    transaction: parking_lot::Mutex<Option<Vec<StagedWrite>>>,
}

impl Default for CalSegmentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CalSegmentManager {
    pub fn new() -> CalSegmentManager {
        CalSegmentManager {
            segments: RwLock::new(Vec::new()),
            ecu_page: AtomicU8::new(CalPageKind::Ram as u8),
            xcp_page: AtomicU8::new(CalPageKind::Ram as u8),
            transaction: parking_lot::Mutex::new(None),
        }
    }

    /// `USER_CMD(0x01)`: open an atomic calibration transaction. Every
    /// `xcp_write` until `end_transaction` is staged rather than applied.
    /// Rejected with `CalError::Active` if a transaction is already open -
    /// the client must pair every `begin` with an `end` before starting
    /// another one.
    pub fn begin_transaction(&self) -> Result<(), CalError> {
        let mut transaction = self.transaction.lock();
        if transaction.is_some() {
            return Err(CalError::Active);
        }
        *transaction = Some(Vec::new());
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.lock().is_some()
    }

    /// `USER_CMD(0x02)`: apply every staged write and close the transaction.
    /// Writes are grouped by segment; each segment's whole new page is built
    /// from a single clone of the current one and published with one atomic
    /// `store`, so a concurrent `ecu_read` (which never takes a lock) sees
    /// either the pre-transaction page or the fully-applied one, never a
    /// partial write.
    pub fn end_transaction(&self) -> Result<(), CalError> {
        let staged = self.transaction.lock().take().unwrap_or_default();
        let segments = self.segments.read();
        let mut by_segment: Vec<(usize, Vec<(u32, Vec<u8>)>)> = Vec::new();
        for write in staged {
            match by_segment.iter_mut().find(|(idx, _)| *idx == write.seg_index) {
                Some((_, writes)) => writes.push((write.offset, write.data)),
                None => by_segment.push((write.seg_index, vec![(write.offset, write.data)])),
            }
        }
        for (seg_index, writes) in by_segment {
            let seg = segments.get(seg_index).ok_or(CalError::SegmentNotValid)?;
            let _write_guard = seg.write_lock.lock();
            let mut updated = (**seg.ram.load()).clone();
            for (offset, data) in writes {
                let offset = offset as usize;
                let dst = updated.get_mut(offset..offset + data.len()).ok_or(CalError::OutOfRange)?;
                dst.copy_from_slice(&data);
            }
            seg.ram.store(Arc::new(updated));
        }
        Ok(())
    }

    /// Register a new segment with `default` as both its initial RAM working
    /// copy and its immutable FLASH reference. Returns the segment's index,
    /// stable for the lifetime of the manager.
    pub fn create_segment(&self, name: &str, default: &[u8]) -> usize {
        let mut segments = self.segments.write();
        let index = segments.len();
        segments.push(SegmentState {
            name: name.to_string(),
            flash: default.to_vec().into_boxed_slice(),
            ram: ArcSwap::from_pointee(default.to_vec()),
            write_lock: parking_lot::Mutex::new(()),
        });
        index
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    pub fn segment_name(&self, index: usize) -> Option<String> {
        self.segments.read().get(index).map(|s| s.name.clone())
    }

    pub fn segment_size(&self, index: usize) -> Result<usize, CalError> {
        let segments = self.segments.read();
        let seg = segments.get(index).ok_or(CalError::SegmentNotValid)?;
        Ok(seg.flash.len())
    }

    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.segments.read().iter().position(|s| s.name == name)
    }

    pub fn get_cal_page(&self, target: PageTarget) -> CalPageKind {
        match target {
            PageTarget::Ecu => self.ecu_page.load(Ordering::Acquire).into(),
            PageTarget::Xcp => self.xcp_page.load(Ordering::Acquire).into(),
        }
    }

    /// Request a global page switch.
    pub fn set_cal_page(&self, target: PageTarget, page: CalPageKind) {
        match target {
            PageTarget::Ecu => self.ecu_page.store(page as u8, Ordering::Release),
            PageTarget::Xcp => self.xcp_page.store(page as u8, Ordering::Release),
        }
    }

    /// Validate `index` and return the ECU page currently in effect, for a
    /// caller (a `CalSeg<T>` handle) that wants to pin its own view of the
    /// segment against a concurrent `SET_CAL_PAGE`. The manager itself keeps
    /// no per-segment lock state: two `CalSeg` clones pinning concurrently
    /// must not share one flag, so the pin lives on the handle, not here.
    pub fn lock(&self, index: usize) -> Result<CalPageKind, CalError> {
        let segments = self.segments.read();
        segments.get(index).ok_or(CalError::SegmentNotValid)?;
        Ok(self.ecu_page.load(Ordering::Acquire).into())
    }

    /// Companion to [`CalSegmentManager::lock`]; only validates that `index`
    /// still exists, the pin itself is released by the caller discarding its
    /// own pinned-page state.
    pub fn unlock(&self, index: usize) -> Result<(), CalError> {
        let segments = self.segments.read();
        segments.get(index).ok_or(CalError::SegmentNotValid)?;
        Ok(())
    }

    fn ecu_read_from_page(&self, seg: &SegmentState, page: CalPageKind, len: usize) -> Result<Vec<u8>, CalError> {
        match page {
            CalPageKind::Flash => {
                if len > seg.flash.len() {
                    return Err(CalError::OutOfRange);
                }
                Ok(seg.flash[..len].to_vec())
            }
            CalPageKind::Ram => {
                let ram = seg.ram.load();
                if len > ram.len() {
                    return Err(CalError::OutOfRange);
                }
                Ok(ram[..len].to_vec())
            }
        }
    }

    /// ECU-side typed read following the current global ECU page selector.
    /// A single atomic load of the RAM page, no lock taken.
    pub fn ecu_read(&self, index: usize, len: usize) -> Result<Vec<u8>, CalError> {
        let segments = self.segments.read();
        let seg = segments.get(index).ok_or(CalError::SegmentNotValid)?;
        let page = self.ecu_page.load(Ordering::Acquire).into();
        self.ecu_read_from_page(seg, page, len)
    }

    /// ECU-side typed read pinned to `page` rather than the current global
    /// selector, used by a `CalSeg<T>` handle between `lock()` and
    /// `unlock()`.
    pub fn ecu_read_with_page(&self, index: usize, len: usize, page: CalPageKind) -> Result<Vec<u8>, CalError> {
        let segments = self.segments.read();
        let seg = segments.get(index).ok_or(CalError::SegmentNotValid)?;
        self.ecu_read_from_page(seg, page, len)
    }

    /// Protocol-side read, following the XCP page selector, used to service
    /// `UPLOAD`/`SHORT_UPLOAD` of segment-relative addresses.
    pub fn xcp_read(&self, index: usize, offset: u32, len: usize) -> Result<Vec<u8>, CalError> {
        let segments = self.segments.read();
        let seg = segments.get(index).ok_or(CalError::SegmentNotValid)?;
        let offset = offset as usize;
        match self.xcp_page.load(Ordering::Acquire).into() {
            CalPageKind::Flash => seg.flash.get(offset..offset + len).map(|s| s.to_vec()).ok_or(CalError::OutOfRange),
            CalPageKind::Ram => {
                let ram = seg.ram.load();
                ram.get(offset..offset + len).map(|s| s.to_vec()).ok_or(CalError::OutOfRange)
            }
        }
    }

    /// Protocol-side write, used to service `DOWNLOAD`/`SHORT_DOWNLOAD`. Only
    /// the RAM page is writable; writing while the FLASH page is selected is
    /// rejected with `AccessDenied`. While an atomic calibration transaction
    /// is open (`begin_transaction`), the write is staged instead of applied
    /// immediately (`USER_CMD` 0x01/0x02).
    pub fn xcp_write(&self, index: usize, offset: u32, data: &[u8]) -> Result<(), CalError> {
        let segments = self.segments.read();
        let seg = segments.get(index).ok_or(CalError::SegmentNotValid)?;
        if self.xcp_page.load(Ordering::Acquire) != CalPageKind::Ram as u8 {
            return Err(CalError::AccessDenied);
        }
        let offset_usize = offset as usize;
        if offset_usize + data.len() > seg.flash.len() {
            return Err(CalError::OutOfRange);
        }

        let mut transaction = self.transaction.lock();
        if let Some(staged) = transaction.as_mut() {
            staged.push(StagedWrite { seg_index: index, offset, data: data.to_vec() });
            return Ok(());
        }
        drop(transaction);

        let _write_guard = seg.write_lock.lock();
        let mut updated = (**seg.ram.load()).clone();
        let dst = updated.get_mut(offset_usize..offset_usize + data.len()).ok_or(CalError::OutOfRange)?;
        dst.copy_from_slice(data);
        seg.ram.store(Arc::new(updated));
        Ok(())
    }

    /// `COPY_CAL_PAGE`: copy one page's bytes onto another within the same
    /// segment. Only copying FLASH onto RAM is meaningful (the reverse would
    /// mutate the immutable reference); copying flash onto ram is exactly
    /// the `init` operation below, kept as a separate entry point per the
    /// wire command's own name.
    pub fn copy_cal_page(&self, index: usize, src: CalPageKind, dst: CalPageKind) -> Result<(), CalError> {
        if dst == CalPageKind::Flash {
            return Err(CalError::AccessDenied);
        }
        let segments = self.segments.read();
        let seg = segments.get(index).ok_or(CalError::SegmentNotValid)?;
        match src {
            CalPageKind::Flash => {
                let _write_guard = seg.write_lock.lock();
                seg.ram.store(Arc::new(seg.flash.to_vec()));
                Ok(())
            }
            CalPageKind::Ram => Ok(()), // ram -> ram is a no-op
        }
    }

    /// Reset the RAM working page back to the FLASH reference values.
    pub fn init(&self, index: usize) -> Result<(), CalError> {
        self.copy_cal_page(index, CalPageKind::Flash, CalPageKind::Ram)
    }

    /// Snapshot the current RAM working page. The caller (typically the
    /// `serde` persistence path) decides what to do with the bytes; this
    /// engine has no file-format opinion of its own.
    pub fn freeze(&self, index: usize) -> Result<Vec<u8>, CalError> {
        let segments = self.segments.read();
        let seg = segments.get(index).ok_or(CalError::SegmentNotValid)?;
        Ok((**seg.ram.load()).clone())
    }

    /// `BUILD_CHECKSUM` using the XCP `ADD_44` algorithm: the region is
    /// summed as 32-bit little-endian words with wrapping addition, the
    /// final partial word (if any) zero-padded.
    pub fn checksum(&self, index: usize, offset: u32, len: u32) -> Result<u32, CalError> {
        let bytes = self.xcp_read(index, offset, len as usize)?;
        Ok(add_44(&bytes))
    }
}

fn add_44(bytes: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    let mut chunks = bytes.chunks_exact(4);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u32::from_le_bytes(chunk.try_into().unwrap()));
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut word = [0u8; 4];
        word[..rem.len()].copy_from_slice(rem);
        sum = sum.wrapping_add(u32::from_le_bytes(word));
    }
    sum
}
