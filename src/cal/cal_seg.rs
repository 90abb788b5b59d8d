//-----------------------------------------------------------------------------
// Module cal::cal_seg
// `CalSeg<T>`: the typed, ergonomic handle application code holds onto for a
// calibration segment (`new`, `Deref`-like read access, `Clone`). Rather than
// owning a private page synchronized by an explicit call, this one reads
// straight through the shared `CalSegmentManager`, since the engine
// underneath already owns the page-swap logic.
//
// `lock()`/`unlock()` pinning is *not* manager state: it is a property of
// this particular handle. Each clone of a `CalSeg<T>` gets its own pin, so
// two threads each holding a clone and calling `with_locked()` concurrently
// never share one lock flag - one clone being locked has no effect on what
// another clone (or the ECU reading through it) observes.

use std::cell::Cell;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

use super::{CalError, CalPageKind, CalSegmentManager};

/// A calibration segment typed as `T`. `T` must be a plain-old-data struct:
/// `Copy` so a snapshot read can hand back an owned value, `'static` so no
/// segment outlives the data it was registered with.
pub struct CalSeg<T: Copy + 'static> {
    manager: Arc<CalSegmentManager>,
    index: usize,
    /// `Some(page)` between this handle's own `lock()` and `unlock()`; `None`
    /// otherwise. Per-clone, not shared with any other `CalSeg<T>` pointing
    /// at the same segment.
    pinned_page: Cell<Option<CalPageKind>>,
    _marker: PhantomData<T>,
}

impl<T: Copy + 'static> CalSeg<T> {
    /// Registers a new segment named `name` with `default` as both its
    /// initial working (RAM) and reference (FLASH) page.
    pub fn new(manager: &Arc<CalSegmentManager>, name: &str, default: &T) -> CalSeg<T> {
        let bytes = unsafe { std::slice::from_raw_parts(default as *const T as *const u8, size_of::<T>()) };
        let index = manager.create_segment(name, bytes);
        CalSeg { manager: Arc::clone(manager), index, pinned_page: Cell::new(None), _marker: PhantomData }
    }

    pub fn name(&self) -> String {
        self.manager.segment_name(self.index).expect("segment index is valid for its own lifetime")
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// A snapshot copy of the segment's value as currently seen from the ECU
    /// side (honors this handle's own `lock()`/`unlock()` pinning).
    pub fn read(&self) -> T {
        let bytes = match self.pinned_page.get() {
            Some(page) => self.manager.ecu_read_with_page(self.index, size_of::<T>(), page),
            None => self.manager.ecu_read(self.index, size_of::<T>()),
        }
        .expect("segment size was fixed at registration and cannot go out of range");
        debug_assert_eq!(bytes.len(), size_of::<T>());
        unsafe { std::ptr::read(bytes.as_ptr() as *const T) }
    }

    /// Run `f` with a pinned, consistent view of the value: equivalent to
    /// `lock(); let v = read(); unlock(); f(v)` but makes the pin/unpin pair
    /// impossible to forget.
    pub fn with_locked<R>(&self, f: impl FnOnce(T) -> R) -> R {
        self.lock().expect("segment index is valid for its own lifetime");
        let value = self.read();
        self.unlock().expect("segment index is valid for its own lifetime");
        f(value)
    }

    /// Explicit pin: this handle will not observe a page switch requested by
    /// `SET_CAL_PAGE` until `unlock()` is called, even if another clone of
    /// the same segment is locked, unlocked, or reading unpinned at the same
    /// time. Prefer [`CalSeg::with_locked`] unless the critical section spans
    /// more than a single expression.
    pub fn lock(&self) -> Result<(), CalError> {
        let page = self.manager.lock(self.index)?;
        self.pinned_page.set(Some(page));
        Ok(())
    }

    pub fn unlock(&self) -> Result<(), CalError> {
        self.manager.unlock(self.index)?;
        self.pinned_page.set(None);
        Ok(())
    }
}

/// Optional JSON persistence for the working (RAM) page, gated behind the
/// `serde` feature. `T` additionally needs `Serialize`/`DeserializeOwned`
/// here; the byte-level manager underneath is untouched by the feature flag.
#[cfg(feature = "serde")]
impl<T: Copy + 'static + serde::Serialize + serde::de::DeserializeOwned> CalSeg<T> {
    /// Write the current working-page value as JSON to `path`.
    pub fn save_to_file(&self, path: &std::path::Path) -> std::io::Result<()> {
        let value = self.read();
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &value)?;
        Ok(())
    }

    /// Overwrite the working page from JSON previously written by
    /// [`CalSeg::save_to_file`]. Fails rather than silently keeping defaults
    /// if the file is missing or does not deserialize as `T`.
    pub fn load_from_file(&self, path: &std::path::Path) -> std::io::Result<()> {
        let file = std::fs::File::open(path)?;
        let value: T = serde_json::from_reader(std::io::BufReader::new(file))?;
        let bytes = unsafe { std::slice::from_raw_parts(&value as *const T as *const u8, size_of::<T>()) };
        self.manager.xcp_write(self.index, 0, bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(())
    }
}

impl<T: Copy + 'static> Clone for CalSeg<T> {
    fn clone(&self) -> CalSeg<T> {
        // A fresh, unpinned Cell: the clone does not inherit whatever lock
        // state `self` happens to be in, it starts unlocked and pins
        // independently.
        CalSeg { manager: Arc::clone(&self.manager), index: self.index, pinned_page: Cell::new(None), _marker: PhantomData }
    }
}

// A `CalSeg<T>` can be moved to another thread - the manager it points at is
// `Send + Sync` and the index is a plain usize - but it cannot be shared by
// reference across threads: `pinned_page` is a `Cell`, so concurrent
// `lock()`/`with_locked()` calls through the same instance would race on it.
// Every caller that needs a handle on more than one thread clones one per
// thread instead.
unsafe impl<T: Copy + 'static> Send for CalSeg<T> {}
