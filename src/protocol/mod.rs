//-----------------------------------------------------------------------------
// Module protocol
// Command dispatch, session state machine, and the `XcpError` taxonomy.

pub mod codes;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
#[allow(unused_imports)]
use log::{debug, info, trace, warn};
use parking_lot::RwLock;
use thiserror::Error;

use crate::address::{self, AddressError, MemoryLocation};
use crate::cal::{CalError, CalPageKind, CalSegmentManager, PageTarget};
use crate::daq::event::EventRegistry;
use crate::daq::{DaqEngine, DaqError};
use crate::platform::Clock;
use codes::*;

/// Fixed absolute address at which the EPK (ECU program identifier / A2L
/// version tag) is served, matching the convention most XCP slaves and A2L
/// tools use: a client that knows nothing about this server's memory layout
/// can still `SET_MTA(ABS, XCP_EPK_ADDR)` + `UPLOAD` to fetch it.
pub const XCP_EPK_ADDR: u32 = 0x8000_0000;

bitflags! {
    /// Session status flags reported by `GET_STATUS`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XcpSessionStatus: u16 {
        const SS_DAQ = 0x0040;
        const SS_CONNECTED = 0x2000;
        const SS_STARTED = 0x4000;
        const SS_INITIALIZED = 0x8000;
    }
}

/// The full error taxonomy, mapped 1:1 onto the wire `ERR_*` codes sent back
/// as `0xFE <code>`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum XcpError {
    #[error("malformed command")]
    CmdSyntax,
    #[error("command cannot be processed right now")]
    CmdBusy,
    #[error("unknown or unsupported command")]
    CmdUnknown,
    #[error("unknown sub-command")]
    SubCmdUnknown,
    #[error("value out of range")]
    OutOfRange,
    #[error("command not valid in the current session sequence")]
    Sequence,
    #[error("access denied")]
    AccessDenied,
    #[error("resource is locked")]
    AccessLocked,
    #[error("calibration page not valid")]
    PageNotValid,
    #[error("calibration segment not valid")]
    SegmentNotValid,
    #[error("requested allocation exceeds configured limits")]
    MemoryOverflow,
    #[error("a DAQ measurement is running")]
    DaqActive,
    #[error("an atomic calibration transaction is in progress")]
    CalActive,
    #[error("resource is temporarily not accessible")]
    ResourceTemporaryNotAccessible,
}

impl XcpError {
    pub fn wire_code(self) -> u8 {
        match self {
            XcpError::CmdSyntax => ERR_CMD_SYNTAX,
            XcpError::CmdBusy => ERR_CMD_BUSY,
            XcpError::CmdUnknown => ERR_CMD_UNKNOWN,
            XcpError::SubCmdUnknown => ERR_SUBCMD_UNKNOWN,
            XcpError::OutOfRange => ERR_OUT_OF_RANGE,
            XcpError::Sequence => ERR_SEQUENCE,
            XcpError::AccessDenied => ERR_ACCESS_DENIED,
            XcpError::AccessLocked => ERR_ACCESS_LOCKED,
            XcpError::PageNotValid => ERR_PAGE_NOT_VALID,
            XcpError::SegmentNotValid => ERR_SEGMENT_NOT_VALID,
            XcpError::MemoryOverflow => ERR_MEMORY_OVERFLOW,
            XcpError::DaqActive => ERR_DAQ_ACTIVE,
            XcpError::CalActive => ERR_CAL_ACTIVE,
            XcpError::ResourceTemporaryNotAccessible => ERR_RESOURCE_TEMPORARY_NOT_ACCESSIBLE,
        }
    }
}

impl From<CalError> for XcpError {
    fn from(e: CalError) -> XcpError {
        match e {
            CalError::SegmentNotValid => XcpError::SegmentNotValid,
            CalError::OutOfRange => XcpError::OutOfRange,
            CalError::AccessDenied => XcpError::AccessDenied,
            CalError::Locked => XcpError::AccessLocked,
            CalError::Active => XcpError::CalActive,
        }
    }
}

impl From<DaqError> for XcpError {
    fn from(e: DaqError) -> XcpError {
        match e {
            DaqError::DaqListNotValid | DaqError::OdtNotValid | DaqError::OdtEntryNotValid => XcpError::OutOfRange,
            DaqError::Sequence => XcpError::Sequence,
            DaqError::MemoryOverflow => XcpError::MemoryOverflow,
        }
    }
}

impl From<AddressError> for XcpError {
    fn from(e: AddressError) -> XcpError {
        match e {
            AddressError::UnknownExtension(_) => XcpError::AccessDenied,
            AddressError::SegmentNotValid => XcpError::SegmentNotValid,
            AddressError::EventNotValid => XcpError::AccessDenied,
        }
    }
}

/// Application-supplied hooks the protocol layer falls back to for
/// addressing modes and identification it cannot resolve on its own, as a
/// plain Rust trait instead of a C-style callback vtable.
pub trait XcpAppCallbacks: Send + Sync {
    /// Resolve an `ABS`/`APP` extended address for `UPLOAD`/`SHORT_UPLOAD`.
    fn read_memory(&self, _location: MemoryLocation, _out: &mut [u8]) -> bool {
        false
    }

    /// Resolve an `ABS`/`APP` extended address for `DOWNLOAD`/`SHORT_DOWNLOAD`.
    fn write_memory(&self, _location: MemoryLocation, _data: &[u8]) -> bool {
        false
    }

    /// Device name reported by `GET_ID` with `id_type == 0`.
    fn device_name(&self) -> String {
        "xcp_lite".to_string()
    }

    /// `USER_CMD` (sub-commands `0x01`/`0x02` are conventionally
    /// application-defined); returning `None` yields `CMD_UNKNOWN`.
    fn user_command(&self, _sub_id: u8, _payload: &[u8]) -> Option<Vec<u8>> {
        None
    }

    /// Called when a client issues `CONNECT`. Returning `false` rejects the
    /// connection with `ACCESS_DENIED`.
    fn on_connect(&self) -> bool {
        true
    }

    /// Called once a DAQ list has been allocated (`ALLOC_DAQ`), before the
    /// client configures its ODTs.
    fn on_prepare_daq(&self) {}

    /// Called when measurement transitions to running (`START_STOP_SYNCH`,
    /// start mode).
    fn on_start_daq(&self) {}

    /// Called when measurement stops, whether by `START_STOP_SYNCH` (stop
    /// mode) or by `DISCONNECT`.
    fn on_stop_daq(&self) {}
}

/// An application that registers no callbacks of its own.
pub struct NullAppCallbacks;
impl XcpAppCallbacks for NullAppCallbacks {}

#[derive(Debug, Clone, Copy, Default)]
struct Mta {
    ext: u8,
    addr: u32,
}

/// Owns session state and dispatches every incoming CTO command. One
/// instance per connected client (spec explicitly scopes out multi-client
/// fan-out, so exactly one may be connected at a time).
pub struct ProtocolEngine {
    connected: AtomicBool,
    mta: RwLock<Mta>,
    cal: Arc<CalSegmentManager>,
    daq: Arc<DaqEngine>,
    events: Arc<EventRegistry>,
    clock: Arc<Clock>,
    app: Arc<dyn XcpAppCallbacks>,
    epk: String,
    a2l: RwLock<Vec<u8>>,
}

impl ProtocolEngine {
    pub fn new(
        cal: Arc<CalSegmentManager>,
        daq: Arc<DaqEngine>,
        events: Arc<EventRegistry>,
        clock: Arc<Clock>,
        app: Arc<dyn XcpAppCallbacks>,
        epk: String,
    ) -> ProtocolEngine {
        ProtocolEngine {
            connected: AtomicBool::new(false),
            mta: RwLock::new(Mta::default()),
            cal,
            daq,
            events,
            clock,
            app,
            epk,
            a2l: RwLock::new(Vec::new()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Replace the buffer served to clients that fetch the A2L description
    /// via `GET_ID`/`UPLOAD` (spec "external interfaces: A2L file contract").
    pub fn set_a2l(&self, content: Vec<u8>) {
        *self.a2l.write() = content;
    }

    fn session_status(&self) -> XcpSessionStatus {
        let mut status = XcpSessionStatus::SS_INITIALIZED;
        if self.is_connected() {
            status |= XcpSessionStatus::SS_CONNECTED;
        }
        if self.daq.state() == crate::daq::DaqState::Running {
            status |= XcpSessionStatus::SS_DAQ | XcpSessionStatus::SS_STARTED;
        }
        status
    }

    /// Dispatch one CTO command packet, returning the full CTO response
    /// packet (including its leading `0xFF`/`0xFE` framing byte).
    pub fn dispatch(&self, cmd: &[u8]) -> Vec<u8> {
        if cmd.is_empty() {
            return error_response(XcpError::CmdSyntax);
        }
        let opcode = cmd[0];

        if opcode != CC_CONNECT && !self.is_connected() {
            return error_response(XcpError::Sequence);
        }

        let result = match opcode {
            CC_CONNECT => self.connect(),
            CC_DISCONNECT => self.disconnect(),
            CC_GET_STATUS => self.get_status(),
            CC_SYNCH => Err(XcpError::CmdSyntax), // SYNCH always answers with ERR_CMD_SYNCH below
            CC_GET_COMM_MODE_INFO => self.get_comm_mode_info(),
            CC_GET_ID => self.get_id(cmd),
            CC_SET_MTA => self.set_mta(cmd),
            CC_UPLOAD => self.upload(cmd),
            CC_SHORT_UPLOAD => self.short_upload(cmd),
            CC_DOWNLOAD => self.download(cmd),
            CC_SHORT_DOWNLOAD => self.short_download(cmd),
            CC_BUILD_CHECKSUM => self.build_checksum(cmd),
            CC_USER_CMD => self.user_cmd(cmd),
            CC_GET_CAL_PAGE => self.get_cal_page(cmd),
            CC_SET_CAL_PAGE => self.set_cal_page(cmd),
            CC_COPY_CAL_PAGE => self.copy_cal_page(cmd),
            CC_ALLOC_DAQ => self.alloc_daq(cmd),
            CC_FREE_DAQ => self.free_daq(),
            CC_ALLOC_ODT => self.alloc_odt(cmd),
            CC_ALLOC_ODT_ENTRY => self.alloc_odt_entry(cmd),
            CC_SET_DAQ_PTR => self.set_daq_ptr(cmd),
            CC_WRITE_DAQ => self.write_daq(cmd),
            CC_WRITE_DAQ_MULTIPLE => self.write_daq_multiple(cmd),
            CC_SET_DAQ_LIST_MODE => self.set_daq_list_mode(cmd),
            CC_GET_DAQ_LIST_MODE => self.get_daq_list_mode(cmd),
            CC_START_STOP_DAQ_LIST => self.start_stop_daq_list(cmd),
            CC_START_STOP_SYNCH => self.start_stop_synch(cmd),
            CC_GET_DAQ_CLOCK => self.get_daq_clock(),
            CC_GET_DAQ_PROCESSOR_INFO => self.get_daq_processor_info(),
            CC_GET_DAQ_RESOLUTION_INFO => self.get_daq_resolution_info(),
            CC_GET_DAQ_EVENT_INFO => self.get_daq_event_info(cmd),
            CC_TIME_CORRELATION_PROPERTIES => self.time_correlation_properties(),
            // Transport-layer sub-commands: only the multicast DAQ clock
            // query is implemented, as a best-effort unicast fallback (this
            // server does not run a multicast responder thread).
            CC_TRANSPORT_LAYER_CMD => self.get_daq_clock(),
            // Non-goals: seed-and-key, flash programming, CAN-specific
            // sub-commands, and packed DAQ mode are all rejected as unknown
            // rather than partially emulated.
            CC_GET_SEED | CC_UNLOCK | CC_PROGRAM_START | CC_PROGRAM_CLEAR | CC_PROGRAM | CC_PROGRAM_RESET => {
                Err(XcpError::CmdUnknown)
            }
            _ => Err(XcpError::CmdUnknown),
        };

        if opcode == CC_SYNCH {
            return vec![RES_ERROR, ERR_CMD_SYNCH];
        }

        match result {
            Ok(bytes) => bytes,
            Err(e) => error_response(e),
        }
    }

    fn connect(&self) -> Result<Vec<u8>, XcpError> {
        if !self.app.on_connect() {
            return Err(XcpError::AccessDenied);
        }
        self.connected.store(true, Ordering::Release);
        Ok(vec![
            RES_POSITIVE,
            RESOURCE_CAL_PAG | RESOURCE_DAQ,
            COMM_MODE_BASIC,
            MAX_CTO as u8,
            (MAX_DTO & 0xFF) as u8,
            (MAX_DTO >> 8) as u8,
            PROTOCOL_LAYER_VERSION,
            TRANSPORT_LAYER_VERSION,
        ])
    }

    fn disconnect(&self) -> Result<Vec<u8>, XcpError> {
        self.connected.store(false, Ordering::Release);
        if self.daq.state() == crate::daq::DaqState::Running {
            self.daq.start_stop_synch(false);
            self.app.on_stop_daq();
        }
        Ok(vec![RES_POSITIVE])
    }

    fn get_status(&self) -> Result<Vec<u8>, XcpError> {
        let status = self.session_status().bits();
        Ok(vec![RES_POSITIVE, (status & 0xFF) as u8, 0x00, 0x00, 0x00])
    }

    fn get_comm_mode_info(&self) -> Result<Vec<u8>, XcpError> {
        Ok(vec![RES_POSITIVE, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01])
    }

    fn get_id(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        let id_type = *cmd.get(1).ok_or(XcpError::CmdSyntax)?;
        match id_type {
            0 => {
                let name = self.app.device_name();
                let bytes = name.as_bytes();
                let mut resp = vec![RES_POSITIVE, 1, 0, 0];
                resp.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                resp.extend_from_slice(&bytes[..bytes.len().min(MAX_CTO - 8)]);
                Ok(resp)
            }
            4 => {
                let a2l = self.a2l.read();
                *self.mta.write() = Mta { ext: address::XCP_ADDR_EXT_A2L, addr: 0 };
                let mut resp = vec![RES_POSITIVE, 0, 0, 0];
                resp.extend_from_slice(&(a2l.len() as u32).to_le_bytes());
                Ok(resp)
            }
            _ => Err(XcpError::OutOfRange),
        }
    }

    fn set_mta(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        if cmd.len() < 8 {
            return Err(XcpError::CmdSyntax);
        }
        let ext = cmd[3];
        let addr = u32::from_le_bytes(cmd[4..8].try_into().unwrap());
        *self.mta.write() = Mta { ext, addr };
        Ok(vec![RES_POSITIVE])
    }

    fn read_at(&self, ext: u8, addr: u32, len: usize) -> Result<Vec<u8>, XcpError> {
        if ext == address::XCP_ADDR_EXT_A2L {
            let a2l = self.a2l.read();
            let start = addr as usize;
            return a2l.get(start..start + len).map(|s| s.to_vec()).ok_or(XcpError::OutOfRange);
        }
        if ext == address::XCP_ADDR_EXT_ABS && addr == XCP_EPK_ADDR {
            return self.epk.as_bytes().get(..len).map(|s| s.to_vec()).ok_or(XcpError::OutOfRange);
        }
        let location = address::decode(ext, addr, None)?;
        match location {
            MemoryLocation::Segment { seg_index, offset } => Ok(self.cal.xcp_read(seg_index as usize, offset, len)?),
            other => {
                let mut out = vec![0u8; len];
                if self.app.read_memory(other, &mut out) {
                    Ok(out)
                } else {
                    Err(XcpError::AccessDenied)
                }
            }
        }
    }

    /// A running measurement samples calibration segments through a single
    /// atomic page-pointer read (`cal::CalSegmentManager::ecu_read`); letting
    /// the client mutate the working page or swap pages concurrently is
    /// still memory-safe but would hand the ECU an inconsistent half-updated
    /// set of parameters. Rejected up front instead.
    fn require_daq_not_running(&self) -> Result<(), XcpError> {
        if self.daq.state() == crate::daq::DaqState::Running {
            Err(XcpError::DaqActive)
        } else {
            Ok(())
        }
    }

    fn write_at(&self, ext: u8, addr: u32, data: &[u8]) -> Result<(), XcpError> {
        if ext == address::XCP_ADDR_EXT_ABS && addr == XCP_EPK_ADDR {
            return Err(XcpError::AccessDenied);
        }
        let location = address::decode(ext, addr, None)?;
        match location {
            MemoryLocation::Segment { seg_index, offset } => {
                self.require_daq_not_running()?;
                Ok(self.cal.xcp_write(seg_index as usize, offset, data)?)
            }
            other => {
                if self.app.write_memory(other, data) {
                    Ok(())
                } else {
                    Err(XcpError::AccessDenied)
                }
            }
        }
    }

    fn upload(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        let size = *cmd.get(1).ok_or(XcpError::CmdSyntax)? as usize;
        let mta = *self.mta.read();
        let bytes = self.read_at(mta.ext, mta.addr, size)?;
        self.mta.write().addr = mta.addr.wrapping_add(size as u32);
        let mut resp = vec![RES_POSITIVE];
        resp.extend_from_slice(&bytes);
        Ok(resp)
    }

    fn short_upload(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        if cmd.len() < 8 {
            return Err(XcpError::CmdSyntax);
        }
        let size = cmd[1] as usize;
        let ext = cmd[3];
        let addr = u32::from_le_bytes(cmd[4..8].try_into().unwrap());
        let bytes = self.read_at(ext, addr, size)?;
        let mut resp = vec![RES_POSITIVE];
        resp.extend_from_slice(&bytes);
        Ok(resp)
    }

    fn download(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        let size = *cmd.get(1).ok_or(XcpError::CmdSyntax)? as usize;
        let data = cmd.get(2..2 + size).ok_or(XcpError::CmdSyntax)?;
        let mta = *self.mta.read();
        self.write_at(mta.ext, mta.addr, data)?;
        self.mta.write().addr = mta.addr.wrapping_add(size as u32);
        Ok(vec![RES_POSITIVE])
    }

    fn short_download(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        if cmd.len() < 8 {
            return Err(XcpError::CmdSyntax);
        }
        let size = cmd[1] as usize;
        let ext = cmd[3];
        let addr = u32::from_le_bytes(cmd[4..8].try_into().unwrap());
        let data = cmd.get(8..8 + size).ok_or(XcpError::CmdSyntax)?;
        self.write_at(ext, addr, data)?;
        Ok(vec![RES_POSITIVE])
    }

    fn build_checksum(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        if cmd.len() < 8 {
            return Err(XcpError::CmdSyntax);
        }
        let size = u32::from_le_bytes(cmd[4..8].try_into().unwrap());
        let mta = *self.mta.read();
        let location = address::decode(mta.ext, mta.addr, None)?;
        let seg_index = match location {
            MemoryLocation::Segment { seg_index, offset: _ } => seg_index,
            _ => return Err(XcpError::AccessDenied),
        };
        let offset = mta.addr & 0xFFFF;
        let checksum = self.cal.checksum(seg_index as usize, offset, size)?;
        let mut resp = vec![RES_POSITIVE, 0x09 /* XCP_CHECKSUM_TYPE_ADD_44 */, 0, 0];
        resp.extend_from_slice(&checksum.to_le_bytes());
        Ok(resp)
    }

    /// `USER_CMD`: sub-commands `0x01`/`0x02` begin/end an atomic
    /// calibration transaction handled directly by the engine; every other
    /// sub-command is delegated to the application.
    fn user_cmd(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        let sub_id = *cmd.get(1).ok_or(XcpError::CmdSyntax)?;
        match sub_id {
            0x01 => {
                self.cal.begin_transaction()?;
                Ok(vec![RES_POSITIVE])
            }
            0x02 => {
                self.cal.end_transaction()?;
                Ok(vec![RES_POSITIVE])
            }
            _ => match self.app.user_command(sub_id, &cmd[2.min(cmd.len())..]) {
                Some(mut bytes) => {
                    let mut resp = vec![RES_POSITIVE];
                    resp.append(&mut bytes);
                    Ok(resp)
                }
                None => Err(XcpError::SubCmdUnknown),
            },
        }
    }

    fn get_cal_page(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        let mode = *cmd.get(1).ok_or(XcpError::CmdSyntax)?;
        let target = if mode & 0x01 != 0 { PageTarget::Ecu } else { PageTarget::Xcp };
        let page = self.cal.get_cal_page(target);
        Ok(vec![RES_POSITIVE, 0, page as u8])
    }

    fn set_cal_page(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        if cmd.len() < 4 {
            return Err(XcpError::CmdSyntax);
        }
        self.require_daq_not_running()?;
        let mode = cmd[1];
        let page = CalPageKind::from(cmd[3]);
        if mode & 0x01 != 0 {
            self.cal.set_cal_page(PageTarget::Ecu, page);
        }
        if mode & 0x02 != 0 {
            self.cal.set_cal_page(PageTarget::Xcp, page);
        }
        Ok(vec![RES_POSITIVE])
    }

    fn copy_cal_page(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        if cmd.len() < 5 {
            return Err(XcpError::CmdSyntax);
        }
        self.require_daq_not_running()?;
        let src_seg = cmd[1] as usize;
        let src_page = CalPageKind::from(cmd[2]);
        let dst_seg = cmd[3] as usize;
        let dst_page = CalPageKind::from(cmd[4]);
        if src_seg != dst_seg {
            return Err(XcpError::SegmentNotValid);
        }
        self.cal.copy_cal_page(src_seg, src_page, dst_page)?;
        Ok(vec![RES_POSITIVE])
    }

    fn alloc_daq(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        if cmd.len() < 5 {
            return Err(XcpError::CmdSyntax);
        }
        let count = u16::from_le_bytes(cmd[3..5].try_into().unwrap());
        self.daq.alloc_daq(count)?;
        self.app.on_prepare_daq();
        Ok(vec![RES_POSITIVE])
    }

    fn free_daq(&self) -> Result<Vec<u8>, XcpError> {
        self.daq.free_daq()?;
        Ok(vec![RES_POSITIVE])
    }

    fn alloc_odt(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        if cmd.len() < 6 {
            return Err(XcpError::CmdSyntax);
        }
        let daq_list = u16::from_le_bytes(cmd[3..5].try_into().unwrap());
        let odt_count = cmd[5];
        self.daq.alloc_odt(daq_list, odt_count)?;
        Ok(vec![RES_POSITIVE])
    }

    fn alloc_odt_entry(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        if cmd.len() < 7 {
            return Err(XcpError::CmdSyntax);
        }
        let daq_list = u16::from_le_bytes(cmd[3..5].try_into().unwrap());
        let odt = cmd[5];
        let entry_count = cmd[6];
        self.daq.alloc_odt_entry(daq_list, odt, entry_count)?;
        Ok(vec![RES_POSITIVE])
    }

    fn set_daq_ptr(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        if cmd.len() < 7 {
            return Err(XcpError::CmdSyntax);
        }
        let daq_list = u16::from_le_bytes(cmd[3..5].try_into().unwrap());
        let odt = cmd[5];
        let entry = cmd[6];
        self.daq.set_daq_ptr(daq_list, odt, entry)?;
        Ok(vec![RES_POSITIVE])
    }

    fn write_daq(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        if cmd.len() < 8 {
            return Err(XcpError::CmdSyntax);
        }
        let size = cmd[2];
        let ext = cmd[3];
        let addr = u32::from_le_bytes(cmd[4..8].try_into().unwrap());
        self.daq.write_daq(ext, addr, size)?;
        Ok(vec![RES_POSITIVE])
    }

    fn write_daq_multiple(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        let count = *cmd.get(1).ok_or(XcpError::CmdSyntax)? as usize;
        let mut offset = 2;
        for _ in 0..count {
            let entry = cmd.get(offset..offset + 7).ok_or(XcpError::CmdSyntax)?;
            let size = entry[1];
            let ext = entry[2];
            let addr = u32::from_le_bytes(entry[3..7].try_into().unwrap());
            self.daq.write_daq(ext, addr, size)?;
            offset += 7;
        }
        Ok(vec![RES_POSITIVE])
    }

    fn set_daq_list_mode(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        if cmd.len() < 6 {
            return Err(XcpError::CmdSyntax);
        }
        let mode = cmd[1];
        let daq_list = u16::from_le_bytes(cmd[2..4].try_into().unwrap());
        let event_id = u16::from_le_bytes(cmd[4..6].try_into().unwrap());
        let timestamps_enabled = mode & 0x10 != 0;
        self.daq.set_daq_list_mode(daq_list, event_id, timestamps_enabled)?;
        Ok(vec![RES_POSITIVE])
    }

    fn get_daq_list_mode(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        if cmd.len() < 4 {
            return Err(XcpError::CmdSyntax);
        }
        let daq_list = u16::from_le_bytes(cmd[2..4].try_into().unwrap());
        let (event_id, timestamps_enabled, running) = self.daq.get_daq_list_mode(daq_list)?;
        let mode = if timestamps_enabled { 0x10 } else { 0 } | if running { 0x01 } else { 0 };
        let event_id = event_id.unwrap_or(crate::daq::event::XCP_UNDEFINED_EVENT_ID);
        Ok(vec![RES_POSITIVE, mode, 0, 0, (event_id & 0xFF) as u8, (event_id >> 8) as u8, 1, 0])
    }

    fn start_stop_daq_list(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        if cmd.len() < 4 {
            return Err(XcpError::CmdSyntax);
        }
        let start = cmd[1] != 0;
        let daq_list = u16::from_le_bytes(cmd[2..4].try_into().unwrap());
        self.daq.start_stop_daq_list(daq_list, start)?;
        Ok(vec![RES_POSITIVE, 0])
    }

    fn start_stop_synch(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        let mode = *cmd.get(1).ok_or(XcpError::CmdSyntax)?;
        let start = mode != 0;
        if start && self.cal.in_transaction() {
            return Err(XcpError::CalActive);
        }
        self.daq.start_stop_synch(start);
        if start {
            self.app.on_start_daq();
        } else {
            self.app.on_stop_daq();
        }
        Ok(vec![RES_POSITIVE])
    }

    fn get_daq_clock(&self) -> Result<Vec<u8>, XcpError> {
        let ts = self.clock.now_32();
        Ok(vec![RES_POSITIVE, 0, 0, 0, (ts & 0xFF) as u8, ((ts >> 8) & 0xFF) as u8, ((ts >> 16) & 0xFF) as u8, ((ts >> 24) & 0xFF) as u8])
    }

    fn get_daq_processor_info(&self) -> Result<Vec<u8>, XcpError> {
        let max_event = self.events.count();
        Ok(vec![
            RES_POSITIVE,
            0x01, // DAQ_PROPERTIES: dynamic DAQ config supported
            0xFF,
            0xFF, // MAX_DAQ (no hard limit enforced beyond memory)
            (max_event & 0xFF) as u8,
            (max_event >> 8) as u8,
            0x00, // MIN_DAQ
            0x00, // DAQ_KEY_BYTE: identifier field not used by this server
        ])
    }

    fn get_daq_resolution_info(&self) -> Result<Vec<u8>, XcpError> {
        Ok(vec![
            RES_POSITIVE,
            1, // GRANULARITY_ODT_ENTRY_SIZE_DAQ (bytes)
            MAX_CTO as u8,
            1, // GRANULARITY_ODT_ENTRY_SIZE_STIM
            0, // MAX_ODT_ENTRY_SIZE_STIM: stimulation is not implemented
            self.clock.unit().xcp_unit_code(),
            0,
            0,
        ])
    }

    fn get_daq_event_info(&self, cmd: &[u8]) -> Result<Vec<u8>, XcpError> {
        if cmd.len() < 4 {
            return Err(XcpError::CmdSyntax);
        }
        let event_id = u16::from_le_bytes(cmd[2..4].try_into().unwrap());
        if event_id >= self.events.count() {
            return Err(XcpError::OutOfRange);
        }
        Ok(vec![
            RES_POSITIVE,
            0x04, // EVENT_CHANNEL_PROPERTIES: DAQ direction supported
            0xFF, // MAX_DAQ_LIST: unrestricted
            0,    // EVENT_CHANNEL_NAME_LENGTH: fetched separately via GET_ID, not inlined
            0,
            0, // EVENT_CHANNEL_TIME_CYCLE/UNIT: event is application-triggered, not periodic
            0,
        ])
    }

    fn time_correlation_properties(&self) -> Result<Vec<u8>, XcpError> {
        Ok(vec![RES_POSITIVE, self.clock.unit().xcp_unit_code(), 0, 0, 0, 0, 0, 0])
    }
}

fn error_response(e: XcpError) -> Vec<u8> {
    vec![RES_ERROR, e.wire_code()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    fn engine() -> ProtocolEngine {
        ProtocolEngine::new(
            Arc::new(CalSegmentManager::new()),
            Arc::new(DaqEngine::new()),
            Arc::new(EventRegistry::new()),
            Arc::new(Clock::new(crate::platform::ClockUnit::Microseconds)),
            Arc::new(NullAppCallbacks),
            "EPK_TEST".to_string(),
        )
    }

    #[test]
    fn commands_before_connect_are_rejected_with_sequence_error() {
        let eng = engine();
        let resp = eng.dispatch(&[CC_GET_STATUS]);
        assert_eq!(resp, vec![RES_ERROR, ERR_SEQUENCE]);
    }

    #[test]
    fn connect_then_get_status_reports_connected() {
        let eng = engine();
        let resp = eng.dispatch(&[CC_CONNECT, 0]);
        assert_eq!(resp[0], RES_POSITIVE);
        let resp = eng.dispatch(&[CC_GET_STATUS]);
        let status = XcpSessionStatus::from_bits_truncate(resp[1] as u16);
        assert!(status.contains(XcpSessionStatus::SS_CONNECTED));
    }

    #[test]
    fn synch_always_answers_with_cmd_synch_error() {
        let eng = engine();
        eng.dispatch(&[CC_CONNECT, 0]);
        assert_eq!(eng.dispatch(&[CC_SYNCH]), vec![RES_ERROR, ERR_CMD_SYNCH]);
    }

    #[test]
    fn set_mta_then_download_then_upload_roundtrips_a_calibration_segment() {
        let eng = engine();
        eng.dispatch(&[CC_CONNECT, 0]);
        let idx = eng.cal.create_segment("Seg", &[0u8; 4]);
        let (ext, addr) = address::encode(MemoryLocation::Segment { seg_index: idx as u16, offset: 0 });

        let mut set_mta = vec![CC_SET_MTA, 0, 0, ext];
        set_mta.extend_from_slice(&addr.to_le_bytes());
        assert_eq!(eng.dispatch(&set_mta)[0], RES_POSITIVE);

        let mut download = vec![CC_DOWNLOAD, 4];
        download.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(eng.dispatch(&download), vec![RES_POSITIVE]);

        let mut set_mta_again = vec![CC_SET_MTA, 0, 0, ext];
        set_mta_again.extend_from_slice(&addr.to_le_bytes());
        eng.dispatch(&set_mta_again);
        let upload = eng.dispatch(&[CC_UPLOAD, 4]);
        assert_eq!(upload, vec![RES_POSITIVE, 1, 2, 3, 4]);
    }

    #[test]
    fn epk_is_readable_at_its_fixed_absolute_address_but_not_writable() {
        let eng = engine();
        eng.dispatch(&[CC_CONNECT, 0]);

        let mut set_mta = vec![CC_SET_MTA, 0, 0, address::XCP_ADDR_EXT_ABS];
        set_mta.extend_from_slice(&XCP_EPK_ADDR.to_le_bytes());
        assert_eq!(eng.dispatch(&set_mta), vec![RES_POSITIVE]);

        let upload = eng.dispatch(&[CC_UPLOAD, 8]);
        assert_eq!(upload, [vec![RES_POSITIVE], b"EPK_TEST".to_vec()].concat());

        let mut short_download = vec![CC_SHORT_DOWNLOAD, 1, 0, address::XCP_ADDR_EXT_ABS];
        short_download.extend_from_slice(&XCP_EPK_ADDR.to_le_bytes());
        short_download.push(b'X');
        assert_eq!(eng.dispatch(&short_download), vec![RES_ERROR, ERR_ACCESS_DENIED]);
    }

    #[test]
    fn unknown_command_is_rejected() {
        let eng = engine();
        eng.dispatch(&[CC_CONNECT, 0]);
        assert_eq!(eng.dispatch(&[0x00]), vec![RES_ERROR, ERR_CMD_UNKNOWN]);
    }

    #[test]
    fn seed_and_key_and_flash_programming_are_rejected_as_unknown() {
        let eng = engine();
        eng.dispatch(&[CC_CONNECT, 0]);
        assert_eq!(eng.dispatch(&[CC_GET_SEED, 0, 0]), vec![RES_ERROR, ERR_CMD_UNKNOWN]);
        assert_eq!(eng.dispatch(&[CC_PROGRAM_START]), vec![RES_ERROR, ERR_CMD_UNKNOWN]);
    }

    #[test]
    fn user_cmd_atomic_transaction_stages_writes_until_end() {
        let eng = engine();
        eng.dispatch(&[CC_CONNECT, 0]);
        let idx = eng.cal.create_segment("Params", &[5u8, (-5i8) as u8]);
        let (ext, addr) = address::encode(MemoryLocation::Segment { seg_index: idx as u16, offset: 0 });

        assert_eq!(eng.dispatch(&[CC_USER_CMD, 0x01]), vec![RES_POSITIVE]);

        let mut set_mta = vec![CC_SET_MTA, 0, 0, ext];
        set_mta.extend_from_slice(&addr.to_le_bytes());
        eng.dispatch(&set_mta);
        assert_eq!(eng.dispatch(&[CC_SHORT_DOWNLOAD, 1, 0, ext, addr.to_le_bytes()[0], addr.to_le_bytes()[1], addr.to_le_bytes()[2], addr.to_le_bytes()[3], 9]), vec![RES_POSITIVE]);

        // Still staged: the segment's committed bytes haven't changed yet.
        assert_eq!(eng.cal.xcp_read(idx, 0, 1).unwrap(), vec![5]);

        assert_eq!(eng.dispatch(&[CC_USER_CMD, 0x02]), vec![RES_POSITIVE]);
        assert_eq!(eng.cal.xcp_read(idx, 0, 1).unwrap(), vec![9]);
    }

    #[test]
    fn full_daq_configuration_and_start_stop_cycle() {
        let eng = engine();
        eng.dispatch(&[CC_CONNECT, 0]);
        assert_eq!(eng.dispatch(&[CC_ALLOC_DAQ, 0, 0, 1, 0]), vec![RES_POSITIVE]);
        assert_eq!(eng.dispatch(&[CC_ALLOC_ODT, 0, 0, 0, 0, 1]), vec![RES_POSITIVE]);
        assert_eq!(eng.dispatch(&[CC_ALLOC_ODT_ENTRY, 0, 0, 0, 0, 0, 1]), vec![RES_POSITIVE]);
        assert_eq!(eng.dispatch(&[CC_SET_DAQ_PTR, 0, 0, 0, 0, 0, 0]), vec![RES_POSITIVE]);

        let mut write_daq = vec![CC_WRITE_DAQ, 0, size_of::<u32>() as u8, address::XCP_ADDR_EXT_DYN];
        write_daq.extend_from_slice(&(1u32 << 16).to_le_bytes());
        assert_eq!(eng.dispatch(&write_daq), vec![RES_POSITIVE]);

        let mut set_mode = vec![CC_SET_DAQ_LIST_MODE, 0x10, 0, 0];
        set_mode.extend_from_slice(&1u16.to_le_bytes());
        assert_eq!(eng.dispatch(&set_mode), vec![RES_POSITIVE]);

        assert_eq!(eng.dispatch(&[CC_START_STOP_DAQ_LIST, 1, 0, 0]), vec![RES_POSITIVE, 0]);
        assert_eq!(eng.dispatch(&[CC_START_STOP_SYNCH, 1]), vec![RES_POSITIVE]);
        assert_eq!(eng.daq.state(), crate::daq::DaqState::Running);
        assert_eq!(eng.dispatch(&[CC_START_STOP_SYNCH, 0]), vec![RES_POSITIVE]);
        assert_eq!(eng.daq.state(), crate::daq::DaqState::Stopped);
    }

    struct RejectConnect;
    impl XcpAppCallbacks for RejectConnect {
        fn on_connect(&self) -> bool {
            false
        }
    }

    #[test]
    fn on_connect_returning_false_rejects_the_connection() {
        let eng = ProtocolEngine::new(
            Arc::new(CalSegmentManager::new()),
            Arc::new(DaqEngine::new()),
            Arc::new(EventRegistry::new()),
            Arc::new(Clock::new(crate::platform::ClockUnit::Microseconds)),
            Arc::new(RejectConnect),
            "EPK_TEST".to_string(),
        );
        assert_eq!(eng.dispatch(&[CC_CONNECT, 0]), vec![RES_ERROR, ERR_ACCESS_DENIED]);
        // Rejected connect must not flip session state.
        assert_eq!(eng.dispatch(&[CC_GET_STATUS]), vec![RES_ERROR, ERR_SEQUENCE]);
    }

    #[derive(Default)]
    struct LifecycleRecorder {
        calls: parking_lot::Mutex<Vec<&'static str>>,
    }
    impl XcpAppCallbacks for LifecycleRecorder {
        fn on_prepare_daq(&self) {
            self.calls.lock().push("prepare");
        }
        fn on_start_daq(&self) {
            self.calls.lock().push("start");
        }
        fn on_stop_daq(&self) {
            self.calls.lock().push("stop");
        }
    }

    #[test]
    fn lifecycle_callbacks_fire_in_order_for_a_full_daq_cycle() {
        let app = Arc::new(LifecycleRecorder::default());
        let eng = ProtocolEngine::new(
            Arc::new(CalSegmentManager::new()),
            Arc::new(DaqEngine::new()),
            Arc::new(EventRegistry::new()),
            Arc::new(Clock::new(crate::platform::ClockUnit::Microseconds)),
            app.clone(),
            "EPK_TEST".to_string(),
        );
        eng.dispatch(&[CC_CONNECT, 0]);
        eng.dispatch(&[CC_ALLOC_DAQ, 0, 0, 1, 0]);
        eng.dispatch(&[CC_START_STOP_SYNCH, 1]);
        eng.dispatch(&[CC_START_STOP_SYNCH, 0]);
        assert_eq!(*app.calls.lock(), vec!["prepare", "start", "stop"]);
    }

    #[test]
    fn disconnect_only_fires_on_stop_daq_if_measurement_was_running() {
        let app = Arc::new(LifecycleRecorder::default());
        let eng = ProtocolEngine::new(
            Arc::new(CalSegmentManager::new()),
            Arc::new(DaqEngine::new()),
            Arc::new(EventRegistry::new()),
            Arc::new(Clock::new(crate::platform::ClockUnit::Microseconds)),
            app.clone(),
            "EPK_TEST".to_string(),
        );
        eng.dispatch(&[CC_CONNECT, 0]);
        eng.dispatch(&[CC_DISCONNECT]);
        assert!(app.calls.lock().is_empty());
    }

    #[test]
    fn calibration_writes_and_page_operations_are_rejected_while_daq_is_running() {
        let eng = engine();
        eng.dispatch(&[CC_CONNECT, 0]);
        let idx = eng.cal.create_segment("Seg", &[0u8; 4]);
        let (ext, addr) = address::encode(MemoryLocation::Segment { seg_index: idx as u16, offset: 0 });

        eng.dispatch(&[CC_ALLOC_DAQ, 0, 0, 1, 0]);
        eng.dispatch(&[CC_START_STOP_SYNCH, 1]);
        assert_eq!(eng.daq.state(), crate::daq::DaqState::Running);

        let addr_bytes = addr.to_le_bytes();
        let short_download = vec![CC_SHORT_DOWNLOAD, 1, 0, ext, addr_bytes[0], addr_bytes[1], addr_bytes[2], addr_bytes[3], 9];
        assert_eq!(eng.dispatch(&short_download), vec![RES_ERROR, ERR_DAQ_ACTIVE]);
        assert_eq!(eng.dispatch(&[CC_SET_CAL_PAGE, 0x03, 0, 1]), vec![RES_ERROR, ERR_DAQ_ACTIVE]);
        assert_eq!(eng.dispatch(&[CC_COPY_CAL_PAGE, 0, 1, 0, 0]), vec![RES_ERROR, ERR_DAQ_ACTIVE]);

        eng.dispatch(&[CC_START_STOP_SYNCH, 0]);
        assert_eq!(eng.dispatch(&short_download), vec![RES_POSITIVE]);
    }

    #[test]
    fn starting_daq_while_an_atomic_calibration_transaction_is_open_is_rejected() {
        let eng = engine();
        eng.dispatch(&[CC_CONNECT, 0]);
        eng.dispatch(&[CC_ALLOC_DAQ, 0, 0, 1, 0]);

        assert_eq!(eng.dispatch(&[CC_USER_CMD, 0x01]), vec![RES_POSITIVE]);
        assert_eq!(eng.dispatch(&[CC_START_STOP_SYNCH, 1]), vec![RES_ERROR, ERR_CAL_ACTIVE]);
        assert_eq!(eng.daq.state(), crate::daq::DaqState::Prepared);

        assert_eq!(eng.dispatch(&[CC_USER_CMD, 0x02]), vec![RES_POSITIVE]);
        assert_eq!(eng.dispatch(&[CC_START_STOP_SYNCH, 1]), vec![RES_POSITIVE]);
        assert_eq!(eng.daq.state(), crate::daq::DaqState::Running);
    }

    #[test]
    fn reopening_an_atomic_calibration_transaction_is_rejected() {
        let eng = engine();
        eng.dispatch(&[CC_CONNECT, 0]);
        assert_eq!(eng.dispatch(&[CC_USER_CMD, 0x01]), vec![RES_POSITIVE]);
        assert_eq!(eng.dispatch(&[CC_USER_CMD, 0x01]), vec![RES_ERROR, ERR_CAL_ACTIVE]);
        assert_eq!(eng.dispatch(&[CC_USER_CMD, 0x02]), vec![RES_POSITIVE]);
    }
}
