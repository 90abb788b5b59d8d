//-----------------------------------------------------------------------------
// Module protocol::codes
// Wire-level command and response codes, the fixed values the ASAM XCP
// standard assigns them, matched by any conforming client.

/// Largest CTO (command/response) packet this server will send or accept.
pub const MAX_CTO: usize = 248;

/// Upper bound offered to the client for DTO (measurement data) packets;
/// the effective value is negotiated down to fit the configured transport
/// segment size.
pub const MAX_DTO: usize = 1500;

/// The largest single UDP/TCP segment the transport layer will assemble.
pub const XCPTL_MAX_SEGMENT_SIZE: usize = 2048 * 2;

// ---- Command codes (first byte of a CTO command packet) -------------------

pub const CC_CONNECT: u8 = 0xFF;
pub const CC_DISCONNECT: u8 = 0xFE;
pub const CC_GET_STATUS: u8 = 0xFD;
pub const CC_SYNCH: u8 = 0xFC;
pub const CC_GET_COMM_MODE_INFO: u8 = 0xFB;
pub const CC_GET_ID: u8 = 0xFA;
pub const CC_SET_REQUEST: u8 = 0xF9;
pub const CC_GET_SEED: u8 = 0xF8;
pub const CC_UNLOCK: u8 = 0xF7;
pub const CC_SET_MTA: u8 = 0xF6;
pub const CC_UPLOAD: u8 = 0xF5;
pub const CC_SHORT_UPLOAD: u8 = 0xF4;
pub const CC_BUILD_CHECKSUM: u8 = 0xF3;
pub const CC_TRANSPORT_LAYER_CMD: u8 = 0xF2;
pub const CC_USER_CMD: u8 = 0xF1;
pub const CC_DOWNLOAD: u8 = 0xF0;
pub const CC_DOWNLOAD_NEXT: u8 = 0xEF;
pub const CC_DOWNLOAD_MAX: u8 = 0xEE;
pub const CC_SHORT_DOWNLOAD: u8 = 0xED;
pub const CC_MODIFY_BITS: u8 = 0xEC;
pub const CC_SET_CAL_PAGE: u8 = 0xEB;
pub const CC_GET_CAL_PAGE: u8 = 0xEA;
pub const CC_GET_PAG_PROCESSOR_INFO: u8 = 0xE9;
pub const CC_GET_SEGMENT_INFO: u8 = 0xE8;
pub const CC_GET_PAGE_INFO: u8 = 0xE7;
pub const CC_SET_SEGMENT_MODE: u8 = 0xE6;
pub const CC_GET_SEGMENT_MODE: u8 = 0xE5;
pub const CC_COPY_CAL_PAGE: u8 = 0xE4;
pub const CC_CLEAR_DAQ_LIST: u8 = 0xE3;
pub const CC_SET_DAQ_PTR: u8 = 0xE2;
pub const CC_WRITE_DAQ: u8 = 0xE1;
pub const CC_SET_DAQ_LIST_MODE: u8 = 0xE0;
pub const CC_GET_DAQ_LIST_MODE: u8 = 0xDF;
pub const CC_START_STOP_DAQ_LIST: u8 = 0xDE;
pub const CC_START_STOP_SYNCH: u8 = 0xDD;
pub const CC_GET_DAQ_CLOCK: u8 = 0xDC;
pub const CC_READ_DAQ: u8 = 0xDB;
pub const CC_GET_DAQ_PROCESSOR_INFO: u8 = 0xDA;
pub const CC_GET_DAQ_RESOLUTION_INFO: u8 = 0xD9;
pub const CC_GET_DAQ_LIST_INFO: u8 = 0xD8;
pub const CC_GET_DAQ_EVENT_INFO: u8 = 0xD7;
pub const CC_FREE_DAQ: u8 = 0xD6;
pub const CC_ALLOC_DAQ: u8 = 0xD5;
pub const CC_ALLOC_ODT: u8 = 0xD4;
pub const CC_ALLOC_ODT_ENTRY: u8 = 0xD3;
pub const CC_PROGRAM_START: u8 = 0xD2;
pub const CC_PROGRAM_CLEAR: u8 = 0xD1;
pub const CC_PROGRAM: u8 = 0xD0;
pub const CC_PROGRAM_RESET: u8 = 0xCF;
pub const CC_WRITE_DAQ_MULTIPLE: u8 = 0xC7;
pub const CC_TIME_CORRELATION_PROPERTIES: u8 = 0xC6;

// ---- Response / error framing ---------------------------------------------

pub const RES_POSITIVE: u8 = 0xFF;
pub const RES_ERROR: u8 = 0xFE;
pub const RES_EVENT: u8 = 0xFD;
pub const RES_SERVICE_REQUEST: u8 = 0xFC;

pub const ERR_CMD_SYNCH: u8 = 0x00;
pub const ERR_CMD_BUSY: u8 = 0x10;
pub const ERR_DAQ_ACTIVE: u8 = 0x11;
pub const ERR_PGM_ACTIVE: u8 = 0x12;
pub const ERR_CMD_UNKNOWN: u8 = 0x20;
pub const ERR_CMD_SYNTAX: u8 = 0x21;
pub const ERR_OUT_OF_RANGE: u8 = 0x22;
pub const ERR_WRITE_PROTECTED: u8 = 0x23;
pub const ERR_ACCESS_DENIED: u8 = 0x24;
pub const ERR_ACCESS_LOCKED: u8 = 0x25;
pub const ERR_PAGE_NOT_VALID: u8 = 0x26;
pub const ERR_MODE_NOT_VALID: u8 = 0x27;
pub const ERR_SEGMENT_NOT_VALID: u8 = 0x28;
pub const ERR_SEQUENCE: u8 = 0x29;
pub const ERR_DAQ_CONFIG: u8 = 0x2A;
pub const ERR_MEMORY_OVERFLOW: u8 = 0x30;
pub const ERR_GENERIC: u8 = 0x31;
pub const ERR_VERIFY: u8 = 0x32;
pub const ERR_RESOURCE_TEMPORARY_NOT_ACCESSIBLE: u8 = 0x33;
pub const ERR_SUBCMD_UNKNOWN: u8 = 0x34;
pub const ERR_CAL_ACTIVE: u8 = 0x35;

/// `RESOURCE` bits reported by `CONNECT` (spec: CAL/PAG and DAQ are the only
/// resources this server implements; PGM and STIM are not, per the Non-goal
/// on flash programming).
pub const RESOURCE_CAL_PAG: u8 = 0x01;
pub const RESOURCE_DAQ: u8 = 0x04;

/// `COMM_MODE_BASIC`: byte order Intel (little-endian), byte granularity
/// addressing, no slave block mode.
pub const COMM_MODE_BASIC: u8 = 0x00;

pub const PROTOCOL_LAYER_VERSION: u8 = 0x01;
pub const TRANSPORT_LAYER_VERSION: u8 = 0x01;
