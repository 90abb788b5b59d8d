//-----------------------------------------------------------------------------
// xcp_client
// A minimal, async XCP client used only by xcp_lite's own integration tests
// and benchmarks: a "connect, then poke commands" usage pattern built
// against a UDP `tokio::net::UdpSocket`.

use std::net::SocketAddr;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;

pub const CMD_TIMEOUT: Duration = Duration::from_secs(3);

pub const CC_CONNECT: u8 = 0xFF;
pub const CC_DISCONNECT: u8 = 0xFE;
pub const CC_GET_STATUS: u8 = 0xFD;
pub const CC_SYNCH: u8 = 0xFC;
pub const CC_GET_ID: u8 = 0xFA;
pub const CC_SET_MTA: u8 = 0xF6;
pub const CC_UPLOAD: u8 = 0xF5;
pub const CC_SHORT_UPLOAD: u8 = 0xF4;
pub const CC_BUILD_CHECKSUM: u8 = 0xF3;
pub const CC_DOWNLOAD: u8 = 0xF0;
pub const CC_SHORT_DOWNLOAD: u8 = 0xED;
pub const CC_SET_CAL_PAGE: u8 = 0xEB;
pub const CC_GET_CAL_PAGE: u8 = 0xEA;
pub const CC_COPY_CAL_PAGE: u8 = 0xE4;
pub const CC_SET_DAQ_PTR: u8 = 0xE2;
pub const CC_WRITE_DAQ: u8 = 0xE1;
pub const CC_SET_DAQ_LIST_MODE: u8 = 0xE0;
pub const CC_GET_DAQ_LIST_MODE: u8 = 0xDF;
pub const CC_START_STOP_DAQ_LIST: u8 = 0xDE;
pub const CC_START_STOP_SYNCH: u8 = 0xDD;
pub const CC_GET_DAQ_CLOCK: u8 = 0xDC;
pub const CC_FREE_DAQ: u8 = 0xD6;
pub const CC_ALLOC_DAQ: u8 = 0xD5;
pub const CC_ALLOC_ODT: u8 = 0xD4;
pub const CC_ALLOC_ODT_ENTRY: u8 = 0xD3;
pub const CC_USER_CMD: u8 = 0xF1;

/// Address extension for absolute (base-relative) addressing, matching
/// `xcp_lite::address::XCP_ADDR_EXT_ABS`.
pub const XCP_ADDR_EXT_ABS: u8 = 1;
/// Fixed absolute address the EPK is served at, matching
/// `xcp_lite::protocol::XCP_EPK_ADDR`.
pub const XCP_EPK_ADDR: u32 = 0x8000_0000;

pub const RES_POSITIVE: u8 = 0xFF;
pub const RES_ERROR: u8 = 0xFE;

pub const ERR_CMD_SYNCH: u8 = 0x00;
pub const ERR_CMD_UNKNOWN: u8 = 0x20;
pub const ERR_CMD_SYNTAX: u8 = 0x21;
pub const ERR_OUT_OF_RANGE: u8 = 0x22;
pub const ERR_ACCESS_DENIED: u8 = 0x24;
pub const ERR_SEGMENT_NOT_VALID: u8 = 0x28;
pub const ERR_SEQUENCE: u8 = 0x29;

#[derive(Debug, Error)]
pub enum XcpClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for a response")]
    Timeout,
    #[error("server returned XCP error code 0x{0:02X}")]
    ServerError(u8),
    #[error("response too short or malformed")]
    Malformed,
}

pub struct XcpClient {
    socket: UdpSocket,
    ctr: u16,
    pub max_cto: u8,
    pub max_dto: u16,
}

fn frame(ctr: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(&ctr.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

impl XcpClient {
    pub async fn connect(server_addr: SocketAddr) -> Result<XcpClient, XcpClientError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(server_addr).await?;
        let mut client = XcpClient { socket, ctr: 0, max_cto: 0, max_dto: 0 };
        let resp = client.command(&[CC_CONNECT, 0]).await?;
        if resp.len() < 7 {
            return Err(XcpClientError::Malformed);
        }
        client.max_cto = resp[2];
        client.max_dto = u16::from_le_bytes([resp[3], resp[4]]);
        Ok(client)
    }

    /// Send one CTO command and return its response payload (without the
    /// leading `0xFF`). Returns `Err(ServerError(code))` for `0xFE` replies.
    pub async fn command(&mut self, payload: &[u8]) -> Result<Vec<u8>, XcpClientError> {
        let ctr = self.ctr;
        self.ctr = self.ctr.wrapping_add(1);
        let framed = frame(ctr, payload);
        self.socket.send(&framed).await?;

        let mut buf = [0u8; 2048];
        let n = timeout(CMD_TIMEOUT, self.socket.recv(&mut buf)).await.map_err(|_| XcpClientError::Timeout)??;
        if n < 5 {
            return Err(XcpClientError::Malformed);
        }
        let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if n < 4 + len || len == 0 {
            return Err(XcpClientError::Malformed);
        }
        let response = &buf[4..4 + len];
        match response[0] {
            RES_POSITIVE => Ok(response[1..].to_vec()),
            RES_ERROR => Err(XcpClientError::ServerError(*response.get(1).unwrap_or(&ERR_CMD_UNKNOWN))),
            _ => Err(XcpClientError::Malformed),
        }
    }

    pub async fn disconnect(&mut self) -> Result<(), XcpClientError> {
        self.command(&[CC_DISCONNECT]).await?;
        Ok(())
    }

    pub async fn get_status(&mut self) -> Result<u16, XcpClientError> {
        let resp = self.command(&[CC_GET_STATUS]).await?;
        Ok(resp[0] as u16)
    }

    pub async fn set_mta(&mut self, ext: u8, addr: u32) -> Result<(), XcpClientError> {
        let mut cmd = vec![CC_SET_MTA, 0, 0, ext];
        cmd.extend_from_slice(&addr.to_le_bytes());
        self.command(&cmd).await?;
        Ok(())
    }

    pub async fn upload(&mut self, size: u8) -> Result<Vec<u8>, XcpClientError> {
        self.command(&[CC_UPLOAD, size]).await
    }

    pub async fn short_upload(&mut self, size: u8, ext: u8, addr: u32) -> Result<Vec<u8>, XcpClientError> {
        let mut cmd = vec![CC_SHORT_UPLOAD, size, 0, ext];
        cmd.extend_from_slice(&addr.to_le_bytes());
        self.command(&cmd).await
    }

    pub async fn download(&mut self, data: &[u8]) -> Result<(), XcpClientError> {
        let mut cmd = vec![CC_DOWNLOAD, data.len() as u8];
        cmd.extend_from_slice(data);
        self.command(&cmd).await?;
        Ok(())
    }

    pub async fn short_download(&mut self, ext: u8, addr: u32, data: &[u8]) -> Result<(), XcpClientError> {
        let mut cmd = vec![CC_SHORT_DOWNLOAD, data.len() as u8, 0, ext];
        cmd.extend_from_slice(&addr.to_le_bytes());
        cmd.extend_from_slice(data);
        self.command(&cmd).await?;
        Ok(())
    }

    pub async fn get_cal_page(&mut self, ecu: bool) -> Result<u8, XcpClientError> {
        let mode = if ecu { 0x01 } else { 0x02 };
        let resp = self.command(&[CC_GET_CAL_PAGE, mode, 0]).await?;
        Ok(resp[1])
    }

    pub async fn set_cal_page(&mut self, ecu: bool, xcp: bool, page: u8) -> Result<(), XcpClientError> {
        let mode = if ecu { 0x01 } else { 0 } | if xcp { 0x02 } else { 0 };
        self.command(&[CC_SET_CAL_PAGE, mode, 0, page]).await?;
        Ok(())
    }

    pub async fn copy_cal_page(&mut self, src_seg: u8, src_page: u8, dst_seg: u8, dst_page: u8) -> Result<(), XcpClientError> {
        self.command(&[CC_COPY_CAL_PAGE, src_seg, src_page, dst_seg, dst_page]).await?;
        Ok(())
    }

    pub async fn build_checksum(&mut self, size: u32) -> Result<u32, XcpClientError> {
        let mut cmd = vec![CC_BUILD_CHECKSUM, 0, 0, 0];
        cmd.extend_from_slice(&size.to_le_bytes());
        let resp = self.command(&cmd).await?;
        if resp.len() < 7 {
            return Err(XcpClientError::Malformed);
        }
        Ok((&resp[3..7]).read_u32::<LittleEndian>().unwrap())
    }

    pub async fn get_daq_clock(&mut self) -> Result<u32, XcpClientError> {
        let resp = self.command(&[CC_GET_DAQ_CLOCK]).await?;
        if resp.len() < 7 {
            return Err(XcpClientError::Malformed);
        }
        Ok((&resp[3..7]).read_u32::<LittleEndian>().unwrap())
    }

    pub async fn alloc_daq(&mut self, count: u16) -> Result<(), XcpClientError> {
        let mut cmd = vec![CC_ALLOC_DAQ, 0, 0];
        cmd.extend_from_slice(&count.to_le_bytes());
        self.command(&cmd).await?;
        Ok(())
    }

    pub async fn free_daq(&mut self) -> Result<(), XcpClientError> {
        self.command(&[CC_FREE_DAQ]).await?;
        Ok(())
    }

    pub async fn alloc_odt(&mut self, daq_list: u16, odt_count: u8) -> Result<(), XcpClientError> {
        let mut cmd = vec![CC_ALLOC_ODT, 0, 0];
        cmd.extend_from_slice(&daq_list.to_le_bytes());
        cmd.push(odt_count);
        self.command(&cmd).await?;
        Ok(())
    }

    pub async fn alloc_odt_entry(&mut self, daq_list: u16, odt: u8, entry_count: u8) -> Result<(), XcpClientError> {
        let mut cmd = vec![CC_ALLOC_ODT_ENTRY, 0, 0];
        cmd.extend_from_slice(&daq_list.to_le_bytes());
        cmd.push(odt);
        cmd.push(entry_count);
        self.command(&cmd).await?;
        Ok(())
    }

    pub async fn set_daq_ptr(&mut self, daq_list: u16, odt: u8, entry: u8) -> Result<(), XcpClientError> {
        let mut cmd = vec![CC_SET_DAQ_PTR, 0, 0];
        cmd.extend_from_slice(&daq_list.to_le_bytes());
        cmd.push(odt);
        cmd.push(entry);
        self.command(&cmd).await?;
        Ok(())
    }

    pub async fn write_daq(&mut self, size: u8, ext: u8, addr: u32) -> Result<(), XcpClientError> {
        let mut cmd = vec![CC_WRITE_DAQ, 0, size, ext];
        cmd.extend_from_slice(&addr.to_le_bytes());
        self.command(&cmd).await?;
        Ok(())
    }

    pub async fn set_daq_list_mode(&mut self, daq_list: u16, event_id: u16, timestamps_enabled: bool) -> Result<(), XcpClientError> {
        let mode = if timestamps_enabled { 0x10 } else { 0 };
        let mut cmd = vec![CC_SET_DAQ_LIST_MODE, mode];
        cmd.extend_from_slice(&daq_list.to_le_bytes());
        cmd.extend_from_slice(&event_id.to_le_bytes());
        self.command(&cmd).await?;
        Ok(())
    }

    pub async fn start_stop_daq_list(&mut self, daq_list: u16, start: bool) -> Result<(), XcpClientError> {
        let mut cmd = vec![CC_START_STOP_DAQ_LIST, start as u8];
        cmd.extend_from_slice(&daq_list.to_le_bytes());
        self.command(&cmd).await?;
        Ok(())
    }

    pub async fn start_stop_synch(&mut self, start: bool) -> Result<(), XcpClientError> {
        self.command(&[CC_START_STOP_SYNCH, start as u8]).await?;
        Ok(())
    }

    /// Begin an atomic calibration transaction (`USER_CMD(0x01)`).
    pub async fn begin_cal_transaction(&mut self) -> Result<(), XcpClientError> {
        self.command(&[CC_USER_CMD, 0x01]).await?;
        Ok(())
    }

    /// End the open atomic calibration transaction (`USER_CMD(0x02)`),
    /// applying every staged write.
    pub async fn end_cal_transaction(&mut self) -> Result<(), XcpClientError> {
        self.command(&[CC_USER_CMD, 0x02]).await?;
        Ok(())
    }

    pub async fn get_id_ascii(&mut self) -> Result<String, XcpClientError> {
        let resp = self.command(&[CC_GET_ID, 0]).await?;
        if resp.len() < 7 {
            return Err(XcpClientError::Malformed);
        }
        let len = u32::from_le_bytes([resp[3], resp[4], resp[5], resp[6]]) as usize;
        let name = resp.get(7..7 + len).ok_or(XcpClientError::Malformed)?;
        Ok(String::from_utf8_lossy(name).into_owned())
    }

    /// Fetch the EPK (ECU program identifier / A2L version tag) via
    /// `SET_MTA(ABS, XCP_EPK_ADDR)` + `UPLOAD`, the same convention the
    /// calibration tool uses to verify the A2L file matches the running ECU.
    pub async fn read_epk(&mut self, len: u8) -> Result<String, XcpClientError> {
        self.set_mta(XCP_ADDR_EXT_ABS, XCP_EPK_ADDR).await?;
        let bytes = self.upload(len).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Receive one raw inbound datagram (a DAQ segment, when no command is
    /// in flight) within `CMD_TIMEOUT`.
    pub async fn receive_daq_segment(&mut self) -> Result<Vec<u8>, XcpClientError> {
        let mut buf = [0u8; 4096];
        let n = timeout(CMD_TIMEOUT, self.socket.recv(&mut buf)).await.map_err(|_| XcpClientError::Timeout)??;
        Ok(buf[..n].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_prefixes_payload_with_length_and_counter() {
        let framed = frame(7, &[1, 2, 3]);
        assert_eq!(framed, vec![3, 0, 7, 0, 1, 2, 3]);
    }
}
