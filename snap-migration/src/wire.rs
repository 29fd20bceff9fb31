//! Wire protocol for the live-migration channel, matching
//! `mlx5_snap_common_command` / `mlx5_snap_completion` byte layouts.

/// `enum mlx5_snap_opcode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    StartLog,
    StopLog,
    GetLogSz,
    ReportLog,
    FreezeDev,
    UnfreezeDev,
    QuiesceDev,
    UnquiesceDev,
    GetStateSz,
    ReadState,
    WriteState,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use Opcode::*;
        Some(match v {
                0x00 => StartLog,
                0x01 => StopLog,
                0x02 => GetLogSz,
                0x03 => ReportLog,
                0x04 => FreezeDev,
                0x05 => UnfreezeDev,
                0x06 => QuiesceDev,
                0x07 => UnquiesceDev,
                0x08 => GetStateSz,
                0x09 => ReadState,
                0x0a => WriteState,
                _ => return None,
        })
    }

    pub fn to_u8(self) -> u8 {
        use Opcode::*;
        match self {
            StartLog => 0x00,
            StopLog => 0x01,
            GetLogSz => 0x02,
            ReportLog => 0x03,
            FreezeDev => 0x04,
            UnfreezeDev => 0x05,
            QuiesceDev => 0x06,
            UnquiesceDev => 0x07,
            GetStateSz => 0x08,
            ReadState => 0x09,
            WriteState => 0x0a,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    InvalidOpcode,
    InvalidField,
    CmdIdConflict,
    DataXferError,
    Internal,
    AlreadyStartedLog,
    AlreadyStoppedLog,
}

impl StatusCode {
    pub fn to_u16(self) -> u16 {
        use StatusCode::*;
        match self {
            Success => 0,
            InvalidOpcode => 1,
            InvalidField => 2,
            CmdIdConflict => 3,
            DataXferError => 4,
            Internal => 5,
            AlreadyStartedLog => 6,
            AlreadyStoppedLog => 7,
        }
    }
}

/// `struct mlx5_snap_common_command`, 64 bytes: a superset layout big
/// enough for every opcode's fields, since this crate parses it into a
/// typed [`Command`] rather than overlaying per-opcode C structs.
#[derive(Debug, Clone, Copy)]
pub struct RawCommand {
    pub opcode: u8,
    pub command_id: u16,
    pub addr: u64,
    pub length: u32,
    pub key: u32,
    /// `page_size` for START_LOG, `offset` (low 32 bits) for
    /// READ_STATE/WRITE_STATE.
    pub cdw6: u32,
}

impl RawCommand {
    pub const WIRE_SIZE: usize = 64;

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(RawCommand {
                opcode: bytes[0],
                command_id: u16::from_le_bytes(bytes[2..4].try_into().ok()?),
                addr: u64::from_le_bytes(bytes[4..12].try_into().ok()?),
                length: u32::from_le_bytes(bytes[12..16].try_into().ok()?),
                key: u32::from_le_bytes(bytes[16..20].try_into().ok()?),
                cdw6: u32::from_le_bytes(bytes[20..24].try_into().ok()?),
        })
    }
}

/// `struct mlx5_snap_completion`, 16 bytes.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub command_id: u16,
    pub status: StatusCode,
    pub result: u64,
}

impl Completion {
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..2].copy_from_slice(&self.command_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.status.to_u16().to_le_bytes());
        out[4..12].copy_from_slice(&self.result.to_le_bytes());
        out
    }
}

/// A parsed, opcode-specific view of a [`RawCommand`].
#[derive(Debug, Clone, Copy)]
pub enum Command {
    StartLog { command_id: u16, addr: u64, length: u32, key: u32, page_size: u32 },
    StopLog { command_id: u16 },
    GetLogSz { command_id: u16 },
    ReportLog { command_id: u16, addr: u64, length: u32, key: u32 },
    FreezeDev { command_id: u16 },
    UnfreezeDev { command_id: u16 },
    QuiesceDev { command_id: u16 },
    UnquiesceDev { command_id: u16 },
    GetStateSz { command_id: u16 },
    ReadState { command_id: u16, addr: u64, length: u32, key: u32, offset: u32 },
    WriteState { command_id: u16, addr: u64, length: u32, key: u32, offset: u32 },
}

impl Command {
    pub fn command_id(&self) -> u16 {
        match *self {
            Command::StartLog { command_id, .. }
            | Command::StopLog { command_id }
            | Command::GetLogSz { command_id }
            | Command::ReportLog { command_id, .. }
            | Command::FreezeDev { command_id }
            | Command::UnfreezeDev { command_id }
            | Command::QuiesceDev { command_id }
            | Command::UnquiesceDev { command_id }
            | Command::GetStateSz { command_id }
            | Command::ReadState { command_id, .. }
            | Command::WriteState { command_id, .. } => command_id,
        }
    }

    /// Parses a raw wire command into its opcode-specific shape.
    /// Returns `Err(InvalidOpcode)` / `Err(InvalidField)`
    /// §4.5 (`page_size` must be a power of two; READ_STATE/WRITE_STATE
    /// `offset` must be zero).
    pub fn parse(raw: &RawCommand) -> Result<Self, (u16, StatusCode)> {
        let op = Opcode::from_u8(raw.opcode).ok_or((raw.command_id, StatusCode::InvalidOpcode))?;
        let cid = raw.command_id;
        Ok(match op {
                Opcode::StartLog => {
                    if !snap_util::is_pow2(raw.cdw6 as u64) {
                        return Err((cid, StatusCode::InvalidField));
                    }
                    Command::StartLog {
                        command_id: cid,
                        addr: raw.addr,
                        length: raw.length,
                        key: raw.key,
                        page_size: raw.cdw6,
                    }
                }
                Opcode::StopLog => Command::StopLog { command_id: cid },
                Opcode::GetLogSz => Command::GetLogSz { command_id: cid },
                Opcode::ReportLog => {
                    Command::ReportLog { command_id: cid, addr: raw.addr, length: raw.length, key: raw.key }
                }
                Opcode::FreezeDev => Command::FreezeDev { command_id: cid },
                Opcode::UnfreezeDev => Command::UnfreezeDev { command_id: cid },
                Opcode::QuiesceDev => Command::QuiesceDev { command_id: cid },
                Opcode::UnquiesceDev => Command::UnquiesceDev { command_id: cid },
                Opcode::GetStateSz => Command::GetStateSz { command_id: cid },
                Opcode::ReadState => {
                    if raw.cdw6 != 0 {
                        return Err((cid, StatusCode::InvalidField));
                    }
                    Command::ReadState {
                        command_id: cid,
                        addr: raw.addr,
                        length: raw.length,
                        key: raw.key,
                        offset: raw.cdw6,
                    }
                }
                Opcode::WriteState => {
                    if raw.cdw6 != 0 {
                        return Err((cid, StatusCode::InvalidField));
                    }
                    Command::WriteState {
                        command_id: cid,
                        addr: raw.addr,
                        length: raw.length,
                        key: raw.key,
                        offset: raw.cdw6,
                    }
                }
        })
    }
}
