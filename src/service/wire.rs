//! Framing for the structured socket transport.
//!
//! Every request is a 24-byte little-endian header followed by `data_size`
//! payload bytes. Every response is a 16-byte header followed by its payload.
//! Paths travel in fixed 256-byte NUL-padded fields.

use std::path::Path;

use super::{Command, ServiceError};
use crate::config::TransportKind;
use crate::privilege::PrivilegeTier;
use crate::rules::{RuleFlags, RuleKind};

/// Header magic, ASCII "MRSA".
pub const MAGIC: u32 = 0x4D52_5341;
/// Framing protocol version.
pub const PROTOCOL_VERSION: u32 = 1;
/// Largest payload accepted in either direction.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;
/// Width of a path field, including the terminating NUL.
pub const PATH_FIELD_LEN: usize = 256;
/// Encoded request header length.
pub const REQUEST_HEADER_LEN: usize = 24;
/// Encoded response header length.
pub const RESPONSE_HEADER_LEN: usize = 16;

/// Operation codes.
pub mod opcode {
    /// Service version.
    pub const GET_VERSION: u32 = 1;
    /// Engine version.
    pub const GET_ENGINE_VERSION: u32 = 2;
    /// Caller privilege level.
    pub const GET_PRIVILEGE_LEVEL: u32 = 3;
    /// Kernel mode availability.
    pub const IS_KERNEL_MODE_AVAILABLE: u32 = 4;
    /// SELinux context of a pid.
    pub const GET_SELINUX_CONTEXT: u32 = 10;
    /// Add or redirect rule.
    pub const HYMO_ADD_RULE: u32 = 20;
    /// Merge rule.
    pub const HYMO_ADD_MERGE_RULE: u32 = 21;
    /// Delete rule by id.
    pub const HYMO_DELETE_RULE: u32 = 22;
    /// Clear all rules.
    pub const HYMO_CLEAR_RULES: u32 = 23;
    /// Active rules as text.
    pub const HYMO_GET_ACTIVE_RULES: u32 = 24;
    /// Stealth toggle.
    pub const HYMO_SET_STEALTH: u32 = 25;
    /// Debug toggle.
    pub const HYMO_SET_DEBUG: u32 = 26;
    /// Mirror path.
    pub const HYMO_SET_MIRROR_PATH: u32 = 27;
    /// Mount id repair.
    pub const HYMO_FIX_MOUNTS: u32 = 28;
    /// Hide a path.
    pub const HYMO_HIDE_PATH: u32 = 29;
    /// Wipe ext4 sysfs traces.
    pub const NUKE_EXT4_SYSFS: u32 = 46;
}

/// Request header fields that vary per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Operation code.
    pub opcode: u32,
    /// Sequence number echoed by the response.
    pub seq: u32,
    /// Payload length.
    pub data_size: u32,
}

impl RequestHeader {
    /// Encode to wire order.
    pub fn encode(&self) -> [u8; REQUEST_HEADER_LEN] {
        let mut out = [0u8; REQUEST_HEADER_LEN];
        let fields = [
            MAGIC,
            PROTOCOL_VERSION,
            self.opcode,
            self.seq,
            self.data_size,
            0,
        ];
        for (chunk, field) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        out
    }
}

/// Decoded response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Sequence number of the request this answers.
    pub seq: u32,
    /// Zero or positive on success, negative error code otherwise.
    pub result: i32,
    /// Payload length that follows.
    pub data_size: u32,
}

impl ResponseHeader {
    /// Decode and validate a response header.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Protocol`] on bad magic or an oversized payload.
    pub fn decode(buf: &[u8; RESPONSE_HEADER_LEN]) -> Result<Self, ServiceError> {
        let word = |index: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&buf[index * 4..index * 4 + 4]);
            bytes
        };
        let magic = u32::from_le_bytes(word(0));
        if magic != MAGIC {
            return Err(ServiceError::Protocol(format!(
                "bad response magic {magic:#010x}"
            )));
        }
        let header = Self {
            seq: u32::from_le_bytes(word(1)),
            result: i32::from_le_bytes(word(2)),
            data_size: u32::from_le_bytes(word(3)),
        };
        if header.data_size as usize > MAX_PACKET_SIZE {
            return Err(ServiceError::Protocol(format!(
                "response payload of {} bytes exceeds {MAX_PACKET_SIZE}",
                header.data_size
            )));
        }
        Ok(header)
    }
}

/// Operation code plus encoded payload for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Operation code.
    pub opcode: u32,
    /// Request payload.
    pub payload: Vec<u8>,
}

impl Frame {
    fn bare(opcode: u32) -> Self {
        Self {
            opcode,
            payload: Vec::new(),
        }
    }
}

/// Encode a logical command for the socket transport.
///
/// # Errors
///
/// Returns [`ServiceError::Unsupported`] for operations the protocol has no
/// code for, and [`ServiceError::InvalidRequest`] for paths that do not fit.
pub fn encode(command: &Command) -> Result<Frame, ServiceError> {
    let frame = match command {
        Command::ProbeTier(PrivilegeTier::Kernel) => Frame::bare(opcode::IS_KERNEL_MODE_AVAILABLE),
        Command::ProbeTier(_) => Frame::bare(opcode::GET_PRIVILEGE_LEVEL),
        Command::ServiceVersion => Frame::bare(opcode::GET_VERSION),
        Command::EngineVersion => Frame::bare(opcode::GET_ENGINE_VERSION),
        Command::SelinuxContext { pid } => {
            let pid = i32::try_from(pid.unwrap_or(0))
                .map_err(|_| ServiceError::InvalidRequest("pid out of range".to_owned()))?;
            Frame {
                opcode: opcode::GET_SELINUX_CONTEXT,
                payload: pid.to_le_bytes().to_vec(),
            }
        }
        Command::AddRule {
            kind,
            source,
            target,
            flags,
        } => match kind {
            RuleKind::Hide => Frame {
                opcode: opcode::HYMO_HIDE_PATH,
                payload: path_field(source)?.to_vec(),
            },
            RuleKind::Add | RuleKind::Merge => {
                let opcode = if *kind == RuleKind::Merge {
                    opcode::HYMO_ADD_MERGE_RULE
                } else {
                    opcode::HYMO_ADD_RULE
                };
                let mut payload = Vec::with_capacity(PATH_FIELD_LEN * 2 + 4);
                payload.extend_from_slice(&path_field(source)?);
                let target = target.as_deref().unwrap_or_else(|| Path::new(""));
                payload.extend_from_slice(&path_field(target)?);
                payload.extend_from_slice(&node_type(*flags).to_le_bytes());
                Frame { opcode, payload }
            }
            RuleKind::Inject => return Err(unsupported(command)),
        },
        Command::DeleteRule(id) => Frame {
            opcode: opcode::HYMO_DELETE_RULE,
            payload: id.get().to_le_bytes().to_vec(),
        },
        Command::ClearRules => Frame::bare(opcode::HYMO_CLEAR_RULES),
        Command::ListRules => Frame::bare(opcode::HYMO_GET_ACTIVE_RULES),
        Command::SetStealth(on) => bool_frame(opcode::HYMO_SET_STEALTH, *on),
        Command::SetDebug(on) => bool_frame(opcode::HYMO_SET_DEBUG, *on),
        Command::SetMirrorPath(path) => Frame {
            opcode: opcode::HYMO_SET_MIRROR_PATH,
            payload: path_field(path)?.to_vec(),
        },
        Command::FixMounts => Frame::bare(opcode::HYMO_FIX_MOUNTS),
        Command::NukeExt4Sysfs => Frame::bare(opcode::NUKE_EXT4_SYSFS),
        Command::SetAvcSpoof(_) | Command::ListModules => return Err(unsupported(command)),
    };
    if frame.payload.len() > MAX_PACKET_SIZE {
        return Err(ServiceError::InvalidRequest(format!(
            "{command} payload exceeds {MAX_PACKET_SIZE} bytes"
        )));
    }
    Ok(frame)
}

/// NUL-padded fixed-width path field.
///
/// # Errors
///
/// Returns [`ServiceError::InvalidRequest`] when the path is too long or
/// contains a NUL byte. Paths are never silently truncated.
pub fn path_field(path: &Path) -> Result<[u8; PATH_FIELD_LEN], ServiceError> {
    let raw = path.to_string_lossy();
    let bytes = raw.as_bytes();
    if bytes.len() >= PATH_FIELD_LEN {
        return Err(ServiceError::InvalidRequest(format!(
            "path '{}' is longer than {} bytes",
            path.display(),
            PATH_FIELD_LEN - 1
        )));
    }
    if bytes.contains(&0) {
        return Err(ServiceError::InvalidRequest(format!(
            "path '{}' contains a NUL byte",
            path.display()
        )));
    }
    let mut field = [0u8; PATH_FIELD_LEN];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

/// Read a little-endian `i32` from the start of a payload.
pub fn decode_i32(payload: &[u8]) -> Option<i32> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some(i32::from_le_bytes(bytes))
}

/// Read a NUL-terminated string payload.
pub fn decode_cstr(payload: &[u8]) -> String {
    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// Engine node type carried in the add-rule payload.
fn node_type(flags: RuleFlags) -> i32 {
    if flags.contains(RuleFlags::SYMLINK) {
        2
    } else if flags.contains(RuleFlags::DIRECTORY) {
        1
    } else {
        0
    }
}

fn bool_frame(opcode: u32, value: bool) -> Frame {
    Frame {
        opcode,
        payload: i32::from(value).to_le_bytes().to_vec(),
    }
}

fn unsupported(command: &Command) -> ServiceError {
    ServiceError::Unsupported {
        command: command.name(),
        transport: TransportKind::Socket,
    }
}
