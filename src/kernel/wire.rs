//! cachefiles on-demand wire format
//!
//! Messages read from the device start with a 16-byte little-endian header
//! `{msg_id, opcode, len, object_id}` followed by an opcode-specific payload.
//! Commands written to the device are short ASCII lines.

use crate::error::DaemonError;
use std::fmt;

pub const MSG_HEADER_SIZE: usize = 16;
pub const MAX_MSG_SIZE: usize = 1024;

pub const OP_OPEN: u32 = 0;
pub const OP_CLOSE: u32 = 1;
pub const OP_READ: u32 = 2;

const OPEN_FIXED_SIZE: usize = 16;
const READ_SIZE: usize = 16;

/// Completion ioctl issued on an object descriptor: `_IOW(0x98, 1, int)`.
pub const CACHEFILES_IOC_READ_COMPLETE: u64 = 0x4004_9801;

/// Size reported for raw slab objects.
pub const SLAB_OBJECT_SIZE: i64 = 1 << 40;

/// Volume key the kernel presents for our domain.
pub fn volume_key(domain_id: &str) -> Vec<u8> {
    let mut v = format!("erofs,{}", domain_id).into_bytes();
    v.push(0);
    v
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Open {
        msg_id: u32,
        object_id: u32,
        fd: u32,
        flags: u32,
        volume_key: Vec<u8>,
        cookie_key: Vec<u8>,
    },
    Close {
        msg_id: u32,
        object_id: u32,
    },
    Read {
        msg_id: u32,
        object_id: u32,
        off: u64,
        len: u64,
    },
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

impl Message {
    pub fn msg_id(&self) -> u32 {
        match self {
            Message::Open { msg_id, .. } | Message::Close { msg_id, .. } | Message::Read { msg_id, .. } => *msg_id,
        }
    }

    pub fn object_id(&self) -> u32 {
        match self {
            Message::Open { object_id, .. }
            | Message::Close { object_id, .. }
            | Message::Read { object_id, .. } => *object_id,
        }
    }

    /// Decode one message. Anything short, oversized or with an unknown opcode
    /// is a protocol error.
    pub fn decode(buf: &[u8]) -> Result<Self, DaemonError> {
        if buf.len() < MSG_HEADER_SIZE {
            return Err(DaemonError::Protocol(format!("message of {} bytes", buf.len())));
        }
        if buf.len() > MAX_MSG_SIZE {
            return Err(DaemonError::Protocol(format!("oversized message of {} bytes", buf.len())));
        }
        let msg_id = u32_at(buf, 0);
        let opcode = u32_at(buf, 4);
        let len = u32_at(buf, 8) as usize;
        let object_id = u32_at(buf, 12);
        if len != buf.len() {
            return Err(DaemonError::Protocol(format!(
                "header length {} but read {} bytes",
                len,
                buf.len()
            )));
        }
        let payload = &buf[MSG_HEADER_SIZE..];
        match opcode {
            OP_OPEN => {
                if payload.len() < OPEN_FIXED_SIZE {
                    return Err(DaemonError::Protocol("short open payload".to_string()));
                }
                let volume_key_size = u32_at(payload, 0) as usize;
                let cookie_key_size = u32_at(payload, 4) as usize;
                let fd = u32_at(payload, 8);
                let flags = u32_at(payload, 12);
                let keys = &payload[OPEN_FIXED_SIZE..];
                if volume_key_size + cookie_key_size > keys.len() {
                    return Err(DaemonError::Protocol(format!(
                        "open keys of {}+{} bytes exceed payload of {}",
                        volume_key_size,
                        cookie_key_size,
                        keys.len()
                    )));
                }
                Ok(Message::Open {
                    msg_id,
                    object_id,
                    fd,
                    flags,
                    volume_key: keys[..volume_key_size].to_vec(),
                    cookie_key: keys[volume_key_size..volume_key_size + cookie_key_size].to_vec(),
                })
            }
            OP_CLOSE => Ok(Message::Close { msg_id, object_id }),
            OP_READ => {
                if payload.len() < READ_SIZE {
                    return Err(DaemonError::Protocol("short read payload".to_string()));
                }
                Ok(Message::Read {
                    msg_id,
                    object_id,
                    off: u64_at(payload, 0),
                    len: u64_at(payload, 8),
                })
            }
            other => Err(DaemonError::Protocol(format!("unknown opcode {}", other))),
        }
    }

    /// Encode as the kernel would; used by test devices.
    pub fn encode(&self) -> Vec<u8> {
        let (opcode, payload) = match self {
            Message::Open {
                fd,
                flags,
                volume_key,
                cookie_key,
                ..
            } => {
                let mut p = Vec::with_capacity(OPEN_FIXED_SIZE + volume_key.len() + cookie_key.len());
                p.extend_from_slice(&(volume_key.len() as u32).to_le_bytes());
                p.extend_from_slice(&(cookie_key.len() as u32).to_le_bytes());
                p.extend_from_slice(&fd.to_le_bytes());
                p.extend_from_slice(&flags.to_le_bytes());
                p.extend_from_slice(volume_key);
                p.extend_from_slice(cookie_key);
                (OP_OPEN, p)
            }
            Message::Close { .. } => (OP_CLOSE, Vec::new()),
            Message::Read { off, len, .. } => {
                let mut p = Vec::with_capacity(READ_SIZE);
                p.extend_from_slice(&off.to_le_bytes());
                p.extend_from_slice(&len.to_le_bytes());
                (OP_READ, p)
            }
        };
        let mut buf = Vec::with_capacity(MSG_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&self.msg_id().to_le_bytes());
        buf.extend_from_slice(&opcode.to_le_bytes());
        buf.extend_from_slice(&((MSG_HEADER_SIZE + payload.len()) as u32).to_le_bytes());
        buf.extend_from_slice(&self.object_id().to_le_bytes());
        buf.extend_from_slice(&payload);
        buf
    }
}

/// Commands written to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Dir(String),
    Tag(String),
    BindOndemand,
    /// Reply to an open: object size, or a negative errno
    Copen { msg_id: u32, size: i64 },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Dir(path) => write!(f, "dir {}", path),
            Command::Tag(tag) => write!(f, "tag {}", tag),
            Command::BindOndemand => write!(f, "bind ondemand"),
            Command::Copen { msg_id, size } => write!(f, "copen {},{}", msg_id, size),
        }
    }
}
