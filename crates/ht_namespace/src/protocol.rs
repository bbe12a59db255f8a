//! Wire protocol for the namespace service.
//!
//! Every message starts with a 16-bit protocol version and a 32-bit
//! operation code, followed by the operation payload. Replies always lead
//! with a 32-bit response code; a non-OK code terminates the reply.

use ht_core::codec::{
    decode_byte, decode_bytes32, decode_i16, decode_i32, decode_i64, decode_vstr, encode_byte,
    encode_bytes32, encode_i16, encode_i32, encode_i64, encode_vstr,
};
use ht_core::{ErrorCode, Exception, Result};

pub const PROTOCOL_VERSION: u16 = 1;

pub const OP_OPEN: u32 = 2;
pub const OP_CLOSE: u32 = 3;
pub const OP_MKDIR: u32 = 4;
pub const OP_UNLINK: u32 = 5;
pub const OP_EXISTS: u32 = 6;
pub const OP_ATTR_SET: u32 = 7;
pub const OP_ATTR_GET: u32 = 8;
pub const OP_ATTR_DEL: u32 = 9;
pub const OP_READDIR: u32 = 10;
pub const OP_LOCK: u32 = 11;
pub const OP_RELEASE: u32 = 12;
pub const OP_STATUS: u32 = 13;

pub const OPEN_FLAG_READ: u32 = 0x0001;
pub const OPEN_FLAG_WRITE: u32 = 0x0002;
pub const OPEN_FLAG_LOCK: u32 = 0x0004;
pub const OPEN_FLAG_CREATE: u32 = 0x0008;
pub const OPEN_FLAG_EXCL: u32 = 0x0010;
pub const OPEN_FLAG_TEMP: u32 = 0x0020;
pub const OPEN_FLAG_LOCK_SHARED: u32 = 0x0040;
pub const OPEN_FLAG_LOCK_EXCLUSIVE: u32 = 0x0080;

pub const LOCK_MODE_SHARED: u32 = 1;
pub const LOCK_MODE_EXCLUSIVE: u32 = 2;

/// Server-reported state of a lock request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum LockStatus {
    Granted = 1,
    Busy = 2,
    Pending = 3,
    Cancelled = 4,
}

impl LockStatus {
    pub fn from_wire(val: i32) -> Result<LockStatus> {
        match val {
            1 => Ok(LockStatus::Granted),
            2 => Ok(LockStatus::Busy),
            3 => Ok(LockStatus::Pending),
            4 => Ok(LockStatus::Cancelled),
            other => Err(Exception::new(
                ErrorCode::ProtocolError,
                format!("unknown lock status {other}"),
            )),
        }
    }
}

/// Initial attribute written atomically with a created file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: Vec<u8>,
}

/// One directory listing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Decoded open/create reply fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenResult {
    pub handle: u64,
    pub created: bool,
    pub lock_generation: u64,
}

/// A request to the namespace master.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Open {
        name: String,
        flags: u32,
        event_mask: u32,
        init_attrs: Vec<Attribute>,
    },
    Close {
        handle: u64,
    },
    Mkdir {
        name: String,
    },
    Unlink {
        name: String,
    },
    Exists {
        name: String,
    },
    AttrSet {
        handle: u64,
        name: String,
        value: Vec<u8>,
    },
    AttrGet {
        handle: u64,
        name: String,
    },
    AttrDel {
        handle: u64,
        name: String,
    },
    Readdir {
        handle: u64,
    },
    Lock {
        handle: u64,
        mode: u32,
        try_acquire: bool,
    },
    Release {
        handle: u64,
    },
    Status,
}

impl Request {
    pub fn op(&self) -> u32 {
        match self {
            Request::Open { .. } => OP_OPEN,
            Request::Close { .. } => OP_CLOSE,
            Request::Mkdir { .. } => OP_MKDIR,
            Request::Unlink { .. } => OP_UNLINK,
            Request::Exists { .. } => OP_EXISTS,
            Request::AttrSet { .. } => OP_ATTR_SET,
            Request::AttrGet { .. } => OP_ATTR_GET,
            Request::AttrDel { .. } => OP_ATTR_DEL,
            Request::Readdir { .. } => OP_READDIR,
            Request::Lock { .. } => OP_LOCK,
            Request::Release { .. } => OP_RELEASE,
            Request::Status => OP_STATUS,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        encode_i16(&mut out, PROTOCOL_VERSION);
        encode_i32(&mut out, self.op() as i32);
        match self {
            Request::Open {
                name,
                flags,
                event_mask,
                init_attrs,
            } => {
                encode_vstr(&mut out, name);
                encode_i32(&mut out, *flags as i32);
                encode_i32(&mut out, *event_mask as i32);
                encode_i32(&mut out, init_attrs.len() as i32);
                for attr in init_attrs {
                    encode_vstr(&mut out, &attr.name);
                    encode_bytes32(&mut out, &attr.value);
                }
            }
            Request::Close { handle }
            | Request::Readdir { handle }
            | Request::Release { handle } => {
                encode_i64(&mut out, *handle as i64);
            }
            Request::Mkdir { name } | Request::Unlink { name } | Request::Exists { name } => {
                encode_vstr(&mut out, name);
            }
            Request::AttrSet {
                handle,
                name,
                value,
            } => {
                encode_i64(&mut out, *handle as i64);
                encode_vstr(&mut out, name);
                encode_bytes32(&mut out, value);
            }
            Request::AttrGet { handle, name } | Request::AttrDel { handle, name } => {
                encode_i64(&mut out, *handle as i64);
                encode_vstr(&mut out, name);
            }
            Request::Lock {
                handle,
                mode,
                try_acquire,
            } => {
                encode_i64(&mut out, *handle as i64);
                encode_i32(&mut out, *mode as i32);
                encode_byte(&mut out, u8::from(*try_acquire));
            }
            Request::Status => {}
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Request> {
        let mut offset = 0;
        let version = decode_i16(data, &mut offset)?;
        if version != PROTOCOL_VERSION {
            return Err(Exception::new(
                ErrorCode::ProtocolError,
                format!("unsupported protocol version {version}"),
            ));
        }
        let op = decode_i32(data, &mut offset)? as u32;
        let request = match op {
            OP_OPEN => {
                let name = decode_vstr(data, &mut offset)?;
                let flags = decode_i32(data, &mut offset)? as u32;
                let event_mask = decode_i32(data, &mut offset)? as u32;
                let count = decode_i32(data, &mut offset)?;
                if count < 0 {
                    return Err(Exception::new(
                        ErrorCode::MalformedRequest,
                        "negative attribute count in open request",
                    ));
                }
                let mut init_attrs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let name = decode_vstr(data, &mut offset)?;
                    let value = decode_bytes32(data, &mut offset)?;
                    init_attrs.push(Attribute { name, value });
                }
                Request::Open {
                    name,
                    flags,
                    event_mask,
                    init_attrs,
                }
            }
            OP_CLOSE => Request::Close {
                handle: decode_i64(data, &mut offset)? as u64,
            },
            OP_MKDIR => Request::Mkdir {
                name: decode_vstr(data, &mut offset)?,
            },
            OP_UNLINK => Request::Unlink {
                name: decode_vstr(data, &mut offset)?,
            },
            OP_EXISTS => Request::Exists {
                name: decode_vstr(data, &mut offset)?,
            },
            OP_ATTR_SET => Request::AttrSet {
                handle: decode_i64(data, &mut offset)? as u64,
                name: decode_vstr(data, &mut offset)?,
                value: decode_bytes32(data, &mut offset)?,
            },
            OP_ATTR_GET => Request::AttrGet {
                handle: decode_i64(data, &mut offset)? as u64,
                name: decode_vstr(data, &mut offset)?,
            },
            OP_ATTR_DEL => Request::AttrDel {
                handle: decode_i64(data, &mut offset)? as u64,
                name: decode_vstr(data, &mut offset)?,
            },
            OP_READDIR => Request::Readdir {
                handle: decode_i64(data, &mut offset)? as u64,
            },
            OP_LOCK => Request::Lock {
                handle: decode_i64(data, &mut offset)? as u64,
                mode: decode_i32(data, &mut offset)? as u32,
                try_acquire: decode_byte(data, &mut offset)? != 0,
            },
            OP_RELEASE => Request::Release {
                handle: decode_i64(data, &mut offset)? as u64,
            },
            OP_STATUS => Request::Status,
            other => {
                return Err(Exception::new(
                    ErrorCode::MalformedRequest,
                    format!("unknown operation code {other}"),
                ))
            }
        };
        Ok(request)
    }
}

/// A reply from the namespace master.
///
/// `Empty` covers every operation whose success reply carries no payload
/// beyond the response code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Open(OpenResult),
    Exists {
        exists: bool,
    },
    AttrGet {
        value: Vec<u8>,
    },
    Readdir {
        listing: Vec<DirEntry>,
    },
    Lock {
        status: LockStatus,
        generation: Option<u64>,
    },
    Empty,
    Error(ErrorCode),
}

impl Reply {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        if let Reply::Error(code) = self {
            encode_i32(&mut out, code.code());
            return out;
        }
        encode_i32(&mut out, ErrorCode::Ok.code());
        match self {
            Reply::Open(result) => {
                encode_i64(&mut out, result.handle as i64);
                encode_byte(&mut out, u8::from(result.created));
                encode_i64(&mut out, result.lock_generation as i64);
            }
            Reply::Exists { exists } => encode_byte(&mut out, u8::from(*exists)),
            Reply::AttrGet { value } => encode_bytes32(&mut out, value),
            Reply::Readdir { listing } => {
                encode_i32(&mut out, listing.len() as i32);
                for entry in listing {
                    encode_dir_entry(&mut out, entry);
                }
            }
            Reply::Lock { status, generation } => {
                encode_i32(&mut out, *status as i32);
                if *status == LockStatus::Granted {
                    encode_i64(&mut out, generation.unwrap_or(0) as i64);
                }
            }
            Reply::Empty => {}
            Reply::Error(_) => unreachable!(),
        }
        out
    }

    /// Decode the reply to `op`. A non-OK leading code decodes to
    /// `Reply::Error` regardless of the operation.
    pub fn decode(data: &[u8], op: u32) -> Result<Reply> {
        let mut offset = 0;
        let code = decode_i32(data, &mut offset)?;
        if code != ErrorCode::Ok.code() {
            let code = ErrorCode::from_code(code).unwrap_or(ErrorCode::ProtocolError);
            return Ok(Reply::Error(code));
        }
        let reply = match op {
            OP_OPEN => Reply::Open(OpenResult {
                handle: decode_i64(data, &mut offset)? as u64,
                created: decode_byte(data, &mut offset)? != 0,
                lock_generation: decode_i64(data, &mut offset)? as u64,
            }),
            OP_EXISTS => Reply::Exists {
                exists: decode_byte(data, &mut offset)? != 0,
            },
            OP_ATTR_GET => Reply::AttrGet {
                value: decode_bytes32(data, &mut offset)?,
            },
            OP_READDIR => {
                let count = decode_i32(data, &mut offset)?;
                if count < 0 {
                    return Err(Exception::new(
                        ErrorCode::ProtocolError,
                        "negative entry count in readdir reply",
                    ));
                }
                let mut listing = Vec::with_capacity(count as usize);
                for i in 0..count {
                    let entry = decode_dir_entry(data, &mut offset).map_err(|e| {
                        Exception::chain(
                            ErrorCode::ProtocolError,
                            format!("problem decoding entry {i} of readdir reply"),
                            e,
                        )
                    })?;
                    listing.push(entry);
                }
                Reply::Readdir { listing }
            }
            OP_LOCK => {
                let status = LockStatus::from_wire(decode_i32(data, &mut offset)?)?;
                let generation = if status == LockStatus::Granted {
                    Some(decode_i64(data, &mut offset)? as u64)
                } else {
                    None
                };
                Reply::Lock { status, generation }
            }
            _ => Reply::Empty,
        };
        Ok(reply)
    }

    /// Leading response code of an encoded reply.
    pub fn response_code(data: &[u8]) -> Result<i32> {
        let mut offset = 0;
        decode_i32(data, &mut offset)
    }
}

fn encode_dir_entry(out: &mut Vec<u8>, entry: &DirEntry) {
    encode_vstr(out, &entry.name);
    encode_byte(out, u8::from(entry.is_dir));
}

fn decode_dir_entry(data: &[u8], offset: &mut usize) -> Result<DirEntry> {
    let name = decode_vstr(data, offset)?;
    let is_dir = decode_byte(data, offset)? != 0;
    Ok(DirEntry { name, is_dir })
}
