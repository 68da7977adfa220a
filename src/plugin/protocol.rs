/*!

The worker IPC protocol: request/signal messages and their wire framing,
per spec §6.2/§6.3. Encoding is explicitly out of scope for the abstract
spec, so the wire format here is a private implementation detail: a
`u32` little-endian length prefix followed by a one-byte variant tag and
its fields, reusing [crate::method_cache::Value]'s tagged encoding for
[MethodCache] payloads.

 */
use std::collections::HashMap;
use std::io::{self, Read, Write};

use crate::error::{Error, Result};
use crate::method_cache::{MethodCache, Value};

/// `GSignondPluginState`-equivalent: the worker's reported progress,
/// forwarded to the session's `state_cb`. Order matches spec §6.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    None,
    Resolving,
    Connecting,
    SendingData,
    Waiting,
    UserPending,
    Refreshing,
    ProcessPending,
    Started,
    Canceling,
    Done,
    Holding,
}

impl PluginState {
    const ORDER: [PluginState; 12] = [
        PluginState::None,
        PluginState::Resolving,
        PluginState::Connecting,
        PluginState::SendingData,
        PluginState::Waiting,
        PluginState::UserPending,
        PluginState::Refreshing,
        PluginState::ProcessPending,
        PluginState::Started,
        PluginState::Canceling,
        PluginState::Done,
        PluginState::Holding,
    ];

    fn to_u8(self) -> u8 {
        Self::ORDER.iter().position(|s| *s == self).unwrap() as u8
    }

    fn from_u8(tag: u8) -> Result<Self> {
        Self::ORDER
            .get(tag as usize)
            .copied()
            .ok_or_else(|| Error::InvalidArgument("plugin state".into(), format!("unknown tag {tag}")))
    }
}

/// A request sent from the proxy to the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Cancel,
    Request { data: MethodCache },
    RequestInitial { data: MethodCache, cache: MethodCache, mechanism: String },
    UserActionFinished { ui_data: MethodCache },
    Refresh { ui_data: MethodCache },
}

/// The worker-reported error kind, per spec §7. The proxy forwards this
/// untouched to the session instead of re-deriving an `Error` from the
/// message text, mirroring `gsignond_plugin_proxy_error_callback`'s
/// untouched-`GError` forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    PermissionDenied,
    MechanismNotAvailable,
    SessionCanceled,
    WrongState,
    UserInteraction,
    PluginCrashed,
    Unknown,
}

impl ErrorKind {
    /// Reconstructs the `crate::error::Error` this kind denotes, carrying
    /// `message` into variants that hold free text. Used by the proxy to
    /// forward a worker's reported error unchanged rather than collapsing
    /// it into a single catch-all variant.
    pub fn into_error(self, message: String) -> Error {
        match self {
            ErrorKind::NotFound => Error::NotFound,
            ErrorKind::AlreadyExists => Error::AlreadyExists,
            ErrorKind::InvalidArgument => Error::InvalidArgument("plugin".into(), message),
            ErrorKind::PermissionDenied => Error::PermissionDenied,
            ErrorKind::MechanismNotAvailable => Error::MechanismNotAvailable(message),
            ErrorKind::SessionCanceled => Error::SessionCanceled,
            ErrorKind::WrongState => Error::WrongState("plugin-reported"),
            ErrorKind::UserInteraction => Error::UserInteraction,
            ErrorKind::PluginCrashed => Error::PluginCrashed,
            ErrorKind::Unknown => Error::Unknown(Box::from(message)),
        }
    }

    const ORDER: [ErrorKind; 10] = [
        ErrorKind::NotFound,
        ErrorKind::AlreadyExists,
        ErrorKind::InvalidArgument,
        ErrorKind::PermissionDenied,
        ErrorKind::MechanismNotAvailable,
        ErrorKind::SessionCanceled,
        ErrorKind::WrongState,
        ErrorKind::UserInteraction,
        ErrorKind::PluginCrashed,
        ErrorKind::Unknown,
    ];

    fn to_u8(self) -> u8 {
        Self::ORDER.iter().position(|k| *k == self).unwrap() as u8
    }

    fn from_u8(tag: u8) -> Result<Self> {
        Self::ORDER
            .get(tag as usize)
            .copied()
            .ok_or_else(|| Error::InvalidArgument("error kind".into(), format!("unknown tag {tag}")))
    }
}

/// A signal sent from the worker to the proxy.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Response { data: MethodCache },
    ResponseFinal { data: MethodCache },
    Store { data: MethodCache },
    UserActionRequired { ui_data: MethodCache },
    Refreshed { ui_data: MethodCache },
    StatusChanged { state: PluginState, message: String },
    Error { kind: ErrorKind, message: String },
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    write_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn write_method_cache(out: &mut Vec<u8>, cache: &MethodCache) {
    write_u32(out, cache.len() as u32);
    for (key, value) in cache {
        write_string(out, key);
        let encoded = value.encode();
        write_u32(out, encoded.len() as u32);
        out.extend_from_slice(&encoded);
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| Error::InvalidArgument("frame".into(), "truncated".into()))?;
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        String::from_utf8(self.take(len)?.to_vec())
            .map_err(|_| Error::InvalidArgument("frame".into(), "string is not UTF-8".into()))
    }

    fn method_cache(&mut self) -> Result<MethodCache> {
        let count = self.u32()? as usize;
        let mut cache = HashMap::with_capacity(count);
        for _ in 0..count {
            let key = self.string()?;
            let len = self.u32()? as usize;
            let value = Value::decode(self.take(len)?)?;
            cache.insert(key, value);
        }
        Ok(cache)
    }
}

const TAG_CANCEL: u8 = 0;
const TAG_REQUEST: u8 = 1;
const TAG_REQUEST_INITIAL: u8 = 2;
const TAG_USER_ACTION_FINISHED: u8 = 3;
const TAG_REFRESH: u8 = 4;

impl Request {
    fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Request::Cancel => out.push(TAG_CANCEL),
            Request::Request { data } => {
                out.push(TAG_REQUEST);
                write_method_cache(&mut out, data);
            }
            Request::RequestInitial { data, cache, mechanism } => {
                out.push(TAG_REQUEST_INITIAL);
                write_method_cache(&mut out, data);
                write_method_cache(&mut out, cache);
                write_string(&mut out, mechanism);
            }
            Request::UserActionFinished { ui_data } => {
                out.push(TAG_USER_ACTION_FINISHED);
                write_method_cache(&mut out, ui_data);
            }
            Request::Refresh { ui_data } => {
                out.push(TAG_REFRESH);
                write_method_cache(&mut out, ui_data);
            }
        }
        out
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        Ok(match cur.u8()? {
            TAG_CANCEL => Request::Cancel,
            TAG_REQUEST => Request::Request { data: cur.method_cache()? },
            TAG_REQUEST_INITIAL => Request::RequestInitial {
                data: cur.method_cache()?,
                cache: cur.method_cache()?,
                mechanism: cur.string()?,
            },
            TAG_USER_ACTION_FINISHED => Request::UserActionFinished { ui_data: cur.method_cache()? },
            TAG_REFRESH => Request::Refresh { ui_data: cur.method_cache()? },
            other => return Err(Error::InvalidArgument("request".into(), format!("unknown tag {other}"))),
        })
    }
}

const TAG_RESPONSE: u8 = 0;
const TAG_RESPONSE_FINAL: u8 = 1;
const TAG_STORE: u8 = 2;
const TAG_USER_ACTION_REQUIRED: u8 = 3;
const TAG_REFRESHED: u8 = 4;
const TAG_STATUS_CHANGED: u8 = 5;
const TAG_ERROR: u8 = 6;

impl Signal {
    fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Signal::Response { data } => {
                out.push(TAG_RESPONSE);
                write_method_cache(&mut out, data);
            }
            Signal::ResponseFinal { data } => {
                out.push(TAG_RESPONSE_FINAL);
                write_method_cache(&mut out, data);
            }
            Signal::Store { data } => {
                out.push(TAG_STORE);
                write_method_cache(&mut out, data);
            }
            Signal::UserActionRequired { ui_data } => {
                out.push(TAG_USER_ACTION_REQUIRED);
                write_method_cache(&mut out, ui_data);
            }
            Signal::Refreshed { ui_data } => {
                out.push(TAG_REFRESHED);
                write_method_cache(&mut out, ui_data);
            }
            Signal::StatusChanged { state, message } => {
                out.push(TAG_STATUS_CHANGED);
                out.push(state.to_u8());
                write_string(&mut out, message);
            }
            Signal::Error { kind, message } => {
                out.push(TAG_ERROR);
                out.push(kind.to_u8());
                write_string(&mut out, message);
            }
        }
        out
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(body);
        Ok(match cur.u8()? {
            TAG_RESPONSE => Signal::Response { data: cur.method_cache()? },
            TAG_RESPONSE_FINAL => Signal::ResponseFinal { data: cur.method_cache()? },
            TAG_STORE => Signal::Store { data: cur.method_cache()? },
            TAG_USER_ACTION_REQUIRED => Signal::UserActionRequired { ui_data: cur.method_cache()? },
            TAG_REFRESHED => Signal::Refreshed { ui_data: cur.method_cache()? },
            TAG_STATUS_CHANGED => {
                let state = PluginState::from_u8(cur.u8()?)?;
                Signal::StatusChanged { state, message: cur.string()? }
            }
            TAG_ERROR => {
                let kind = ErrorKind::from_u8(cur.u8()?)?;
                Signal::Error { kind, message: cur.string()? }
            }
            other => return Err(Error::InvalidArgument("signal".into(), format!("unknown tag {other}"))),
        })
    }
}

/// Writes one length-prefixed frame: `u32` length, then the encoded body.
pub fn write_frame(out: &mut impl Write, body: &[u8]) -> io::Result<()> {
    out.write_all(&(body.len() as u32).to_le_bytes())?;
    out.write_all(body)?;
    out.flush()
}

pub fn write_request(out: &mut impl Write, req: &Request) -> io::Result<()> {
    write_frame(out, &req.encode_body())
}

pub fn write_signal(out: &mut impl Write, sig: &Signal) -> io::Result<()> {
    write_frame(out, &sig.encode_body())
}

/// Reads one length-prefixed frame's body. Returns `Ok(None)` on clean EOF
/// before any bytes of the next frame arrive (the worker closed its pipe).
pub fn read_frame(input: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match input.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    input.read_exact(&mut body)?;
    Ok(Some(body))
}

pub fn read_request(input: &mut impl Read) -> Result<Option<Request>> {
    match read_frame(input).map_err(|e| Error::ConnectionFailure(Box::new(e)))? {
        Some(body) => Ok(Some(Request::decode_body(&body)?)),
        None => Ok(None),
    }
}

pub fn read_signal(input: &mut impl Read) -> Result<Option<Signal>> {
    match read_frame(input).map_err(|e| Error::ConnectionFailure(Box::new(e)))? {
        Some(body) => Ok(Some(Signal::decode_body(&body)?)),
        None => Ok(None),
    }
}
