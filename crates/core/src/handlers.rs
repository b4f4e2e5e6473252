//! Custom-handler transport and chain
//!
//! Hook requests may carry a little-endian blob naming observers in
//! external modules. The format is length-prefixed and unaligned:
//!
//! ```text
//! u32 count
//! repeat count:
//!   u32 flags
//!   u32 dll_name_chars        (UTF-16 units)
//!   u32 handler_name_chars
//!   u16 dll_name[dll_name_chars]
//!   u16 handler_name[handler_name_chars]
//! ```
//!
//! Any length that overruns the buffer rejects the whole hook request
//! with `InvalidTransportData`.

use std::sync::Arc;

use divert_sdk::{CallInfo, CallState, CallbackAction, INTERCALL_SCRATCH_SIZE};

use crate::error::{EngineError, EngineResult};
use crate::host::{CustomHandler, EngineCallbacks};

/// Parsed descriptor of one custom handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerDescriptor {
    pub flags: u32,
    pub dll_name: String,
    pub handler_name: String,
}

/// A resolved handler attached to a hook entry.
pub struct AttachedHandler {
    pub descriptor: HandlerDescriptor,
    pub handler: Arc<dyn CustomHandler>,
}

/// Parse a custom-handler blob.
pub fn parse_handler_blob(data: &[u8]) -> EngineResult<Vec<HandlerDescriptor>> {
    let mut cursor = Cursor { data, pos: 0 };
    let count = cursor.read_u32()?;
    let mut out = Vec::new();
    for _ in 0..count {
        let flags = cursor.read_u32()?;
        let dll_chars = cursor.read_u32()? as usize;
        let handler_chars = cursor.read_u32()? as usize;
        let dll_name = cursor.read_utf16(dll_chars)?;
        let handler_name = cursor.read_utf16(handler_chars)?;
        out.push(HandlerDescriptor {
            flags,
            dll_name,
            handler_name,
        });
    }
    Ok(out)
}

/// Resolve every descriptor through the host; the first failure rejects
/// the hook request.
pub fn attach_handlers(
    descriptors: Vec<HandlerDescriptor>,
    callbacks: &dyn EngineCallbacks,
) -> EngineResult<Vec<AttachedHandler>> {
    descriptors
        .into_iter()
        .map(|descriptor| {
            let handler = callbacks.resolve_custom_handler(
                &descriptor.dll_name,
                &descriptor.handler_name,
                descriptor.flags,
            )?;
            Ok(AttachedHandler {
                descriptor,
                handler,
            })
        })
        .collect()
}

/// Run the handler chain for one phase.
///
/// A handler returning `Suppress` still lets the rest of the chain run
/// but withholds the outer callback; an error stops the chain and makes
/// the dispatcher ignore the call.
pub fn run_handler_chain(
    handlers: &[AttachedHandler],
    info: &CallInfo,
    state: &mut CallState,
    scratch: &mut [u8; INTERCALL_SCRATCH_SIZE],
) -> EngineResult<CallbackAction> {
    let mut action = CallbackAction::Continue;
    for attached in handlers {
        if attached.handler.on_call(info, state, scratch)? == CallbackAction::Suppress {
            action = CallbackAction::Suppress;
        }
    }
    Ok(action)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn read_u32(&mut self) -> EngineResult<u32> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or(EngineError::InvalidTransportData)?;
        self.pos += 4;
        let bytes: [u8; 4] = bytes.try_into().map_err(|_| EngineError::InvalidTransportData)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_utf16(&mut self, chars: usize) -> EngineResult<String> {
        let byte_len = chars
            .checked_mul(2)
            .ok_or(EngineError::InvalidTransportData)?;
        let bytes = self
            .data
            .get(self.pos..self.pos.checked_add(byte_len).ok_or(EngineError::InvalidTransportData)?)
            .ok_or(EngineError::InvalidTransportData)?;
        self.pos += byte_len;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(entries: &[(u32, &str, &str)]) -> Vec<u8> {
        let mut blob = (entries.len() as u32).to_le_bytes().to_vec();
        for (flags, dll, handler) in entries {
            blob.extend_from_slice(&flags.to_le_bytes());
            let dll16: Vec<u16> = dll.encode_utf16().collect();
            let handler16: Vec<u16> = handler.encode_utf16().collect();
            blob.extend_from_slice(&(dll16.len() as u32).to_le_bytes());
            blob.extend_from_slice(&(handler16.len() as u32).to_le_bytes());
            for u in dll16.iter().chain(handler16.iter()) {
                blob.extend_from_slice(&u.to_le_bytes());
            }
        }
        blob
    }

    #[test]
    fn parse_two_handlers() {
        let blob = encode(&[(1, "trace.dll", "OnFileOpen"), (0, "audit.dll", "OnFileOpen")]);
        let parsed = parse_handler_blob(&blob).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].dll_name, "trace.dll");
        assert_eq!(parsed[0].handler_name, "OnFileOpen");
        assert_eq!(parsed[0].flags, 1);
        assert_eq!(parsed[1].dll_name, "audit.dll");
    }

    #[test]
    fn declared_count_beyond_buffer_is_rejected() {
        // Claims two entries but carries one.
        let mut blob = encode(&[(0, "a.dll", "H")]);
        blob[0] = 2;
        assert_eq!(
            parse_handler_blob(&blob),
            Err(EngineError::InvalidTransportData)
        );
    }

    #[test]
    fn truncated_name_is_rejected() {
        let mut blob = encode(&[(0, "abc.dll", "Handler")]);
        blob.truncate(blob.len() - 3);
        assert_eq!(
            parse_handler_blob(&blob),
            Err(EngineError::InvalidTransportData)
        );
    }

    #[test]
    fn empty_blob_is_rejected() {
        assert_eq!(parse_handler_blob(&[]), Err(EngineError::InvalidTransportData));
        assert_eq!(parse_handler_blob(&[1, 0]), Err(EngineError::InvalidTransportData));
    }
}
