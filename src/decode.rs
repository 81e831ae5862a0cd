//! Decode plugin contract for `PROPRIETARY` wire records, plus one
//! reference plugin kept in tree for testability. Real deployments load
//! vendor-specific decoders from a plugin directory; that loading
//! mechanism is an external collaborator per the top-level scope note.

use crate::idmef::{AdditionalData, AdditionalDataValue, Event};

/// A decode plugin claims one sub-tag byte and is handed the remainder of
/// a `PROPRIETARY` record's payload plus the event currently being
/// normalized. It must report exactly how many bytes it consumed; a
/// mismatch against the record's declared length is a protocol error at
/// the call site, not here.
pub trait DecodePlugin: Send + Sync {
    fn decode_id(&self) -> u8;

    /// Consume some prefix of `payload`, mutating `event` as needed, and
    /// return the number of bytes consumed.
    fn run(&self, payload: &[u8], event: &mut Event) -> Result<usize, DecodeError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload too short for this decoder")]
    Truncated,
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Registry of decode plugins, keyed by their `decode_id`.
#[derive(Default)]
pub struct DecodeRegistry {
    plugins: Vec<Box<dyn DecodePlugin>>,
}

impl DecodeRegistry {
    pub fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    pub fn register(&mut self, plugin: Box<dyn DecodePlugin>) {
        self.plugins.push(plugin);
    }

    pub fn find(&self, decode_id: u8) -> Option<&dyn DecodePlugin> {
        self.plugins
            .iter()
            .find(|p| p.decode_id() == decode_id)
            .map(|b| b.as_ref())
    }
}

/// Reference decode plugin: reads a length-prefixed UTF-8 string and
/// appends it to the event's additional data as free-text vendor context.
///
/// Wire shape: `[len: u8][utf8 bytes; len]`.
pub struct VendorTextDecoder {
    decode_id: u8,
    meaning: String,
}

impl VendorTextDecoder {
    pub fn new(decode_id: u8, meaning: impl Into<String>) -> Self {
        Self {
            decode_id,
            meaning: meaning.into(),
        }
    }
}

impl DecodePlugin for VendorTextDecoder {
    fn decode_id(&self) -> u8 {
        self.decode_id
    }

    fn run(&self, payload: &[u8], event: &mut Event) -> Result<usize, DecodeError> {
        let len = *payload.first().ok_or(DecodeError::Truncated)? as usize;
        let end = 1 + len;
        if payload.len() < end {
            return Err(DecodeError::Truncated);
        }
        let text = std::str::from_utf8(&payload[1..end])
            .map_err(|e| DecodeError::Malformed(e.to_string()))?
            .to_string();

        event.core_mut().additional_data.push(AdditionalData {
            ident: 0,
            meaning: Some(self.meaning.clone()),
            data: AdditionalDataValue::String(text),
        });

        Ok(end)
    }
}
