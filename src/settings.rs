//! Connection settings (RFC 7540 section 6.5.2).
//!
//! Each side keeps two copies: the local settings it advertises and the
//! remote settings the peer advertised. Remote values govern what we send;
//! local values govern what we accept, and take effect only once the peer
//! has acknowledged them.

use crate::error::ProtoError;
use crate::frame::{
    ErrorCode, SettingsFrame, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE,
    MAX_ALLOWED_FRAME_SIZE,
};
use crate::{Error, Result};

/// SETTINGS parameter identifiers.
pub mod ids {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

/// The six RFC 7540 settings. `None` means unlimited for the two
/// limit-style parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// Validate locally supplied settings before they are advertised.
    pub fn validate(&self) -> Result<()> {
        if self.initial_window_size > i32::MAX as u32 {
            return Err(Error::InvalidUsage(
                "INITIAL_WINDOW_SIZE exceeds 2^31-1",
            ));
        }
        if self.max_frame_size < DEFAULT_MAX_FRAME_SIZE
            || self.max_frame_size > MAX_ALLOWED_FRAME_SIZE
        {
            return Err(Error::InvalidUsage(
                "MAX_FRAME_SIZE outside [16384, 16777215]",
            ));
        }
        Ok(())
    }

    /// Encode as a non-ACK SETTINGS frame. All six parameters are
    /// advertised explicitly.
    pub fn to_frame(&self) -> SettingsFrame {
        let mut frame = SettingsFrame::new();
        frame.push(ids::HEADER_TABLE_SIZE, self.header_table_size);
        frame.push(ids::ENABLE_PUSH, self.enable_push as u32);
        if let Some(max) = self.max_concurrent_streams {
            frame.push(ids::MAX_CONCURRENT_STREAMS, max);
        }
        frame.push(ids::INITIAL_WINDOW_SIZE, self.initial_window_size);
        frame.push(ids::MAX_FRAME_SIZE, self.max_frame_size);
        if let Some(max) = self.max_header_list_size {
            frame.push(ids::MAX_HEADER_LIST_SIZE, max);
        }
        frame
    }

    /// Apply a received SETTINGS payload on top of the current values.
    /// Duplicate identifiers: last wins. Unknown identifiers are ignored.
    /// Value validation per RFC 7540 section 6.5.2.
    pub fn apply(&mut self, frame: &SettingsFrame) -> std::result::Result<(), ProtoError> {
        for &(id, value) in &frame.settings {
            match id {
                ids::HEADER_TABLE_SIZE => self.header_table_size = value,
                ids::ENABLE_PUSH => match value {
                    0 => self.enable_push = false,
                    1 => self.enable_push = true,
                    _ => {
                        return Err(ProtoError::conn(
                            ErrorCode::ProtocolError,
                            "ENABLE_PUSH must be 0 or 1",
                        ))
                    }
                },
                ids::MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = Some(value),
                ids::INITIAL_WINDOW_SIZE => {
                    if value > i32::MAX as u32 {
                        return Err(ProtoError::conn(
                            ErrorCode::FlowControlError,
                            "INITIAL_WINDOW_SIZE exceeds 2^31-1",
                        ));
                    }
                    self.initial_window_size = value;
                }
                ids::MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE).contains(&value) {
                        return Err(ProtoError::conn(
                            ErrorCode::ProtocolError,
                            "MAX_FRAME_SIZE outside [16384, 16777215]",
                        ));
                    }
                    self.max_frame_size = value;
                }
                ids::MAX_HEADER_LIST_SIZE => self.max_header_list_size = Some(value),
                _ => {} // unknown identifier, skip
            }
        }
        Ok(())
    }
}
