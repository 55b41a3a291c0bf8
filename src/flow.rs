//! Flow-control window accounting (RFC 7540 section 6.9).
//!
//! Both scopes (connection and stream) and both directions use the same
//! signed 32-bit window. A window may go negative after an
//! INITIAL_WINDOW_SIZE reduction, but must never exceed 2^31-1.

use crate::error::ProtoError;
use crate::frame::ErrorCode;

/// A signed flow-control window.
#[derive(Debug, Clone, Copy)]
pub struct FlowWindow(i32);

impl FlowWindow {
    pub fn new(initial: u32) -> Self {
        debug_assert!(initial <= i32::MAX as u32);
        Self(initial as i32)
    }

    /// Octets currently available to send or accept. Zero when negative.
    pub fn available(&self) -> u32 {
        self.0.max(0) as u32
    }

    pub fn get(&self) -> i32 {
        self.0
    }

    /// Debit `n` octets. Fails when `n` exceeds the available window; on
    /// the receive side that means the peer overran its allowance.
    pub fn consume(&mut self, n: u32) -> std::result::Result<(), Underflow> {
        if n > self.available() {
            return Err(Underflow);
        }
        self.0 -= n as i32;
        Ok(())
    }

    /// Credit `n` octets from a WINDOW_UPDATE. Exceeding 2^31-1 is a
    /// FLOW_CONTROL_ERROR at the given scope (stream id 0 = connection).
    pub fn grant(&mut self, n: u32, stream_id: u32) -> std::result::Result<(), ProtoError> {
        let next = self.0 as i64 + n as i64;
        if next > i32::MAX as i64 {
            return Err(if stream_id == 0 {
                ProtoError::conn(
                    ErrorCode::FlowControlError,
                    "connection window overflows 2^31-1",
                )
            } else {
                ProtoError::stream(stream_id, ErrorCode::FlowControlError)
            });
        }
        self.0 = next as i32;
        Ok(())
    }

    /// Shift the window by an INITIAL_WINDOW_SIZE delta. The result may be
    /// negative; overflowing 2^31-1 fails the connection.
    pub fn adjust(&mut self, delta: i32) -> std::result::Result<(), ProtoError> {
        let next = self.0 as i64 + delta as i64;
        if next > i32::MAX as i64 {
            return Err(ProtoError::conn(
                ErrorCode::FlowControlError,
                "INITIAL_WINDOW_SIZE change overflows a stream window",
            ));
        }
        self.0 = next.max(-(1i64 << 31)) as i32;
        Ok(())
    }
}

/// Receive-side window underflow: the peer sent more than it was allowed.
#[derive(Debug)]
pub struct Underflow;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_and_grant() {
        let mut w = FlowWindow::new(100);
        w.consume(60).unwrap();
        assert_eq!(w.available(), 40);
        w.grant(60, 0).unwrap();
        assert_eq!(w.available(), 100);
    }

    #[test]
    fn consume_past_zero_underflows() {
        let mut w = FlowWindow::new(10);
        assert!(w.consume(11).is_err());
    }

    #[test]
    fn grant_overflow_is_flow_control_error() {
        let mut w = FlowWindow::new(i32::MAX as u32);
        let err = w.grant(1, 0).unwrap_err();
        assert!(matches!(
            err,
            ProtoError::Connection {
                code: ErrorCode::FlowControlError,
                ..
            }
        ));

        let mut w = FlowWindow::new(i32::MAX as u32);
        let err = w.grant(1, 5).unwrap_err();
        assert!(matches!(
            err,
            ProtoError::Stream {
                id: 5,
                code: ErrorCode::FlowControlError,
            }
        ));
    }

    #[test]
    fn adjust_may_go_negative() {
        let mut w = FlowWindow::new(10);
        w.consume(10).unwrap();
        w.adjust(-65_535).unwrap();
        assert!(w.get() < 0);
        assert_eq!(w.available(), 0);

        // WINDOW_UPDATE brings it back above zero.
        w.grant(65_600, 1).unwrap();
        assert!(w.available() > 0);
    }

    #[test]
    fn adjust_overflow_fails_connection() {
        let mut w = FlowWindow::new(i32::MAX as u32);
        assert!(w.adjust(1).is_err());
    }
}
