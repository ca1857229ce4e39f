//! Unified error type for the engine's server side.

use loretable_protocol::ProtocolError;
use loretable_room::RoomError;
use loretable_session::SessionError;
use loretable_transport::TransportError;

/// Top-level error wrapping each layer's error type, so server code deals
/// with one and `?` converts the rest.
#[derive(Debug, thiserror::Error)]
pub enum LoretableError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Room(#[from] RoomError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use loretable_encounter::RoomId;

    #[test]
    fn test_from_impls_wrap_each_layer() {
        let e: LoretableError = TransportError::ConnectionClosed("gone".into()).into();
        assert!(matches!(e, LoretableError::Transport(_)));
        assert!(e.to_string().contains("gone"));

        let e: LoretableError = ProtocolError::InvalidMessage("bad".into()).into();
        assert!(matches!(e, LoretableError::Protocol(_)));

        let e: LoretableError = SessionError::InvalidToken.into();
        assert!(matches!(e, LoretableError::Session(_)));

        let e: LoretableError = RoomError::NotFound(RoomId(1)).into();
        assert!(matches!(e, LoretableError::Room(_)));
    }
}
