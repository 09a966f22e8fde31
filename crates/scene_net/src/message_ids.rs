//! Fixed message kinds of the scene protocol.
//!
//! Every frame on the wire carries a one-byte tag. Tags below
//! [`SCENES`] are system messages; tags from [`SCENES`] upward are scene
//! handles assigned by the host during the connect handshake.

/// Connect to a scene. Client → Host, system request.
pub const CONNECT_TO_SCENE: u8 = 134;

/// Leave a scene. Client → Host, system request.
pub const DISCONNECT_FROM_SCENE: u8 = 135;

/// Fetch scene metadata, routes and the selected serializer. Client → Host,
/// system request.
pub const GET_SCENE_INFOS: u8 = 136;

/// Intermediate value of a system request. Does not settle the request.
pub const REQUEST_RESPONSE_MSG: u8 = 137;

/// Successful end of a system request.
pub const REQUEST_RESPONSE_COMPLETE: u8 = 138;

/// Failed end of a system request. Body is the serialized fault message.
pub const REQUEST_RESPONSE_ERROR: u8 = 139;

/// Reply kind of [`CONNECT_TO_SCENE`]. Reserved on the wire.
pub const CONNECTION_RESULT: u8 = 140;

/// First scene handle. Effective handle = `SCENES + slot`.
pub const SCENES: u8 = 141;

/// Number of scene handles available on one connection.
pub const MAX_SCENES: usize = (u8::MAX - SCENES) as usize + 1;

/// Returns `true` if `tag` addresses a scene rather than the system layer.
#[must_use]
pub const fn is_scene_handle(tag: u8) -> bool {
    tag >= SCENES
}

/// Returns `true` if `tag` terminates or feeds a pending system request.
#[must_use]
pub const fn is_request_response(tag: u8) -> bool {
    matches!(
        tag,
        REQUEST_RESPONSE_MSG | REQUEST_RESPONSE_COMPLETE | REQUEST_RESPONSE_ERROR
    )
}

/// Human-readable name of a message kind, for logs.
#[must_use]
pub fn name(tag: u8) -> &'static str {
    match tag {
        CONNECT_TO_SCENE => "connect_to_scene",
        DISCONNECT_FROM_SCENE => "disconnect_from_scene",
        GET_SCENE_INFOS => "get_scene_infos",
        REQUEST_RESPONSE_MSG => "request_response_msg",
        REQUEST_RESPONSE_COMPLETE => "request_response_complete",
        REQUEST_RESPONSE_ERROR => "request_response_error",
        CONNECTION_RESULT => "connection_result",
        t if is_scene_handle(t) => "scene",
        _ => "unknown",
    }
}
