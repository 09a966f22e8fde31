//! System message bodies exchanged with the host.
//!
//! All bodies derive `Serialize` and `Deserialize` and are carried as
//! MessagePack maps with PascalCase keys, after the two-byte request id.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// String metadata attached to scenes, routes and connections.
pub type Metadata = HashMap<String, String>;

/// Route index used on the wire before the host assigns a real one.
pub const UNASSIGNED_ROUTE_INDEX: u16 = 0;

/// A route as described on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RouteDto {
    /// Route name, unique within its table.
    pub name: String,
    /// Route index. [`UNASSIGNED_ROUTE_INDEX`] in connect requests.
    pub handle: u16,
    /// Free-form route metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

// ── Get scene infos ─────────────────────────────────────────────────────────

/// Body of a [`GET_SCENE_INFOS`](crate::message_ids::GET_SCENE_INFOS) request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SceneInfosRequest {
    /// The join token, as received from the token endpoint.
    pub token: String,
    /// The connection metadata snapshot.
    pub metadata: Metadata,
}

/// Reply to a [`GET_SCENE_INFOS`](crate::message_ids::GET_SCENE_INFOS) request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SceneInfosDto {
    /// Scene identifier.
    pub scene_id: String,
    /// Host-side scene metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Routes the host accepts traffic on (remote routes for the client).
    #[serde(default)]
    pub routes: Vec<RouteDto>,
    /// Name of the serializer the host selected for this connection.
    pub selected_serializer: String,
}

// ── Connect to scene ────────────────────────────────────────────────────────

/// Body of a [`CONNECT_TO_SCENE`](crate::message_ids::CONNECT_TO_SCENE) request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectToSceneMsg {
    /// The join token of the scene.
    pub token: String,
    /// Local routes of the client, index left unassigned.
    pub routes: Vec<RouteDto>,
    /// The connection metadata snapshot.
    pub connection_metadata: Metadata,
}

/// Reply to a [`CONNECT_TO_SCENE`](crate::message_ids::CONNECT_TO_SCENE) request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionResult {
    /// The handle scene traffic is tagged with from now on.
    pub scene_handle: u8,
    /// Index assigned to every submitted local route, by name.
    pub route_mappings: HashMap<String, u16>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};

    #[test]
    fn test_scene_infos_defaults_missing_collections() {
        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct Minimal {
            scene_id: String,
            selected_serializer: String,
        }
        let bytes = encode(&Minimal {
            scene_id: "lobby".to_string(),
            selected_serializer: "MsgPack".to_string(),
        })
        .unwrap();
        let infos: SceneInfosDto = decode(&bytes).unwrap();
        assert_eq!(infos.scene_id, "lobby");
        assert!(infos.routes.is_empty());
        assert!(infos.metadata.is_empty());
    }

    #[test]
    fn test_connect_to_scene_wire_keys() {
        let msg = ConnectToSceneMsg {
            token: "tok".to_string(),
            routes: vec![RouteDto {
                name: "chat".to_string(),
                handle: UNASSIGNED_ROUTE_INDEX,
                metadata: Metadata::new(),
            }],
            connection_metadata: Metadata::new(),
        };
        let bytes = encode(&msg).unwrap();
        let raw: HashMap<String, serde_json::Value> = decode(&bytes).unwrap();
        assert!(raw.contains_key("Token"));
        assert!(raw.contains_key("ConnectionMetadata"));
        assert_eq!(raw["Routes"][0]["Name"], "chat");
        assert_eq!(raw["Routes"][0]["Handle"], 0);
    }

    #[test]
    fn test_connection_result_decodes() {
        let mut route_mappings = HashMap::new();
        route_mappings.insert("chat".to_string(), 3u16);
        let bytes = encode(&ConnectionResult {
            scene_handle: 141,
            route_mappings,
        })
        .unwrap();
        let result: ConnectionResult = decode(&bytes).unwrap();
        assert_eq!(result.scene_handle, 141);
        assert_eq!(result.route_mappings["chat"], 3);
    }
}
