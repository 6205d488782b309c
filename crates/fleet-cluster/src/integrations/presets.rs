//! Identity provider objects registered for every managed cluster
//!
//! Client ids are prefixed with `<namespace>-<cluster>` so each cluster gets
//! its own set.

use std::collections::BTreeMap;

/// Applications that authenticate against the identity provider
pub const CLIENT_APPS: [&str; 6] = [
    "kibana",
    "grafana",
    "kiali",
    "jaeger",
    "hyperregistry",
    "opensearch",
];

const MAPPER_APPS: [&str; 4] = ["kibana", "jaeger", "hyperregistry", "opensearch"];
const ROLE_APPS: [&str; 3] = ["kibana", "jaeger", "opensearch"];
const SCOPE_APPS: [&str; 1] = ["kiali"];

/// Role granted to the cluster owner on each role-bearing client
pub const ADMIN_ROLE: &str = "admin";

/// An OIDC client
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientPreset {
    /// Client id
    pub client_id: String,
    /// Whether the client is confidential (has a secret)
    pub confidential: bool,
    /// Allowed redirect URIs
    pub redirect_uris: Vec<String>,
}

/// A protocol mapper attached to a client
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolMapperPreset {
    /// Client the mapper belongs to
    pub client_id: String,
    /// Mapper name
    pub name: String,
    /// Mapper implementation id
    pub protocol_mapper: String,
    /// Mapper configuration
    pub config: BTreeMap<String, String>,
}

/// A client-level role granted to the cluster owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientRolePreset {
    /// Client the role belongs to
    pub client_id: String,
    /// Role name
    pub role: String,
}

/// A client scope attached to a client as default scope
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientScopePreset {
    /// Client receiving the scope
    pub client_id: String,
    /// Scope name
    pub scope: String,
}

/// A group the cluster owner joins
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupPreset {
    /// Group name
    pub name: String,
}

fn client_id(prefix: &str, app: &str) -> String {
    format!("{}-{}", prefix, app)
}

/// Clients for every integrated application
pub fn clients(prefix: &str) -> Vec<ClientPreset> {
    CLIENT_APPS
        .iter()
        .map(|app| ClientPreset {
            client_id: client_id(prefix, app),
            confidential: *app != "kiali",
            redirect_uris: vec!["*".to_string()],
        })
        .collect()
}

/// Group membership mappers, so tokens carry the user's groups
pub fn protocol_mappers(prefix: &str) -> Vec<ProtocolMapperPreset> {
    MAPPER_APPS
        .iter()
        .map(|app| ProtocolMapperPreset {
            client_id: client_id(prefix, app),
            name: "group".to_string(),
            protocol_mapper: "oidc-group-membership-mapper".to_string(),
            config: BTreeMap::from([
                ("claim.name".to_string(), "group".to_string()),
                ("full.path".to_string(), "false".to_string()),
                ("id.token.claim".to_string(), "true".to_string()),
                ("access.token.claim".to_string(), "true".to_string()),
                ("userinfo.token.claim".to_string(), "true".to_string()),
            ]),
        })
        .collect()
}

/// Admin roles on clients whose applications authorize by client role
pub fn client_roles(prefix: &str) -> Vec<ClientRolePreset> {
    ROLE_APPS
        .iter()
        .map(|app| ClientRolePreset {
            client_id: client_id(prefix, app),
            role: ADMIN_ROLE.to_string(),
        })
        .collect()
}

/// Scopes required by clients beyond the realm defaults
pub fn client_scopes(prefix: &str) -> Vec<ClientScopePreset> {
    SCOPE_APPS
        .iter()
        .map(|app| ClientScopePreset {
            client_id: client_id(prefix, app),
            scope: "kubernetes".to_string(),
        })
        .collect()
}

/// Cluster admin group
pub fn groups(prefix: &str) -> Vec<GroupPreset> {
    vec![GroupPreset {
        name: format!("{}-cluster-admin", prefix),
    }]
}
