//! Identity provider registration over the Keycloak admin REST API

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use fleet_common::Error;

use super::presets::{
    ClientPreset, ClientRolePreset, ClientScopePreset, GroupPreset, ProtocolMapperPreset,
};
use super::IdentityRegistrar;
use crate::config::IdentityConfig;

const SYSTEM: &str = "identity";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct IdRepresentation {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

/// IdentityRegistrar talking to a Keycloak compatible server
pub struct KeycloakRegistrar {
    client: Client,
    http: reqwest::Client,
    config: IdentityConfig,
}

impl KeycloakRegistrar {
    /// Create a registrar; `client` reads the admin password secret
    pub fn new(client: Client, config: IdentityConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::integration(SYSTEM, "", format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            http,
            config,
        })
    }

    fn admin_url(&self, path: &str) -> String {
        admin_url(&self.config.url, &self.config.realm, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, &str)],
        target: &str,
    ) -> Result<T, Error> {
        let response = self
            .http
            .get(self.admin_url(path))
            .query(query)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| transport_error(target, e))?;
        let response = expect_success(response, target, false).await?;
        response
            .json()
            .await
            .map_err(|e| Error::integration(SYSTEM, target, format!("invalid response: {}", e)))
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        token: &str,
        path: &str,
        body: &Value,
        target: &str,
    ) -> Result<(), Error> {
        let response = self
            .http
            .request(method, self.admin_url(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(target, e))?;
        expect_success(response, target, true).await?;
        Ok(())
    }

    async fn client_uuid(&self, token: &str, client_id: &str) -> Result<String, Error> {
        let found: Vec<IdRepresentation> = self
            .get_json(token, "/clients", &[("clientId", client_id)], client_id)
            .await?;
        first_id(found, client_id, "client")
    }

    async fn user_id(&self, token: &str, user: &str) -> Result<String, Error> {
        let found: Vec<IdRepresentation> = self
            .get_json(token, "/users", &[("username", user), ("exact", "true")], user)
            .await?;
        first_id(found, user, "user")
    }
}

/// Admin API URL of `path` within a realm
fn admin_url(base: &str, realm: &str, path: &str) -> String {
    format!("{}/admin/realms/{}{}", base.trim_end_matches('/'), realm, path)
}

/// Password grant endpoint of the master realm
fn token_url(base: &str) -> String {
    format!(
        "{}/realms/master/protocol/openid-connect/token",
        base.trim_end_matches('/')
    )
}

/// ID of the first match of an exact-filter lookup
fn first_id(found: Vec<IdRepresentation>, target: &str, kind: &str) -> Result<String, Error> {
    found
        .into_iter()
        .next()
        .map(|r| r.id)
        .ok_or_else(|| Error::integration(SYSTEM, target, format!("{} not found", kind)))
}

/// ID of the entry named exactly `name`; list and search endpoints match loosely
fn id_by_name(found: Vec<IdRepresentation>, name: &str) -> Option<String> {
    found
        .into_iter()
        .find(|r| r.name.as_deref() == Some(name))
        .map(|r| r.id)
}

fn transport_error(target: &str, err: reqwest::Error) -> Error {
    Error::integration(SYSTEM, target, format!("request failed: {}", err))
}

/// Map a response to success; 409 counts as success for creates
async fn expect_success(
    response: Response,
    target: &str,
    conflict_ok: bool,
) -> Result<Response, Error> {
    let status = response.status();
    if status.is_success() || (conflict_ok && status == StatusCode::CONFLICT) {
        if status == StatusCode::CONFLICT {
            debug!(object = %target, "identity object already exists");
        }
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::integration(
        SYSTEM,
        target,
        format!("unexpected status {}: {}", status, body),
    ))
}

#[async_trait]
impl IdentityRegistrar for KeycloakRegistrar {
    async fn admin_password(&self) -> Result<Option<String>, Error> {
        let api: Api<Secret> =
            Api::namespaced(self.client.clone(), &self.config.password_secret_namespace);
        let Some(secret) = api.get_opt(&self.config.password_secret_name).await? else {
            return Ok(None);
        };
        Ok(secret
            .data
            .and_then(|mut d| d.remove(&self.config.password_secret_key))
            .and_then(|v| String::from_utf8(v.0).ok())
            .filter(|p| !p.is_empty()))
    }

    async fn login(&self, password: &str) -> Result<String, Error> {
        let target = self.config.admin_user.as_str();
        let response = self
            .http
            .post(token_url(&self.config.url))
            .form(&[
                ("grant_type", "password"),
                ("client_id", "admin-cli"),
                ("username", target),
                ("password", password),
            ])
            .send()
            .await
            .map_err(|e| transport_error(target, e))?;
        let token: TokenResponse = expect_success(response, target, false)
            .await?
            .json()
            .await
            .map_err(|e| Error::integration(SYSTEM, target, format!("invalid token response: {}", e)))?;
        Ok(token.access_token)
    }

    async fn create_client(&self, token: &str, client: &ClientPreset) -> Result<(), Error> {
        let body = json!({
            "clientId": client.client_id,
            "enabled": true,
            "protocol": "openid-connect",
            "publicClient": !client.confidential,
            "standardFlowEnabled": true,
            "directAccessGrantsEnabled": true,
            "redirectUris": client.redirect_uris,
        });
        self.send_json(reqwest::Method::POST, token, "/clients", &body, &client.client_id)
            .await
    }

    async fn create_protocol_mapper(
        &self,
        token: &str,
        mapper: &ProtocolMapperPreset,
    ) -> Result<(), Error> {
        let uuid = self.client_uuid(token, &mapper.client_id).await?;
        let body = json!({
            "name": mapper.name,
            "protocol": "openid-connect",
            "protocolMapper": mapper.protocol_mapper,
            "config": mapper.config,
        });
        self.send_json(
            reqwest::Method::POST,
            token,
            &format!("/clients/{}/protocol-mappers/models", uuid),
            &body,
            &mapper.client_id,
        )
        .await
    }

    async fn create_client_role(
        &self,
        token: &str,
        role: &ClientRolePreset,
    ) -> Result<(), Error> {
        let uuid = self.client_uuid(token, &role.client_id).await?;
        self.send_json(
            reqwest::Method::POST,
            token,
            &format!("/clients/{}/roles", uuid),
            &json!({ "name": role.role }),
            &role.client_id,
        )
        .await
    }

    async fn add_client_role_to_user(
        &self,
        token: &str,
        role: &ClientRolePreset,
        user: &str,
    ) -> Result<(), Error> {
        let uuid = self.client_uuid(token, &role.client_id).await?;
        let user_id = self.user_id(token, user).await?;
        let representation: Value = self
            .get_json(
                token,
                &format!("/clients/{}/roles/{}", uuid, role.role),
                &[],
                &role.client_id,
            )
            .await?;
        self.send_json(
            reqwest::Method::POST,
            token,
            &format!("/users/{}/role-mappings/clients/{}", user_id, uuid),
            &json!([representation]),
            &role.client_id,
        )
        .await
    }

    async fn add_client_scope(
        &self,
        token: &str,
        scope: &ClientScopePreset,
    ) -> Result<(), Error> {
        let uuid = self.client_uuid(token, &scope.client_id).await?;
        let scopes: Vec<IdRepresentation> = self
            .get_json(token, "/client-scopes", &[], &scope.client_id)
            .await?;
        let scope_id = id_by_name(scopes, &scope.scope).ok_or_else(|| {
            Error::integration(
                SYSTEM,
                &scope.client_id,
                format!("client scope {} not found", scope.scope),
            )
        })?;
        self.send_json(
            reqwest::Method::PUT,
            token,
            &format!("/clients/{}/default-client-scopes/{}", uuid, scope_id),
            &json!({}),
            &scope.client_id,
        )
        .await
    }

    async fn create_group(&self, token: &str, group: &GroupPreset) -> Result<(), Error> {
        self.send_json(
            reqwest::Method::POST,
            token,
            "/groups",
            &json!({ "name": group.name }),
            &group.name,
        )
        .await
    }

    async fn add_user_to_group(
        &self,
        token: &str,
        group: &GroupPreset,
        user: &str,
    ) -> Result<(), Error> {
        let user_id = self.user_id(token, user).await?;
        let groups: Vec<IdRepresentation> = self
            .get_json(token, "/groups", &[("search", group.name.as_str())], &group.name)
            .await?;
        let group_id = id_by_name(groups, &group.name)
            .ok_or_else(|| Error::integration(SYSTEM, &group.name, "group not found"))?;
        self.send_json(
            reqwest::Method::PUT,
            token,
            &format!("/users/{}/groups/{}", user_id, group_id),
            &json!({}),
            &group.name,
        )
        .await
    }
}
