use anyhow::Result;
use async_trait::async_trait;
use ring::hmac;
use std::sync::Arc;

/// Channel material handed to providers, supplied by the transport when it
/// can bind the auth exchange to the underlying channel.
#[derive(Clone, Debug, Default)]
pub struct AuthContext {
    pub local_public_security: Option<Vec<u8>>,
    pub remote_public_security: Option<Vec<u8>>,
}

pub enum ClientAuthReply {
    Data(Vec<u8>),
    Reject,
}

pub enum ServerAuthReply {
    Ok,
    Reject,
    Data(Vec<u8>),
}

/// A pluggable authentication method. A provider that can only act as one
/// side leaves the other constructor returning `None`; clients skip such
/// providers when rotating.
pub trait AuthProvider: Send + Sync {
    fn id(&self) -> &str;

    fn create_client_flow(&self, _ctx: &AuthContext) -> Option<Box<dyn ClientAuthFlow>> {
        None
    }

    fn create_server_flow(&self, _ctx: &AuthContext) -> Option<Box<dyn ServerAuthFlow>> {
        None
    }
}

/// One client-side attempt with one provider. Dropped on rotation.
#[async_trait]
pub trait ClientAuthFlow: Send {
    /// The payload of the opening `Auth` frame.
    async fn initial_message(&mut self) -> Result<Vec<u8>>;

    /// Handle an `AuthData` frame from the server.
    async fn receive_data(&mut self, data: &[u8]) -> Result<ClientAuthReply>;
}

/// One server-side attempt with one provider.
#[async_trait]
pub trait ServerAuthFlow: Send {
    /// Handle the payload of the opening `Auth` frame.
    async fn receive_initial(&mut self, data: &[u8]) -> Result<ServerAuthReply>;

    /// Handle a subsequent `AuthData` frame.
    async fn receive_data(&mut self, data: &[u8]) -> Result<ServerAuthReply>;

    /// Release any resources held by the flow. Called on every exit path:
    /// acceptance, rejection, rotation, and peer teardown.
    async fn destroy(&mut self) {}
}

/// Ordered set of configured providers. The order is the order clients try
/// them in.
#[derive(Clone, Default)]
pub struct AuthRegistry {
    providers: Vec<Arc<dyn AuthProvider>>,
}

impl AuthRegistry {
    pub fn new(providers: Vec<Arc<dyn AuthProvider>>) -> Self {
        AuthRegistry { providers }
    }

    pub fn providers(&self) -> &[Arc<dyn AuthProvider>] {
        &self.providers
    }

    pub fn get_provider(&self, id: &str) -> Option<Arc<dyn AuthProvider>> {
        self.providers.iter().find(|p| p.id() == id).cloned()
    }
}

/// No-op authentication for meshes running on trusted links. The client
/// sends an empty opening message and the server accepts it immediately.
pub struct AnonymousAuth;

impl AuthProvider for AnonymousAuth {
    fn id(&self) -> &str {
        "anonymous"
    }

    fn create_client_flow(&self, _ctx: &AuthContext) -> Option<Box<dyn ClientAuthFlow>> {
        Some(Box::new(AnonymousClientFlow))
    }

    fn create_server_flow(&self, _ctx: &AuthContext) -> Option<Box<dyn ServerAuthFlow>> {
        Some(Box::new(AnonymousServerFlow))
    }
}

struct AnonymousClientFlow;

#[async_trait]
impl ClientAuthFlow for AnonymousClientFlow {
    async fn initial_message(&mut self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn receive_data(&mut self, _data: &[u8]) -> Result<ClientAuthReply> {
        // the server side never sends data for this method
        Ok(ClientAuthReply::Reject)
    }
}

struct AnonymousServerFlow;

#[async_trait]
impl ServerAuthFlow for AnonymousServerFlow {
    async fn receive_initial(&mut self, _data: &[u8]) -> Result<ServerAuthReply> {
        Ok(ServerAuthReply::Ok)
    }

    async fn receive_data(&mut self, _data: &[u8]) -> Result<ServerAuthReply> {
        Ok(ServerAuthReply::Reject)
    }
}

/// HMAC-SHA256 challenge/response over a preshared secret. When the
/// transport supplies channel security material, the MAC binds to it, so a
/// response cannot be replayed onto a different channel.
///
/// Exchange: client opens with an empty `Auth` payload, server answers with
/// a random challenge, client responds with
/// `HMAC(secret, challenge || client_material || server_material)`.
pub struct SharedSecretAuth {
    secret: Vec<u8>,
}

impl SharedSecretAuth {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        SharedSecretAuth {
            secret: secret.into(),
        }
    }
}

impl AuthProvider for SharedSecretAuth {
    fn id(&self) -> &str {
        "shared-secret"
    }

    fn create_client_flow(&self, ctx: &AuthContext) -> Option<Box<dyn ClientAuthFlow>> {
        Some(Box::new(SharedSecretClientFlow {
            key: hmac::Key::new(hmac::HMAC_SHA256, &self.secret),
            // on the client side, local material is the client's
            client_material: ctx.local_public_security.clone().unwrap_or_default(),
            server_material: ctx.remote_public_security.clone().unwrap_or_default(),
        }))
    }

    fn create_server_flow(&self, ctx: &AuthContext) -> Option<Box<dyn ServerAuthFlow>> {
        Some(Box::new(SharedSecretServerFlow {
            key: hmac::Key::new(hmac::HMAC_SHA256, &self.secret),
            client_material: ctx.remote_public_security.clone().unwrap_or_default(),
            server_material: ctx.local_public_security.clone().unwrap_or_default(),
            challenge: None,
        }))
    }
}

fn mac_input(challenge: &[u8], client_material: &[u8], server_material: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(challenge.len() + client_material.len() + server_material.len());
    input.extend_from_slice(challenge);
    input.extend_from_slice(client_material);
    input.extend_from_slice(server_material);
    input
}

struct SharedSecretClientFlow {
    key: hmac::Key,
    client_material: Vec<u8>,
    server_material: Vec<u8>,
}

#[async_trait]
impl ClientAuthFlow for SharedSecretClientFlow {
    async fn initial_message(&mut self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn receive_data(&mut self, data: &[u8]) -> Result<ClientAuthReply> {
        let input = mac_input(data, &self.client_material, &self.server_material);
        let tag = hmac::sign(&self.key, &input);
        Ok(ClientAuthReply::Data(tag.as_ref().to_vec()))
    }
}

struct SharedSecretServerFlow {
    key: hmac::Key,
    client_material: Vec<u8>,
    server_material: Vec<u8>,
    challenge: Option<[u8; 32]>,
}

#[async_trait]
impl ServerAuthFlow for SharedSecretServerFlow {
    async fn receive_initial(&mut self, _data: &[u8]) -> Result<ServerAuthReply> {
        let challenge: [u8; 32] = rand::random();
        self.challenge = Some(challenge);
        Ok(ServerAuthReply::Data(challenge.to_vec()))
    }

    async fn receive_data(&mut self, data: &[u8]) -> Result<ServerAuthReply> {
        let Some(challenge) = self.challenge.take() else {
            return Ok(ServerAuthReply::Reject);
        };
        let input = mac_input(&challenge, &self.client_material, &self.server_material);
        match hmac::verify(&self.key, &input, data) {
            Ok(()) => Ok(ServerAuthReply::Ok),
            Err(_) => Ok(ServerAuthReply::Reject),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn anonymous_accepts_immediately() {
        let provider = AnonymousAuth;
        let ctx = AuthContext::default();
        let mut client = provider.create_client_flow(&ctx).unwrap();
        let mut server = provider.create_server_flow(&ctx).unwrap();
        let opening = client.initial_message().await.unwrap();
        match server.receive_initial(&opening).await.unwrap() {
            ServerAuthReply::Ok => {}
            _ => panic!("anonymous server should accept"),
        }
    }

    #[tokio::test]
    async fn shared_secret_accepts_matching_secret() {
        let provider = SharedSecretAuth::new(b"hunter2".to_vec());
        let client_ctx = AuthContext {
            local_public_security: Some(vec![1, 1]),
            remote_public_security: Some(vec![2, 2]),
        };
        let server_ctx = AuthContext {
            local_public_security: Some(vec![2, 2]),
            remote_public_security: Some(vec![1, 1]),
        };
        let mut client = provider.create_client_flow(&client_ctx).unwrap();
        let mut server = provider.create_server_flow(&server_ctx).unwrap();

        let opening = client.initial_message().await.unwrap();
        let challenge = match server.receive_initial(&opening).await.unwrap() {
            ServerAuthReply::Data(challenge) => challenge,
            _ => panic!("server should challenge"),
        };
        let response = match client.receive_data(&challenge).await.unwrap() {
            ClientAuthReply::Data(response) => response,
            _ => panic!("client should answer the challenge"),
        };
        match server.receive_data(&response).await.unwrap() {
            ServerAuthReply::Ok => {}
            _ => panic!("matching secret should be accepted"),
        }
    }

    #[tokio::test]
    async fn shared_secret_rejects_wrong_secret() {
        let good = SharedSecretAuth::new(b"hunter2".to_vec());
        let bad = SharedSecretAuth::new(b"password".to_vec());
        let ctx = AuthContext::default();
        let mut client = bad.create_client_flow(&ctx).unwrap();
        let mut server = good.create_server_flow(&ctx).unwrap();

        let opening = client.initial_message().await.unwrap();
        let ServerAuthReply::Data(challenge) = server.receive_initial(&opening).await.unwrap()
        else {
            panic!("server should challenge");
        };
        let ClientAuthReply::Data(response) = client.receive_data(&challenge).await.unwrap() else {
            panic!("client should answer");
        };
        match server.receive_data(&response).await.unwrap() {
            ServerAuthReply::Reject => {}
            _ => panic!("wrong secret should be rejected"),
        }
    }

    #[test]
    fn registry_preserves_order_and_looks_up_by_id() {
        let registry = AuthRegistry::new(vec![
            Arc::new(SharedSecretAuth::new(b"s".to_vec())),
            Arc::new(AnonymousAuth),
        ]);
        assert_eq!(registry.providers()[0].id(), "shared-secret");
        assert_eq!(registry.providers()[1].id(), "anonymous");
        assert!(registry.get_provider("anonymous").is_some());
        assert!(registry.get_provider("kerberos").is_none());
    }
}
