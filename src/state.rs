use std::sync::Arc;

use crate::{
    auth::{
        broker::IdentityBroker, identity::IdentityProvider, jwt::TokenCodec,
        session::SessionCache,
    },
    config::AppConfig,
    controllers::{registry::SharedSecretVerifier, ControllerRegistry},
    rbac::RbacEngine,
    store::Store,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn Store>,
    pub broker: Arc<IdentityBroker>,
    pub rbac: Arc<RbacEngine>,
    pub registry: Arc<ControllerRegistry>,
}

impl AppState {
    /// Wires every service over the given backends. One codec instance signs
    /// user and controller tokens alike.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn Store>,
        sessions: Arc<dyn SessionCache>,
        provider: Arc<dyn IdentityProvider>,
    ) -> Self {
        let codec = TokenCodec::from_config(&config);
        let broker = IdentityBroker::new(codec.clone(), sessions, provider, store.clone());
        let rbac = RbacEngine::new(store.clone(), config.super_admin_discord_id.clone());
        let registry = ControllerRegistry::new(
            store.clone(),
            codec,
            Box::new(
                SharedSecretVerifier::new(config.controller_handshake_secret.clone())
                    .require_signature(config.require_signed_handshake),
            ),
            config.heartbeat_ttl,
            config.max_heartbeat_age,
        );

        Self {
            config: Arc::new(config),
            store,
            broker: Arc::new(broker),
            rbac: Arc::new(rbac),
            registry: Arc::new(registry),
        }
    }
}
