use axum::http::HeaderValue;
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    auth::require_auth,
    controllers::protocol::{HANDSHAKE_PATH, HEARTBEAT_PATH},
    state::AppState,
    tenant::require_tenant,
};

pub mod admin;
pub mod auth;
pub mod controllers;
pub mod guilds;
pub mod health;
pub mod tenant;

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub fn create_router(state: AppState) -> Router<()> {
    let cors = cors_layer(&state.config.cors_origins());

    let auth_routes = Router::new()
        .route("/login", get(auth::login))
        .route("/callback", get(auth::callback))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout))
        .route(
            "/me",
            get(auth::me).route_layer(middleware::from_fn_with_state(
                state.clone(),
                require_auth,
            )),
        );

    let health_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/healthz", get(health::health_check))
        .route("/live", get(health::live))
        .route("/ready", get(health::ready));

    let protocol_routes = Router::new()
        .route(HANDSHAKE_PATH, post(controllers::handshake))
        .route(HEARTBEAT_PATH, post(controllers::heartbeat));

    let tenant_routes = Router::new()
        .route("/info", get(tenant::tenant_info))
        .route("/permissions", get(tenant::my_permissions))
        .route("/roles", get(tenant::list_roles).post(tenant::create_role))
        .route(
            "/roles/:id",
            put(tenant::update_role).delete(tenant::delete_role),
        )
        .route(
            "/members/:user_id/roles/:role",
            post(tenant::assign_member_role).delete(tenant::remove_member_role),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_tenant,
        ));

    let controller_routes = Router::new()
        .route("/", get(controllers::list_controllers))
        .route("/:id", get(controllers::get_controller))
        .route("/:id/approve", post(controllers::approve_controller))
        .route("/:id/reject", post(controllers::reject_controller));

    let admin_routes = Router::new()
        .route("/check-access", get(admin::check_access))
        .route("/cleanup-controllers", post(admin::cleanup_controllers))
        .route(
            "/super-admins",
            post(admin::assign_super_admin).delete(admin::remove_super_admin),
        );

    let protected_routes = Router::new()
        .route("/api/guilds", get(guilds::list_guilds))
        .nest("/api/controllers", controller_routes)
        .nest("/api/admin", admin_routes)
        .nest("/api/tenant", tenant_routes)
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(health_routes)
        .merge(protocol_routes)
        .merge(protected_routes)
        .nest("/auth", auth_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
