use axum::{extract::State, Json};
use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    auth::{identity::ExternalGuild, AuthenticatedUser},
    error::AppResult,
    state::AppState,
};

#[derive(Serialize)]
struct GuildView {
    #[serde(flatten)]
    guild: ExternalGuild,
    can_install: bool,
}

pub async fn list_guilds(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    let guilds: Vec<GuildView> = state
        .broker
        .list_guilds(user.session_id)
        .await?
        .into_iter()
        .map(|guild| GuildView {
            can_install: guild.can_install(),
            guild,
        })
        .collect();
    Ok(Json(json!({ "guilds": guilds })))
}
