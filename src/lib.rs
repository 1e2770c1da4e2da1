//! Control plane for game-server clusters whose tenants are Discord guilds.
//!
//! - `auth` signs tokens, keeps sessions and gates requests
//! - `rbac` and `tenant` decide what a caller may do inside a tenant
//! - `controllers` registers remote clusters and tracks their liveness
//! - `agent` is the cluster-side client used by the `agent` binary

pub mod agent;
pub mod auth;
pub mod config;
pub mod controllers;
pub mod db;
pub mod error;
pub mod models;
pub mod rbac;
pub mod routes;
pub mod schema;
pub mod state;
pub mod store;
pub mod tenant;
