//! Smart-HTTP gateway
//!
//! Hosts every repository under the configured root at `/{repo}` and speaks
//! the git HTTP protocol, smart and dumb. Accepted pushes are announced to
//! the [`SyncHub`] once every ref update of the push was attempted.
//!
//! ```text
//! /{repo}/
//! ├── HEAD, info/refs              ref advertisement
//! ├── objects/...                  dumb object access
//! ├── git-upload-pack              fetch
//! └── git-receive-pack             push
//! ```

pub mod auth;
pub mod error;
pub mod routes;

use crate::areas::repository::Repository;
use crate::artifacts::branch::branch_name::BranchName;
use crate::config::VellumConfig;
use crate::errors::BackendId;
use crate::sync::notification::SyncHub;
use anyhow::Context;
use auth::{AuthPolicy, StaticCredentials, parse_basic};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, header};
use axum::routing::{get, post};
use error::{GatewayError, GatewayResult};
use std::path::PathBuf;
use std::sync::Arc;

const REPOSITORY_NAME_REGEX: &str = r"^[A-Za-z0-9][A-Za-z0-9._-]*$";

/// Shared by every request
#[derive(Clone)]
pub struct GatewayState {
    root: PathBuf,
    flavor: String,
    default_branch: BranchName,
    auth: Arc<dyn AuthPolicy>,
    hub: Arc<SyncHub>,
    allow_anonymous_read: bool,
    max_pack_size: usize,
}

impl GatewayState {
    pub fn from_config(config: &VellumConfig, hub: Arc<SyncHub>) -> anyhow::Result<Self> {
        let default_branch = BranchName::try_parse(config.repository.default_branch.clone())
            .context("invalid default branch in configuration")?;

        Ok(GatewayState {
            root: config.repository.root.clone(),
            flavor: config.repository.flavor.clone(),
            default_branch,
            auth: Arc::new(StaticCredentials::new(config.server.credentials.clone())),
            hub,
            allow_anonymous_read: config.server.allow_anonymous_read,
            max_pack_size: config.server.max_pack_size,
        })
    }

    /// Replace the built-in credential table.
    pub fn with_auth(mut self, auth: Arc<dyn AuthPolicy>) -> Self {
        self.auth = auth;
        self
    }

    pub fn hub(&self) -> &Arc<SyncHub> {
        &self.hub
    }

    pub fn max_pack_size(&self) -> usize {
        self.max_pack_size
    }

    /// The hosted repository called `name`; unknown names are not found.
    pub fn open_repository(&self, name: &str) -> GatewayResult<Arc<Repository>> {
        let pattern = regex::Regex::new(REPOSITORY_NAME_REGEX)
            .map_err(|error| GatewayError::Internal(error.to_string()))?;
        if !pattern.is_match(name) {
            return Err(GatewayError::NotFound(format!("repository '{name}'")));
        }

        let id = BackendId::new(self.flavor.clone(), self.root.join(name));
        let repository = Repository::open(id, self.default_branch.clone());
        if !repository.exists() {
            return Err(GatewayError::NotFound(format!("repository '{name}'")));
        }

        Ok(Arc::new(repository))
    }

    /// Reads may be anonymous when configured; writes never are.
    pub fn authorize(&self, repository: &str, headers: &HeaderMap, write: bool) -> GatewayResult<()> {
        if !write && self.allow_anonymous_read {
            return Ok(());
        }

        let authenticated = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_basic)
            .is_some_and(|(user, password)| self.auth.authenticate(repository, &user, &password));

        if authenticated {
            Ok(())
        } else {
            Err(GatewayError::Unauthorized {
                realm: self.auth.realm(repository),
            })
        }
    }
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("root", &self.root)
            .field("flavor", &self.flavor)
            .field("default_branch", &self.default_branch)
            .field("allow_anonymous_read", &self.allow_anonymous_read)
            .field("max_pack_size", &self.max_pack_size)
            .finish()
    }
}

pub fn router(state: GatewayState) -> Router {
    let body_limit = state.max_pack_size;

    Router::new()
        .route("/:repo/", get(routes::info))
        .route("/:repo/HEAD", get(routes::head))
        .route("/:repo/info/refs", get(routes::info_refs))
        .route("/:repo/objects/*rest", get(routes::objects))
        .route("/:repo/git-upload-pack", post(routes::upload_pack))
        .route("/:repo/git-receive-pack", post(routes::receive_pack))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Serve the gateway until the process is stopped.
pub async fn serve(config: &VellumConfig, hub: Arc<SyncHub>) -> anyhow::Result<()> {
    let state = GatewayState::from_config(config, hub)?;
    let bind_addr = &config.server.bind_addr;

    let listener = tokio::net::TcpListener::bind(bind_addr.as_str())
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(
        addr = %bind_addr,
        root = %config.repository.root.display(),
        "gateway listening"
    );

    axum::serve(listener, router(state))
        .await
        .context("gateway stopped")
}
