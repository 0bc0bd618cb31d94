use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use tracing::debug;

/// Shared connection password. Gates the socket only; requester identity
/// travels as an opaque id inside each statement.
#[derive(Debug)]
pub struct StaygridAuthSource {
    password: String,
}

impl StaygridAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for StaygridAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!("login attempt for database {:?}", login.database());
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
