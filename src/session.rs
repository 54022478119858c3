use tower_sessions::Session;

use crate::{model::UserId, AppResult};

/// Set by the login flow in front of this service.
pub const USER_ID: &str = "user_id";

pub(crate) async fn authenticated(session: &Session) -> AppResult<Option<UserId>> {
    Ok(session.get::<i64>(USER_ID).await?.map(UserId))
}
