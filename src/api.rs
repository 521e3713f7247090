//! Client-facing API surface on top of the dispatcher.
//!
//! [`RestApi`] is the seam higher-level helpers are written against: submit a
//! request, and know who "we" are. [`Client`] implements it over a
//! [`Dispatcher`].

use crate::dispatcher::{Dispatcher, ResponseHandle};
use crate::endpoints;
use crate::error::ApiError;
use crate::request::ApiRequest;
use crate::snowflake::Snowflake;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::OnceCell;

#[async_trait]
pub trait RestApi: Send + Sync {
    /// Queue a request; see [`Dispatcher::execute`].
    fn submit(&self, request: ApiRequest) -> ResponseHandle;

    /// Id of the authenticated user.
    async fn current_user_id(&self) -> Result<Snowflake, ApiError>;
}

#[derive(Deserialize)]
struct CurrentUser {
    id: Snowflake,
}

/// A [`Dispatcher`] plus a lazily fetched identity.
#[derive(Debug)]
pub struct Client {
    dispatcher: Dispatcher,
    me: OnceCell<Snowflake>,
}

impl Client {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher, me: OnceCell::new() }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Submit `request` and decode a JSON response body.
    pub async fn fetch<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let response = self.dispatcher.execute(request).await?;
        Ok(response.json()?)
    }
}

#[async_trait]
impl RestApi for Client {
    fn submit(&self, request: ApiRequest) -> ResponseHandle {
        self.dispatcher.execute(request)
    }

    /// Fetched once with `GET /users/@me`; failures are not cached.
    async fn current_user_id(&self) -> Result<Snowflake, ApiError> {
        let id = self
            .me
            .get_or_try_init(|| async {
                let user: CurrentUser =
                    self.fetch(endpoints::get_current_user().request()?).await?;
                tracing::debug!(user_id = %user.id, "identity resolved");
                Ok::<_, ApiError>(user.id)
            })
            .await?;
        Ok(*id)
    }
}

/// Leave a group DM by removing ourselves from its recipients.
pub async fn leave_group_dm<A>(api: &A, channel_id: Snowflake) -> Result<(), ApiError>
where
    A: RestApi + ?Sized,
{
    let me = api.current_user_id().await?;
    api.submit(endpoints::remove_group_recipient(channel_id, me).request()?).await?;
    Ok(())
}
