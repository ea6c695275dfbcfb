//! # User Management Client
//!
//! Provides a high-level API for the `user-management` capability. Users are
//! global, so every call goes to the global channel.
use crate::capabilities::{UserManagement, UserManagementApiDemux};
use crate::clients::{ApiClient, ClientError};
use crate::model::{User, UserCreate, UserRequest, UserResponse};
use microservice_framework::{ApiDemux, RoutingKey};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Client for the user-management API.
#[derive(Clone)]
pub struct UserManagementClient {
    inner: Arc<UserManagementApiDemux>,
}

impl UserManagementClient {
    pub fn new(inner: Arc<UserManagementApiDemux>) -> Self {
        Self { inner }
    }
}

impl ApiClient<UserManagement> for UserManagementClient {
    fn inner(&self) -> &ApiDemux<UserManagement> {
        &self.inner
    }
}

impl UserManagementClient {
    #[instrument(skip(self, params), fields(username = %params.username))]
    pub async fn create_user(&self, params: UserCreate) -> Result<User, ClientError> {
        debug!("create_user called");
        match self.invoke(&RoutingKey::Global, UserRequest::Create(params)).await? {
            UserResponse::Created(user) => Ok(user),
            other => Err(ClientError::unexpected::<UserManagement>("create_user", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_user(&self, username: &str) -> Result<Option<User>, ClientError> {
        let request = UserRequest::Get {
            username: username.to_string(),
        };
        match self.invoke(&RoutingKey::Global, request).await? {
            UserResponse::Found(user) => Ok(user),
            other => Err(ClientError::unexpected::<UserManagement>("get_user", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn list_users(&self) -> Result<Vec<User>, ClientError> {
        match self.invoke(&RoutingKey::Global, UserRequest::List).await? {
            UserResponse::Listed(users) => Ok(users),
            other => Err(ClientError::unexpected::<UserManagement>("list_users", &other)),
        }
    }

    /// Deletes `username`, returning the removed user if it existed.
    #[instrument(skip(self))]
    pub async fn delete_user(&self, username: &str) -> Result<Option<User>, ClientError> {
        let request = UserRequest::Delete {
            username: username.to_string(),
        };
        match self.invoke(&RoutingKey::Global, request).await? {
            UserResponse::Deleted(user) => Ok(user),
            other => Err(ClientError::unexpected::<UserManagement>("delete_user", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microservice_framework::mock::MockTransportFactory;
    use microservice_framework::{
        DemuxSettings, DiscoveryConfig, Endpoint, LifecycleComponent, ProgressMonitor, ServiceAddress,
        StaticAddressResolver,
    };

    async fn started_client(factory: Arc<MockTransportFactory<UserManagement>>) -> UserManagementClient {
        let discovery =
            DiscoveryConfig::default().with_service("user-management", ServiceAddress::new("users", 8001));
        let demux = ApiDemux::<UserManagement>::new(
            Arc::new(StaticAddressResolver::new(discovery)),
            factory,
            DemuxSettings::default(),
        );
        let monitor = ProgressMonitor::new("test");
        demux.initialize(&monitor).await.unwrap();
        demux.start(&monitor).await.unwrap();
        UserManagementClient::new(demux)
    }

    #[tokio::test]
    async fn test_get_user_maps_found_response() {
        let factory = Arc::new(MockTransportFactory::<UserManagement>::new());
        let mock = factory.transport(&Endpoint::new("users", 8001));
        let alice = User::from(UserCreate::new("alice", "alice@example.com"));
        mock.expect_send().return_ok(UserResponse::Found(Some(alice.clone())));
        mock.expect_send().return_ok(UserResponse::Found(None));

        let client = started_client(factory).await;
        assert_eq!(client.get_user("alice").await.unwrap(), Some(alice));
        assert_eq!(client.get_user("bob").await.unwrap(), None);
        mock.verify();
    }

    #[tokio::test]
    async fn test_mismatched_response_is_an_error() {
        let factory = Arc::new(MockTransportFactory::<UserManagement>::new());
        let mock = factory.transport(&Endpoint::new("users", 8001));
        mock.expect_send().return_ok(UserResponse::Listed(Vec::new()));

        let client = started_client(factory).await;
        let err = client.get_user("alice").await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::UnexpectedResponse { operation: "get_user", .. }
        ));
        mock.verify();
    }

    #[tokio::test]
    async fn test_unavailable_api_fails_fast() {
        let factory = Arc::new(MockTransportFactory::<UserManagement>::new());
        let mock = factory.transport(&Endpoint::new("users", 8001));
        mock.set_connectivity(microservice_framework::ConnectivityState::Unavailable);

        let client = started_client(factory).await;
        let err = client.list_users().await.unwrap_err();
        assert!(err.is_unavailable(), "{err}");
        assert_eq!(mock.send_count(), 0);
    }
}
