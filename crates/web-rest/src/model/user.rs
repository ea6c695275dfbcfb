use serde::{Deserialize, Serialize};

/// A user account managed by the user-management capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Payload for creating a new user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreate {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl UserCreate {
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            first_name: String::new(),
            last_name: String::new(),
            email: email.into(),
            roles: Vec::new(),
        }
    }
}

impl From<UserCreate> for User {
    fn from(params: UserCreate) -> Self {
        Self {
            username: params.username,
            first_name: params.first_name,
            last_name: params.last_name,
            email: params.email,
            roles: params.roles,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UserRequest {
    Create(UserCreate),
    Get { username: String },
    List,
    Delete { username: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UserResponse {
    Created(User),
    Found(Option<User>),
    Listed(Vec<User>),
    Deleted(Option<User>),
}
