use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{ControlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Management,
    Client,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenType::Management => write!(f, "management"),
            TokenType::Client => write!(f, "client"),
        }
    }
}

/// Reference from a token to the role it was minted for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AclTokenRoleLink {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
}

/// A credential minted by the cluster. Tokens are never mutated after
/// creation; revocation deletes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AclToken {
    #[serde(rename = "AccessorID")]
    pub accessor_id: String,
    #[serde(rename = "SecretID")]
    pub secret_id: String,
    pub name: String,
    #[serde(rename = "Type")]
    pub token_type: TokenType,
    pub global: bool,
    pub roles: Vec<AclTokenRoleLink>,
    pub create_time: DateTime<Utc>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub hash: Vec<u8>,
    pub create_index: u64,
    pub modify_index: u64,
}

#[derive(Serialize)]
struct TokenHashFields<'a> {
    name: &'a str,
    token_type: TokenType,
    global: bool,
    roles: &'a [AclTokenRoleLink],
}

impl AclToken {
    /// A fresh token with newly generated accessor and secret identifiers.
    pub fn generate(name: impl Into<String>, token_type: TokenType, global: bool) -> Self {
        Self {
            accessor_id: Uuid::new_v4().to_string(),
            secret_id: Uuid::new_v4().to_string(),
            name: name.into(),
            token_type,
            global,
            roles: Vec::new(),
            create_time: Utc::now(),
            expiration_time: None,
            hash: Vec::new(),
            create_index: 0,
            modify_index: 0,
        }
    }

    pub fn set_hash(&mut self) -> &[u8] {
        let fields = TokenHashFields {
            name: &self.name,
            token_type: self.token_type,
            global: self.global,
            roles: &self.roles,
        };
        let encoded = bincode::serialize(&fields).unwrap_or_default();
        self.hash = Sha256::digest(&encoded).to_vec();
        &self.hash
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.map(|t| t <= now).unwrap_or(false)
    }

    pub fn validate(&self) -> Result<()> {
        if self.accessor_id.is_empty() || self.secret_id.is_empty() {
            return Err(ControlError::InvalidArgument(
                "token must carry accessor and secret IDs".to_string(),
            ));
        }
        if self.token_type == TokenType::Management && !self.roles.is_empty() {
            return Err(ControlError::InvalidArgument(
                "management tokens cannot be linked to roles".to_string(),
            ));
        }
        Ok(())
    }
}

/// A named set of policies tokens can be bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AclRole {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub hash: Vec<u8>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl AclRole {
    pub fn new(name: impl Into<String>, policies: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            policies,
            hash: Vec::new(),
            create_index: 0,
            modify_index: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ControlError::InvalidArgument(
                "role name is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn set_hash(&mut self) -> &[u8] {
        let encoded =
            bincode::serialize(&(&self.name, &self.description, &self.policies)).unwrap_or_default();
        self.hash = Sha256::digest(&encoded).to_vec();
        &self.hash
    }
}

/// The capabilities a resolved token grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    management: bool,
    roles: Vec<String>,
}

impl Acl {
    pub fn management() -> Self {
        Self {
            management: true,
            roles: Vec::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            management: false,
            roles: Vec::new(),
        }
    }

    pub fn for_token(token: &AclToken) -> Self {
        Self {
            management: token.token_type == TokenType::Management,
            roles: token.roles.iter().map(|r| r.name.clone()).collect(),
        }
    }

    pub fn is_management(&self) -> bool {
        self.management
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }
}
