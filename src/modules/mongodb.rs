//! MongoDB preset.

use crate::builder::ContainerBuilder;
use crate::error::Result;
use crate::modules::{Module, check_credential};
use crate::orchestrator::{ContainerHandle, Orchestrator};
use crate::wait::WaitStrategy;

pub const MONGODB_PORT: u16 = 27017;

/// MongoDB, optionally with a root user.
///
/// Username and password are set together or not at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MongoDb {
    pub image: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MongoDb {
    fn default() -> Self {
        Self {
            image: "mongo:7".to_string(),
            username: None,
            password: None,
        }
    }
}

impl MongoDb {
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub async fn start(&self, orchestrator: &Orchestrator) -> Result<MongoDbContainer> {
        let handle = self.builder()?.start(orchestrator).await?;
        Ok(MongoDbContainer {
            handle,
            preset: self.clone(),
        })
    }
}

impl Module for MongoDb {
    fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if self.image.trim().is_empty() {
            violations.push("image must not be empty".to_string());
        }
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                check_credential("username", user, &mut violations);
                check_credential("password", pass, &mut violations);
            }
            (None, None) => {}
            _ => violations.push("username and password must be set together".to_string()),
        }
        violations
    }

    fn configure(&self) -> ContainerBuilder {
        let mut builder = ContainerBuilder::new()
            .with_image(self.image.clone())
            .with_random_port_binding(MONGODB_PORT)
            .with_wait_strategy(WaitStrategy::log("Waiting for connections"));
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            builder = builder.with_envs([
                ("MONGO_INITDB_ROOT_USERNAME", user.as_str()),
                ("MONGO_INITDB_ROOT_PASSWORD", pass.as_str()),
            ]);
        }
        builder
    }
}

#[derive(Debug, Clone)]
pub struct MongoDbContainer {
    pub handle: ContainerHandle,
    pub preset: MongoDb,
}

impl MongoDbContainer {
    /// `mongodb://[user:password@]host:port`
    pub async fn connection_string(&self) -> Result<String> {
        let port = self.handle.mapped_port(MONGODB_PORT).await?;
        let credentials = match (&self.preset.username, &self.preset.password) {
            (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
            _ => String::new(),
        };
        Ok(format!(
            "mongodb://{}{}:{}",
            credentials,
            self.handle.host(),
            port
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_are_optional_but_paired() {
        let anonymous = MongoDb::default().builder().unwrap();
        assert!(anonymous.configuration().env.is_empty());

        let mut half = MongoDb::default();
        half.username = Some("root".to_string());
        let err = half.builder().unwrap_err();
        assert_eq!(err.violations, vec!["username and password must be set together"]);

        let config = MongoDb::default()
            .with_credentials("root", "secret")
            .builder()
            .unwrap()
            .configuration()
            .clone();
        assert_eq!(config.env["MONGO_INITDB_ROOT_USERNAME"], "root");
    }
}
