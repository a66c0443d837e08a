//! LocalStack preset.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::builder::ContainerBuilder;
use crate::error::Result;
use crate::modules::Module;
use crate::orchestrator::{ContainerHandle, Orchestrator};
use crate::wait::{HttpProbe, WaitStrategy};

pub const LOCALSTACK_PORT: u16 = 4566;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStack {
    pub image: String,
    pub region: String,
    /// Services to enable, e.g. `s3`, `sqs`. Empty enables the defaults.
    pub services: BTreeSet<String>,
}

impl Default for LocalStack {
    fn default() -> Self {
        Self {
            image: "localstack/localstack:3".to_string(),
            region: "us-east-1".to_string(),
            services: BTreeSet::new(),
        }
    }
}

impl LocalStack {
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.services.insert(service.into());
        self
    }

    pub async fn start(&self, orchestrator: &Orchestrator) -> Result<LocalStackContainer> {
        let handle = self.builder()?.start(orchestrator).await?;
        Ok(LocalStackContainer { handle })
    }
}

impl Module for LocalStack {
    fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if self.image.trim().is_empty() {
            violations.push("image must not be empty".to_string());
        }
        if self.region.is_empty() || !self.region.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            violations.push(format!("invalid region '{}'", self.region));
        }
        for service in &self.services {
            if service.is_empty() || service.contains([',', ' ']) {
                violations.push(format!("invalid service name '{}'", service));
            }
        }
        violations
    }

    fn configure(&self) -> ContainerBuilder {
        let mut builder = ContainerBuilder::new()
            .with_image(self.image.clone())
            .with_env("AWS_DEFAULT_REGION", self.region.clone())
            .with_random_port_binding(LOCALSTACK_PORT)
            .with_wait_strategy(
                WaitStrategy::http(HttpProbe::get(LOCALSTACK_PORT, "/_localstack/health"))
                    .with_timeout(Duration::from_secs(120))
                    .with_interval(Duration::from_secs(1)),
            );
        if !self.services.is_empty() {
            let services: Vec<&str> = self.services.iter().map(String::as_str).collect();
            builder = builder.with_env("SERVICES", services.join(","));
        }
        builder
    }
}

#[derive(Debug, Clone)]
pub struct LocalStackContainer {
    pub handle: ContainerHandle,
}

impl LocalStackContainer {
    /// Endpoint URL to hand to AWS SDK clients.
    pub async fn endpoint(&self) -> Result<String> {
        let port = self.handle.mapped_port(LOCALSTACK_PORT).await?;
        Ok(format!("http://{}:{}", self.handle.host(), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_services_joined_in_order() {
        let config = LocalStack::default()
            .with_service("sqs")
            .with_service("s3")
            .builder()
            .unwrap()
            .configuration()
            .clone();
        assert_eq!(config.env["SERVICES"], "s3,sqs");
        assert_eq!(config.env["AWS_DEFAULT_REGION"], "us-east-1");
    }

    #[test]
    fn test_rejects_bad_region_and_service() {
        let err = LocalStack::default()
            .with_region("us east")
            .with_service("s3,sqs")
            .builder()
            .unwrap_err();
        assert_eq!(err.violations.len(), 2);
    }
}
