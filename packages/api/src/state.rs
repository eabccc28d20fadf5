// ABOUTME: Shared handler state: the store, configuration, authenticators and provider resolution
// ABOUTME: Provider resolution sits behind a trait so the server can run against scripted providers

use crate::auth::{StaticUserTokens, UserAuthenticator};
use crate::config::ApiConfig;
use async_trait::async_trait;
use hatchery_core::{ComputeTarget, Store};
use hatchery_provisioner::{ProvisionerConfig, TaskExecutor};
use hatchery_sandbox::{provider_for_target, ContainerProvider, FactoryError};
use std::sync::Arc;

/// Turns a compute target into a live provider
#[async_trait]
pub trait ProviderResolver: Send + Sync {
    async fn resolve(&self, target: &ComputeTarget) -> Result<Arc<dyn ContainerProvider>, FactoryError>;
}

/// Resolver backed by the provider factory
pub struct FactoryResolver;

#[async_trait]
impl ProviderResolver for FactoryResolver {
    async fn resolve(&self, target: &ComputeTarget) -> Result<Arc<dyn ContainerProvider>, FactoryError> {
        provider_for_target(target)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Arc<ApiConfig>,
    pub users: Arc<dyn UserAuthenticator>,
    pub providers: Arc<dyn ProviderResolver>,
    pub executor: Arc<TaskExecutor>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: ApiConfig) -> Self {
        let users = Arc::new(StaticUserTokens::new(config.user_tokens.clone()));
        let executor = Arc::new(TaskExecutor::new(store.clone(), ProvisionerConfig::from_env()));
        Self {
            store,
            config: Arc::new(config),
            users,
            providers: Arc::new(FactoryResolver),
            executor,
        }
    }

    pub fn with_providers(mut self, providers: Arc<dyn ProviderResolver>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_executor(mut self, executor: Arc<TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }
}
