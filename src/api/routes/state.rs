use std::sync::Arc;

use crate::executor::{CSharpRunner, ExecutionGateway};

/// Shared application state passed to all Axum handlers via `.with_state()`.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<ExecutionGateway>,
}

impl AppState {
    pub fn new(gateway: Arc<ExecutionGateway>) -> Self {
        Self { gateway }
    }
}

/// State of the stand-alone C# execution service.
#[derive(Clone)]
pub struct ExecutorState {
    pub runner: Arc<CSharpRunner>,
}

impl ExecutorState {
    pub fn new(runner: Arc<CSharpRunner>) -> Self {
        Self { runner }
    }
}
