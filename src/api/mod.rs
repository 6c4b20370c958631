pub mod routes;

// Re-export route handlers for convenience
pub use routes::execute;
pub use routes::executor_service;
pub use routes::schema;
pub use routes::state;
