mod ha;
mod listener;
mod server;
mod service;

pub use self::ha::{HaConfig, HaManager};
pub use self::server::{NotificationServer, ServerError, ServerHandle, ServerResult};
pub use self::service::{NotificationService, ServiceError, ServiceResult};

pub const LOG_TARGET: &str = "evhub::server";
