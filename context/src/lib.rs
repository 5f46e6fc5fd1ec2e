pub mod chain;
pub mod context;
pub mod handler;
pub mod middleware;

pub use chain::MiddlewareChain;
pub use common::model::{Request, Response};
pub use context::{ScraperContext, ScraperContextBuilder, StateUpdater};
pub use handler::ScraperHandler;
pub use middleware::logging::RequestLoggingMiddleware;
pub use middleware::parser::ParserMiddleware;
pub use middleware::proxy::ProxyMiddleware;
pub use middleware::rate_limiter::RateLimiterMiddleware;
pub use middleware::robots_txt::RobotsTxtMiddleware;
pub use middleware::user_agent::UserAgentInjectorMiddleware;
