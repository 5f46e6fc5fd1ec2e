pub mod config;
pub mod lease;
pub mod log;
pub mod priority;
pub mod request;
pub mod response;
pub mod schedule;
pub mod scraper;
pub mod task;

pub use config::{merge_json, ScraperConfig};
pub use lease::Lease;
pub use log::LogLine;
pub use priority::Priority;
pub use request::{HttpMethod, ProxySpec, Request, RequestBody};
pub use response::Response;
pub use schedule::Schedule;
pub use scraper::{CreateScraperRequest, Scraper, SearchFilters};
pub use task::{EnqueueRequest, Task, TaskStatus, EPHEMERAL_SCRAPER_KEY};
