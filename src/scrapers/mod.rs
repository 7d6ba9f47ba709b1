//! Fetch infrastructure: politeness gate, HTTP client, render gateway.

pub mod browser;
pub mod http_client;
pub mod politeness;

pub use browser::{BrowserRenderer, PageRenderer, RenderConfig, RenderedPage};
pub use http_client::{HttpClient, HttpResponse};
pub use politeness::{PolitenessConfig, PolitenessGate};
