pub mod edge_services;
pub mod origin_services;

pub use edge_services::EdgeServices;
pub use origin_services::{FetchedResponse, MAX_REDIRECT_HOPS, OriginFetcher};
