pub mod health_controller;
pub mod portal_controller;
pub mod proxies_controller;
pub mod proxy_controller;

pub use portal_controller::PortalController;
pub use proxies_controller::ProxiesController;
pub use proxy_controller::ProxyController;
