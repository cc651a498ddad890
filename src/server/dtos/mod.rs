pub mod health_dto;
pub mod portal_dto;
pub mod proxy_dto;
