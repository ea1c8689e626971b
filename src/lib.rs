pub mod accrual;
pub mod auth;
pub mod config;
pub mod db;
pub mod middleware;
pub mod models;
pub mod repos;
pub mod routes;
pub mod services;
pub mod uow;
pub mod validation;
