//! Desk availability, calendar booking and daily quota service.

pub mod calendar;
pub mod clock;
pub mod config;
pub mod desk;
pub mod engine;
pub mod http;
pub mod limits;
pub mod model;
pub mod observability;
pub mod quota;
