//! Usage Service - attributes metered usage events to subscription line
//! items and reports priced usage analytics.

pub mod config;
pub mod models;
pub mod services;
pub mod startup;
