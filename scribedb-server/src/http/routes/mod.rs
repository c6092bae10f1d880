//! Route modules

pub mod db;
pub mod health;
