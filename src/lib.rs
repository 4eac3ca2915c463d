#![forbid(unsafe_code)]

pub mod acquire;
pub mod auth;
pub mod config;
pub mod error;
pub mod library;
pub mod logging;
pub mod security;
pub mod service;
pub mod storage;
