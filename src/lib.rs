pub mod app;
pub mod backend;
pub mod blueprint;
pub mod bundle;
pub mod config;
pub mod orchestration;
pub mod review;
pub mod runtime;
pub mod shared;
pub mod storage;
