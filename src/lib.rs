// ABOUTME: Library crate for the middleware client exposing the public API

#![allow(missing_docs)]

pub mod client;
pub mod config;

pub use client::{
    CallContext, Client, ClientError, ClientResult, CollectionUpdate, HandlerError, Job,
    JobProgress, JobState, MetricsSnapshot, UpdateKind,
};
pub use config::{ClientConfig, Credentials};
