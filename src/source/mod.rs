// src/source/mod.rs
pub mod client;
pub mod collector;
pub mod models;
pub mod rate_gate;
pub mod resolver;
pub mod retry;

pub use client::SiteClient;
pub use collector::{Collection, DocumentCollector};
pub use models::{CompanyIdentity, RawDocumentEntry, Section};
pub use resolver::CompanyResolver;
