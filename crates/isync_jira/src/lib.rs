pub mod client;

pub use client::{JiraClient, JiraSettings};
