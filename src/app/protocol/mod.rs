pub mod action;
pub mod client;

pub use action::{Action, ActionResult};
pub use client::{HttpClient, RequestOptions, Transport};
