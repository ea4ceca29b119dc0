// The core module contains all business logic.
// Nothing in here knows about HTTP, credential files, or the terminal.

#[path = "poller.rs"]
pub mod poller;

#[path = "retrieval.rs"]
pub mod retrieval;

#[path = "oauth.rs"]
pub mod oauth;

#[path = "benchmark.rs"]
pub mod benchmark;
