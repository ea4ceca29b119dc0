// The infra module contains implementations of core traits.
// This is where the Google APIs and the filesystem live.

#[path = "google_auth.rs"]
pub mod google_auth;

#[path = "logging_client.rs"]
pub mod logging_client;

#[path = "script_client.rs"]
pub mod script_client;

#[path = "token_marker.rs"]
pub mod token_marker;
