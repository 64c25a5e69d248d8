//! Integration tests for nested persistence contexts

mod fetch_translation;
mod notification_relay;
mod save_propagation;
