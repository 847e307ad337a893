//! Integration tests for cachefsd

mod allocator_invariants;
mod daemon_lifecycle;
mod image_layout;
mod support;
