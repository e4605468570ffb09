// Test module entry point for sync tests
// Shared fixtures live in support

mod support;

mod engine_tests;
mod executor_tests;
