// tests/property/main.rs

mod readiness;
mod schedule;
