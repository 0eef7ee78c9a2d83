//! Twitshot library.
//!
//! A web service that renders clean, cropped screenshots of social media
//! posts by driving a headless browser and stripping each platform's chrome
//! from the page before capture.

// Allow raw string hashes for safety - they're harmless and prevent issues if content changes
#![allow(clippy::needless_raw_string_hashes)]

pub mod blocklist;
pub mod bluesky;
pub mod browser;
pub mod config;
pub mod constants;
pub mod handlers;
pub mod web;
