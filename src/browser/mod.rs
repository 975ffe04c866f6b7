//! Browser automation module
//!
//! Launches one Chrome/Chromium instance and provisions one page per reward
//! target, with an asynchronous observer capturing each target's true outcome
//! from the reward-submission network response.

mod errors;
pub mod observer;
mod session;

pub use errors::BrowserError;
pub use session::{
    click_target, extract_page_info, probe_page, BrowserLaunchConfig, BrowserSession, PageInfo,
};
