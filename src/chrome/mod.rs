mod discovery;
mod error;
mod launcher;

pub use discovery::{BrowserVersion, PageTarget, query_targets, query_version, wait_for_page_target};
pub use error::ChromeError;
pub use launcher::{
    ChromeProcess, LaunchConfig, find_available_port, find_chrome_executable, kill_process_group,
    launch_chrome,
};
