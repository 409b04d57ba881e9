mod cli;
mod config;
mod core;
mod interfaces;
mod logging;

use crate::core::terminal;

#[tokio::main]
async fn main() {
    match cli::run_main().await {
        Ok(()) => {}
        Err(e) => {
            terminal::print_error(&format!("{:#}", e));
            std::process::exit(1);
        }
    }
}
