use taskbeat::core::terminal;
use taskbeat::{cli, logging};

#[tokio::main]
async fn main() {
    logging::init();
    match cli::run_main().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            terminal::print_error(&format!("{e:#}"));
            std::process::exit(2);
        }
    }
}
