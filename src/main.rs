use anyhow::Result;
use proctrace::cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse cli and handle clap errors
    let options = cli::parse_from_args();

    proctrace::init_logger(Some(options.override_log_level()));

    match proctrace::run(&options).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            proctrace::utils::report_error(&e);
            std::process::exit(1);
        }
    }
}
