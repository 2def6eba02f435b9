use clap::Parser;
use runtool::cli::{self, Args};
use runtool::logging::{self, config::LoggingConfig};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let working_directory = std::env::current_dir().ok();
    let logging_config = match LoggingConfig::load(working_directory.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("runtool: invalid logging configuration: {err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = logging::init(&logging_config) {
        eprintln!("runtool: failed to initialize logging: {err}");
        std::process::exit(2);
    }

    match cli::run(args).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!("{err:#}");
            eprintln!("runtool: {err:#}");
            std::process::exit(1);
        }
    }
}
