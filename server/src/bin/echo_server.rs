//! Echo server binary.

use clap::Parser;
use server::config::Config;
use server::{logging, EchoServer};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "echo-server")]
#[command(about = "Multi-threaded reactor echo server")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    logging::init(&config.logging);

    if let Err(e) = run(config) {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), reactor::Error> {
    let base_loop = reactor::EventLoop::new()?;
    let echo = EchoServer::new(base_loop.clone(), &config)?;
    echo.start();
    tracing::info!(
        address = %config.server.address,
        workers = config.workers.threads,
        "listening"
    );
    base_loop.run();
    Ok(())
}

fn print_default_config() {
    let config = r#"# Echo Server Configuration

[server]
# Listen address
address = "0.0.0.0:8000"

# Server name; prefixes connection names and worker threads
name = "echo"

# Enable SO_REUSEPORT on the listen socket
reuse_port = false

[workers]
# Number of I/O worker loops (0 = run everything on the base loop)
threads = 2

[logging]
# Log level: "trace", "debug", "info", "warn", "error"
# The RUST_LOG environment variable takes precedence when set
level = "info"

# Output format: "pretty", "compact", or "json"
format = "pretty"

# Include timestamps / thread names in output
timestamps = true
thread_names = false
"#;
    print!("{}", config);
}
