use clap::Parser;
use packrat::cli::{self, Cli};

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	let code = cli::run(cli).await;
	std::process::exit(code);
}
