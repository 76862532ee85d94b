//! sprig-tail: follow one conversation of the Sprig chat from the terminal.

#[tokio::main]
async fn main() {
    if let Err(e) = sprig::cli::run().await {
        eprintln!("sprig-tail: {e}");
        std::process::exit(1);
    }
}
