fn main() {
    if let Err(e) = freeproxy::cli::run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
