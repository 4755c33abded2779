fn main() {
    if opencode_ask::cli::run_opencode_ask().is_err() {
        std::process::exit(1);
    }
}
