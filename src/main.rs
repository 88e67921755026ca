fn main() {
    if let Err(err) = scanharness::cli::run() {
        scanharness::ui::eprintln_error(&err);
        std::process::exit(scanharness::exit::exit_code(&err));
    }
}
