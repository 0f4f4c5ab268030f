fn main() {
    scan_normalizer::cli::run();
}
