fn main() {
    smfish_pipeline::cli::run();
}
