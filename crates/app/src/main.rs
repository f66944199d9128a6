fn main() {
    std::process::exit(octlens_app::run_from_env());
}
