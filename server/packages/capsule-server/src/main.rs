fn main() {
    if let Err(err) = capsule_server::cli::run_capsule_server() {
        tracing::error!(error = %err, "capsule-server failed");
        std::process::exit(1);
    }
}
