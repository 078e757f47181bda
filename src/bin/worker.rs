//! The `scrutiny-worker` binary: a long-lived tool runner driven over
//! stdin/stdout by the engine. See [`scrutiny::worker::worker_main`].

fn main() -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build the runtime");
    runtime.block_on(scrutiny::worker::worker_main())
}
